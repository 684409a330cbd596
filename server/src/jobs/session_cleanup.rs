use tokio::time::{interval, Duration};
use tracing::{error, info};

use crate::db::Store;
use crate::models::now_micros;

const RUN_INTERVAL: Duration = Duration::from_secs(900);

/// Drops sessions past `expires_at`, freeing the table of dead rows a
/// revoked or abandoned session would otherwise leave behind indefinitely.
pub async fn run_session_cleanup_worker(store: Store) {
    let mut ticker = interval(RUN_INTERVAL);
    info!("starting session cleanup worker (runs every 15 minutes)");

    loop {
        ticker.tick().await;
        match store.purge_expired_sessions(now_micros()).await {
            Ok(count) if count > 0 => info!(count, "purged expired sessions"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "session cleanup failed"),
        }
    }
}
