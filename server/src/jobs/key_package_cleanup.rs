use tokio::time::{interval, Duration};
use tracing::{error, info};

use crate::db::Store;
use crate::models::now_micros;

const RUN_INTERVAL: Duration = Duration::from_secs(1800);

/// Drops key packages older than 30 days, consumed or not -- runs every 30
/// minutes.
pub async fn run_key_package_cleanup_worker(store: Store) {
    let mut ticker = interval(RUN_INTERVAL);
    info!("starting key package cleanup worker (runs every 30 minutes)");

    loop {
        ticker.tick().await;
        match store.purge_expired_key_packages(now_micros()).await {
            Ok(count) if count > 0 => info!(count, "purged expired key packages"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "key package cleanup failed"),
        }
    }
}
