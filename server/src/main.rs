use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sovereign_server::auth::AuthService;
use sovereign_server::db;
use sovereign_server::delivery::DeliveryEngine;
use sovereign_server::gateway::{self, hub::Hub, GatewayContext};
use sovereign_server::health;
use sovereign_server::jobs;
use sovereign_server::metrics::MetricsRecorder;
use sovereign_server::mls::MlsService;
use sovereign_server::Config;
use sovereign_server::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = Config::load()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&config.log_level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(listen_addr = %config.listen_addr, "starting sovereign messaging server");

    let metrics_recorder = config.metrics_enabled.then(MetricsRecorder::new);
    let metrics_handle = metrics_recorder.as_ref().map(|r| r.handle().clone());

    let pool = db::init_db(db::DbConfig {
        database_path: config.database_path.clone(),
        ..Default::default()
    })
    .await?;
    let store = Store::new(pool);
    tracing::info!("database initialized");

    let auth = Arc::new(AuthService::new(&config.rp_id, &config.rp_origin, store.clone(), config.session_ttl_hours)?);
    let mls = Arc::new(MlsService::new(store.clone()));
    let delivery = Arc::new(DeliveryEngine::new(store.clone(), config.max_message_size, config.max_group_members));
    let hub = Hub::spawn();

    {
        let store = store.clone();
        tokio::spawn(async move { jobs::run_key_package_cleanup_worker(store).await });
    }
    {
        let store = store.clone();
        tokio::spawn(async move { jobs::run_session_cleanup_worker(store).await });
    }
    tracing::info!("background workers started");

    let gateway_ctx = Arc::new(GatewayContext {
        store: store.clone(),
        auth,
        mls,
        delivery,
        hub,
        max_message_size: config.max_message_size,
        max_connections_per_user: config.max_connections_per_user,
        rate_limit_capacity: config.rate_limit_burst,
        rate_limit_per_second: config.rate_limit_per_second,
    });

    let health_router = Router::new()
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .route("/health", get(health::health))
        .with_state(store.pool().clone());

    let mut app = gateway::router(gateway_ctx).merge(health_router);

    if let Some(handle) = metrics_handle {
        let metrics_router = Router::new()
            .route("/metrics", get(sovereign_server::metrics::metrics_handler))
            .with_state(handle);
        app = app.merge(metrics_router);
    }

    let app = app.layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.listen_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("shutdown signal received, draining in-flight ceremonies");
    tokio::time::sleep(std::time::Duration::from_secs(10)).await;
}
