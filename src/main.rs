use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use ride_dispatch::api;
use ride_dispatch::broadcast::heartbeat::run_heartbeat_loop;
use ride_dispatch::config::Config;
use ride_dispatch::engine::alerts::{RideAlertMonitor, run_alert_loop};
use ride_dispatch::engine::matching::MatchingEngine;
use ride_dispatch::engine::notification::NotificationDispatcher;
use ride_dispatch::engine::pipeline::{DispatchPipeline, run_dispatch_loop};
use ride_dispatch::error::AppError;
use ride_dispatch::gateway::{
    ChatGateway, FcmPushGateway, LogChatGateway, LogPushGateway, PushGateway, ServiceAccountKey,
    WebhookChatGateway,
};
use ride_dispatch::state::AppState;
use ride_dispatch::store::{MemoryStore, MySqlStore, RideStore, StoreError};

const GATEWAY_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let store = build_store(&config).await?;
    let push = build_push_gateway(&config)?;
    let chat = build_chat_gateway(&config)?;

    let shared_state = Arc::new(AppState::new(
        config.event_buffer_size,
        config.session_queue_size,
    ));

    let pipeline = DispatchPipeline::new(
        shared_state.clone(),
        MatchingEngine::new(store.clone(), config.match_radius_km),
        NotificationDispatcher::new(
            store.clone(),
            push,
            config.notify_window,
            config.push_title.clone(),
        ),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut loops = vec![
        tokio::spawn(run_dispatch_loop(
            pipeline,
            config.poll_interval,
            shutdown_rx.clone(),
        )),
        tokio::spawn(run_heartbeat_loop(
            shared_state.clone(),
            config.heartbeat_interval,
            config.inactivity_threshold,
            shutdown_rx.clone(),
        )),
    ];

    if config.alerts_enabled {
        let monitor = RideAlertMonitor::new(store.clone(), chat, config.overdue_ride_after);
        loops.push(tokio::spawn(run_alert_loop(
            monitor,
            config.alert_interval,
            shutdown_rx.clone(),
        )));
    }

    let app = api::rest::router(shared_state.clone());

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(
        http_port = config.http_port,
        poll_interval_secs = config.poll_interval.as_secs(),
        match_radius_km = config.match_radius_km,
        "ride dispatch server started"
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")));

    let _ = shutdown_tx.send(true);
    for handle in loops {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "background loop panicked");
        }
    }

    tracing::info!("ride dispatch server stopped");
    served
}

async fn build_store(config: &Config) -> Result<Arc<dyn RideStore>, AppError> {
    match &config.database_url {
        Some(url) => {
            let store = MySqlStore::connect(url, config.db_max_connections)
                .await
                .map_err(StoreError::from)?;
            tracing::info!(max_connections = config.db_max_connections, "connected to mysql");
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

fn build_push_gateway(config: &Config) -> Result<Arc<dyn PushGateway>, AppError> {
    match &config.fcm {
        Some(fcm) => {
            let key = ServiceAccountKey::load(&fcm.credentials)
                .map_err(|err| AppError::Config(err.to_string()))?;
            let gateway = FcmPushGateway::new(key, fcm.project_id.clone(), GATEWAY_TIMEOUT)
                .map_err(|err| AppError::Config(err.to_string()))?;
            Ok(Arc::new(gateway))
        }
        None => {
            tracing::warn!("FCM_CREDENTIALS not set; push notifications are only logged");
            Ok(Arc::new(LogPushGateway))
        }
    }
}

fn build_chat_gateway(config: &Config) -> Result<Arc<dyn ChatGateway>, AppError> {
    match &config.chat_webhook_url {
        Some(url) => {
            let gateway = WebhookChatGateway::new(url.clone(), GATEWAY_TIMEOUT)
                .map_err(|err| AppError::Config(err.to_string()))?;
            Ok(Arc::new(gateway))
        }
        None => Ok(Arc::new(LogChatGateway)),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
