use std::sync::Arc;

use fanout_gateway::config::{Config, LogFormat};
use fanout_gateway::AppState;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(1);
        }
    };

    init_tracing(config.log_format);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let state = match AppState::new(config) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to start the broker consumer");
            std::process::exit(1);
        }
    };

    let kafka_task = tokio::spawn({
        let kafka = Arc::clone(&state.kafka);
        let shutdown_rx = shutdown_rx.clone();
        async move { kafka.run(shutdown_rx).await }
    });
    let cpu_sampler_task = tokio::spawn({
        let resource_guard = Arc::clone(&state.hub.resource_guard);
        let shutdown_rx = shutdown_rx.clone();
        async move { resource_guard.run_cpu_sampler(shutdown_rx).await }
    });
    let rate_limiter_sweep_task = tokio::spawn({
        let rate_limiter = Arc::clone(&state.hub.rate_limiter);
        let shutdown_rx = shutdown_rx.clone();
        async move { rate_limiter.run_sweeper(shutdown_rx).await }
    });
    let metrics_task = tokio::spawn({
        let hub = Arc::clone(&state.hub);
        let shutdown_rx = shutdown_rx.clone();
        async move { hub.run_metrics_reporter(shutdown_rx).await }
    });

    let bind_addr = state.config.bind_addr;
    let hub = Arc::clone(&state.hub);
    let router = fanout_gateway::build_router(state);
    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .expect("failed to bind");
    info!(addr = %bind_addr, "gateway listening");

    // The signal waits once here and fans the result out two ways: axum
    // stops accepting new connections as soon as the watch flips, while
    // this task notifies already-connected clients and waits (bounded)
    // for them to drain before the process tears down the listener.
    let drain_task = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        let hub = Arc::clone(&hub);
        async move {
            shutdown_signal().await;
            let _ = shutdown_tx.send(true);
            hub.shutdown().await;
            drop(shutdown_rx);
        }
    });

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(wait_for_shutdown(shutdown_rx))
    .await
    .expect("server error");

    let _ = drain_task.await;
    let _ = tokio::join!(
        kafka_task,
        cpu_sampler_task,
        rate_limiter_sweep_task,
        metrics_task
    );
    info!("gateway shut down gracefully");
}

/// Resolves once the shutdown watch flips to `true`, for axum's graceful
/// shutdown future to await without racing its own signal handler against
/// [`shutdown_signal`].
async fn wait_for_shutdown(mut shutdown_rx: watch::Receiver<bool>) {
    while !*shutdown_rx.borrow() {
        if shutdown_rx.changed().await.is_err() {
            return;
        }
    }
}

fn init_tracing(format: LogFormat) {
    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    let filter = EnvFilter::try_new(&log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => {
            tracing_subscriber::fmt().json().with_env_filter(filter).init();
        }
        LogFormat::Text => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
