use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use envconfig::Envconfig;
use futures::future::ready;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::signal::unix::SignalKind;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

use kafka_relay::{config::Config, health::Liveness, service::RelayService};

fn setup_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install metrics recorder")
}

fn start_server(config: &Config, liveness: Arc<Liveness>) -> Result<JoinHandle<()>> {
    let router = Router::new()
        .route("/", get(|| async { "kafka relay" }))
        .route("/_readiness", get(|| async { "ok" }))
        .route(
            "/_liveness",
            get(move || {
                let status = liveness.status();
                if !status.is_healthy() {
                    error!("Health check FAILED - relay loop status: {:?}", status);
                }
                ready(status)
            }),
        );

    let router = if config.export_prometheus {
        let recorder_handle = setup_metrics()?;
        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    };

    let bind = config.bind_address.clone();

    Ok(tokio::task::spawn(async move {
        let served = match tokio::net::TcpListener::bind(&bind).await {
            Ok(listener) => axum::serve(listener, router).await,
            Err(e) => Err(e),
        };
        if let Err(e) = served {
            error!("Failed to serve metrics on {}: {}", bind, e);
        }
    }))
}

async fn wait_for_shutdown_signal(cancel: CancellationToken) -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = cancel.cancelled() => return Ok(()),
    }

    cancel.cancel();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::init_from_env()
        .context("Failed to load configuration from environment variables")?;

    // Initialize tracing
    let log_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_level(true)
        .with_filter(EnvFilter::from_default_env())
        .boxed();

    tracing_subscriber::registry().with(log_layer).init();

    info!("Starting Kafka relay");
    info!(
        "Relaying {} -> {} as group {}",
        config.kafka_source_topic, config.kafka_destination_topic, config.kafka_consumer_group
    );

    // The relay loop reports at least once per heartbeat while it is running
    let liveness = Arc::new(Liveness::new(config.heartbeat_interval() * 3));

    let server_handle = start_server(&config, liveness.clone())?;
    info!("Started metrics server on {}", config.bind_address);

    let service =
        RelayService::new(&config, liveness).context("Failed to create relay service")?;

    let cancel = CancellationToken::new();
    let signals = tokio::spawn(wait_for_shutdown_signal(cancel.clone()));

    // Run the service (this blocks until shutdown)
    let result = service.run(cancel.clone()).await;

    cancel.cancel();
    match signals.await {
        Ok(Err(e)) => error!("Signal handling failed: {:#}", e),
        Err(e) => error!("Signal handler task failed: {}", e),
        Ok(Ok(())) => {}
    }
    server_handle.abort();

    result
}
