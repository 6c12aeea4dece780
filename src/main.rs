use log_relay::config::{CollectorConfig, LoggingConfig};
use log_relay::error::CollectorError;
use log_relay::init::init_collector_tracing;
use log_relay::Collector;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), CollectorError> {
    if let Err(e) = init_collector_tracing(&LoggingConfig::from_env()) {
        eprintln!("failed to initialize tracing: {e}");
    }

    let config = CollectorConfig::from_env()?;
    info!(
        listen = %config.listen_addr,
        sinks = ?config.sinks,
        format = ?config.format,
        order = ?config.queue_order,
        "starting collector"
    );
    let collector = Collector::from_config(&config).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    collector.run(shutdown).await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT, shutting down"),
        () = terminate => info!("received SIGTERM, shutting down"),
    }
}
