use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};
use tokio_util::sync::CancellationToken;
use tracing::error;

use log_relay::init::init_tracing;
use log_relay::noop_sink::NoopSink;
use log_relay::{Collector, CollectorConfig, Level, LogSink, ProducerConfig, Transport};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // In-process collector that discards everything it receives.
    let collector_config = CollectorConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        ..CollectorConfig::default()
    };
    let collector = Collector::bind(&collector_config, vec![Arc::new(NoopSink) as Arc<dyn LogSink>]).await?;
    let addr = collector.local_addr()?;
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(collector.run(shutdown.clone()));

    let fallback = std::env::temp_dir().join("log-relay-default-load.cache");
    let transport = Transport::connect(ProducerConfig::new(
        Level::Info,
        "default-load",
        fallback,
        addr.to_string(),
    ))
    .await?;
    init_tracing(transport.clone())?;

    let n: u64 = 100_000;
    let start = Instant::now();

    for i in 0..n {
        error!(iteration = i, "default load test error");
    }

    let elapsed = start.elapsed();
    println!("default config: emitted {} events in {:?} (~{:.0} ev/s)",
        n,
        elapsed,
        n as f64 / elapsed.as_secs_f64()
    );

    // Give the forwarding task a little time to drain the channel
    sleep(Duration::from_secs(2)).await;
    transport.shutdown().await;
    shutdown.cancel();
    server.await??;
    Ok(())
}
