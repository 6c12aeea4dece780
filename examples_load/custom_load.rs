use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use log_relay::noop_sink::NoopSink;
use log_relay::pipeline::QueueOrder;
use log_relay::{Collector, CollectorConfig, Level, LogSink, ProducerConfig, Transport};

/// Several producers hammer one collector directly through `Transport`,
/// without going through `tracing`.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let producers: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(8);
    let per_producer: usize = std::env::args()
        .nth(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(20_000);

    let collector_config = CollectorConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        queue_capacity: 50_000,
        queue_order: QueueOrder::CreatedAt,
        dispatch_workers: 4,
        ..CollectorConfig::default()
    };
    let collector = Collector::bind(&collector_config, vec![Arc::new(NoopSink) as Arc<dyn LogSink>]).await?;
    let addr = collector.local_addr()?.to_string();
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(collector.run(shutdown.clone()));

    let start = Instant::now();
    let mut tasks = JoinSet::new();
    for p in 0..producers {
        let config = ProducerConfig::new(
            Level::Debug,
            format!("load-{p}"),
            std::env::temp_dir().join(format!("log-relay-custom-load-{p}.cache")),
            addr.clone(),
        );
        tasks.spawn(async move {
            let transport = Transport::connect(config).await?;
            for i in 0..per_producer {
                transport.send(format!("custom load record {i}"), Level::Info).await?;
            }
            transport.shutdown().await;
            Ok::<_, log_relay::error::TransportError>(())
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined??;
    }

    let n = producers * per_producer;
    let elapsed = start.elapsed();
    println!("custom config: sent {} records from {} producers in {:?} (~{:.0} rec/s)",
        n,
        producers,
        elapsed,
        n as f64 / elapsed.as_secs_f64()
    );

    shutdown.cancel();
    server.await??;
    Ok(())
}
