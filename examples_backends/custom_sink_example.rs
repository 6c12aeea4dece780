use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use log_relay::{
    record::LogRecord,
    sink::LogSink,
    Collector, CollectorConfig, Level, ProducerConfig, Transport,
};

/// Example of plugging a completely custom destination into the collector
/// by implementing the `LogSink` trait directly. Imagine this talks to some
/// proprietary DB for which this crate does not provide a built-in sink.
struct MyCustomDbSink;

#[async_trait]
impl LogSink for MyCustomDbSink {
    async fn deliver(&self, record: &LogRecord) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // Here you would call your own client library for the target DB.
        // For the sake of example we just print the record.
        println!("[my-custom-db] {:?}", record);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "my-custom-db"
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = CollectorConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        ..CollectorConfig::default()
    };
    let sink: Arc<dyn LogSink> = Arc::new(MyCustomDbSink);
    let collector = Collector::bind(&config, vec![sink]).await?;
    let addr = collector.local_addr()?;
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(collector.run(shutdown.clone()));

    let transport = Transport::connect(ProducerConfig::new(
        Level::Info,
        "custom-sink-example",
        std::env::temp_dir().join("log-relay-custom-sink.cache"),
        addr.to_string(),
    ))
    .await?;

    transport.info("custom sink example started").await?;
    transport.error("simulated error sent via custom sink").await?;
    transport.shutdown().await;

    // Let the collector read the records before stopping it; shutdown
    // drains what was received but does not wait for unread bytes.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    shutdown.cancel();
    server.await??;
    Ok(())
}
