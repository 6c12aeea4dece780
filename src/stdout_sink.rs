use async_trait::async_trait;
use std::error::Error;
use std::sync::Arc;
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::Mutex;

use crate::format::LogFormat;
use crate::record::LogRecord;
use crate::sink::LogSink;

/// Writes each formatted record as one line on standard output.
pub struct StdoutSink {
    format: Arc<dyn LogFormat>,
    out: Mutex<Stdout>,
}

impl StdoutSink {
    pub fn new(format: Arc<dyn LogFormat>) -> Self {
        Self {
            format,
            out: Mutex::new(tokio::io::stdout()),
        }
    }
}

#[async_trait]
impl LogSink for StdoutSink {
    async fn deliver(&self, record: &LogRecord) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut line = self.format.format(record);
        line.push('\n');
        let mut out = self.out.lock().await;
        out.write_all(line.as_bytes()).await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.out.lock().await.flush().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "stdout"
    }
}
