use async_trait::async_trait;
use chrono::SecondsFormat;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::format::LogFormat;
use crate::record::LogRecord;
use crate::sink::LogSink;

/// Append-only file store. Each record becomes one line keyed by its
/// collector receipt time:
///
/// ```text
/// 2024-05-01T12:00:00.731Z | [2024-05-01T12:00:00.500Z] [Info] billing-7: payment failed
/// ```
pub struct FileSink {
    path: PathBuf,
    format: Arc<dyn LogFormat>,
    file: Mutex<File>,
}

impl FileSink {
    /// Open (or create) the store at `path` for appending.
    pub async fn open(
        path: impl Into<PathBuf>,
        format: Arc<dyn LogFormat>,
    ) -> Result<Self, std::io::Error> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            format,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LogSink for FileSink {
    async fn deliver(&self, record: &LogRecord) -> Result<(), Box<dyn Error + Send + Sync>> {
        let key = record
            .processed_at()
            .ok_or("record reached the store without a receipt time")?;
        let mut line = key.to_rfc3339_opts(SecondsFormat::AutoSi, true);
        line.push_str(" | ");
        line.push_str(&self.format.format(record));
        line.push('\n');

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{Csv, PlainText};
    use crate::record::Level;
    use chrono::Utc;
    use tempfile::TempDir;

    #[tokio::test]
    async fn appends_one_line_per_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store").join("relay.log");
        let sink = FileSink::open(&path, Arc::new(PlainText)).await.unwrap();

        for message in ["first", "second"] {
            let record = LogRecord::new("api", message, Level::Info, Utc::now()).processed(Utc::now());
            sink.deliver(&record).await.unwrap();
        }
        sink.flush().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("[Info] api: first"));
        assert!(lines[1].ends_with("api: second"));
        assert!(lines[0].contains(" | ["));
    }

    #[tokio::test]
    async fn reopening_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("relay.csv");
        let record = LogRecord::new("api", "x", Level::Error, Utc::now()).processed(Utc::now());

        FileSink::open(&path, Arc::new(Csv)).await.unwrap().deliver(&record).await.unwrap();
        FileSink::open(&path, Arc::new(Csv)).await.unwrap().deliver(&record).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn rejects_unstamped_records() {
        let dir = TempDir::new().unwrap();
        let sink = FileSink::open(dir.path().join("relay.log"), Arc::new(PlainText))
            .await
            .unwrap();
        let record = LogRecord::new("api", "x", Level::Info, Utc::now());
        assert!(sink.deliver(&record).await.is_err());
    }
}
