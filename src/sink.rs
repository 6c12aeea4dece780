use crate::record::LogRecord;
use async_trait::async_trait;
use std::error::Error;

/// Asynchronous destination for [`LogRecord`]s leaving the dispatch pipeline.
///
/// Implementations turn a record into an external effect (a line in a file,
/// a message to live viewers, etc). Dispatcher workers call `deliver` once
/// per record and sink, in registration order.
#[async_trait]
pub trait LogSink: Send + Sync {
    /// Deliver a single record.
    ///
    /// **Parameters**
    /// - `record`: record stamped with its collector receipt time.
    ///
    /// **Returns**
    /// - `Ok(())` if the record reached the destination.
    /// - `Err(..)` if it did not. The dispatcher logs the failure and moves
    ///   on to the next sink; the record is not retried.
    async fn deliver(&self, record: &LogRecord) -> Result<(), Box<dyn Error + Send + Sync>>;

    /// Flush any buffered output. Called when the dispatcher stops.
    ///
    /// Default implementation is a no-op.
    async fn flush(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }

    /// Short name used in diagnostics.
    fn name(&self) -> &'static str {
        "sink"
    }
}
