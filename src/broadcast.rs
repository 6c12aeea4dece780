use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::error::Error;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use crate::format::LogFormat;
use crate::record::LogRecord;
use crate::sink::LogSink;

/// Per-viewer buffer; a viewer that falls this far behind misses lines.
pub const VIEWER_BUFFER: usize = 256;

pub type ViewerId = u64;

/// Registry of currently connected live viewers.
///
/// Viewer connections register and unregister concurrently while the
/// dispatcher broadcasts; every access goes through one lock.
#[derive(Default)]
pub struct ViewerHub {
    viewers: Mutex<HashMap<ViewerId, mpsc::Sender<String>>>,
    next_id: AtomicU64,
}

impl ViewerHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a viewer; lines broadcast from now on arrive on the receiver.
    pub fn register(&self) -> (ViewerId, mpsc::Receiver<String>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(VIEWER_BUFFER);
        self.viewers.lock().insert(id, tx);
        debug!(viewer = id, "viewer registered");
        (id, rx)
    }

    pub fn unregister(&self, id: ViewerId) {
        if self.viewers.lock().remove(&id).is_some() {
            debug!(viewer = id, "viewer unregistered");
        }
    }

    pub fn viewer_count(&self) -> usize {
        self.viewers.lock().len()
    }

    /// Push `line` to every open viewer and return how many got it.
    /// Viewers whose receiving side is gone are dropped from the registry.
    pub fn broadcast(&self, line: &str) -> usize {
        let mut viewers = self.viewers.lock();
        let mut reached = 0;
        viewers.retain(|id, tx| match tx.try_send(line.to_string()) {
            Ok(()) => {
                reached += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                warn!(viewer = *id, "viewer is lagging, line skipped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
        reached
    }
}

/// Sink that formats each record and pushes it to all live viewers.
pub struct BroadcastSink {
    format: Arc<dyn LogFormat>,
    hub: Arc<ViewerHub>,
}

impl BroadcastSink {
    pub fn new(format: Arc<dyn LogFormat>, hub: Arc<ViewerHub>) -> Self {
        Self { format, hub }
    }

    pub fn hub(&self) -> &Arc<ViewerHub> {
        &self.hub
    }
}

#[async_trait]
impl LogSink for BroadcastSink {
    async fn deliver(&self, record: &LogRecord) -> Result<(), Box<dyn Error + Send + Sync>> {
        self.hub.broadcast(&self.format.format(record));
        Ok(())
    }

    fn name(&self) -> &'static str {
        "broadcast"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PlainText;
    use crate::record::Level;
    use chrono::Utc;

    #[tokio::test]
    async fn reaches_every_registered_viewer() {
        let hub = ViewerHub::new();
        let (_, mut a) = hub.register();
        let (_, mut b) = hub.register();

        let sink = BroadcastSink::new(Arc::new(PlainText), hub.clone());
        let record = LogRecord::new("api", "live", Level::Warning, Utc::now());
        sink.deliver(&record).await.unwrap();

        assert!(a.recv().await.unwrap().ends_with("[Warning] api: live"));
        assert!(b.recv().await.unwrap().ends_with("[Warning] api: live"));
    }

    #[tokio::test]
    async fn closed_viewers_are_skipped_and_removed() {
        let hub = ViewerHub::new();
        let (_, mut open) = hub.register();
        let (_, closed) = hub.register();
        drop(closed);

        assert_eq!(hub.broadcast("line"), 1);
        assert_eq!(hub.viewer_count(), 1);
        assert_eq!(open.recv().await.unwrap(), "line");
    }

    #[test]
    fn late_viewers_miss_earlier_lines() {
        let hub = ViewerHub::new();
        assert_eq!(hub.broadcast("nobody listening"), 0);

        let (id, mut rx) = hub.register();
        assert!(rx.try_recv().is_err());
        hub.unregister(id);
        assert_eq!(hub.viewer_count(), 0);
    }

    #[test]
    fn lagging_viewer_stays_registered() {
        let hub = ViewerHub::new();
        let (_, _rx) = hub.register();
        for _ in 0..VIEWER_BUFFER {
            assert_eq!(hub.broadcast("fill"), 1);
        }
        assert_eq!(hub.broadcast("overflow"), 0);
        assert_eq!(hub.viewer_count(), 1);
    }
}
