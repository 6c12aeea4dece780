//! Collector-side queue between connection decoders and sink adapters.
//!
//! Many decoders [`put`](DispatchQueue::put) into one bounded queue; one or
//! more dispatcher workers [`take`](DispatchQueue::take) from it and hand
//! each record to every sink in registration order. A full queue blocks the
//! decoder, which in turn stops reading its socket and slows the producer.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::record::LogRecord;
use crate::sink::LogSink;

/// Order in which queued records are dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOrder {
    /// First in, first out.
    #[default]
    Arrival,
    /// Earliest `created_at` first; ties keep arrival order.
    CreatedAt,
}

impl FromStr for QueueOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "arrival" | "fifo" => Ok(QueueOrder::Arrival),
            "created" | "created_at" | "time" => Ok(QueueOrder::CreatedAt),
            other => Err(format!("unknown queue order {other:?}")),
        }
    }
}

#[derive(thiserror::Error, Debug)]
#[error("dispatch queue is closed")]
pub struct QueueClosed(pub LogRecord);

struct Queued {
    key: Option<DateTime<Utc>>,
    seq: u64,
    record: LogRecord,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.key.cmp(&other.key).then(self.seq.cmp(&other.seq))
    }
}

struct State {
    heap: BinaryHeap<Reverse<Queued>>,
    closed: bool,
}

struct Shared {
    order: QueueOrder,
    state: Mutex<State>,
    /// One permit per free slot.
    slots: Semaphore,
    available: Notify,
    seq: AtomicU64,
}

/// Bounded multi-producer, multi-consumer record queue.
#[derive(Clone)]
pub struct DispatchQueue {
    shared: Arc<Shared>,
}

impl DispatchQueue {
    pub fn new(capacity: usize, order: QueueOrder) -> Self {
        let capacity = capacity.max(1);
        Self {
            shared: Arc::new(Shared {
                order,
                state: Mutex::new(State {
                    heap: BinaryHeap::with_capacity(capacity),
                    closed: false,
                }),
                slots: Semaphore::new(capacity),
                available: Notify::new(),
                seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn order(&self) -> QueueOrder {
        self.shared.order
    }

    /// Enqueue a record, waiting for a free slot while the queue is full.
    pub async fn put(&self, record: LogRecord) -> Result<(), QueueClosed> {
        let permit = match self.shared.slots.acquire().await {
            Ok(permit) => permit,
            Err(_) => return Err(QueueClosed(record)),
        };

        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(QueueClosed(record));
        }
        permit.forget();

        let key = match self.shared.order {
            QueueOrder::Arrival => None,
            QueueOrder::CreatedAt => Some(record.created_at()),
        };
        let seq = self.shared.seq.fetch_add(1, Ordering::Relaxed);
        state.heap.push(Reverse(Queued { key, seq, record }));
        drop(state);

        self.shared.available.notify_one();
        Ok(())
    }

    /// Dequeue the next record; `None` once the queue is closed and empty.
    pub async fn take(&self) -> Option<LogRecord> {
        loop {
            let notified = self.shared.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.shared.state.lock();
                if let Some(Reverse(queued)) = state.heap.pop() {
                    drop(state);
                    self.shared.slots.add_permits(1);
                    return Some(queued.record);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Stop accepting records. Queued records can still be taken.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.slots.close();
        self.shared.available.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.shared.state.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pulls records off a [`DispatchQueue`] and fans them out to sinks.
pub struct Dispatcher {
    queue: DispatchQueue,
    sinks: Arc<Vec<Arc<dyn LogSink>>>,
}

impl Dispatcher {
    pub fn new(queue: DispatchQueue, sinks: Vec<Arc<dyn LogSink>>) -> Self {
        Self {
            queue,
            sinks: Arc::new(sinks),
        }
    }

    /// Spawn `workers` dispatcher tasks. They exit after the queue is
    /// closed and drained, flushing every sink on the way out.
    pub fn spawn(self, workers: usize) -> Vec<JoinHandle<()>> {
        (0..workers.max(1))
            .map(|worker| {
                let queue = self.queue.clone();
                let sinks = Arc::clone(&self.sinks);
                tokio::spawn(async move {
                    while let Some(record) = queue.take().await {
                        dispatch(&sinks, &record).await;
                    }
                    for sink in sinks.iter() {
                        if let Err(e) = sink.flush().await {
                            error!(sink = sink.name(), error = %e, "sink flush failed");
                        }
                    }
                    debug!(worker, "dispatcher stopped");
                })
            })
            .collect()
    }
}

/// Deliver one record to each sink; a failing sink does not stop the others.
pub async fn dispatch(sinks: &[Arc<dyn LogSink>], record: &LogRecord) {
    for sink in sinks {
        if let Err(e) = sink.deliver(record).await {
            error!(
                sink = sink.name(),
                source = record.source(),
                error = %e,
                "sink failed to deliver record"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Level;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::error::Error;
    use std::time::Duration;
    use tokio::time::timeout;

    fn at(secs: i64, message: &str) -> LogRecord {
        LogRecord::new("q", message, Level::Info, Utc.timestamp_opt(secs, 0).unwrap())
    }

    #[tokio::test]
    async fn arrival_order_is_fifo() {
        let queue = DispatchQueue::new(8, QueueOrder::Arrival);
        for (secs, msg) in [(3, "a"), (1, "b"), (2, "c")] {
            queue.put(at(secs, msg)).await.unwrap();
        }
        let mut out = Vec::new();
        for _ in 0..3 {
            out.push(queue.take().await.unwrap().message().to_string());
        }
        assert_eq!(out, ["a", "b", "c"]);
    }

    #[tokio::test]
    async fn created_order_sorts_by_creation_and_keeps_ties_stable() {
        let queue = DispatchQueue::new(8, QueueOrder::CreatedAt);
        for (secs, msg) in [(3, "late"), (1, "first"), (2, "tie-1"), (2, "tie-2")] {
            queue.put(at(secs, msg)).await.unwrap();
        }
        let mut out = Vec::new();
        while !queue.is_empty() {
            out.push(queue.take().await.unwrap().message().to_string());
        }
        assert_eq!(out, ["first", "tie-1", "tie-2", "late"]);
    }

    #[tokio::test]
    async fn full_queue_blocks_put_until_a_take() {
        let queue = DispatchQueue::new(1, QueueOrder::Arrival);
        queue.put(at(1, "one")).await.unwrap();

        let blocked = queue.clone();
        let pending = tokio::spawn(async move { blocked.put(at(2, "two")).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        assert_eq!(queue.take().await.unwrap().message(), "one");
        timeout(Duration::from_secs(1), pending).await.unwrap().unwrap().unwrap();
        assert_eq!(queue.take().await.unwrap().message(), "two");
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let queue = DispatchQueue::new(4, QueueOrder::Arrival);
        queue.put(at(1, "left over")).await.unwrap();
        queue.close();

        assert!(queue.put(at(2, "rejected")).await.is_err());
        assert_eq!(queue.take().await.unwrap().message(), "left over");
        assert!(queue.take().await.is_none());
    }

    #[tokio::test]
    async fn close_wakes_idle_takers() {
        let queue = DispatchQueue::new(4, QueueOrder::Arrival);
        let taker = queue.clone();
        let handle = tokio::spawn(async move { taker.take().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        assert!(timeout(Duration::from_secs(1), handle).await.unwrap().unwrap().is_none());
    }

    struct Failing;

    #[async_trait]
    impl LogSink for Failing {
        async fn deliver(&self, _record: &LogRecord) -> Result<(), Box<dyn Error + Send + Sync>> {
            Err("boom".into())
        }
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<String>>);

    #[async_trait]
    impl LogSink for Recording {
        async fn deliver(&self, record: &LogRecord) -> Result<(), Box<dyn Error + Send + Sync>> {
            self.0.lock().push(record.message().to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn failing_sink_does_not_block_later_sinks() {
        let recording = Arc::new(Recording::default());
        let queue = DispatchQueue::new(4, QueueOrder::Arrival);
        let handles = Dispatcher::new(
            queue.clone(),
            vec![Arc::new(Failing) as Arc<dyn LogSink>, recording.clone()],
        )
        .spawn(1);

        queue.put(at(1, "one")).await.unwrap();
        queue.put(at(2, "two")).await.unwrap();
        queue.close();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*recording.0.lock(), ["one", "two"]);
    }
}
