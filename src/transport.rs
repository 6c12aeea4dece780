//! Producer side: one logical connection to the collector, backed by the
//! fallback cache whenever the connection is down.
//!
//! Every record that passes the level filter either reaches the wire or
//! the cache. All writes (live sends and cache replay) go through the
//! single writer lock, so records cached during an outage are always
//! written before anything produced after reconnection.

use async_trait::async_trait;
use chrono::Utc;
use futures::SinkExt;
use std::error::Error;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{sleep, timeout};
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{FallbackCache, ReplayError, ReplaySink};
use crate::config::ProducerConfig;
use crate::error::{CodecError, TransportError};
use crate::record::{Level, LogRecord};
use crate::wire::LogRecordCodec;

type Connection = FramedWrite<OwnedWriteHalf, LogRecordCodec>;

/// Upper bound on a single connect attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
impl ReplaySink for Connection {
    type Error = CodecError;

    async fn replay_record(&mut self, record: LogRecord) -> Result<(), CodecError> {
        self.send(&record).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Reconnecting,
}

/// Handle to the producer transport. Cheap to clone and safe to share
/// between tasks.
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

struct Inner {
    source: String,
    min_level: AtomicU8,
    collector_addr: String,
    reconnect_interval: Duration,
    writer: Mutex<Writer>,
    /// Set while a reconnection loop is running; flipped only under the writer lock.
    reconnecting: AtomicBool,
    shutdown: CancellationToken,
}

struct Writer {
    conn: Option<Connection>,
    /// Bumped for each installed connection so stale watchers stand down.
    generation: u64,
    cache: FallbackCache,
    closed: bool,
}

impl Transport {
    /// Open the fallback cache and connect to the collector.
    ///
    /// A failed initial connect is not an error: the transport starts in
    /// [`ConnectionState::Reconnecting`] and caches records until the
    /// collector is reachable. Only an invalid configuration or a fallback
    /// cache that cannot be opened fails construction.
    pub async fn connect(config: ProducerConfig) -> Result<Self, TransportError> {
        config.validate()?;
        let cache = FallbackCache::open(&config.fallback_path).await?;
        let inner = Arc::new(Inner {
            source: config.source.clone(),
            min_level: AtomicU8::new(config.minimum_level.ordinal()),
            collector_addr: config.collector_addr.clone(),
            reconnect_interval: config.reconnect_interval(),
            writer: Mutex::new(Writer {
                conn: None,
                generation: 0,
                cache,
                closed: false,
            }),
            reconnecting: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });

        let mut writer = inner.writer.lock().await;
        match open_stream(&inner.collector_addr).await {
            Ok(stream) => {
                inner.install(&mut writer, stream);
                info!(collector = %inner.collector_addr, source = %inner.source, "connected to collector");
                match inner.replay_pending(&mut writer).await {
                    Ok(_) => {}
                    Err(TransportError::Write(e)) => {
                        warn!(error = %e, "connection lost while replaying fallback cache");
                        writer.conn = None;
                        inner.arm_reconnect();
                    }
                    Err(e) => error!(error = %e, "fallback cache could not be replayed"),
                }
            }
            Err(e) => {
                warn!(error = %e, "collector unreachable, caching records until it is back");
                inner.arm_reconnect();
            }
        }
        drop(writer);

        Ok(Self { inner })
    }

    /// Send `message` at `level`, stamped with the current time.
    ///
    /// Records below the minimum level are dropped without side effects.
    /// Collector outages are absorbed by the fallback cache; an error is
    /// returned only when the record could not be cached either, or after
    /// [`Transport::shutdown`].
    pub async fn send(&self, message: impl Into<String>, level: Level) -> Result<(), TransportError> {
        if !level.passes(self.min_level()) {
            return Ok(());
        }
        let record = LogRecord::new(self.inner.source.as_str(), message, level, Utc::now());
        self.inner.deliver(record).await
    }

    /// Send a record built elsewhere, keeping its creation time.
    ///
    /// The record's level is checked against the minimum like [`send`](Self::send).
    pub async fn send_record(&self, record: LogRecord) -> Result<(), TransportError> {
        if !record.level().passes(self.min_level()) {
            return Ok(());
        }
        self.inner.deliver(record).await
    }

    pub async fn log(&self, level: Level, message: impl Into<String>) -> Result<(), TransportError> {
        self.send(message, level).await
    }

    pub async fn debug(&self, message: impl Into<String>) -> Result<(), TransportError> {
        self.send(message, Level::Debug).await
    }

    pub async fn info(&self, message: impl Into<String>) -> Result<(), TransportError> {
        self.send(message, Level::Info).await
    }

    pub async fn warn(&self, message: impl Into<String>) -> Result<(), TransportError> {
        self.send(message, Level::Warning).await
    }

    pub async fn error(&self, message: impl Into<String>) -> Result<(), TransportError> {
        self.send(message, Level::Error).await
    }

    /// Log an error together with its chain of sources.
    pub async fn error_with(
        &self,
        message: impl Into<String>,
        err: &(dyn Error + 'static),
    ) -> Result<(), TransportError> {
        let mut text = message.into();
        text.push_str(": ");
        text.push_str(&err.to_string());
        let mut source = err.source();
        while let Some(cause) = source {
            text.push_str("\n  caused by: ");
            text.push_str(&cause.to_string());
            source = cause.source();
        }
        self.send(text, Level::Error).await
    }

    pub fn min_level(&self) -> Level {
        Level::from_ordinal(self.inner.min_level.load(Ordering::Relaxed)).unwrap_or(Level::Debug)
    }

    pub fn set_min_level(&self, level: Level) {
        self.inner.min_level.store(level.ordinal(), Ordering::Relaxed);
    }

    pub fn source(&self) -> &str {
        &self.inner.source
    }

    pub async fn state(&self) -> ConnectionState {
        if self.inner.writer.lock().await.conn.is_some() {
            ConnectionState::Connected
        } else {
            ConnectionState::Reconnecting
        }
    }

    /// Records waiting in the fallback cache.
    pub async fn cached(&self) -> usize {
        self.inner.writer.lock().await.cache.pending()
    }

    /// Flush and close the connection and stop any reconnection loop.
    /// Later sends fail with [`TransportError::Closed`].
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let mut writer = self.inner.writer.lock().await;
        writer.closed = true;
        if let Some(mut conn) = writer.conn.take() {
            if let Err(e) = SinkExt::<&LogRecord>::close(&mut conn).await {
                debug!(error = %e, "error closing collector connection");
            }
        }
        info!(source = %self.inner.source, "transport shut down");
    }
}

impl Inner {
    async fn deliver(self: &Arc<Self>, record: LogRecord) -> Result<(), TransportError> {
        let mut writer = self.writer.lock().await;
        if writer.closed {
            return Err(TransportError::Closed);
        }

        if writer.conn.is_some() {
            match self.write_live(&mut writer, &record).await {
                Ok(()) => return Ok(()),
                Err(TransportError::Write(e)) => {
                    warn!(error = %e, "lost connection to collector, caching record");
                    writer.conn = None;
                }
                Err(e) => return Err(e),
            }
        }

        if let Err(e) = writer.cache.append(&record).await {
            error!(error = %e, "record could be neither sent nor cached and is lost");
            return Err(e.into());
        }
        self.arm_reconnect();
        Ok(())
    }

    /// Write one record on the live connection, draining any cache backlog first.
    async fn write_live(&self, writer: &mut Writer, record: &LogRecord) -> Result<(), TransportError> {
        self.replay_pending(writer).await?;
        match writer.conn.as_mut() {
            Some(conn) => Ok(conn.send(record).await?),
            None => Err(TransportError::Closed),
        }
    }

    async fn replay_pending(&self, writer: &mut Writer) -> Result<usize, TransportError> {
        let Writer { conn, cache, .. } = writer;
        let Some(conn) = conn.as_mut() else {
            return Ok(0);
        };
        if cache.pending() == 0 {
            return Ok(0);
        }
        match cache.replay(conn).await {
            Ok(replayed) => Ok(replayed),
            Err(ReplayError::Sink(e)) => Err(TransportError::Write(e)),
            Err(ReplayError::Cache(e)) => Err(TransportError::Cache(e)),
        }
    }

    fn install(self: &Arc<Self>, writer: &mut Writer, stream: TcpStream) {
        writer.generation += 1;
        let (read_half, write_half) = stream.into_split();
        writer.conn = Some(FramedWrite::new(write_half, LogRecordCodec::new()));
        tokio::spawn(watch_peer(Arc::downgrade(self), writer.generation, read_half));
    }

    /// Start the reconnection loop unless one is already running.
    /// Callers hold the writer lock.
    fn arm_reconnect(self: &Arc<Self>) {
        if self.shutdown.is_cancelled() {
            return;
        }
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            debug!(collector = %self.collector_addr, "reconnection loop armed");
            tokio::spawn(reconnect_loop(Arc::downgrade(self)));
        }
    }
}

async fn open_stream(addr: &str) -> Result<TcpStream, TransportError> {
    let connected = match timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
    };
    let stream = connected.map_err(|source| TransportError::Connect {
        address: addr.to_string(),
        source,
    })?;
    stream.set_nodelay(true).ok();
    Ok(stream)
}

async fn reconnect_loop(inner: Weak<Inner>) {
    loop {
        let (interval, addr, shutdown) = match inner.upgrade() {
            Some(inner) => (
                inner.reconnect_interval,
                inner.collector_addr.clone(),
                inner.shutdown.clone(),
            ),
            None => return,
        };

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = sleep(interval) => {}
        }

        let stream = match open_stream(&addr).await {
            Ok(stream) => stream,
            Err(e) => {
                debug!(error = %e, "reconnect attempt failed");
                continue;
            }
        };

        let Some(inner) = inner.upgrade() else { return };
        let mut writer = inner.writer.lock().await;
        if writer.closed {
            inner.reconnecting.store(false, Ordering::Release);
            return;
        }

        inner.install(&mut writer, stream);
        match inner.replay_pending(&mut writer).await {
            Ok(replayed) => {
                info!(collector = %addr, replayed, "reconnected to collector");
                inner.reconnecting.store(false, Ordering::Release);
                return;
            }
            Err(TransportError::Write(e)) => {
                warn!(error = %e, "connection lost while replaying fallback cache");
                writer.conn = None;
            }
            Err(e) => {
                // The connection stays up; the next send retries the replay
                // and reports the failure to its caller.
                error!(error = %e, "fallback cache could not be replayed");
                inner.reconnecting.store(false, Ordering::Release);
                return;
            }
        }
    }
}

/// Watch the read half: the collector never writes, so any read completing
/// means the peer closed or reset the connection.
async fn watch_peer(inner: Weak<Inner>, generation: u64, mut read_half: OwnedReadHalf) {
    let mut buf = [0u8; 256];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => continue,
        }
    }

    let Some(inner) = inner.upgrade() else { return };
    let mut writer = inner.writer.lock().await;
    if writer.generation == generation && writer.conn.is_some() && !writer.closed {
        warn!(collector = %inner.collector_addr, "collector closed the connection");
        writer.conn = None;
        inner.arm_reconnect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tempfile::TempDir;
    use tokio::net::TcpListener;
    use tokio::time::timeout;
    use tokio_util::codec::FramedRead;

    fn config(dir: &TempDir, addr: String, min: Level) -> ProducerConfig {
        ProducerConfig {
            reconnect_interval_ms: 20,
            ..ProducerConfig::new(min, "unit-producer", dir.path().join("cache.log"), addr)
        }
    }

    async fn unused_addr() -> std::net::SocketAddr {
        let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
        reserved.local_addr().unwrap()
    }

    async fn next_record(frames: &mut FramedRead<TcpStream, LogRecordCodec>) -> LogRecord {
        timeout(Duration::from_secs(5), frames.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("decode failed")
    }

    #[tokio::test]
    async fn sends_over_live_connection() {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let transport = Transport::connect(config(&dir, addr, Level::Debug)).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let mut frames = FramedRead::new(stream, LogRecordCodec::new());

        transport.info("hello").await.unwrap();
        let record = next_record(&mut frames).await;
        assert_eq!(record.message(), "hello");
        assert_eq!(record.level(), Level::Info);
        assert_eq!(record.source(), "unit-producer");
        assert_eq!(record.processed_at(), None);
        assert_eq!(transport.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn records_below_minimum_have_no_effect() {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let transport = Transport::connect(config(&dir, addr, Level::Warning)).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let mut frames = FramedRead::new(stream, LogRecordCodec::new());

        transport.debug("quiet").await.unwrap();
        transport.info("still quiet").await.unwrap();
        transport.warn("loud").await.unwrap();

        assert_eq!(next_record(&mut frames).await.message(), "loud");
        assert!(!dir.path().join("cache.log").exists());

        transport.set_min_level(Level::Error);
        transport.warn("now filtered").await.unwrap();
        transport.error("passes").await.unwrap();
        assert_eq!(next_record(&mut frames).await.message(), "passes");
    }

    #[tokio::test]
    async fn caches_while_down_and_replays_in_order_on_reconnect() {
        let dir = TempDir::new().unwrap();
        let addr = unused_addr().await;

        let transport = Transport::connect(config(&dir, addr.to_string(), Level::Debug)).await.unwrap();
        assert_eq!(transport.state().await, ConnectionState::Reconnecting);

        for i in 0..3 {
            transport.info(format!("offline-{i}")).await.unwrap();
        }
        assert_eq!(transport.cached().await, 3);
        let cached = std::fs::read_to_string(dir.path().join("cache.log")).unwrap();
        assert_eq!(cached.lines().count(), 3);

        let listener = TcpListener::bind(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let mut frames = FramedRead::new(stream, LogRecordCodec::new());

        for i in 0..3 {
            assert_eq!(next_record(&mut frames).await.message(), format!("offline-{i}"));
        }
        transport.info("online").await.unwrap();
        assert_eq!(next_record(&mut frames).await.message(), "online");

        assert_eq!(transport.cached().await, 0);
        assert!(!dir.path().join("cache.log").exists());
    }

    #[tokio::test]
    async fn reconnects_after_collector_drops_live_connection() {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let slow_retry = ProducerConfig {
            reconnect_interval_ms: 200,
            ..config(&dir, addr, Level::Debug)
        };
        let transport = Transport::connect(slow_retry).await.unwrap();

        let (first, _) = listener.accept().await.unwrap();
        drop(first);
        timeout(Duration::from_secs(5), async {
            while transport.state().await == ConnectionState::Connected {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("peer close was never noticed");

        transport.info("during-outage").await.unwrap();

        let (second, _) = listener.accept().await.unwrap();
        let mut frames = FramedRead::new(second, LogRecordCodec::new());
        assert_eq!(next_record(&mut frames).await.message(), "during-outage");

        transport.info("after").await.unwrap();
        assert_eq!(next_record(&mut frames).await.message(), "after");
        assert_eq!(transport.state().await, ConnectionState::Connected);
        assert_eq!(transport.cached().await, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sends_while_down_start_one_reconnect_loop() {
        let dir = TempDir::new().unwrap();
        let addr = unused_addr().await;
        let transport = Transport::connect(config(&dir, addr.to_string(), Level::Debug)).await.unwrap();

        let sends = (0..16).map(|i| {
            let transport = transport.clone();
            async move { transport.info(format!("burst-{i}")).await }
        });
        for result in futures::future::join_all(sends).await {
            result.unwrap();
        }
        assert_eq!(transport.cached().await, 16);
        assert!(transport.inner.reconnecting.load(Ordering::Acquire));

        let listener = TcpListener::bind(addr).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let mut frames = FramedRead::new(stream, LogRecordCodec::new());
        let mut seen = std::collections::HashSet::new();
        for _ in 0..16 {
            assert!(seen.insert(next_record(&mut frames).await.message().to_string()));
        }

        // A second loop would open a second connection.
        assert!(timeout(Duration::from_millis(300), listener.accept()).await.is_err());
        assert!(!transport.inner.reconnecting.load(Ordering::Acquire));
        assert_eq!(transport.state().await, ConnectionState::Connected);
    }

    #[tokio::test]
    async fn rejects_invalid_config() {
        let dir = TempDir::new().unwrap();
        let addr = unused_addr().await.to_string();
        let busy_loop = ProducerConfig {
            reconnect_interval_ms: 0,
            ..config(&dir, addr.clone(), Level::Debug)
        };
        assert!(matches!(Transport::connect(busy_loop).await, Err(TransportError::Config(_))));

        let no_source = ProducerConfig {
            source: " ".to_string(),
            ..config(&dir, addr, Level::Debug)
        };
        assert!(matches!(Transport::connect(no_source).await, Err(TransportError::Config(_))));
        assert!(!dir.path().join("cache.log").exists());
    }

    #[tokio::test]
    async fn error_with_appends_the_source_chain() {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let transport = Transport::connect(config(&dir, addr, Level::Debug)).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let mut frames = FramedRead::new(stream, LogRecordCodec::new());

        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let err = TransportError::Connect {
            address: "db:5432".into(),
            source: io,
        };
        transport.error_with("flush failed", &err).await.unwrap();

        let record = next_record(&mut frames).await;
        assert_eq!(record.level(), Level::Error);
        assert!(record.message().starts_with("flush failed: connection to db:5432 failed"));
        assert!(record.message().contains("caused by: disk full"));
    }

    #[tokio::test]
    async fn shutdown_rejects_later_sends() {
        let dir = TempDir::new().unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let transport = Transport::connect(config(&dir, addr, Level::Debug)).await.unwrap();

        transport.shutdown().await;
        assert!(matches!(transport.info("late").await, Err(TransportError::Closed)));
    }
}
