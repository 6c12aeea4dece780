use chrono::Utc;
use futures::StreamExt;
use std::net::SocketAddr;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CodecError;
use crate::pipeline::DispatchQueue;
use crate::wire::LogRecordCodec;

/// Why a connection's read loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Peer closed the stream at a frame boundary.
    PeerClosed,
    /// Peer vanished without a clean close.
    Reset,
    /// Bytes on the wire were not a valid frame.
    Malformed,
    /// Other read failure.
    ReadError,
    /// Collector is stopping.
    Shutdown,
    /// Dispatch queue no longer accepts records.
    PipelineClosed,
}

/// Read loop for one accepted connection.
///
/// Owns the stream; it is closed exactly once when [`run`](Self::run)
/// returns, whichever way the loop ended.
pub struct ConnectionDecoder<S> {
    frames: FramedRead<S, LogRecordCodec>,
    peer: SocketAddr,
    queue: DispatchQueue,
}

impl<S> ConnectionDecoder<S>
where
    S: AsyncRead + Unpin,
{
    pub fn new(stream: S, peer: SocketAddr, queue: DispatchQueue) -> Self {
        Self {
            frames: FramedRead::new(stream, LogRecordCodec::new()),
            peer,
            queue,
        }
    }

    /// Decode frames, stamp their receipt time and enqueue them until the
    /// stream ends, fails, or `shutdown` fires between frames.
    pub async fn run(mut self, shutdown: CancellationToken) -> Termination {
        let peer = self.peer;
        info!(%peer, "producer connected");
        let mut received: u64 = 0;

        let termination = loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Termination::Shutdown,
                next = self.frames.next() => next,
            };

            let record = match next {
                Some(Ok(record)) => record,
                None => break Termination::PeerClosed,
                Some(Err(e)) => break classify(peer, &e),
            };

            let stamped = record.processed(Utc::now());
            // Blocks while the queue is full.
            if let Err(e) = self.queue.put(stamped).await {
                warn!(%peer, error = %e, "record dropped, collector is stopping");
                break Termination::PipelineClosed;
            }
            received += 1;
        };

        drop(self.frames);
        info!(%peer, received, reason = ?termination, "connection closed");
        termination
    }
}

fn classify(peer: SocketAddr, err: &CodecError) -> Termination {
    match err {
        CodecError::Malformed(frame) => {
            warn!(%peer, error = %frame, "malformed frame, dropping connection");
            Termination::Malformed
        }
        e if e.is_connection_reset() => {
            warn!(%peer, error = %e, "connection reset by producer");
            Termination::Reset
        }
        e => {
            debug!(%peer, error = %e, "read failed");
            Termination::ReadError
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::QueueOrder;
    use crate::record::{Level, LogRecord};
    use crate::wire::encode;
    use tokio::io::AsyncWriteExt;

    fn peer() -> SocketAddr {
        "127.0.0.1:4000".parse().unwrap()
    }

    #[tokio::test]
    async fn stamps_and_enqueues_until_peer_closes() {
        let (mut client, server) = tokio::io::duplex(64);
        let queue = DispatchQueue::new(16, QueueOrder::Arrival);
        let decoder = ConnectionDecoder::new(server, peer(), queue.clone());
        let handle = tokio::spawn(decoder.run(CancellationToken::new()));

        let before = Utc::now();
        for i in 0..3 {
            let record = LogRecord::new("p", format!("m{i}"), Level::Info, Utc::now());
            client.write_all(&encode(&record)).await.unwrap();
        }
        drop(client);

        assert_eq!(handle.await.unwrap(), Termination::PeerClosed);
        for i in 0..3 {
            let record = queue.take().await.unwrap();
            assert_eq!(record.message(), format!("m{i}"));
            assert!(record.processed_at().unwrap() >= before);
        }
    }

    #[tokio::test]
    async fn malformed_frame_ends_only_this_connection() {
        let (mut client, server) = tokio::io::duplex(64);
        let queue = DispatchQueue::new(16, QueueOrder::Arrival);
        let handle = tokio::spawn(
            ConnectionDecoder::new(server, peer(), queue.clone()).run(CancellationToken::new()),
        );

        let good = LogRecord::new("p", "ok", Level::Info, Utc::now());
        client.write_all(&encode(&good)).await.unwrap();
        client.write_all(&[0xff, 0x00, 0x00]).await.unwrap();

        assert_eq!(handle.await.unwrap(), Termination::Malformed);
        assert_eq!(queue.take().await.unwrap().message(), "ok");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn truncated_stream_is_malformed() {
        let (mut client, server) = tokio::io::duplex(64);
        let queue = DispatchQueue::new(16, QueueOrder::Arrival);
        let handle = tokio::spawn(
            ConnectionDecoder::new(server, peer(), queue.clone()).run(CancellationToken::new()),
        );

        let bytes = encode(&LogRecord::new("p", "cut", Level::Info, Utc::now()));
        client.write_all(&bytes[..bytes.len() / 2]).await.unwrap();
        drop(client);

        assert_eq!(handle.await.unwrap(), Termination::Malformed);
    }

    #[tokio::test]
    async fn stops_on_shutdown() {
        let (_client, server) = tokio::io::duplex(64);
        let queue = DispatchQueue::new(16, QueueOrder::Arrival);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(ConnectionDecoder::new(server, peer(), queue).run(shutdown.clone()));

        shutdown.cancel();
        assert_eq!(handle.await.unwrap(), Termination::Shutdown);
    }
}
