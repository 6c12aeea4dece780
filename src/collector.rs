use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::backend::{make_sink_from_config, parse_dsn};
use crate::config::CollectorConfig;
use crate::decoder::ConnectionDecoder;
use crate::error::CollectorError;
use crate::pipeline::{DispatchQueue, Dispatcher};
use crate::sink::LogSink;

#[cfg(feature = "websocket")]
use crate::viewer::ViewerServer;

/// Accepts producer connections and runs one decoder task per connection.
///
/// The listener keeps no per-connection state: each accepted stream is
/// handed to its own [`ConnectionDecoder`] and the accept loop moves on.
pub struct Collector {
    listener: TcpListener,
    queue: DispatchQueue,
    sinks: Vec<Arc<dyn LogSink>>,
    workers: usize,
    #[cfg(feature = "websocket")]
    viewers: Vec<ViewerServer>,
}

impl Collector {
    /// Bind the listening socket. Failure here is fatal for the collector.
    pub async fn bind(
        config: &CollectorConfig,
        sinks: Vec<Arc<dyn LogSink>>,
    ) -> Result<Self, CollectorError> {
        let listener = TcpListener::bind(&config.listen_addr)
            .await
            .map_err(|source| CollectorError::Bind {
                address: config.listen_addr.clone(),
                source,
            })?;
        info!(addr = %listener.local_addr()?, "collector listening");

        Ok(Self {
            listener,
            queue: DispatchQueue::new(config.queue_capacity, config.queue_order),
            sinks,
            workers: config.dispatch_workers,
            #[cfg(feature = "websocket")]
            viewers: Vec::new(),
        })
    }

    /// Build every configured sink, then bind.
    pub async fn from_config(config: &CollectorConfig) -> Result<Self, CollectorError> {
        config.validate()?;
        let format = config.format.build();
        let mut sinks = Vec::with_capacity(config.sinks.len());
        #[cfg(feature = "websocket")]
        let mut viewers = Vec::new();

        for dsn in &config.sinks {
            let backend = parse_dsn(dsn).map_err(|e| CollectorError::Sink(format!("{dsn}: {e}")))?;
            let built = make_sink_from_config(&backend, Arc::clone(&format))
                .await
                .map_err(|e| CollectorError::Sink(format!("{dsn}: {e}")))?;
            sinks.push(built.sink);
            #[cfg(feature = "websocket")]
            viewers.extend(built.viewer);
        }

        #[allow(unused_mut)]
        let mut collector = Self::bind(config, sinks).await?;
        #[cfg(feature = "websocket")]
        {
            collector.viewers = viewers;
        }
        Ok(collector)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, CollectorError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn queue(&self) -> &DispatchQueue {
        &self.queue
    }

    /// Run until `shutdown` fires.
    ///
    /// On shutdown the listener is closed, open connections stop at their
    /// next frame boundary, and the dispatchers drain what was queued.
    /// Viewer endpoints stay up until that drain is done.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), CollectorError> {
        #[cfg(feature = "websocket")]
        let viewer_shutdown = CancellationToken::new();
        #[cfg(feature = "websocket")]
        let viewer_tasks: Vec<_> = self
            .viewers
            .into_iter()
            .map(|server| tokio::spawn(server.run(viewer_shutdown.child_token())))
            .collect();

        let Collector {
            listener,
            queue,
            sinks,
            workers,
            ..
        } = self;

        let dispatchers = Dispatcher::new(queue.clone(), sinks).spawn(workers);
        let connections = TaskTracker::new();

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "failed to accept connection");
                        sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
            };
            stream.set_nodelay(true).ok();
            let decoder = ConnectionDecoder::new(stream, peer, queue.clone());
            connections.spawn(decoder.run(shutdown.child_token()));
        }

        drop(listener);
        info!(open = connections.len(), "collector stopping, waiting for connections");
        connections.close();
        connections.wait().await;

        queue.close();
        for handle in dispatchers {
            if let Err(e) = handle.await {
                error!(error = %e, "dispatcher task failed");
            }
        }
        #[cfg(feature = "websocket")]
        viewer_shutdown.cancel();
        #[cfg(feature = "websocket")]
        for handle in viewer_tasks {
            if let Err(e) = handle.await {
                error!(error = %e, "viewer endpoint task failed");
            }
        }

        info!("collector stopped");
        Ok(())
    }
}
