//! Websocket endpoint for live viewers.
//!
//! The channel is push-only: every broadcast line is sent as one text
//! message, and anything a viewer sends is ignored.

use futures::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::broadcast::ViewerHub;

pub struct ViewerServer {
    listener: TcpListener,
    hub: Arc<ViewerHub>,
}

impl ViewerServer {
    pub async fn bind(addr: &str, hub: Arc<ViewerHub>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, hub })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept viewers until `shutdown` fires, then close them all.
    pub async fn run(self, shutdown: CancellationToken) {
        let tracker = TaskTracker::new();
        if let Ok(addr) = self.listener.local_addr() {
            info!(%addr, "viewer endpoint listening");
        }

        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "failed to accept viewer");
                        sleep(Duration::from_millis(50)).await;
                        continue;
                    }
                },
            };
            tracker.spawn(serve_viewer(
                stream,
                peer,
                Arc::clone(&self.hub),
                shutdown.child_token(),
            ));
        }

        tracker.close();
        tracker.wait().await;
        info!("viewer endpoint stopped");
    }
}

async fn serve_viewer(
    stream: TcpStream,
    peer: SocketAddr,
    hub: Arc<ViewerHub>,
    shutdown: CancellationToken,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            warn!(%peer, error = %e, "viewer handshake failed");
            return;
        }
    };
    info!(%peer, "viewer connected");

    let (mut outgoing, mut incoming) = ws.split();
    let (id, mut lines) = hub.register();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                // Lines already broadcast still go out before the close.
                while let Ok(line) = lines.try_recv() {
                    if outgoing.send(Message::text(line)).await.is_err() {
                        break;
                    }
                }
                break;
            }
            line = lines.recv() => match line {
                Some(line) => {
                    if let Err(e) = outgoing.send(Message::text(line)).await {
                        debug!(%peer, error = %e, "viewer write failed");
                        break;
                    }
                }
                None => break,
            },
            message = incoming.next() => match message {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%peer, error = %e, "viewer read failed");
                    break;
                }
            },
        }
    }

    hub.unregister(id);
    let _ = outgoing.close().await;
    info!(%peer, "viewer disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    #[tokio::test]
    async fn pushes_broadcast_lines_to_connected_viewers() {
        let hub = ViewerHub::new();
        let server = ViewerServer::bind("127.0.0.1:0", hub.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.run(shutdown.clone()));

        let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        while hub.viewer_count() == 0 {
            sleep(Duration::from_millis(5)).await;
        }

        // Inbound payloads are ignored.
        ws.send(Message::text("hello server")).await.unwrap();
        hub.broadcast("first line");

        let message = timeout(Duration::from_secs(5), ws.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(message.into_text().unwrap(), "first line");

        shutdown.cancel();
        timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert_eq!(hub.viewer_count(), 0);
    }
}
