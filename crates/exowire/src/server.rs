//! # RPC Server
//!
//! Accepts connections and answers `Call` frames with `Reply` frames.
//!
//! Each request is handled on its own task, so one slow closure never blocks the other calls
//! arriving on the same connection. Replies are funnelled through a single writer task per
//! connection and may leave in a different order than the calls arrived; the caller's peer
//! correlates them by sequence number.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::frame::Frame;
use crate::frame::Outcome;
use crate::frame::Request;
use crate::shutdown::Shutdown;
use crate::transport;

/// Something that answers requests. Endpoints implement this.
#[async_trait::async_trait]
pub trait Service: Send + Sync + 'static {
    async fn handle(&self, request: Request) -> Outcome;
}

/// A running server. Dropping the handle does not stop it; trigger its shutdown signal.
pub struct ServerHandle {
    pub local_addr: SocketAddr,
    pub task: JoinHandle<()>,
}

/// Binds `addr` and serves `service` until `shutdown` fires.
pub async fn bind(
    addr: &str,
    name: &'static str,
    service: Arc<dyn Service>,
    shutdown: Shutdown,
) -> transport::Result<ServerHandle> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::debug!(server = name, %local_addr, "listening");
    let task = tokio::spawn(serve(listener, name, service, shutdown));
    Ok(ServerHandle { local_addr, task })
}

/// The accept loop.
pub async fn serve(listener: TcpListener, name: &'static str, service: Arc<dyn Service>, mut shutdown: Shutdown) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    tracing::debug!(server = name, %remote, "connection accepted");
                    let service = service.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = connection(stream, name, service, shutdown).await {
                            tracing::debug!(server = name, %remote, error = %e, "connection ended");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(server = name, error = %e, "accept failed");
                }
            },
            _ = shutdown.wait() => {
                tracing::debug!(server = name, "shutting down");
                return;
            }
        }
    }
}

async fn connection(
    stream: TcpStream,
    name: &'static str,
    service: Arc<dyn Service>,
    mut shutdown: Shutdown,
) -> transport::Result<()> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    let writer_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if let Err(e) = transport::write_message(&mut writer, &payload).await {
                tracing::debug!(server = name, error = %e, "reply write failed");
                break;
            }
        }
    });

    let result = loop {
        let message = tokio::select! {
            message = transport::read_message(&mut reader) => message,
            _ = shutdown.wait() => break Ok(()),
        };
        let bytes = match message {
            Ok(Some(bytes)) => bytes,
            Ok(None) => break Ok(()),
            Err(e) => break Err(e),
        };

        let (seq, request) = match Frame::decode(&bytes) {
            Ok(Frame::Call { seq, request }) => (seq, request),
            Ok(Frame::Reply { seq, .. }) => {
                tracing::warn!(server = name, seq, "ignoring Reply frame sent to a server");
                continue;
            }
            Err(e) => {
                break Err(transport::Error::Io(format!("undecodable call: {}", e)));
            }
        };

        let service = service.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let op = request.op();
            let outcome = service.handle(request).await;
            if let Err(failure) = &outcome {
                tracing::debug!(server = name, seq, op, %failure, "request failed");
            }
            match (Frame::Reply { seq, outcome }).encode() {
                Ok(payload) => {
                    let _ = tx.send(payload);
                }
                Err(e) => tracing::error!(server = name, seq, error = %e, "reply encode failed"),
            }
        });
    };

    drop(tx);
    // In-flight handlers still hold senders; the writer drains them before exiting.
    let _ = writer_task.await;
    result
}
