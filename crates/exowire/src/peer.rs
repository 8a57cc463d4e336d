//! # RPC Peer with Async Pump
//!
//! This module provides the `Peer` abstraction for making RPC calls over a transport.
//! It uses an async pump task to demultiplex incoming replies and correlate them
//! with pending requests via sequence numbers.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::frame;
use crate::frame::Failure;
use crate::frame::Frame;
use crate::frame::Request;
use crate::frame::Response;
use crate::transport;
use crate::transport::TcpTransport;
use crate::transport::Transport;

#[derive(Debug, Clone)]
pub enum Error {
    Transport(transport::Error),
    Frame(frame::Error),
    Remote(Failure),
    Timeout,
    ChannelClosed,
    ProtocolViolation(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Frame(e) => write!(f, "Frame error: {}", e),
            Self::Remote(reason) => write!(f, "Remote failure: {}", reason),
            Self::Timeout => write!(f, "Request timed out"),
            Self::ChannelClosed => write!(f, "Response channel closed"),
            Self::ProtocolViolation(msg) => write!(f, "Protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<frame::Error> for Error {
    fn from(e: frame::Error) -> Self {
        Self::Frame(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

type Pending = DashMap<u64, oneshot::Sender<Result<Response>>>;

/// RPC peer with an async message pump for concurrent requests.
///
/// The peer spawns a background task that continuously reads from the transport
/// and routes replies to the matching pending request by sequence number.
///
/// Each Peer owns its transport exclusively, so sequence numbers are scoped to a single
/// connection. Peers can be wrapped in Arc for sharing across tasks.
pub struct Peer {
    peer_name: String,
    transport: Arc<dyn Transport>,
    pending: Arc<Pending>,
    seq_gen: AtomicU64,
    closed: Arc<AtomicBool>,
    timeout: Option<Duration>,
}

impl Peer {
    /// Creates a new peer and spawns the background pump task.
    /// The peer_name is used for logging and diagnostics.
    pub fn new(peer_name: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        let peer_name = peer_name.into();
        let transport: Arc<dyn Transport> = Arc::from(transport);
        let pending: Arc<Pending> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let pump_transport = transport.clone();
        let pump_pending = pending.clone();
        let pump_closed = closed.clone();
        let pump_name = peer_name.clone();

        tokio::spawn(async move {
            let error = loop {
                match pump_transport.recv().await {
                    Ok(Some(msg)) => {
                        if let Err(e) = Self::handle_message(&msg, &pump_pending) {
                            tracing::warn!(peer = %pump_name, error = %e, "dropping connection after bad reply");
                            break e;
                        }
                    }
                    Ok(None) => {
                        tracing::debug!(peer = %pump_name, "stream closed");
                        break Error::Transport(transport::Error::ConnectionLost("Stream closed".into()));
                    }
                    Err(e) => {
                        tracing::debug!(peer = %pump_name, error = %e, "transport error in pump");
                        break Error::Transport(e);
                    }
                }
            };

            pump_closed.store(true, Ordering::SeqCst);
            Self::notify_all_pending(&pump_pending, error);
        });

        Self {
            peer_name,
            transport,
            pending,
            seq_gen: AtomicU64::new(1),
            closed,
            timeout: Some(Duration::from_secs(30)),
        }
    }

    /// Connects a TCP transport to `addr` and wraps it in a peer.
    pub async fn connect(peer_name: impl Into<String>, addr: &str) -> Result<Self> {
        let transport = TcpTransport::connect(addr).await?;
        Ok(Self::new(peer_name, Box::new(transport)))
    }

    /// Sets the per-call timeout. `None` waits for as long as the remote side takes.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the peer name for this client.
    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    /// True once the pump has observed the connection going away.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn notify_all_pending(pending: &Pending, error: Error) {
        let keys: Vec<u64> = pending.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, tx)) = pending.remove(&key) {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }

    fn handle_message(msg: &[u8], pending: &Pending) -> Result<()> {
        let frame = Frame::decode(msg)?;

        let Frame::Reply { seq, outcome } = frame else {
            return Err(Error::ProtocolViolation("Pump received Call frame instead of Reply".into()));
        };

        // No pending request: a late reply to a call that already timed out.
        let Some((_, tx)) = pending.remove(&seq) else {
            return Ok(());
        };

        let _ = tx.send(outcome.map_err(Error::Remote));
        Ok(())
    }

    /// Sends a request and awaits the correlated reply.
    pub async fn call(&self, request: Request) -> Result<Response> {
        if self.is_closed() {
            return Err(Error::Transport(transport::Error::ConnectionLost("peer closed".into())));
        }

        let seq = self.seq_gen.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, tx);

        // The pump may have drained `pending` between the first check and the insert.
        if self.is_closed() {
            self.pending.remove(&seq);
            return Err(Error::Transport(transport::Error::ConnectionLost("peer closed".into())));
        }

        let op = request.op();
        let payload = Frame::Call { seq, request }.encode();
        let payload = match payload {
            Ok(p) => p,
            Err(e) => {
                self.pending.remove(&seq);
                return Err(e.into());
            }
        };

        if let Err(e) = self.transport.send(&payload).await {
            self.pending.remove(&seq);
            return Err(e.into());
        }
        tracing::trace!(peer = %self.peer_name, seq, op, "request sent");

        let reply = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    self.pending.remove(&seq);
                    return Err(Error::Timeout);
                }
            },
            None => rx.await,
        };

        match reply {
            Ok(result) => result,
            Err(_) => {
                self.pending.remove(&seq);
                Err(Error::ChannelClosed)
            }
        }
    }
}
