//! # Handshake
//!
//! Host half of the rendezvous, shared by every backend:
//!
//! 1. connect to the worker's directory, retrying until it is reachable;
//! 2. start the code lookup endpoint and publish it as `code-lookup`;
//! 3. poll `list()` until the worker has published `worker`;
//! 4. connect to the worker endpoint and identify it.
//!
//! The whole exchange is bounded by `bootstrap_timeout` and abandoned when `shutdown` fires.

use std::net::SocketAddr;
use std::sync::Arc;

use exocode::CodeLookupService;
use exocode::CodeProvider;
use exowire::DirectoryClient;
use exowire::Peer;
use exowire::Shutdown;
use exowire::ShutdownTrigger;
use exowire::peer;
use exowire::poll;
use exowire::server;
use exowire::server::ServerHandle;
use exowire::shutdown;
use exowire::transport;

use crate::config::BootOptions;
use crate::worker::CallError;
use crate::worker::RemoteWorker;

#[derive(Debug)]
pub enum Error {
    /// The directory never became reachable, or the worker never published itself.
    NotReady(poll::Error),
    /// The overall deadline passed.
    TimedOut(std::time::Duration),
    /// The directory connection failed mid-handshake.
    Directory(peer::Error),
    /// The code lookup endpoint could not be started.
    Lookup(transport::Error),
    /// The worker was published but could not be reached or identified.
    Worker(CallError),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotReady(e) => write!(f, "worker not ready: {}", e),
            Self::TimedOut(limit) => write!(f, "handshake did not finish within {:?}", limit),
            Self::Directory(e) => write!(f, "directory connection failed: {}", e),
            Self::Lookup(e) => write!(f, "cannot start the code lookup endpoint: {}", e),
            Self::Worker(e) => write!(f, "cannot reach the worker endpoint: {}", e),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// The host's side of an established worker connection.
///
/// Dropping it stops the code lookup endpoint.
pub struct Connection {
    pub worker: RemoteWorker,
    pub lookup_addr: SocketAddr,
    _lookup: LookupServer,
}

struct LookupServer {
    handle: ServerHandle,
    trigger: ShutdownTrigger,
}

impl Drop for LookupServer {
    fn drop(&mut self) {
        self.trigger.trigger();
    }
}

/// Runs the handshake against the directory at `directory_addr`, serving code from `code`.
pub async fn establish(
    directory_addr: &str,
    code: Arc<dyn CodeProvider>,
    options: &BootOptions,
    shutdown: &Shutdown,
) -> Result<Connection> {
    let limit = options.bootstrap_timeout;
    tokio::time::timeout(limit, exchange(directory_addr, code, options, shutdown))
        .await
        .map_err(|_| Error::TimedOut(limit))?
}

async fn exchange(
    directory_addr: &str,
    code: Arc<dyn CodeProvider>,
    options: &BootOptions,
    shutdown: &Shutdown,
) -> Result<Connection> {
    let backoff = options.handshake_backoff();

    let directory = poll::until(backoff, shutdown, move || async move {
        DirectoryClient::connect(directory_addr).await.ok()
    })
    .await
    .map_err(Error::NotReady)?;
    tracing::debug!(directory = %directory_addr, "directory reachable");

    let (trigger, signal) = shutdown::channel();
    let handle = server::bind(&options.lookup_bind, "code-lookup", CodeLookupService::new(code), signal)
        .await
        .map_err(Error::Lookup)?;
    let lookup = LookupServer { handle, trigger };
    let lookup_addr = lookup.handle.local_addr;
    let advertised = advertised_lookup(lookup_addr, options.lookup_advertise_host.as_deref());
    directory
        .bind(exowire::CODE_LOOKUP, &advertised)
        .await
        .map_err(Error::Directory)?;
    tracing::debug!(lookup = %advertised, "code lookup published");

    let directory = &directory;
    poll::until(backoff, shutdown, move || async move {
        match directory.list().await {
            Ok(names) if names.iter().any(|n| n == exowire::WORKER) => Some(Ok(())),
            Ok(_) => None,
            // The directory lives in the worker; losing it means the worker is gone.
            Err(e) => Some(Err(e)),
        }
    })
    .await
    .map_err(Error::NotReady)?
    .map_err(Error::Directory)?;

    let worker_addr = directory
        .lookup(exowire::WORKER)
        .await
        .map_err(Error::Directory)?
        .ok_or_else(|| Error::Directory(peer::Error::ProtocolViolation("worker listed but not bound".into())))?;

    let peer = Peer::connect(format!("worker@{}", worker_addr), &worker_addr)
        .await
        .map_err(|e| Error::Worker(e.into()))?
        .with_timeout(options.call_timeout);
    let worker = RemoteWorker::attach(peer).await.map_err(Error::Worker)?;
    tracing::info!(worker = %worker_addr, owner = %worker.owner(), "worker connected");

    Ok(Connection {
        worker,
        lookup_addr,
        _lookup: lookup,
    })
}

fn advertised_lookup(bound: SocketAddr, host: Option<&str>) -> String {
    match host {
        Some(host) => format!("{}:{}", host, bound.port()),
        None if bound.ip().is_unspecified() => format!("127.0.0.1:{}", bound.port()),
        None => bound.to_string(),
    }
}
