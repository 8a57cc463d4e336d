//! # Worker bootstrap
//!
//! Brings a worker up from nothing:
//!
//! 1. host the directory service on the directory port, publishing nothing;
//! 2. poll the directory until the host has published `code-lookup`;
//! 3. bind the code loader to that endpoint;
//! 4. start the worker endpoint and publish it as `worker`.
//!
//! The worker then serves until its shutdown signal fires.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use exocode::CodeLoader;
use exocode::CodeProvider;
use exocode::CodeRoot;
use exocode::CodeUnit;
use exocode::RemoteLookup;
use exocode::ScopedRoots;
use exowire::Directory;
use exowire::Shutdown;
use exowire::peer;
use exowire::poll;
use exowire::poll::Backoff;
use exowire::server;
use exowire::server::ServerHandle;
use exowire::transport;
use wasmtime::Engine;

use crate::endpoint::WorkerEndpoint;
use crate::invoke::Invoker;
use crate::table::ObjectTable;

/// Closures every worker can run before it can reach the host.
pub const PRELUDE_UNIT: &str = "exo.prelude";

const PRELUDE_WAT: &str = include_str!("../units/prelude.wat");

pub fn bootstrap_units() -> Vec<CodeUnit> {
    vec![CodeUnit::new(PRELUDE_UNIT, PRELUDE_WAT.as_bytes().to_vec())]
}

#[derive(Debug)]
pub enum Error {
    /// A listener could not be bound.
    Listen { what: &'static str, source: transport::Error },
    /// The local code source could not be read.
    CodeSource(exocode::roots::Error),
    /// The runtime could not be set up.
    Engine(String),
    /// The host never published its code lookup endpoint.
    NoCodeLookup(poll::Error),
    /// The host's code lookup endpoint was published but is unreachable.
    Lookup(peer::Error),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Listen { what, source } => write!(f, "cannot listen for the {}: {}", what, source),
            Self::CodeSource(e) => write!(f, "cannot read the code source: {}", e),
            Self::Engine(msg) => write!(f, "runtime setup failed: {}", msg),
            Self::NoCodeLookup(e) => write!(f, "host never published its code lookup endpoint: {}", e),
            Self::Lookup(e) => write!(f, "cannot reach the code lookup endpoint: {}", e),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub directory_port: u16,
    pub code_source: PathBuf,
    pub listen_host: String,
    pub advertise_host: String,
    pub worker_port: u16,
    /// How the worker waits for the host's `code-lookup` entry.
    pub lookup_wait: Backoff,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            directory_port: 0,
            code_source: PathBuf::from("."),
            listen_host: "0.0.0.0".to_string(),
            advertise_host: "127.0.0.1".to_string(),
            worker_port: 0,
            lookup_wait: Backoff {
                initial: Duration::from_millis(10),
                max: Duration::from_millis(250),
                deadline: Some(Duration::from_secs(60)),
            },
        }
    }
}

/// A worker whose directory is up but which has not yet met its host.
pub struct Worker {
    options: WorkerOptions,
    directory: Arc<Directory>,
    directory_server: ServerHandle,
    loader: Arc<CodeLoader>,
    endpoint: Arc<WorkerEndpoint>,
}

impl Worker {
    /// Sets up the runtime and starts the directory service.
    pub async fn listen(options: WorkerOptions, shutdown: Shutdown) -> Result<Self> {
        let engine = Engine::default();
        let local = local_units(&options.code_source)?;
        let loader = Arc::new(CodeLoader::new(engine.clone(), local).with_bootstrap(bootstrap_units()));
        let invoker = Invoker::new(&engine).map_err(|e| Error::Engine(e.to_string()))?;
        let endpoint = WorkerEndpoint::new(ObjectTable::new(), loader.clone(), Arc::new(invoker));

        let directory = Directory::new();
        let addr = format!("{}:{}", options.listen_host, options.directory_port);
        let directory_server = server::bind(&addr, "directory", directory.clone(), shutdown)
            .await
            .map_err(|source| Error::Listen {
                what: "directory service",
                source,
            })?;
        tracing::info!(addr = %directory_server.local_addr, owner = %endpoint.table().owner(), "directory service up");

        Ok(Self {
            options,
            directory,
            directory_server,
            loader,
            endpoint,
        })
    }

    pub fn directory_addr(&self) -> SocketAddr {
        self.directory_server.local_addr
    }

    pub fn endpoint(&self) -> &Arc<WorkerEndpoint> {
        &self.endpoint
    }

    /// Waits for the host, publishes the worker endpoint, and serves until `shutdown` fires.
    pub async fn serve(self, mut shutdown: Shutdown) -> Result<()> {
        let directory = self.directory.clone();
        let lookup_addr = poll::until(self.options.lookup_wait, &shutdown, || {
            let directory = directory.clone();
            async move { directory.lookup(exowire::CODE_LOOKUP) }
        })
        .await
        .map_err(Error::NoCodeLookup)?;

        let lookup = RemoteLookup::connect(&lookup_addr).await.map_err(Error::Lookup)?;
        // A fresh loader is always unbound; this cannot fail.
        if let Err(e) = self.loader.bind(Arc::new(lookup)) {
            tracing::warn!(error = %e, "code loader was already bound");
        }

        let addr = format!("{}:{}", self.options.listen_host, self.options.worker_port);
        let worker_server = server::bind(&addr, "worker", self.endpoint.clone(), shutdown.clone())
            .await
            .map_err(|source| Error::Listen {
                what: "worker endpoint",
                source,
            })?;
        let advertised = format!("{}:{}", self.options.advertise_host, worker_server.local_addr.port());
        self.directory.bind(exowire::WORKER, advertised.clone());
        tracing::info!(addr = %advertised, lookup = %lookup_addr, "worker endpoint published");

        shutdown.wait().await;
        tracing::info!("worker shutting down");
        Ok(())
    }
}

/// Starts a worker and serves until `shutdown` fires.
pub async fn run(options: WorkerOptions, shutdown: Shutdown) -> Result<()> {
    Worker::listen(options, shutdown.clone()).await?.serve(shutdown).await
}

fn local_units(code_source: &std::path::Path) -> Result<Arc<dyn CodeProvider>> {
    if !code_source.exists() {
        tracing::warn!(path = %code_source.display(), "code source does not exist, only the host's units will resolve");
        return Ok(ScopedRoots::empty().into_provider());
    }
    let roots = ScopedRoots::scan(vec![CodeRoot::detect(code_source)]).map_err(Error::CodeSource)?;
    tracing::debug!(path = %code_source.display(), units = roots.names().len(), "local code source scanned");
    Ok(roots.into_provider())
}
