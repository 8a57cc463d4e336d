//! # Directory Service
//!
//! The rendezvous point between host and worker. One directory exists per backend instance;
//! the worker hosts it on the directory port passed at launch. Exactly two names matter:
//!
//! - [`CODE_LOOKUP`], published by the host,
//! - [`WORKER`], published by the worker once its code loader is bound.
//!
//! Endpoints are always located by name, so the transport binding stays an implementation detail.

use std::sync::Arc;

use dashmap::DashMap;

use crate::frame::Failure;
use crate::frame::Outcome;
use crate::frame::Request;
use crate::frame::Response;
use crate::peer;
use crate::peer::Peer;
use crate::server::Service;

/// Name under which the host publishes its code lookup endpoint.
pub const CODE_LOOKUP: &str = "code-lookup";
/// Name under which the worker publishes its worker endpoint.
pub const WORKER: &str = "worker";

/// Name -> endpoint address table.
#[derive(Default)]
pub struct Directory {
    entries: DashMap<String, String>,
}

impl Directory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publishes `addr` under `name`, replacing any previous binding.
    pub fn bind(&self, name: impl Into<String>, addr: impl Into<String>) {
        let name = name.into();
        let addr = addr.into();
        tracing::info!(%name, %addr, "directory binding");
        self.entries.insert(name, addr);
    }

    pub fn lookup(&self, name: &str) -> Option<String> {
        self.entries.get(name).map(|entry| entry.value().clone())
    }

    /// Published names, sorted for stable output.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

#[async_trait::async_trait]
impl Service for Directory {
    async fn handle(&self, request: Request) -> Outcome {
        match request {
            Request::Bind { name, addr } => {
                self.bind(name, addr);
                Ok(Response::Done)
            }
            Request::Lookup { name } => Ok(Response::Addr(self.lookup(&name))),
            Request::List => Ok(Response::Names(self.list())),
            other => Err(Failure::Unsupported(other.op().to_string())),
        }
    }
}

/// Remote view of a directory.
pub struct DirectoryClient {
    peer: Peer,
}

impl DirectoryClient {
    pub fn new(peer: Peer) -> Self {
        Self { peer }
    }

    pub async fn connect(addr: &str) -> peer::Result<Self> {
        Ok(Self::new(Peer::connect(format!("directory@{}", addr), addr).await?))
    }

    pub fn is_closed(&self) -> bool {
        self.peer.is_closed()
    }

    pub async fn bind(&self, name: &str, addr: &str) -> peer::Result<()> {
        let request = Request::Bind {
            name: name.to_string(),
            addr: addr.to_string(),
        };
        match self.peer.call(request).await? {
            Response::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn lookup(&self, name: &str) -> peer::Result<Option<String>> {
        match self.peer.call(Request::Lookup { name: name.to_string() }).await? {
            Response::Addr(addr) => Ok(addr),
            other => Err(unexpected(other)),
        }
    }

    pub async fn list(&self) -> peer::Result<Vec<String>> {
        match self.peer.call(Request::List).await? {
            Response::Names(names) => Ok(names),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: Response) -> peer::Error {
    peer::Error::ProtocolViolation(format!("unexpected directory response: {:?}", response))
}
