//! # Code Lookup endpoint
//!
//! The host side serves unit bytes by name ([`CodeLookupService`]); the worker side asks for
//! them through a [`UnitSource`] ([`RemoteLookup`] over the wire).

use std::sync::Arc;

use exowire::Failure;
use exowire::Outcome;
use exowire::Peer;
use exowire::Request;
use exowire::Response;
use exowire::Service;
use exowire::peer;

use crate::provider::CodeProvider;
use crate::unit::CodeUnit;

/// Host-side endpoint published in the worker's directory under `code-lookup`.
pub struct CodeLookupService {
    provider: Arc<dyn CodeProvider>,
}

impl CodeLookupService {
    pub fn new(provider: Arc<dyn CodeProvider>) -> Arc<Self> {
        Arc::new(Self { provider })
    }
}

#[async_trait::async_trait]
impl Service for CodeLookupService {
    async fn handle(&self, request: Request) -> Outcome {
        match request {
            Request::FetchUnit { name } => {
                let unit = self.provider.fetch(&name);
                tracing::debug!(unit = %name, found = unit.is_some(), "code lookup");
                Ok(Response::Unit(unit.map(|u| u.bytes.to_vec())))
            }
            other => Err(Failure::Unsupported(other.op().to_string())),
        }
    }
}

/// Where the worker's loader fetches units it cannot resolve locally.
#[async_trait::async_trait]
pub trait UnitSource: Send + Sync + 'static {
    /// `Ok(None)` is a negative answer; `Err` means the source could not be asked at all.
    async fn fetch(&self, name: &str) -> peer::Result<Option<CodeUnit>>;
}

/// A [`UnitSource`] backed by the host's code lookup endpoint.
pub struct RemoteLookup {
    peer: Peer,
}

impl RemoteLookup {
    pub fn new(peer: Peer) -> Self {
        Self { peer }
    }

    pub async fn connect(addr: &str) -> peer::Result<Self> {
        Ok(Self::new(Peer::connect(format!("code-lookup@{}", addr), addr).await?))
    }
}

#[async_trait::async_trait]
impl UnitSource for RemoteLookup {
    async fn fetch(&self, name: &str) -> peer::Result<Option<CodeUnit>> {
        match self.peer.call(Request::FetchUnit { name: name.to_string() }).await? {
            Response::Unit(bytes) => Ok(bytes.map(|b| CodeUnit::new(name, b))),
            other => Err(peer::Error::ProtocolViolation(format!(
                "unexpected code lookup response: {:?}",
                other
            ))),
        }
    }
}
