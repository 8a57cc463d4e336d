//! # Remote worker
//!
//! The host's typed view of a worker endpoint. Every method is one blocking round trip; values
//! stay in the worker unless [`RemoteWorker::get`] asks for one.

use exowire::Closure;
use exowire::Failure;
use exowire::FaultInfo;
use exowire::Handle;
use exowire::OwnerId;
use exowire::Peer;
use exowire::Request;
use exowire::Response;
use exowire::Value;
use exowire::peer;

/// A closure failure, with the fault value fetched back from the worker when possible.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFault {
    /// Where the worker keeps the `Value::Fault`.
    pub handle: Handle,
    pub info: Option<FaultInfo>,
}

impl std::fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.info {
            Some(info) => write!(f, "{} (held at {})", info, self.handle),
            None => write!(f, "closure failed, fault held at {}", self.handle),
        }
    }
}

#[derive(Debug)]
pub enum CallError {
    UnknownHandle(Handle),
    Fault(RemoteFault),
    CodeNotFound(String),
    /// The worker refused the request for another reason.
    Rejected(Failure),
    /// The channel to the worker failed.
    Peer(peer::Error),
}

impl std::fmt::Display for CallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownHandle(h) => write!(f, "unknown handle {}", h),
            Self::Fault(fault) => write!(f, "{}", fault),
            Self::CodeNotFound(name) => write!(f, "code unit '{}' not found", name),
            Self::Rejected(failure) => write!(f, "worker rejected the request: {}", failure),
            Self::Peer(e) => write!(f, "worker unreachable: {}", e),
        }
    }
}

impl std::error::Error for CallError {}

impl From<peer::Error> for CallError {
    fn from(e: peer::Error) -> Self {
        match e {
            peer::Error::Remote(Failure::UnknownHandle(h)) => CallError::UnknownHandle(h),
            peer::Error::Remote(Failure::Fault(handle)) => CallError::Fault(RemoteFault { handle, info: None }),
            peer::Error::Remote(Failure::CodeNotFound(name)) => CallError::CodeNotFound(name),
            peer::Error::Remote(other) => CallError::Rejected(other),
            other => CallError::Peer(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, CallError>;

pub struct RemoteWorker {
    peer: Peer,
    owner: OwnerId,
}

impl RemoteWorker {
    /// Identifies the worker behind `peer`.
    pub async fn attach(peer: Peer) -> Result<Self> {
        let owner = match peer.call(Request::Identify).await? {
            Response::Owner(owner) => owner,
            other => return Err(unexpected("identify", other)),
        };
        tracing::debug!(peer = peer.peer_name(), %owner, "worker identified");
        Ok(Self { peer, owner })
    }

    /// The table that mints this worker's handles.
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn is_connected(&self) -> bool {
        !self.peer.is_closed()
    }

    /// Runs `closure` for its side effects.
    pub async fn run(&self, closure: Closure) -> Result<()> {
        match self.request(Request::Run { closure }).await? {
            Response::Done => Ok(()),
            other => Err(unexpected("run", other)),
        }
    }

    /// Runs `closure` with no arguments and keeps its result in the worker.
    pub async fn call(&self, closure: Closure) -> Result<Handle> {
        self.call_with(Vec::new(), closure).await
    }

    /// Runs `closure` on the values behind `args`, in order.
    pub async fn call_with(&self, args: Vec<Handle>, closure: Closure) -> Result<Handle> {
        match self.request(Request::Call { args, closure }).await? {
            Response::Handle(h) => Ok(h),
            other => Err(unexpected("call", other)),
        }
    }

    pub async fn copy(&self, handle: Handle) -> Result<Handle> {
        match self.request(Request::Copy { handle }).await? {
            Response::Handle(h) => Ok(h),
            other => Err(unexpected("copy", other)),
        }
    }

    pub async fn remove(&self, handle: Handle) -> Result<()> {
        match self.request(Request::Remove { handle }).await? {
            Response::Done => Ok(()),
            other => Err(unexpected("remove", other)),
        }
    }

    /// Fetches a value out of the worker.
    pub async fn get(&self, handle: Handle) -> Result<Value> {
        match self.request(Request::Get { handle }).await? {
            Response::Value(v) => Ok(v),
            other => Err(unexpected("get", other)),
        }
    }

    /// Pushes a value into the worker.
    pub async fn wrap(&self, value: impl Into<Value>) -> Result<Handle> {
        match self.request(Request::Wrap { value: value.into() }).await? {
            Response::Handle(h) => Ok(h),
            other => Err(unexpected("wrap", other)),
        }
    }

    /// Drops every value held for this host. Returns how many were released.
    pub async fn release_all(&self) -> Result<u64> {
        match self.request(Request::ReleaseAll).await? {
            Response::Released(n) => Ok(n),
            other => Err(unexpected("release-all", other)),
        }
    }

    async fn request(&self, request: Request) -> Result<Response> {
        match self.peer.call(request).await {
            Ok(response) => Ok(response),
            Err(peer::Error::Remote(Failure::Fault(handle))) => {
                // Best effort: the fault is still reported if it cannot be read back.
                let info = match self.peer.call(Request::Get { handle }).await {
                    Ok(Response::Value(Value::Fault(info))) => Some(info),
                    _ => None,
                };
                Err(CallError::Fault(RemoteFault { handle, info }))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn unexpected(op: &str, response: Response) -> CallError {
    CallError::Peer(peer::Error::ProtocolViolation(format!(
        "unexpected {} response: {:?}",
        op, response
    )))
}
