//! # Protocol Frames
//!
//! Defines the RPC envelope (Call vs Reply) and the request vocabulary of the three endpoints
//! (directory, code lookup, worker).
//!
//! ## Invariants
//! - **Panic Safety**: decoding returns `Result`, never panicking on unknown data.
//! - **One vocabulary**: every endpoint speaks the same `Request` enum and answers what it
//!   does not serve with `Failure::Unsupported`.

use serde::Deserialize;
use serde::Serialize;

use crate::value::Closure;
use crate::value::Handle;
use crate::value::OwnerId;
use crate::value::Value;

/// Frame encoding failures.
#[derive(Debug, Clone)]
pub enum Error {
    /// postcard could not encode the frame.
    Encode(String),
    /// postcard could not decode the bytes as a frame.
    Decode(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(msg) => write!(f, "frame encode failed: {}", msg),
            Self::Decode(msg) => write!(f, "frame decode failed: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

/// Every operation any endpoint can be asked to perform.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    // Directory service.
    Bind { name: String, addr: String },
    Lookup { name: String },
    List,

    // Code lookup.
    FetchUnit { name: String },

    // Worker endpoint.
    Identify,
    Run { closure: Closure },
    Call { args: Vec<Handle>, closure: Closure },
    Copy { handle: Handle },
    Remove { handle: Handle },
    Get { handle: Handle },
    Wrap { value: Value },
    ReleaseAll,
}

impl Request {
    /// Operation name, for logging.
    pub fn op(&self) -> &'static str {
        match self {
            Request::Bind { .. } => "bind",
            Request::Lookup { .. } => "lookup",
            Request::List => "list",
            Request::FetchUnit { .. } => "fetch-unit",
            Request::Identify => "identify",
            Request::Run { .. } => "run",
            Request::Call { .. } => "call",
            Request::Copy { .. } => "copy",
            Request::Remove { .. } => "remove",
            Request::Get { .. } => "get",
            Request::Wrap { .. } => "wrap",
            Request::ReleaseAll => "release-all",
        }
    }
}

/// Successful answers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Done,
    Addr(Option<String>),
    Names(Vec<String>),
    Unit(Option<Vec<u8>>),
    Owner(OwnerId),
    Handle(Handle),
    Value(Value),
    Released(u64),
}

/// Reasons for an RPC failure (the "Err" side of a Reply).
///
/// These represent the *remote* side refusing or failing, whereas transport and peer errors
/// represent the channel failing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Failure {
    /// The handle is absent from, or not owned by, the table it was presented to.
    UnknownHandle(Handle),
    /// The closure failed; the handle resolves to a `Value::Fault` describing the failure.
    Fault(Handle),
    /// A code unit could not be resolved locally or through the lookup channel.
    CodeNotFound(String),
    /// The endpoint does not serve this operation.
    Unsupported(String),
    /// The request was well-formed but could not be honoured.
    Invalid(String),
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownHandle(h) => write!(f, "unknown handle {}", h),
            Self::Fault(h) => write!(f, "closure failed, fault held at {}", h),
            Self::CodeNotFound(name) => write!(f, "code unit '{}' not found", name),
            Self::Unsupported(op) => write!(f, "operation '{}' is not served here", op),
            Self::Invalid(msg) => write!(f, "invalid request: {}", msg),
        }
    }
}

pub type Outcome = std::result::Result<Response, Failure>;

/// The RPC envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Call { seq: u64, request: Request },
    Reply { seq: u64, outcome: Outcome },
}

impl Frame {
    pub fn encode(&self) -> Result<Vec<u8>> {
        postcard::to_stdvec(self).map_err(|e| Error::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        postcard::from_bytes(bytes).map_err(|e| Error::Decode(e.to_string()))
    }
}

/// Encodes a standalone value the same way frames embed it.
///
/// Guest code receives closure arguments in this encoding.
pub fn encode_value(value: &Value) -> Result<Vec<u8>> {
    postcard::to_stdvec(value).map_err(|e| Error::Encode(e.to_string()))
}

pub fn decode_value(bytes: &[u8]) -> Result<Value> {
    postcard::from_bytes(bytes).map_err(|e| Error::Decode(e.to_string()))
}
