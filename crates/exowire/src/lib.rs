//! # exowire
//!
//! The wire layer shared by hosts and workers: values and handles, the frame vocabulary,
//! a length-prefixed TCP transport, an RPC peer that multiplexes concurrent calls over one
//! connection, the server loop that answers them, and the directory service both sides use
//! to find each other.
//!
//! ## RPC Protocol
//!
//! - Call: `[seq, Request]`
//! - Reply: `[seq, Result<Response, Failure>]`
//!
//! Frames are postcard-encoded and length-prefixed on the stream.

pub mod directory;
pub mod frame;
pub mod peer;
pub mod poll;
pub mod server;
pub mod shutdown;
pub mod transport;
pub mod value;

pub use directory::CODE_LOOKUP;
pub use directory::Directory;
pub use directory::DirectoryClient;
pub use directory::WORKER;
pub use frame::Failure;
pub use frame::Frame;
pub use frame::Outcome;
pub use frame::Request;
pub use frame::Response;
pub use peer::Peer;
pub use server::Service;
pub use shutdown::Shutdown;
pub use shutdown::ShutdownTrigger;
pub use transport::TcpTransport;
pub use transport::Transport;
pub use value::Closure;
pub use value::FaultInfo;
pub use value::Handle;
pub use value::OwnerId;
pub use value::Value;
