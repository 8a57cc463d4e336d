//! # exoworker
//!
//! The isolated side of exo. A worker hosts the directory service both sides rendezvous on,
//! resolves code units through its loader (bootstrap units, then the host, then its own code
//! source), and runs closures against the values in its object table.

pub mod args;
pub mod bootstrap;
pub mod endpoint;
pub mod invoke;
pub mod table;

pub use args::WorkerArgs;
pub use bootstrap::PRELUDE_UNIT;
pub use bootstrap::Worker;
pub use bootstrap::WorkerOptions;
pub use endpoint::WorkerEndpoint;
pub use invoke::Invoker;
pub use table::ObjectTable;
