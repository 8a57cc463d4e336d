//! # exohost
//!
//! The host side of exo. A [`Backend`] launches an isolated worker runtime (a child process,
//! a container or a virtual machine), meets it through the worker's directory service, serves
//! it code units on demand, and hands back a [`RemoteWorker`] to run closures against.
//!
//! ```text
//! host                                  worker
//!  |  connect directory (poll) -------->  |
//!  |  bind code-lookup ---------------->  |
//!  |                    <---------------  |  bind worker
//!  |  list() until worker (poll) ------>  |
//!  |  identify ------------------------>  |
//! ```
//!
//! Runtimes are torn down by [`Backend::terminate`], on drop, or by [`reaper::run_exit_hooks`]
//! when the host is interrupted.

pub mod backend;
pub mod config;
pub mod handshake;
pub mod platform;
pub mod reaper;
pub mod worker;

pub use backend::Backend;
pub use backend::BackendState;
pub use backend::ContainerBackend;
pub use backend::ProcessBackend;
pub use backend::VmBackend;
pub use config::BootOptions;
pub use handshake::Connection;
pub use platform::Platform;
pub use platform::SystemPlatform;
pub use worker::CallError;
pub use worker::RemoteFault;
pub use worker::RemoteWorker;

#[cfg(test)]
mod tests;
