//! # Backends
//!
//! A backend starts one isolated worker runtime, hands it its bootstrap parameters, performs
//! the handshake, and owns the runtime's teardown. Three variants share the contract:
//!
//! - [`ProcessBackend`]: a child process on this machine;
//! - [`ContainerBackend`]: a container started through the `docker` CLI;
//! - [`VmBackend`]: a virtual machine started through `vagrant`.
//!
//! ## States
//!
//! `Starting -> Running` once the worker endpoint is connected; `-> Terminated` on explicit
//! termination or detected death. `Terminated` is absorbing and repeated `terminate` calls are
//! no-ops.

use std::sync::Arc;
use std::sync::Mutex;

use exocode::CodeProvider;

use crate::config;
use crate::config::BootOptions;
use crate::handshake;
use crate::worker::RemoteWorker;

pub mod container;
pub mod process;
pub mod vm;

pub use container::ContainerBackend;
pub use process::ProcessBackend;
pub use vm::VmBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendState {
    Starting,
    Running,
    Terminated,
}

/// The state machine shared by every backend.
#[derive(Debug)]
pub struct StateCell {
    state: Mutex<BackendState>,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BackendState::Starting),
        }
    }

    pub fn get(&self) -> BackendState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Moves to `next` if the transition is legal. Returns true if the state changed.
    pub fn advance(&self, next: BackendState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let legal = matches!(
            (*state, next),
            (BackendState::Starting, BackendState::Running)
                | (BackendState::Starting, BackendState::Terminated)
                | (BackendState::Running, BackendState::Terminated)
        );
        if legal {
            *state = next;
        }
        legal
    }

    pub fn is_terminated(&self) -> bool {
        self.get() == BackendState::Terminated
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub enum Error {
    /// The container platform's daemon is not running or not reachable.
    PlatformUnreachable,
    /// The base image is missing and could not be pulled.
    ImagePull(String),
    /// The VM scratch directory could not be prepared or removed.
    Scratch(std::io::Error),
    /// The runtime or a platform tool could not be launched.
    Spawn(std::io::Error),
    /// A platform tool reported a failure.
    Platform { command: String, detail: String },
    Config(config::Error),
    Handshake(handshake::Error),
    /// The worker process exited before it published its endpoint.
    ExitedDuringStartup(Option<i32>),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PlatformUnreachable => write!(f, "cannot reach the container platform, is it running?"),
            Self::ImagePull(detail) => write!(f, "cannot pull the base image: {}", detail),
            Self::Scratch(e) => write!(f, "scratch directory: {}", e),
            Self::Spawn(e) => write!(f, "cannot launch: {}", e),
            Self::Platform { command, detail } => write!(f, "'{}' failed: {}", command, detail.trim()),
            Self::Config(e) => write!(f, "{}", e),
            Self::Handshake(e) => write!(f, "{}", e),
            Self::ExitedDuringStartup(Some(code)) => write!(f, "worker exited with status {} during startup", code),
            Self::ExitedDuringStartup(None) => write!(f, "worker died during startup"),
        }
    }
}

impl std::error::Error for Error {}

impl From<config::Error> for Error {
    fn from(e: config::Error) -> Self {
        Error::Config(e)
    }
}

impl From<handshake::Error> for Error {
    fn from(e: handshake::Error) -> Self {
        Error::Handshake(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Starts the runtime and returns once the worker endpoint is connected.
    async fn start(code: Arc<dyn CodeProvider>, options: BootOptions) -> Result<Self>
    where
        Self: Sized;

    fn state(&self) -> BackendState;

    /// The connected worker.
    fn worker(&self) -> &RemoteWorker;

    /// Asks the isolation mechanism whether the runtime still runs.
    async fn is_alive(&self) -> bool;

    /// Stops the runtime and releases everything it holds. Idempotent.
    async fn terminate(&self) -> Result<()>;

    /// Waits until the runtime stops on its own (or is terminated).
    async fn wait_for_exit(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminated_is_absorbing() {
        let cell = StateCell::new();
        assert_eq!(cell.get(), BackendState::Starting);
        assert!(cell.advance(BackendState::Running));
        assert!(!cell.advance(BackendState::Running));
        assert!(cell.advance(BackendState::Terminated));
        assert!(!cell.advance(BackendState::Running));
        assert!(!cell.advance(BackendState::Terminated));
        assert!(cell.is_terminated());
    }

    #[test]
    fn test_startup_can_fail_straight_to_terminated() {
        let cell = StateCell::new();
        assert!(cell.advance(BackendState::Terminated));
        assert!(!cell.advance(BackendState::Running));
    }
}
