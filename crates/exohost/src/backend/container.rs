//! # Container backend
//!
//! Runs the worker in a container driven through the `docker` CLI. The code source directory is
//! bound at `/exo` (and must contain the `exoworker` executable); every shared path `p` is bound
//! at `/shared<p>`. The container uses host networking, so the worker's directory port and
//! endpoint are reachable from the host as they are.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use exocode::CodeProvider;
use exoworker::WorkerArgs;
use exowire::ShutdownTrigger;
use exowire::shutdown;

use super::Backend;
use super::BackendState;
use super::Error;
use super::Result;
use super::StateCell;
use crate::config::BootOptions;
use crate::handshake;
use crate::handshake::Connection;
use crate::platform;
use crate::platform::CommandOutput;
use crate::platform::Platform;
use crate::platform::SystemPlatform;
use crate::reaper;
use crate::reaper::ExitHook;
use crate::worker::RemoteWorker;

pub const DOCKER: &str = "docker";

/// Where the code source is mounted inside the container.
pub const MOUNT_POINT: &str = "/exo";

const DAEMON_UNREACHABLE: &str = "Cannot connect to the Docker daemon";

pub struct ContainerBackend {
    platform: Arc<dyn Platform>,
    id: String,
    state: StateCell,
    connection: Connection,
    hook: Arc<ExitHook>,
    trigger: ShutdownTrigger,
}

impl ContainerBackend {
    /// Starts a container through `platform` instead of the system's `docker`.
    pub async fn start_with(platform: Arc<dyn Platform>, code: Arc<dyn CodeProvider>, options: BootOptions) -> Result<Self> {
        reaper::install_signal_hook();
        let port = options.resolve_directory_port()?;
        ensure_image(platform.as_ref(), &options.image).await?;

        let source = absolute(&options.code_source);
        let mut worker_args = WorkerArgs::new(port, MOUNT_POINT);
        worker_args.listen_host = options.listen_host.clone();
        worker_args.advertise_host = options.advertise_host.clone();

        let mut create = platform::args(["create", "--network", "host", "-v"]);
        create.push(format!("{}:{}", source.display(), MOUNT_POINT));
        for shared in &options.shared_paths {
            let shared = absolute(shared);
            create.push("-v".to_string());
            create.push(format!("{}:/shared{}", shared.display(), shared.display()));
        }
        create.extend(platform::args(["-w", MOUNT_POINT, options.image.as_str()]));
        create.push(format!("{}/exoworker", MOUNT_POINT));
        create.extend(worker_args.to_command_args());

        let id = run(platform.as_ref(), &create).await?.stdout.trim().to_string();
        tracing::info!(container = %id, image = %options.image, port, "container created");

        let hook_platform = platform.clone();
        let hook_id = id.clone();
        let hook = reaper::register(format!("container {}", id), move || {
            let args = platform::args(["rm", "-f", hook_id.as_str()]);
            if let Err(e) = hook_platform.run_blocking(DOCKER, &args, None) {
                tracing::warn!(container = %hook_id, error = %e, "cannot remove container");
            }
        });

        let started = async {
            run(platform.as_ref(), &platform::args(["start", id.as_str()])).await?;
            platform
                .spawn(DOCKER, &platform::args(["logs", "-f", id.as_str()]), None)
                .await
                .map_err(Error::Spawn)?;

            let (trigger, signal) = shutdown::channel();
            let directory_addr = format!("127.0.0.1:{}", port);
            let connection = handshake::establish(&directory_addr, code, &options, &signal).await?;
            Ok::<_, Error>((connection, trigger))
        };

        let (connection, trigger) = match started.await {
            Ok(started) => started,
            Err(e) => {
                tracing::warn!(container = %id, error = %e, "container failed to start");
                remove(platform.as_ref(), &id).await;
                hook.disarm();
                return Err(e);
            }
        };

        let backend = Self {
            platform,
            id,
            state: StateCell::new(),
            connection,
            hook,
            trigger,
        };
        backend.state.advance(BackendState::Running);
        Ok(backend)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Records that the container stopped. It is only removed once the hook is spent.
    fn mark_terminated(&self) {
        if self.state.advance(BackendState::Terminated) {
            self.trigger.trigger();
            tracing::info!(container = %self.id, "container stopped");
        }
    }
}

#[async_trait::async_trait]
impl Backend for ContainerBackend {
    async fn start(code: Arc<dyn CodeProvider>, options: BootOptions) -> Result<Self> {
        Self::start_with(Arc::new(SystemPlatform), code, options).await
    }

    fn state(&self) -> BackendState {
        self.state.get()
    }

    fn worker(&self) -> &RemoteWorker {
        &self.connection.worker
    }

    async fn is_alive(&self) -> bool {
        if self.state.is_terminated() {
            return false;
        }
        let args = platform::args(["inspect", "-f", "{{.State.Running}}", self.id.as_str()]);
        match self.platform.run(DOCKER, &args, None).await {
            Ok(output) if output.success => {
                let running = output.stdout.trim() == "true";
                if !running {
                    self.mark_terminated();
                }
                running
            }
            Ok(output) if is_gone(&output.stderr) => {
                self.mark_terminated();
                false
            }
            // The daemon could not answer; that says nothing about the container.
            Ok(output) => {
                tracing::warn!(container = %self.id, detail = %output.stderr.trim(), "cannot inspect container");
                false
            }
            Err(e) => {
                tracing::warn!(container = %self.id, error = %e, "cannot inspect container");
                false
            }
        }
    }

    async fn terminate(&self) -> Result<()> {
        if self.hook.is_spent() {
            self.mark_terminated();
            return Ok(());
        }
        tolerate_gone(run(self.platform.as_ref(), &platform::args(["stop", self.id.as_str()])).await)?;
        tolerate_gone(run(self.platform.as_ref(), &platform::args(["rm", self.id.as_str()])).await)?;
        self.hook.disarm();
        self.mark_terminated();
        tracing::info!(container = %self.id, "container removed");
        Ok(())
    }

    async fn wait_for_exit(&self) -> Result<()> {
        if !self.state.is_terminated() {
            tolerate_gone(run(self.platform.as_ref(), &platform::args(["wait", self.id.as_str()])).await)?;
        }
        self.mark_terminated();
        Ok(())
    }
}

impl Drop for ContainerBackend {
    fn drop(&mut self) {
        self.hook.fire();
        self.trigger.trigger();
    }
}

/// Pulls `image` unless it is already present, logging the pull's status lines.
async fn ensure_image(platform: &dyn Platform, image: &str) -> Result<()> {
    let inspect = platform
        .run(DOCKER, &platform::args(["image", "inspect", image]), None)
        .await
        .map_err(Error::Spawn)?;
    if inspect.success {
        return Ok(());
    }
    if inspect.stderr.contains(DAEMON_UNREACHABLE) {
        return Err(Error::PlatformUnreachable);
    }

    tracing::info!(image, "pulling base image");
    let pull = platform
        .run(DOCKER, &platform::args(["pull", image]), None)
        .await
        .map_err(Error::Spawn)?;
    for line in pull.stdout.lines().filter(|line| !line.trim().is_empty()) {
        tracing::info!(image, "{}", line);
    }
    if !pull.success {
        if pull.stderr.contains(DAEMON_UNREACHABLE) {
            return Err(Error::PlatformUnreachable);
        }
        return Err(Error::ImagePull(pull.stderr.trim().to_string()));
    }
    Ok(())
}

/// Runs a docker command, turning a failed exit into an error.
async fn run(platform: &dyn Platform, args: &[String]) -> Result<CommandOutput> {
    let output = platform.run(DOCKER, args, None).await.map_err(Error::Spawn)?;
    if output.success {
        return Ok(output);
    }
    if output.stderr.contains(DAEMON_UNREACHABLE) {
        return Err(Error::PlatformUnreachable);
    }
    Err(Error::Platform {
        command: format!("{} {}", DOCKER, args.join(" ")),
        detail: output.stderr,
    })
}

/// A container that is already stopped or removed counts as torn down.
fn tolerate_gone(result: Result<CommandOutput>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(Error::Platform { detail, .. }) if is_gone(&detail) => Ok(()),
        Err(e) => Err(e),
    }
}

fn is_gone(detail: &str) -> bool {
    detail.contains("No such container") || detail.contains("No such object") || detail.contains("is not running")
}

async fn remove(platform: &dyn Platform, id: &str) {
    if let Err(e) = tolerate_gone(run(platform, &platform::args(["rm", "-f", id])).await) {
        tracing::warn!(container = %id, error = %e, "cannot remove container");
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
