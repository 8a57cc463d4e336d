//! # Virtual machine backend
//!
//! Runs the worker in a VM managed by `vagrant`. Each instance gets a scratch directory
//! `exo-vm-<random>` under the system temp dir holding its materialised `Vagrantfile`; the
//! directory's absence means the machine has already been torn down.
//!
//! Both worker ports are forwarded to the host's loopback. The worker reaches the host's code
//! lookup endpoint through the NAT gateway unless `lookup_advertise_host` says otherwise.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use exocode::CodeProvider;
use exoworker::WorkerArgs;
use exowire::Shutdown;
use exowire::ShutdownTrigger;
use exowire::poll;
use exowire::poll::Backoff;
use exowire::shutdown;

use super::Backend;
use super::BackendState;
use super::Error;
use super::Result;
use super::StateCell;
use crate::config;
use crate::config::BootOptions;
use crate::handshake;
use crate::handshake::Connection;
use crate::platform;
use crate::platform::Platform;
use crate::platform::SystemPlatform;
use crate::reaper;
use crate::reaper::ExitHook;
use crate::worker::RemoteWorker;

pub const VAGRANT: &str = "vagrant";

/// The machine definition used unless `BootOptions::vm_template` replaces it.
pub const DEFAULT_TEMPLATE: &str = include_str!("../../templates/Vagrantfile");

/// The host as seen from inside a NAT-networked guest.
pub const GUEST_GATEWAY: &str = "10.0.2.2";

const MOUNT_POINT: &str = "/exo";

/// Fills the `<port>`, `<worker_port>`, `<source>` and `<command>` placeholders.
pub fn render_template(template: &str, port: u16, worker_port: u16, source: &Path, command: &str) -> String {
    template
        .replace("<port>", &port.to_string())
        .replace("<worker_port>", &worker_port.to_string())
        .replace("<source>", &source.display().to_string())
        .replace("<command>", command)
}

pub struct VmBackend {
    platform: Arc<dyn Platform>,
    scratch: PathBuf,
    state: StateCell,
    connection: Connection,
    hook: Arc<ExitHook>,
    trigger: ShutdownTrigger,
    signal: Shutdown,
    exit_poll_interval: Duration,
}

impl VmBackend {
    /// Starts a machine through `platform` instead of the system's `vagrant`.
    pub async fn start_with(platform: Arc<dyn Platform>, code: Arc<dyn CodeProvider>, mut options: BootOptions) -> Result<Self> {
        reaper::install_signal_hook();
        let port = options.resolve_directory_port()?;
        let worker_port = port
            .checked_add(1)
            .ok_or_else(|| config::Error::Unavailable(format!("no worker port above directory port {}", port)))?;
        if options.lookup_advertise_host.is_none() {
            options.lookup_bind = "0.0.0.0:0".to_string();
            options.lookup_advertise_host = Some(GUEST_GATEWAY.to_string());
        }

        let scratch = std::env::temp_dir().join(format!("exo-vm-{:016x}", rand::random::<u64>()));
        std::fs::create_dir_all(&scratch).map_err(Error::Scratch)?;

        let mut worker_args = WorkerArgs::new(port, MOUNT_POINT);
        worker_args.listen_host = "0.0.0.0".to_string();
        worker_args.advertise_host = "127.0.0.1".to_string();
        worker_args.worker_port = worker_port;
        let command = format!("{}/exoworker {}", MOUNT_POINT, worker_args.to_command_args().join(" "));

        let source = std::fs::canonicalize(&options.code_source).unwrap_or_else(|_| options.code_source.clone());
        let template = options.vm_template.as_deref().unwrap_or(DEFAULT_TEMPLATE);
        let definition = render_template(template, port, worker_port, &source, &command);
        if let Err(e) = std::fs::write(scratch.join("Vagrantfile"), definition) {
            let _ = std::fs::remove_dir_all(&scratch);
            return Err(Error::Scratch(e));
        }
        tracing::info!(scratch = %scratch.display(), port, "virtual machine defined");

        let hook_platform = platform.clone();
        let hook_scratch = scratch.clone();
        let hook = reaper::register(format!("vm {}", scratch.display()), move || {
            if !hook_scratch.exists() {
                return;
            }
            if let Err(e) = hook_platform.run_blocking(VAGRANT, &platform::args(["destroy", "-f"]), Some(&hook_scratch)) {
                tracing::warn!(scratch = %hook_scratch.display(), error = %e, "cannot destroy virtual machine");
            }
            let _ = std::fs::remove_dir_all(&hook_scratch);
        });

        let (trigger, signal) = shutdown::channel();
        let started = async {
            platform
                .spawn(VAGRANT, &platform::args(["up"]), Some(&scratch))
                .await
                .map_err(Error::Spawn)?;

            let booting = Backoff {
                initial: options.poll_interval,
                max: options.max_poll_interval,
                deadline: Some(options.bootstrap_timeout),
            };
            let (tool, dir) = (platform.as_ref(), scratch.as_path());
            poll::until(booting, &signal, move || async move { (machine_running(tool, dir).await == Some(true)).then_some(()) })
                .await
                .map_err(|e| Error::Handshake(handshake::Error::NotReady(e)))?;
            tracing::info!(scratch = %scratch.display(), "virtual machine running");

            let directory_addr = format!("127.0.0.1:{}", port);
            Ok::<_, Error>(handshake::establish(&directory_addr, code, &options, &signal).await?)
        };

        let connection = match started.await {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!(scratch = %scratch.display(), error = %e, "virtual machine failed to start");
                trigger.trigger();
                if let Err(e) = destroy(platform.as_ref(), &scratch).await {
                    tracing::warn!(scratch = %scratch.display(), error = %e, "cannot destroy virtual machine");
                }
                hook.disarm();
                return Err(e);
            }
        };

        let backend = Self {
            platform,
            scratch,
            state: StateCell::new(),
            connection,
            hook,
            trigger,
            signal,
            exit_poll_interval: options.exit_poll_interval,
        };
        backend.state.advance(BackendState::Running);
        Ok(backend)
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch
    }

    /// Records that the machine stopped. It is only destroyed once the hook is spent.
    fn mark_terminated(&self) {
        if self.state.advance(BackendState::Terminated) {
            self.trigger.trigger();
            tracing::info!(scratch = %self.scratch.display(), "virtual machine stopped");
        }
    }

    /// `Some(true)` once the machine is known to be down, `None` if that cannot be told right now.
    async fn has_stopped(&self) -> Option<bool> {
        if self.state.is_terminated() {
            return Some(true);
        }
        if !self.scratch.exists() {
            self.hook.disarm();
            self.mark_terminated();
            return Some(true);
        }
        let running = machine_running(self.platform.as_ref(), &self.scratch).await?;
        if !running {
            self.mark_terminated();
        }
        Some(!running)
    }
}

#[async_trait::async_trait]
impl Backend for VmBackend {
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
        self.has_stopped().await == Some(false)
    }

    async fn terminate(&self) -> Result<()> {
        if self.hook.is_spent() {
            self.mark_terminated();
            return Ok(());
        }
        destroy(self.platform.as_ref(), &self.scratch).await?;
        self.hook.disarm();
        self.mark_terminated();
        Ok(())
    }

    async fn wait_for_exit(&self) -> Result<()> {
        let backoff = Backoff::fixed(self.exit_poll_interval, None);
        // Cancelled means the backend was marked stopped meanwhile.
        let this = self;
        let _ = poll::until(backoff, &self.signal, move || async move {
            (this.has_stopped().await == Some(true)).then_some(())
        })
        .await;
        self.mark_terminated();
        Ok(())
    }
}

impl Drop for VmBackend {
    fn drop(&mut self) {
        self.hook.fire();
        self.trigger.trigger();
    }
}

/// Asks `vagrant status`. `None` when the tool could not answer.
async fn machine_running(platform: &dyn Platform, scratch: &Path) -> Option<bool> {
    match platform.run(VAGRANT, &platform::args(["status"]), Some(scratch)).await {
        Ok(output) if output.success => Some(output.stdout.contains("running")),
        Ok(output) => {
            tracing::debug!(detail = %output.stderr.trim(), "vagrant status failed");
            None
        }
        Err(e) => {
            tracing::debug!(error = %e, "vagrant status failed");
            None
        }
    }
}

/// Destroys the machine and its scratch directory. A missing scratch directory is success.
async fn destroy(platform: &dyn Platform, scratch: &Path) -> Result<()> {
    if !scratch.exists() {
        return Ok(());
    }
    let args = platform::args(["destroy", "-f"]);
    let output = platform.run(VAGRANT, &args, Some(scratch)).await.map_err(Error::Spawn)?;
    if !output.success {
        return Err(Error::Platform {
            command: format!("{} {}", VAGRANT, args.join(" ")),
            detail: output.stderr,
        });
    }
    match std::fs::remove_dir_all(scratch) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Scratch(e)),
    }
}
