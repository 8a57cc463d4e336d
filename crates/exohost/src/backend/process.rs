//! Process backend: the worker runs as a child process of the host.

use std::process::Stdio;
use std::sync::Arc;

use exocode::CodeProvider;
use exoworker::WorkerArgs;
use exowire::ShutdownTrigger;
use exowire::shutdown;
use tokio::process::Child;
use tokio::sync::Notify;
use tokio::sync::watch;

use super::Backend;
use super::BackendState;
use super::Error;
use super::Result;
use super::StateCell;
use crate::config::BootOptions;
use crate::handshake;
use crate::handshake::Connection;
use crate::reaper;
use crate::reaper::ExitHook;
use crate::worker::RemoteWorker;

/// How the worker process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exited {
    /// `None` when the process was killed by a signal or its status could not be read.
    pub code: Option<i32>,
}

pub struct ProcessBackend {
    state: StateCell,
    connection: Connection,
    pid: Option<u32>,
    exit: watch::Receiver<Option<Exited>>,
    kill: Arc<Notify>,
    hook: Arc<ExitHook>,
    trigger: ShutdownTrigger,
}

impl ProcessBackend {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// The exit status, once the process has ended.
    pub fn exit_status(&self) -> Option<Exited> {
        *self.exit.borrow()
    }

    fn has_exited(&self) -> bool {
        self.exit.borrow().is_some()
    }

    fn mark_terminated(&self) {
        if self.state.advance(BackendState::Terminated) {
            self.trigger.trigger();
            self.hook.disarm();
            tracing::info!(pid = ?self.pid, status = ?self.exit_status(), "worker process terminated");
        }
    }
}

#[async_trait::async_trait]
impl Backend for ProcessBackend {
    async fn start(code: Arc<dyn CodeProvider>, options: BootOptions) -> Result<Self> {
        let port = options.resolve_directory_port()?;
        let program = options.resolve_worker_program()?;

        let mut args = WorkerArgs::new(port, &options.code_source);
        args.listen_host = options.listen_host.clone();
        args.advertise_host = options.advertise_host.clone();

        reaper::install_signal_hook();
        let mut command = tokio::process::Command::new(&program);
        command
            .args(args.to_command_args())
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        die_with_parent(&mut command);
        let child = command.spawn().map_err(Error::Spawn)?;
        let pid = child.id();
        tracing::info!(program = %program.display(), ?pid, port, "worker process spawned");

        let label = pid.map_or_else(|| "process".to_string(), |pid| format!("process {}", pid));
        let hook = reaper::register(label, move || {
            if let Some(pid) = pid {
                kill_pid(pid);
            }
        });
        let kill = Arc::new(Notify::new());
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(monitor(child, kill.clone(), exit_tx));

        let (trigger, signal) = shutdown::channel();
        let directory_addr = format!("127.0.0.1:{}", port);
        let mut exited = exit_rx.clone();
        let outcome = tokio::select! {
            connected = handshake::establish(&directory_addr, code, &options, &signal) => connected.map_err(Error::from),
            status = exited.wait_for(|status| status.is_some()) => {
                let code = status.ok().and_then(|status| *status).and_then(|e| e.code);
                Err(Error::ExitedDuringStartup(code))
            }
        };

        let connection = match outcome {
            Ok(connection) => connection,
            Err(e) => {
                tracing::warn!(?pid, error = %e, "worker process failed to start");
                trigger.trigger();
                kill.notify_one();
                let _ = exited.wait_for(|status| status.is_some()).await;
                hook.disarm();
                return Err(e);
            }
        };

        let backend = Self {
            state: StateCell::new(),
            connection,
            pid,
            exit: exit_rx,
            kill,
            hook,
            trigger,
        };
        backend.state.advance(BackendState::Running);
        Ok(backend)
    }

    fn state(&self) -> BackendState {
        if self.has_exited() {
            self.mark_terminated();
        }
        self.state.get()
    }

    fn worker(&self) -> &RemoteWorker {
        &self.connection.worker
    }

    async fn is_alive(&self) -> bool {
        if self.has_exited() {
            self.mark_terminated();
            return false;
        }
        true
    }

    async fn terminate(&self) -> Result<()> {
        if !self.has_exited() {
            self.kill.notify_one();
        }
        self.wait_for_exit().await
    }

    async fn wait_for_exit(&self) -> Result<()> {
        let mut exit = self.exit.clone();
        // The monitor publishes before it goes away, so a closed channel means it has exited too.
        let _ = exit.wait_for(|status| status.is_some()).await;
        self.mark_terminated();
        Ok(())
    }
}

impl Drop for ProcessBackend {
    fn drop(&mut self) {
        if !self.has_exited() {
            self.hook.fire();
        }
        self.trigger.trigger();
    }
}

/// Owns the child until it exits, killing it on request, and publishes how it ended.
async fn monitor(mut child: Child, kill: Arc<Notify>, exit: watch::Sender<Option<Exited>>) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.notified() => {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "kill request on an exited worker");
            }
            child.wait().await
        }
    };
    let exited = match status {
        Ok(status) => Exited { code: status.code() },
        Err(e) => {
            tracing::warn!(error = %e, "lost track of the worker process");
            Exited { code: None }
        }
    };
    exit.send_replace(Some(exited));
}

/// Has the kernel SIGKILL the worker if the host dies without running its exit hooks.
#[cfg(target_os = "linux")]
fn die_with_parent(command: &mut tokio::process::Command) {
    use nix::sys::prctl;
    use nix::sys::signal::Signal;

    // SAFETY: the closure runs in the forked child before exec and only issues one prctl call.
    unsafe {
        command.pre_exec(|| prctl::set_pdeathsig(Signal::SIGKILL).map_err(std::io::Error::from));
    }
}

#[cfg(not(target_os = "linux"))]
fn die_with_parent(_command: &mut tokio::process::Command) {}

#[cfg(unix)]
fn kill_pid(pid: u32) {
    use nix::sys::signal::Signal;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else { return };
    match nix::sys::signal::kill(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pid, error = %e, "cannot kill worker process"),
    }
}

#[cfg(not(unix))]
fn kill_pid(_pid: u32) {
    // The child is spawned with kill_on_drop; nothing else to do here.
}
