//! # Platform command runner
//!
//! The container and VM backends drive external tools (`docker`, `vagrant`). They do it through
//! [`Platform`] so tests can script the tool's answers.

use std::path::Path;
use std::process::Stdio;

/// What a finished command printed, and whether it succeeded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

impl From<std::process::Output> for CommandOutput {
    fn from(output: std::process::Output) -> Self {
        Self {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

#[async_trait::async_trait]
pub trait Platform: Send + Sync + 'static {
    /// Runs a command to completion, capturing its output.
    async fn run(&self, program: &str, args: &[String], cwd: Option<&Path>) -> std::io::Result<CommandOutput>;

    /// Starts a long-running command with the host's stdout and stderr, without waiting for it.
    async fn spawn(&self, program: &str, args: &[String], cwd: Option<&Path>) -> std::io::Result<()>;

    /// Synchronous variant of [`Platform::run`] for exit hooks, which cannot await.
    fn run_blocking(&self, program: &str, args: &[String], cwd: Option<&Path>) -> std::io::Result<CommandOutput>;
}

/// Runs commands on the local system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPlatform;

#[async_trait::async_trait]
impl Platform for SystemPlatform {
    async fn run(&self, program: &str, args: &[String], cwd: Option<&Path>) -> std::io::Result<CommandOutput> {
        let mut command = tokio::process::Command::new(program);
        command.args(args).stdin(Stdio::null());
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        tracing::trace!(program, ?args, "running platform command");
        Ok(command.output().await?.into())
    }

    async fn spawn(&self, program: &str, args: &[String], cwd: Option<&Path>) -> std::io::Result<()> {
        let mut command = tokio::process::Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        let mut child = command.spawn()?;
        let program = program.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => tracing::debug!(program = %program, %status, "background command finished"),
                Err(e) => tracing::warn!(program = %program, error = %e, "background command lost"),
            }
        });
        Ok(())
    }

    fn run_blocking(&self, program: &str, args: &[String], cwd: Option<&Path>) -> std::io::Result<CommandOutput> {
        let mut command = std::process::Command::new(program);
        command.args(args).stdin(Stdio::null());
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }
        Ok(command.output()?.into())
    }
}

/// Shorthand for building argument lists.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
