//! # Boot options
//!
//! Everything a backend needs to start and reach a worker. Built with chained `with_*`
//! setters over [`Default`], or from `EXO_*` environment variables with [`BootOptions::from_env`].

use std::path::PathBuf;
use std::time::Duration;

use exowire::poll::Backoff;

/// Base image used by the container backend unless overridden.
pub const DEFAULT_IMAGE: &str = "debian:bookworm-slim";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An environment variable is set but cannot be parsed.
    InvalidVar { name: &'static str, value: String },
    /// No free port could be found, or the worker executable could not be located.
    Unavailable(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidVar { name, value } => write!(f, "{} has an invalid value '{}'", name, value),
            Self::Unavailable(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone)]
pub struct BootOptions {
    /// Port of the worker's directory service. `None` picks a free one at start.
    pub directory_port: Option<u16>,
    /// Code units the worker may resolve without asking the host. Mounted at `/exo` in
    /// containers and virtual machines.
    pub code_source: PathBuf,
    /// Interface the worker listens on.
    pub listen_host: String,
    /// Host name the worker publishes its endpoint under.
    pub advertise_host: String,
    /// Where the host's code lookup endpoint listens.
    pub lookup_bind: String,
    /// Host name the worker should use to reach the code lookup endpoint. `None` uses the
    /// bound address.
    pub lookup_advertise_host: Option<String>,
    pub bootstrap_timeout: Duration,
    pub poll_interval: Duration,
    pub max_poll_interval: Duration,
    pub exit_poll_interval: Duration,
    /// Upper bound on a single remote call. `None` waits as long as the closure runs.
    pub call_timeout: Option<Duration>,
    /// The `exoworker` executable. `None` looks next to the current executable.
    pub worker_program: Option<PathBuf>,
    pub image: String,
    /// Extra host directories shared with a container, each mounted at `/shared<path>`.
    pub shared_paths: Vec<PathBuf>,
    /// Machine definition replacing the embedded `Vagrantfile`.
    pub vm_template: Option<String>,
}

impl Default for BootOptions {
    fn default() -> Self {
        Self {
            directory_port: None,
            code_source: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            listen_host: "127.0.0.1".to_string(),
            advertise_host: "127.0.0.1".to_string(),
            lookup_bind: "127.0.0.1:0".to_string(),
            lookup_advertise_host: None,
            bootstrap_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(10),
            max_poll_interval: Duration::from_millis(250),
            exit_poll_interval: Duration::from_millis(100),
            call_timeout: None,
            worker_program: None,
            image: DEFAULT_IMAGE.to_string(),
            shared_paths: Vec::new(),
            vm_template: None,
        }
    }
}

impl BootOptions {
    /// Defaults overlaid with `EXO_WORKER_BIN`, `EXO_DIRECTORY_PORT`,
    /// `EXO_BOOTSTRAP_TIMEOUT_MS`, `EXO_ADVERTISE_HOST` and `EXO_IMAGE`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut options = Self::default();
        if let Some(program) = var("EXO_WORKER_BIN") {
            options.worker_program = Some(PathBuf::from(program));
        }
        if let Some(port) = var("EXO_DIRECTORY_PORT") {
            let parsed = port.parse().map_err(|_| Error::InvalidVar {
                name: "EXO_DIRECTORY_PORT",
                value: port.clone(),
            })?;
            options.directory_port = Some(parsed);
        }
        if let Some(millis) = var("EXO_BOOTSTRAP_TIMEOUT_MS") {
            let parsed = millis.parse().map_err(|_| Error::InvalidVar {
                name: "EXO_BOOTSTRAP_TIMEOUT_MS",
                value: millis.clone(),
            })?;
            options.bootstrap_timeout = Duration::from_millis(parsed);
        }
        if let Some(host) = var("EXO_ADVERTISE_HOST") {
            options.advertise_host = host;
        }
        if let Some(image) = var("EXO_IMAGE") {
            options.image = image;
        }
        Ok(options)
    }

    pub fn with_directory_port(mut self, port: u16) -> Self {
        self.directory_port = Some(port);
        self
    }

    pub fn with_code_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.code_source = path.into();
        self
    }

    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    pub fn with_bootstrap_timeout(mut self, timeout: Duration) -> Self {
        self.bootstrap_timeout = timeout;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_shared_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.shared_paths.push(path.into());
        self
    }

    pub fn with_vm_template(mut self, template: impl Into<String>) -> Self {
        self.vm_template = Some(template.into());
        self
    }

    pub fn with_lookup_advertise_host(mut self, host: impl Into<String>) -> Self {
        self.lookup_advertise_host = Some(host.into());
        self
    }

    /// Backoff for the handshake's polling loops. The overall deadline is applied by the
    /// handshake itself.
    pub fn handshake_backoff(&self) -> Backoff {
        Backoff {
            initial: self.poll_interval,
            max: self.max_poll_interval,
            deadline: None,
        }
    }

    /// The configured directory port, or a currently free one.
    pub fn resolve_directory_port(&self) -> Result<u16> {
        if let Some(port) = self.directory_port {
            return Ok(port);
        }
        let listener = std::net::TcpListener::bind("127.0.0.1:0")
            .map_err(|e| Error::Unavailable(format!("no free directory port: {}", e)))?;
        let port = listener
            .local_addr()
            .map_err(|e| Error::Unavailable(format!("no free directory port: {}", e)))?
            .port();
        Ok(port)
    }

    /// The configured worker executable, or `exoworker` next to the current executable.
    pub fn resolve_worker_program(&self) -> Result<PathBuf> {
        if let Some(program) = &self.worker_program {
            return Ok(program.clone());
        }
        let current = std::env::current_exe()
            .map_err(|e| Error::Unavailable(format!("cannot locate the current executable: {}", e)))?;
        let sibling = current
            .parent()
            .map(|dir| dir.join(format!("exoworker{}", std::env::consts::EXE_SUFFIX)))
            .ok_or_else(|| Error::Unavailable("current executable has no parent directory".into()))?;
        Ok(sibling)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_env_overrides_defaults() {
        let options = BootOptions::from_lookup(lookup(&[
            ("EXO_WORKER_BIN", "/opt/exo/exoworker"),
            ("EXO_DIRECTORY_PORT", "4100"),
            ("EXO_BOOTSTRAP_TIMEOUT_MS", "2500"),
            ("EXO_IMAGE", "alpine:3"),
        ]))
        .unwrap();

        assert_eq!(options.worker_program, Some(PathBuf::from("/opt/exo/exoworker")));
        assert_eq!(options.directory_port, Some(4100));
        assert_eq!(options.bootstrap_timeout, Duration::from_millis(2500));
        assert_eq!(options.image, "alpine:3");
        assert_eq!(options.advertise_host, "127.0.0.1");
    }

    #[test]
    fn test_env_rejects_bad_numbers() {
        let err = BootOptions::from_lookup(lookup(&[("EXO_DIRECTORY_PORT", "70000")])).unwrap_err();
        assert!(matches!(err, Error::InvalidVar { name: "EXO_DIRECTORY_PORT", .. }));
    }

    #[test]
    fn test_free_port_when_unset() {
        let options = BootOptions::default();
        assert_ne!(options.resolve_directory_port().unwrap(), 0);
        assert_eq!(options.with_directory_port(4100).resolve_directory_port().unwrap(), 4100);
    }

    #[test]
    fn test_call_timeout_is_opt_in() {
        assert_eq!(BootOptions::default().call_timeout, None);
        let options = BootOptions::default().with_call_timeout(Duration::from_secs(3));
        assert_eq!(options.call_timeout, Some(Duration::from_secs(3)));
    }
}
