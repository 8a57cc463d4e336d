//! Worker launch arguments.
//!
//! Backends render these onto the worker's command line with [`WorkerArgs::to_command_args`];
//! the `exoworker` binary parses them back.

use std::path::PathBuf;

use clap::Parser;

use crate::bootstrap::WorkerOptions;

#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "exoworker", about = "Runs closures shipped by an exo host")]
pub struct WorkerArgs {
    /// Port of the directory service this worker hosts.
    #[arg(long)]
    pub directory_port: u16,

    /// Directory (or archive, or single unit) of code units resolvable without the host.
    #[arg(long)]
    pub code_source: PathBuf,

    /// Interface the directory and worker endpoint listen on.
    #[arg(long, default_value = "0.0.0.0")]
    pub listen_host: String,

    /// Host name the worker endpoint is published under.
    #[arg(long, default_value = "127.0.0.1")]
    pub advertise_host: String,

    /// Port of the worker endpoint; 0 picks a free one.
    #[arg(long, default_value_t = 0)]
    pub worker_port: u16,
}

impl WorkerArgs {
    pub fn new(directory_port: u16, code_source: impl Into<PathBuf>) -> Self {
        Self {
            directory_port,
            code_source: code_source.into(),
            listen_host: "0.0.0.0".to_string(),
            advertise_host: "127.0.0.1".to_string(),
            worker_port: 0,
        }
    }

    /// The arguments as they appear after the program name.
    pub fn to_command_args(&self) -> Vec<String> {
        vec![
            "--directory-port".to_string(),
            self.directory_port.to_string(),
            "--code-source".to_string(),
            self.code_source.to_string_lossy().into_owned(),
            "--listen-host".to_string(),
            self.listen_host.clone(),
            "--advertise-host".to_string(),
            self.advertise_host.clone(),
            "--worker-port".to_string(),
            self.worker_port.to_string(),
        ]
    }
}

impl From<WorkerArgs> for WorkerOptions {
    fn from(args: WorkerArgs) -> Self {
        WorkerOptions {
            directory_port: args.directory_port,
            code_source: args.code_source,
            listen_host: args.listen_host,
            advertise_host: args.advertise_host,
            worker_port: args.worker_port,
            ..WorkerOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_optional_arguments() {
        let args = WorkerArgs::try_parse_from(["exoworker", "--directory-port", "4100", "--code-source", "/exo"]).unwrap();
        assert_eq!(args, WorkerArgs::new(4100, "/exo"));
    }

    #[test]
    fn test_required_arguments() {
        assert!(WorkerArgs::try_parse_from(["exoworker", "--code-source", "/exo"]).is_err());
        assert!(WorkerArgs::try_parse_from(["exoworker", "--directory-port", "4100"]).is_err());
    }

    #[test]
    fn test_command_args_parse_back() {
        let mut args = WorkerArgs::new(4100, "/tmp/code");
        args.advertise_host = "10.0.0.2".into();
        args.worker_port = 4200;

        let mut argv = vec!["exoworker".to_string()];
        argv.extend(args.to_command_args());
        assert_eq!(WorkerArgs::try_parse_from(argv).unwrap(), args);
    }
}
