//! Process execution and container runtime backends for the K2HDKC guest agent.
//!
//! This crate implements the execution layer: the timeout-bounded command
//! `Executor`, the pluggable `ContainerRuntime` trait with a Docker CLI backend
//! and an in-memory mock backend, and runtime selection by name.

pub mod backend;
pub mod docker;
pub mod exec;
pub mod mock;

pub use backend::{select_runtime, ContainerHandle, ContainerRuntime};
pub use exec::{ExecutionResult, Executor, ExitOutcome};

use k2hdkc_schema::CommandLineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("runtime I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to start '{program}': {source}")]
    SpawnFailed {
        program: String,
        source: std::io::Error,
    },
    #[error("invalid command line: {0}")]
    InvalidCommandLine(#[from] CommandLineError),
    #[error("'{command}' timed out after {timeout_secs}s")]
    TimedOut { command: String, timeout_secs: u64 },
    #[error("'{command}' exited with {}: {stderr}", exit_label(.code))]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("container '{container}' failed")]
    ContainerError { container: String, logs: String },
    #[error("runtime backend '{0}' is not available on this system")]
    BackendUnavailable(String),
    #[error("runtime execution failed: {0}")]
    ExecFailed(String),
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("code {c}"),
        None => "a signal".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failed_display_with_code() {
        let e = RuntimeError::CommandFailed {
            command: "docker stop database".to_owned(),
            code: Some(1),
            stderr: "boom".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("code 1"));
        assert!(msg.contains("boom"));
    }

    #[test]
    fn command_failed_display_without_code() {
        let e = RuntimeError::CommandFailed {
            command: "x".to_owned(),
            code: None,
            stderr: String::new(),
        };
        assert!(e.to_string().contains("a signal"));
    }

    #[test]
    fn timed_out_display() {
        let e = RuntimeError::TimedOut {
            command: "sleep 10".to_owned(),
            timeout_secs: 1,
        };
        assert_eq!(e.to_string(), "'sleep 10' timed out after 1s");
    }
}
