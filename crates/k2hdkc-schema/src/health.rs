use serde::{Deserialize, Serialize};
use std::fmt;

/// Token the in-container status command prints once the database answers.
pub const HEALTHY_TOKEN: &str = "HEALTHY";

/// Lifecycle state as reported by the container runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Running,
    /// The runtime has no such container, or it was never started.
    NotRunning,
    Paused,
    Exited,
    Dead,
    Other(String),
}

impl LifecycleState {
    /// Parse the runtime's textual state (`running`, `paused`, ...).
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "running" => Self::Running,
            "not running" | "not_running" => Self::NotRunning,
            "paused" => Self::Paused,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Running => write!(f, "running"),
            LifecycleState::NotRunning => write!(f, "not running"),
            LifecycleState::Paused => write!(f, "paused"),
            LifecycleState::Exited => write!(f, "exited"),
            LifecycleState::Dead => write!(f, "dead"),
            LifecycleState::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Health of the database service as reported to the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceHealth {
    Healthy,
    Running,
    Shutdown,
    Paused,
    Crashed,
    Unknown,
}

impl ServiceHealth {
    /// Map a runtime lifecycle state and, for running containers, the output
    /// of the health probe onto a health value.
    ///
    /// `probe_output` is ignored unless the container is running, so a
    /// non-running container can never be reported `Healthy`.
    pub fn from_observation(state: &LifecycleState, probe_output: Option<&str>) -> Self {
        match state {
            LifecycleState::Running => {
                if probe_output.is_some_and(|out| out.contains(HEALTHY_TOKEN)) {
                    Self::Healthy
                } else {
                    Self::Running
                }
            }
            LifecycleState::NotRunning | LifecycleState::Exited => Self::Shutdown,
            LifecycleState::Paused => Self::Paused,
            LifecycleState::Dead => Self::Crashed,
            LifecycleState::Other(_) => Self::Unknown,
        }
    }
}

impl fmt::Display for ServiceHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceHealth::Healthy => write!(f, "healthy"),
            ServiceHealth::Running => write!(f, "running"),
            ServiceHealth::Shutdown => write!(f, "shutdown"),
            ServiceHealth::Paused => write!(f, "paused"),
            ServiceHealth::Crashed => write!(f, "crashed"),
            ServiceHealth::Unknown => write!(f, "unknown"),
        }
    }
}
