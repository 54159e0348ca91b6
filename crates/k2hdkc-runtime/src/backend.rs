use crate::RuntimeError;
use k2hdkc_schema::{AgentConfig, CommandLine, ContainerId, ContainerSpec, LifecycleState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHandle {
    pub id: ContainerId,
    pub name: String,
}

/// Operations the agent needs from a container runtime.
///
/// A runtime instance is bound to one service container; `container_status`,
/// `run_command` and `stop_and_unregister` act on it. `run`, `get_container`
/// and `remove` address auxiliary containers by name.
pub trait ContainerRuntime: Send + Sync {
    fn name(&self) -> &str;

    fn available(&self) -> bool;

    /// Create and start the service container described by `spec`.
    fn start_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError>;

    /// Run an auxiliary container detached.
    ///
    /// A container that fails on its own account is reported as
    /// [`RuntimeError::ContainerError`] carrying its logs.
    fn run(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError>;

    fn container_status(&self) -> Result<LifecycleState, RuntimeError>;

    /// Execute `command` inside the service container and return its stdout.
    fn run_command(&self, command: &CommandLine) -> Result<String, RuntimeError>;

    /// Look up a container by name; [`RuntimeError::NotFound`] if absent.
    fn get_container(&self, name: &str) -> Result<ContainerHandle, RuntimeError>;

    fn remove(&self, handle: &ContainerHandle, force: bool) -> Result<(), RuntimeError>;

    fn logs(&self, handle: &ContainerHandle) -> Result<String, RuntimeError> {
        Err(RuntimeError::ExecFailed(format!(
            "logs of '{}' not supported by {} backend",
            handle.name,
            self.name()
        )))
    }

    /// Stop the database inside the service container, then the container.
    fn stop_and_unregister(&self) -> Result<(), RuntimeError>;
}

pub fn select_runtime(
    name: &str,
    config: &AgentConfig,
) -> Result<Arc<dyn ContainerRuntime>, RuntimeError> {
    match name {
        "docker" => Ok(Arc::new(crate::docker::DockerCli::from_config(config))),
        "mock" => Ok(Arc::new(crate::mock::MockRuntime::new())),
        other => Err(RuntimeError::BackendUnavailable(other.to_owned())),
    }
}
