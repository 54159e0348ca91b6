//! Container specs for the database service and the restore job.

use crate::backup::RESTORE_CONTAINER;
use crate::CoreError;
use k2hdkc_schema::{
    AgentConfig, CommandLine, ContainerSpec, NetworkMode, OverrideSet, PortBinding, RestartPolicy,
};

pub use k2hdkc_runtime::docker::SERVICE_CONTAINER;

/// Ports to publish: every port of every configured range, but only when
/// the container gets its own network namespace.
fn port_bindings(config: &AgentConfig) -> Result<Vec<PortBinding>, CoreError> {
    if config.network_mode != NetworkMode::Bridge {
        return Ok(Vec::new());
    }
    let mut ports = Vec::new();
    for range in config.port_ranges()? {
        ports.extend(range.map(|port| PortBinding {
            container_port: port,
            host_port: port,
        }));
    }
    Ok(ports)
}

fn base_spec(
    config: &AgentConfig,
    image: &str,
    name: &str,
    overrides: &OverrideSet,
) -> Result<ContainerSpec, CoreError> {
    Ok(ContainerSpec {
        image: image.to_owned(),
        name: name.to_owned(),
        network_mode: config.network_mode,
        volumes: config.volumes.clone(),
        ports: port_bindings(config)?,
        user: config.container_user.clone(),
        environment: overrides.to_environment(),
        command: None,
        restart_policy: RestartPolicy::UnlessStopped,
        sysctls: config.sysctls.clone(),
    })
}

/// The long-running database container, started with the image's own command.
pub fn service_container_spec(
    config: &AgentConfig,
    overrides: &OverrideSet,
) -> Result<ContainerSpec, CoreError> {
    base_spec(config, &config.docker_image, SERVICE_CONTAINER, overrides)
}

/// The one-shot container that pulls a backup into the data directory.
pub fn restore_container_spec(
    config: &AgentConfig,
    command: CommandLine,
    overrides: &OverrideSet,
) -> Result<ContainerSpec, CoreError> {
    let mut spec = base_spec(config, &config.backup_docker_image, RESTORE_CONTAINER, overrides)?;
    spec.command = Some(command);
    Ok(spec)
}
