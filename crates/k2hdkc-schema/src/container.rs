use crate::command::CommandLine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub host: String,
    pub container: String,
    #[serde(default)]
    pub read_only: bool,
}

impl VolumeMount {
    /// Read-write bind mount at the same path on both sides.
    pub fn same_path(path: &str) -> Self {
        Self {
            host: path.to_owned(),
            container: path.to_owned(),
            read_only: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    #[default]
    Host,
    Bridge,
    None,
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkMode::Host => write!(f, "host"),
            NetworkMode::Bridge => write!(f, "bridge"),
            NetworkMode::None => write!(f, "none"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    #[default]
    No,
    Always,
    UnlessStopped,
    OnFailure,
}

impl fmt::Display for RestartPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartPolicy::No => write!(f, "no"),
            RestartPolicy::Always => write!(f, "always"),
            RestartPolicy::UnlessStopped => write!(f, "unless-stopped"),
            RestartPolicy::OnFailure => write!(f, "on-failure"),
        }
    }
}

/// TCP port published from the container to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_port: u16,
}

impl fmt::Display for PortBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/tcp", self.host_port, self.container_port)
    }
}

/// Declarative request for one container start or run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub network_mode: NetworkMode,
    pub volumes: Vec<VolumeMount>,
    pub ports: Vec<PortBinding>,
    /// `uid:gid` the container process runs as.
    pub user: String,
    pub environment: BTreeMap<String, String>,
    /// `None` runs the image's default command.
    pub command: Option<CommandLine>,
    pub restart_policy: RestartPolicy,
    pub sysctls: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_policy_renders_docker_names() {
        assert_eq!(RestartPolicy::UnlessStopped.to_string(), "unless-stopped");
        assert_eq!(RestartPolicy::OnFailure.to_string(), "on-failure");
        let json = serde_json::to_string(&RestartPolicy::UnlessStopped).unwrap();
        assert_eq!(json, "\"unless-stopped\"");
    }

    #[test]
    fn port_binding_display() {
        let p = PortBinding {
            container_port: 8020,
            host_port: 18020,
        };
        assert_eq!(p.to_string(), "18020:8020/tcp");
    }

    #[test]
    fn network_mode_defaults_to_host() {
        assert_eq!(NetworkMode::default(), NetworkMode::Host);
        assert_eq!(ContainerSpec::default().network_mode, NetworkMode::Host);
    }
}
