//! Agent configuration, loaded once and passed into every component.

use crate::container::{NetworkMode, VolumeMount};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Upper bound for `state_change_wait_time_secs` and `command_timeout_secs`.
pub const MAX_WAIT_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read agent config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse agent config: {0}")]
    ParseToml(#[from] toml::de::Error),
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{field} must be at most {max}, got {value}")]
    TooLarge {
        field: &'static str,
        max: u64,
        value: u64,
    },
    #[error("invalid tcp port range '{0}', expected '<port>' or '<first>-<last>'")]
    InvalidPortRange(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Image of the k2hdkc service container.
    #[serde(default = "default_docker_image")]
    pub docker_image: String,
    /// Image carrying the backup/restore tool.
    #[serde(default = "default_backup_docker_image")]
    pub backup_docker_image: String,
    #[serde(default = "default_storage_strategy")]
    pub storage_strategy: String,
    #[serde(default = "default_backup_strategy")]
    pub backup_strategy: String,
    /// Identity service endpoint handed to the restore tool.
    #[serde(default)]
    pub auth_url: String,
    /// Passed to the restore tool when set; never logged.
    #[serde(default)]
    pub backup_aes_cbc_key: Option<String>,
    #[serde(default = "default_wait_secs")]
    pub state_change_wait_time_secs: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default)]
    pub network_mode: NetworkMode,
    /// Published only under bridge networking, e.g. `["8020-8021", "8031"]`.
    #[serde(default)]
    pub tcp_ports: Vec<String>,
    #[serde(default)]
    pub sysctls: BTreeMap<String, String>,
    #[serde(default = "default_mount_point")]
    pub mount_point: PathBuf,
    /// Directory holding one marker file per recognized override key.
    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,
    #[serde(default = "default_config_file")]
    pub config_file: PathBuf,
    #[serde(default = "default_helper_path")]
    pub helper_path: String,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_snapshot_name")]
    pub snapshot_name: String,
    #[serde(default = "default_container_user")]
    pub container_user: String,
    #[serde(default = "default_restore_tool")]
    pub restore_tool: String,
    #[serde(default = "default_restart_command")]
    pub restart_command: String,
    #[serde(default = "default_runtime_backend")]
    pub runtime_backend: String,
    #[serde(default = "default_volumes")]
    pub volumes: Vec<VolumeMount>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            docker_image: default_docker_image(),
            backup_docker_image: default_backup_docker_image(),
            storage_strategy: default_storage_strategy(),
            backup_strategy: default_backup_strategy(),
            auth_url: String::new(),
            backup_aes_cbc_key: None,
            state_change_wait_time_secs: default_wait_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            poll_interval_ms: default_poll_interval_ms(),
            network_mode: NetworkMode::default(),
            tcp_ports: Vec::new(),
            sysctls: BTreeMap::new(),
            mount_point: default_mount_point(),
            config_dir: default_config_dir(),
            config_file: default_config_file(),
            helper_path: default_helper_path(),
            data_dir: default_data_dir(),
            snapshot_name: default_snapshot_name(),
            container_user: default_container_user(),
            restore_tool: default_restore_tool(),
            restart_command: default_restart_command(),
            runtime_backend: default_runtime_backend(),
            volumes: default_volumes(),
        }
    }
}

impl AgentConfig {
    pub fn state_change_wait_time(&self) -> Duration {
        Duration::from_secs(self.state_change_wait_time_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// The configured encryption key, treating an empty string as unset.
    pub fn encryption_key(&self) -> Option<&str> {
        self.backup_aes_cbc_key
            .as_deref()
            .filter(|k| !k.is_empty())
    }

    pub fn port_ranges(&self) -> Result<Vec<RangeInclusive<u16>>, ConfigError> {
        self.tcp_ports
            .iter()
            .map(String::as_str)
            .map(parse_port_range)
            .collect()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.docker_image.trim().is_empty() {
            return Err(ConfigError::Empty("docker_image"));
        }
        if self.helper_path.trim().is_empty() {
            return Err(ConfigError::Empty("helper_path"));
        }
        if self.data_dir.trim().is_empty() {
            return Err(ConfigError::Empty("data_dir"));
        }
        check_wait_secs("state_change_wait_time_secs", self.state_change_wait_time_secs)?;
        check_wait_secs("command_timeout_secs", self.command_timeout_secs)?;
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Zero("poll_interval_ms"));
        }
        self.port_ranges()?;
        Ok(())
    }
}

fn check_wait_secs(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Zero(field));
    }
    if value > MAX_WAIT_SECS {
        return Err(ConfigError::TooLarge {
            field,
            max: MAX_WAIT_SECS,
            value,
        });
    }
    Ok(())
}

fn parse_port_range(spec: &str) -> Result<RangeInclusive<u16>, ConfigError> {
    let invalid = || ConfigError::InvalidPortRange(spec.to_owned());
    let parse = |s: &str| s.trim().parse::<u16>().map_err(|_| invalid());

    let (first, last) = match spec.split_once('-') {
        Some((a, b)) => (parse(a)?, parse(b)?),
        None => {
            let p = parse(spec)?;
            (p, p)
        }
    };
    if first == 0 || first > last {
        return Err(invalid());
    }
    Ok(first..=last)
}

fn default_docker_image() -> String {
    "antpickax/k2hdkc-trove:latest".to_owned()
}

fn default_backup_docker_image() -> String {
    "antpickax/k2hdkc-trove-backup:latest".to_owned()
}

fn default_storage_strategy() -> String {
    "swift".to_owned()
}

fn default_backup_strategy() -> String {
    "k2hdkcbackup".to_owned()
}

fn default_wait_secs() -> u64 {
    60
}

fn default_command_timeout_secs() -> u64 {
    60
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_mount_point() -> PathBuf {
    PathBuf::from("/var/lib/antpickax/k2hdkc")
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("/etc/antpickax")
}

fn default_config_file() -> PathBuf {
    PathBuf::from("/etc/antpickax/k2hdkc-trove.cfg")
}

fn default_helper_path() -> String {
    "/usr/libexec/k2hdkctrove.sh".to_owned()
}

fn default_data_dir() -> String {
    "/var/lib/antpickax/k2hdkc".to_owned()
}

fn default_snapshot_name() -> String {
    "trovebackup".to_owned()
}

fn default_container_user() -> String {
    "1001:1001".to_owned()
}

fn default_restore_tool() -> String {
    "/usr/bin/python3 main.py".to_owned()
}

fn default_restart_command() -> String {
    "/bin/sudo /usr/bin/systemctl restart k2hdkc-trove".to_owned()
}

fn default_runtime_backend() -> String {
    "docker".to_owned()
}

fn default_volumes() -> Vec<VolumeMount> {
    vec![
        VolumeMount::same_path("/var/lib/cloud/data"),
        VolumeMount::same_path("/var/lib/antpickax/k2hdkc"),
    ]
}

pub fn parse_config_str(input: &str) -> Result<AgentConfig, ConfigError> {
    let config: AgentConfig = toml::from_str(input)?;
    config.validate()?;
    Ok(config)
}

pub fn parse_config_file(path: impl AsRef<Path>) -> Result<AgentConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    parse_config_str(&content)
}
