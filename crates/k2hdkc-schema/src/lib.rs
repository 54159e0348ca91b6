//! Data model and configuration for the K2HDKC guest agent.
//!
//! This crate defines the schema layer shared by every other crate: the health
//! model (`ServiceHealth`, `LifecycleState`), control-plane inputs
//! (`OverrideSet`, `BackupDescriptor`, `RequestContext`), the declarative
//! `ContainerSpec` handed to container runtimes, structured shell-quoted
//! command lines (`CommandLine`), and the TOML-backed `AgentConfig`.

pub mod backup;
pub mod command;
pub mod config;
pub mod container;
pub mod health;
pub mod overrides;
pub mod types;

pub use backup::{BackupDescriptor, RequestContext};
pub use command::{shell_quote, split_words, CommandLine, CommandLineError};
pub use config::{
    parse_config_file, parse_config_str, AgentConfig, ConfigError, MAX_WAIT_SECS,
};
pub use container::{ContainerSpec, NetworkMode, PortBinding, RestartPolicy, VolumeMount};
pub use health::{LifecycleState, ServiceHealth, HEALTHY_TOKEN};
pub use overrides::{OverrideSet, RecognizedKey, RECOGNIZED_KEYS};
pub use types::{BackupId, ContainerId};
