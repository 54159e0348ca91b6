use crate::container::restore_container_spec;
use crate::CoreError;
use k2hdkc_runtime::{ContainerHandle, ContainerRuntime, Executor, RuntimeError};
use k2hdkc_schema::{
    AgentConfig, BackupDescriptor, CommandLine, OverrideSet, RequestContext, VolumeMount,
};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Name of the one-shot restore container.
pub const RESTORE_CONTAINER: &str = "db_restore";

/// How a helper invocation ended. Helper failures never abort the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HelperOutcome {
    Succeeded,
    /// Non-zero exit; `None` when killed by a signal.
    Failed(Option<i32>),
    TimedOut,
    /// The helper could not be spawned at all.
    NotStarted,
}

impl HelperOutcome {
    pub fn succeeded(self) -> bool {
        self == HelperOutcome::Succeeded
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreOutcome {
    pub ok: bool,
    /// Container id on success, the container's logs on failure.
    pub output: String,
    pub container: Option<ContainerHandle>,
}

/// Drives the snapshot helper and the restore container.
pub struct BackupOrchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    executor: Executor,
    config: AgentConfig,
}

impl BackupOrchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: AgentConfig) -> Self {
        Self {
            runtime,
            executor: Executor::new(),
            config,
        }
    }

    /// Snapshot the data directory for the backup tool.
    ///
    /// `volumes` are the mounts the backup job gets; a data directory none of
    /// them covers is logged, since the tool would not see the snapshot.
    /// `extra_params` are appended to the helper invocation.
    pub fn create_backup(
        &self,
        backup: &BackupDescriptor,
        volumes: &[VolumeMount],
        extra_params: &str,
    ) -> HelperOutcome {
        info!("creating backup {}", backup.id);
        let data_dir = Path::new(&self.config.data_dir);
        if !volumes
            .iter()
            .any(|v| data_dir.starts_with(Path::new(&v.container)))
        {
            warn!(
                "data directory {} is not mounted into the backup job",
                self.config.data_dir
            );
        }

        let extra = match k2hdkc_schema::split_words(extra_params) {
            Ok(words) => words,
            Err(e) => {
                warn!("ignoring malformed extra backup parameters: {e}");
                Vec::new()
            }
        };
        let cmd = self.snapshot_command("backup", &self.config.snapshot_name).args(extra);
        self.run_helper(&cmd)
    }

    pub fn delete_backup_artifact(&self, snapshot_name: &str) -> HelperOutcome {
        self.run_helper(&self.snapshot_command("delete", snapshot_name))
    }

    pub fn restore_snapshot(&self, snapshot_name: &str) -> HelperOutcome {
        self.run_helper(&self.snapshot_command("restore", snapshot_name))
    }

    pub fn helper_status(&self) -> HelperOutcome {
        self.run_helper(&CommandLine::new(&self.config.helper_path).arg("status"))
    }

    /// Restore `backup` into `restore_location` with a fresh restore container.
    ///
    /// A restore job that fails on its own is reported with `ok == false` and
    /// its logs; any other runtime failure is an error.
    pub fn restore_from_backup(
        &self,
        ctx: &RequestContext,
        backup: &BackupDescriptor,
        restore_location: &str,
        overrides: &OverrideSet,
    ) -> Result<RestoreOutcome, CoreError> {
        let command = self.restore_command(ctx, backup, restore_location)?;
        let spec = restore_container_spec(&self.config, command, overrides)?;

        match self.runtime.get_container(RESTORE_CONTAINER) {
            Ok(existing) => {
                debug!("removing existing container {RESTORE_CONTAINER}");
                self.runtime.remove(&existing, true)?;
            }
            Err(RuntimeError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        info!(
            "restoring backup {} from {} into {restore_location}",
            backup.id, backup.location
        );
        match self.runtime.run(&spec) {
            Ok(handle) => Ok(RestoreOutcome {
                ok: true,
                output: handle.id.to_string(),
                container: Some(handle),
            }),
            Err(RuntimeError::ContainerError { container, logs }) => {
                error!("restore container {container} failed");
                Ok(RestoreOutcome {
                    ok: false,
                    output: logs,
                    container: None,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Command line the restore container runs.
    pub fn restore_command(
        &self,
        ctx: &RequestContext,
        backup: &BackupDescriptor,
        restore_location: &str,
    ) -> Result<CommandLine, CoreError> {
        let mut cmd = CommandLine::parse(&self.config.restore_tool)?
            .arg("--nobackup")
            .option("--storage-driver", &self.config.storage_strategy)
            .option("--driver", &self.config.backup_strategy)
            .secret_option("--os-token", &ctx.auth_token)
            .option("--os-auth-url", &self.config.auth_url)
            .option("--os-tenant-id", &ctx.project_id)
            .option("--restore-from", &backup.location)
            .option("--restore-checksum", &backup.checksum)
            .pair("--db-datadir", restore_location);
        if let Some(key) = self.config.encryption_key() {
            cmd = cmd.secret_option("--backup-encryption-key", key);
        }
        Ok(cmd)
    }

    fn snapshot_command(&self, action: &str, snapshot_name: &str) -> CommandLine {
        CommandLine::new(&self.config.helper_path)
            .arg(action)
            .arg(&self.config.data_dir)
            .arg(snapshot_name)
    }

    fn run_helper(&self, cmd: &CommandLine) -> HelperOutcome {
        let timeout = self.config.command_timeout();
        let result = match self.executor.run(cmd, timeout) {
            Ok(result) => result,
            Err(e) => {
                warn!("could not run {cmd}: {e}");
                return HelperOutcome::NotStarted;
            }
        };
        if result.success() {
            info!("{cmd} succeeded");
            HelperOutcome::Succeeded
        } else if result.timed_out() {
            warn!("{cmd} timed out after {}s", timeout.as_secs());
            HelperOutcome::TimedOut
        } else {
            warn!("{cmd} failed: {}", result.stderr.trim());
            HelperOutcome::Failed(result.exit_code())
        }
    }
}
