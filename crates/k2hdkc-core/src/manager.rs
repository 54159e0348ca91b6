use crate::backup::{BackupOrchestrator, HelperOutcome, RestoreOutcome};
use crate::container::service_container_spec;
use crate::lifecycle::{validate_transition, ManagerState};
use crate::reconcile::{ConfigReconciler, ReconcileOutcome};
use crate::status::StatusPoller;
use crate::CoreError;
use k2hdkc_runtime::{select_runtime, ContainerHandle, ContainerRuntime, Executor, RuntimeError};
use k2hdkc_schema::{
    parse_config_file, AgentConfig, BackupDescriptor, OverrideSet, RequestContext, ServiceHealth,
};
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{error, info, warn};

/// Entry points the control plane invokes on the guest.
pub trait GuestAgent {
    /// Start the service, wait for it to become healthy, and restore `backup`
    /// into it if one is given.
    fn prepare(
        &self,
        ctx: &RequestContext,
        overrides: &OverrideSet,
        backup: Option<&BackupDescriptor>,
    ) -> Result<PrepareReport, CoreError>;

    /// Apply (or, with `remove`, drop) overrides, restarting the service if
    /// a tracked key changed.
    fn update_overrides(
        &self,
        overrides: &OverrideSet,
        remove: bool,
    ) -> Result<ReconcileOutcome, CoreError>;

    /// Stop the database and its container. Never fails.
    fn stop(&self);

    fn create_backup(&self, backup: &BackupDescriptor) -> HelperOutcome;
}

/// Result of a successful prepare.
#[derive(Debug, Clone, Serialize)]
pub struct PrepareReport {
    pub container: ContainerHandle,
    pub health: ServiceHealth,
    /// Present when a backup was restored; `ok == false` means the restore
    /// job failed and `output` holds its logs.
    pub restore: Option<RestoreOutcome>,
}

/// Top-level coordinator for one guest's database service.
pub struct Manager {
    config: AgentConfig,
    runtime: Arc<dyn ContainerRuntime>,
    poller: StatusPoller,
    reconciler: ConfigReconciler,
    backups: BackupOrchestrator,
    executor: Executor,
    state: Mutex<ManagerState>,
}

impl Manager {
    /// Validate `config` and use the runtime backend it names.
    pub fn new(config: AgentConfig) -> Result<Self, CoreError> {
        config.validate()?;
        let runtime = select_runtime(&config.runtime_backend, &config)?;
        Ok(Self::with_runtime(config, runtime))
    }

    pub fn from_config_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        Self::new(parse_config_file(path)?)
    }

    pub fn with_runtime(config: AgentConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        let poller = StatusPoller::from_config(Arc::clone(&runtime), &config);
        let reconciler = ConfigReconciler::from_config(&config);
        let backups = BackupOrchestrator::new(Arc::clone(&runtime), config.clone());
        Self {
            config,
            runtime,
            poller,
            reconciler,
            backups,
            executor: Executor::new(),
            state: Mutex::new(ManagerState::Idle),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn state(&self) -> ManagerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn poller(&self) -> &StatusPoller {
        &self.poller
    }

    pub fn reconciler(&self) -> &ConfigReconciler {
        &self.reconciler
    }

    pub fn backups(&self) -> &BackupOrchestrator {
        &self.backups
    }

    /// A fresh observation of the service.
    pub fn status(&self) -> ServiceHealth {
        self.poller.poll_once()
    }

    /// Restart the service and wait until it is healthy again.
    pub fn restart(&self) -> Result<(), CoreError> {
        self.run_restart_command()?;
        let wait = self.config.state_change_wait_time();
        if self.poller.wait_for_status(ServiceHealth::Healthy, wait, false) {
            Ok(())
        } else {
            Err(CoreError::HealthTimeout {
                target: ServiceHealth::Healthy,
                waited_secs: wait.as_secs(),
            })
        }
    }

    fn transition(&self, to: ManagerState) -> Result<(), CoreError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        validate_transition(*state, to)?;
        info!("manager {} -> {to}", *state);
        *state = to;
        Ok(())
    }

    /// Mark the current prepare as failed and hand back `err`.
    fn fail(&self, err: CoreError) -> CoreError {
        if let Err(e) = self.transition(ManagerState::Failed) {
            warn!("could not record failure: {e}");
        }
        err
    }

    fn run_restart_command(&self) -> Result<(), CoreError> {
        let command = &self.config.restart_command;
        let timeout = self.config.command_timeout();
        let result = self.executor.run_line(command, timeout)?;
        if result.timed_out() {
            return Err(RuntimeError::TimedOut {
                command: command.clone(),
                timeout_secs: timeout.as_secs(),
            }
            .into());
        }
        if !result.success() {
            return Err(RuntimeError::CommandFailed {
                command: command.clone(),
                code: result.exit_code(),
                stderr: result.stderr.trim().to_owned(),
            }
            .into());
        }
        info!("restarted k2hdkc");
        Ok(())
    }

    fn start_service(&self, overrides: &OverrideSet) -> Result<ContainerHandle, CoreError> {
        let spec = service_container_spec(&self.config, overrides)?;
        info!(
            "starting {} from {} (network {}, {} port(s))",
            spec.name,
            spec.image,
            spec.network_mode,
            spec.ports.len()
        );
        Ok(self.runtime.start_container(&spec)?)
    }

    fn await_health_and_restore(
        &self,
        ctx: &RequestContext,
        overrides: &OverrideSet,
        backup: Option<&BackupDescriptor>,
    ) -> Result<Option<RestoreOutcome>, CoreError> {
        let wait = self.config.state_change_wait_time();
        if !self.poller.wait_for_status(ServiceHealth::Healthy, wait, false) {
            return Err(CoreError::HealthTimeout {
                target: ServiceHealth::Healthy,
                waited_secs: wait.as_secs(),
            });
        }

        let Some(backup) = backup else {
            return Ok(None);
        };
        let location = self.config.mount_point.to_string_lossy();
        let outcome = self
            .backups
            .restore_from_backup(ctx, backup, &location, overrides)?;
        if outcome.ok {
            info!("restored backup {}", backup.id);
        } else {
            error!("restore of backup {} failed: {}", backup.id, outcome.output.trim());
        }
        Ok(Some(outcome))
    }
}

impl GuestAgent for Manager {
    fn prepare(
        &self,
        ctx: &RequestContext,
        overrides: &OverrideSet,
        backup: Option<&BackupDescriptor>,
    ) -> Result<PrepareReport, CoreError> {
        self.transition(ManagerState::Preparing)?;

        let container = match self.start_service(overrides) {
            Ok(handle) => handle,
            Err(e) => {
                error!("failed to start k2hdkc: {e}");
                return Err(self.fail(e));
            }
        };
        self.transition(ManagerState::AwaitingHealth)?;

        let restore = match self.await_health_and_restore(ctx, overrides, backup) {
            Ok(restore) => restore,
            Err(e) => {
                error!("k2hdkc did not come up: {e}");
                return Err(self.fail(e));
            }
        };
        self.transition(ManagerState::Ready)?;

        Ok(PrepareReport {
            container,
            health: self.poller.last_observed().unwrap_or(ServiceHealth::Healthy),
            restore,
        })
    }

    fn update_overrides(
        &self,
        overrides: &OverrideSet,
        remove: bool,
    ) -> Result<ReconcileOutcome, CoreError> {
        let state = self.state();
        if state == ManagerState::Failed {
            return Err(CoreError::Unavailable {
                state,
                operation: "update overrides",
            });
        }

        let outcome = if remove {
            self.reconciler.remove_overrides()?;
            self.reconciler.reconcile_markers(&OverrideSet::new())?
        } else {
            self.reconciler.apply_overrides(overrides)?
        };

        if outcome.changed() {
            if let Err(e) = self.run_restart_command() {
                warn!("failed to restart k2hdkc: {e}");
            }
        } else {
            info!("overrides unchanged, no restart needed");
        }
        Ok(outcome)
    }

    fn stop(&self) {
        if let Err(e) = self.runtime.stop_and_unregister() {
            warn!("could not stop k2hdkc: {e}");
        }
    }

    fn create_backup(&self, backup: &BackupDescriptor) -> HelperOutcome {
        self.backups.create_backup(backup, &self.config.volumes, "")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k2hdkc_runtime::mock::MockRuntime;
    use k2hdkc_schema::LifecycleState;

    fn config(dir: &Path) -> AgentConfig {
        AgentConfig {
            config_dir: dir.join("etc"),
            config_file: dir.join("etc/k2hdkc-trove.cfg"),
            restart_command: "/bin/true".to_owned(),
            poll_interval_ms: 5,
            state_change_wait_time_secs: 1,
            ..AgentConfig::default()
        }
    }

    fn manager(dir: &Path) -> (Arc<MockRuntime>, Manager) {
        let rt = Arc::new(MockRuntime::new());
        let m = Manager::with_runtime(config(dir), rt.clone());
        (rt, m)
    }

    fn ctx() -> RequestContext {
        RequestContext::new("token", "project")
    }

    #[test]
    fn prepare_without_backup_reaches_ready() {
        let dir = tempfile::tempdir().unwrap();
        let (rt, m) = manager(dir.path());
        assert_eq!(m.state(), ManagerState::Idle);

        let report = m
            .prepare(&ctx(), &OverrideSet::new().with("cluster-name", "c1"), None)
            .unwrap();
        assert_eq!(m.state(), ManagerState::Ready);
        assert_eq!(report.health, ServiceHealth::Healthy);
        assert!(report.restore.is_none());
        assert_eq!(report.container.name, "database");
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["health"], "healthy");
        assert!(json["restore"].is_null());

        let started = rt.started();
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].environment["cluster_name"], "c1");
    }

    #[test]
    fn start_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (rt, m) = manager(dir.path());
        rt.fail_start("image not found");
        let err = m.prepare(&ctx(), &OverrideSet::new(), None).unwrap_err();
        assert!(matches!(err, CoreError::Runtime(_)));
        assert_eq!(m.state(), ManagerState::Failed);
    }

    #[test]
    fn health_timeout_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (rt, m) = manager(dir.path());
        rt.set_healthy_on_start(false);
        let err = m.prepare(&ctx(), &OverrideSet::new(), None).unwrap_err();
        assert!(matches!(
            err,
            CoreError::HealthTimeout {
                target: ServiceHealth::Healthy,
                ..
            }
        ));
        assert_eq!(m.state(), ManagerState::Failed);
        assert!(m.update_overrides(&OverrideSet::new(), false).is_err());
    }

    #[test]
    fn failed_restore_keeps_service_ready() {
        let dir = tempfile::tempdir().unwrap();
        let (rt, m) = manager(dir.path());
        rt.fail_run("restore exploded");
        let backup = BackupDescriptor {
            id: "b1".into(),
            location: "swift://x".to_owned(),
            checksum: "abc123".to_owned(),
        };
        let report = m.prepare(&ctx(), &OverrideSet::new(), Some(&backup)).unwrap();
        let restore = report.restore.unwrap();
        assert!(!restore.ok);
        assert_eq!(restore.output, "restore exploded");
        assert_eq!(m.state(), ManagerState::Ready);
    }

    #[test]
    fn restore_targets_mount_point() {
        let dir = tempfile::tempdir().unwrap();
        let (rt, m) = manager(dir.path());
        let backup = BackupDescriptor {
            id: "b1".into(),
            location: "swift://x".to_owned(),
            checksum: "abc123".to_owned(),
        };
        let report = m.prepare(&ctx(), &OverrideSet::new(), Some(&backup)).unwrap();
        assert!(report.restore.unwrap().ok);
        let runs = rt.runs();
        let command = runs[0].command.as_ref().unwrap().render();
        assert!(command.contains("--db-datadir /var/lib/antpickax/k2hdkc"));
    }

    #[test]
    fn stop_swallows_failures() {
        let dir = tempfile::tempdir().unwrap();
        let (rt, m) = manager(dir.path());
        rt.fail_stop(true);
        m.stop();
        assert_eq!(rt.stop_count(), 1);
    }

    #[test]
    fn restart_waits_for_health() {
        let dir = tempfile::tempdir().unwrap();
        let (rt, m) = manager(dir.path());
        m.prepare(&ctx(), &OverrideSet::new(), None).unwrap();
        m.restart().unwrap();

        rt.set_status(LifecycleState::Exited);
        assert!(matches!(m.restart(), Err(CoreError::HealthTimeout { .. })));
        assert_eq!(m.status(), ServiceHealth::Shutdown);
    }

    #[test]
    fn prepare_again_after_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (rt, m) = manager(dir.path());
        rt.set_healthy_on_start(false);
        assert!(m.prepare(&ctx(), &OverrideSet::new(), None).is_err());
        assert_eq!(m.state(), ManagerState::Failed);

        rt.set_healthy_on_start(true);
        m.prepare(&ctx(), &OverrideSet::new(), None).unwrap();
        assert_eq!(m.state(), ManagerState::Ready);
        m.prepare(&ctx(), &OverrideSet::new(), None).unwrap();
        assert_eq!(rt.started().len(), 3);
    }
}
