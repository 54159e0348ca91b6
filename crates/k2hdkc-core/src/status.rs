use k2hdkc_runtime::ContainerRuntime;
use k2hdkc_schema::{AgentConfig, CommandLine, LifecycleState, ServiceHealth};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Observes the service container and maps what it sees to [`ServiceHealth`].
///
/// Every call queries the runtime afresh; only the latest result is kept,
/// for diagnostics.
pub struct StatusPoller {
    runtime: Arc<dyn ContainerRuntime>,
    probe: CommandLine,
    interval: Duration,
    last: Mutex<Option<ServiceHealth>>,
}

impl StatusPoller {
    /// `helper_path` is the in-container script whose `status` action
    /// prints the healthy token.
    pub fn new(runtime: Arc<dyn ContainerRuntime>, helper_path: &str) -> Self {
        Self {
            runtime,
            probe: CommandLine::new(helper_path).arg("status"),
            interval: Duration::from_secs(1),
            last: Mutex::new(None),
        }
    }

    pub fn from_config(runtime: Arc<dyn ContainerRuntime>, config: &AgentConfig) -> Self {
        Self::new(runtime, &config.helper_path).with_interval(config.poll_interval())
    }

    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn poll_once(&self) -> ServiceHealth {
        self.observe().1
    }

    /// Poll until `target` is seen or `timeout` elapses.
    ///
    /// With `fatal_if_missing`, a container the runtime reports as not
    /// running ends the wait early, unless `Shutdown` is what we wait for.
    pub fn wait_for_status(
        &self,
        target: ServiceHealth,
        timeout: Duration,
        fatal_if_missing: bool,
    ) -> bool {
        let started = Instant::now();
        // An unrepresentable deadline means waiting without one.
        let deadline = started.checked_add(timeout);
        loop {
            let (state, health) = self.observe();
            if health == target {
                info!("service reached {target} after {:?}", started.elapsed());
                return true;
            }
            if fatal_if_missing
                && state == Some(LifecycleState::NotRunning)
                && target != ServiceHealth::Shutdown
            {
                warn!("service container is missing while waiting for {target}");
                return false;
            }
            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!(
                            "timed out after {}s waiting for {target} (last seen {health})",
                            timeout.as_secs()
                        );
                        return false;
                    }
                    self.interval.min(deadline - now)
                }
                None => self.interval,
            };
            thread::sleep(pause);
        }
    }

    /// Most recent observation, if any poll has run.
    pub fn last_observed(&self) -> Option<ServiceHealth> {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn observe(&self) -> (Option<LifecycleState>, ServiceHealth) {
        let (state, health) = match self.runtime.container_status() {
            Ok(state) => {
                let probe = if state == LifecycleState::Running {
                    match self.runtime.run_command(&self.probe) {
                        Ok(output) => Some(output),
                        Err(e) => {
                            debug!("health probe failed: {e}");
                            None
                        }
                    }
                } else {
                    None
                };
                let health = ServiceHealth::from_observation(&state, probe.as_deref());
                debug!("container {state}, service {health}");
                (Some(state), health)
            }
            Err(e) => {
                warn!("container status query failed: {e}");
                (None, ServiceHealth::Unknown)
            }
        };
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Some(health);
        (state, health)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k2hdkc_runtime::mock::MockRuntime;
    use k2hdkc_schema::HEALTHY_TOKEN;

    fn poller(rt: &Arc<MockRuntime>) -> StatusPoller {
        StatusPoller::new(rt.clone(), "/usr/libexec/k2hdkctrove.sh")
            .with_interval(Duration::from_millis(5))
    }

    #[test]
    fn poll_once_maps_every_state() {
        let rt = Arc::new(MockRuntime::new());
        let p = poller(&rt);
        let cases = [
            (LifecycleState::NotRunning, ServiceHealth::Shutdown),
            (LifecycleState::Paused, ServiceHealth::Paused),
            (LifecycleState::Exited, ServiceHealth::Shutdown),
            (LifecycleState::Dead, ServiceHealth::Crashed),
            (LifecycleState::Other("created".to_owned()), ServiceHealth::Unknown),
        ];
        for (state, expected) in cases {
            rt.set_status(state);
            assert_eq!(p.poll_once(), expected);
        }
        assert!(rt.commands().is_empty());

        rt.set_status(LifecycleState::Running);
        rt.set_exec_output("starting");
        assert_eq!(p.poll_once(), ServiceHealth::Running);
        rt.set_exec_output(format!("k2hdkc {HEALTHY_TOKEN}"));
        assert_eq!(p.poll_once(), ServiceHealth::Healthy);
    }

    #[test]
    fn probe_runs_helper_status() {
        let rt = Arc::new(MockRuntime::new());
        rt.set_status(LifecycleState::Running);
        poller(&rt).poll_once();
        let cmds = rt.commands();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].render(), "/usr/libexec/k2hdkctrove.sh status");
    }

    #[test]
    fn helper_path_with_spaces_stays_one_argument() {
        let rt = Arc::new(MockRuntime::new());
        rt.set_status(LifecycleState::Running);
        StatusPoller::new(rt.clone(), "/opt/k2hdkc tools/k2hdkctrove.sh;reboot").poll_once();
        let cmds = rt.commands();
        assert_eq!(cmds[0].program(), "/opt/k2hdkc tools/k2hdkctrove.sh;reboot");
        assert_eq!(cmds[0].argv(), ["status"]);
    }

    #[test]
    fn failing_probe_is_running_and_failing_runtime_is_unknown() {
        let rt = Arc::new(MockRuntime::new());
        let p = poller(&rt);
        rt.set_status(LifecycleState::Running);
        rt.fail_exec(true);
        assert_eq!(p.poll_once(), ServiceHealth::Running);

        rt.fail_status(true);
        assert_eq!(p.poll_once(), ServiceHealth::Unknown);
        assert_eq!(p.last_observed(), Some(ServiceHealth::Unknown));
    }

    #[test]
    fn wait_succeeds_once_target_observed() {
        let rt = Arc::new(MockRuntime::new());
        rt.set_status(LifecycleState::Running);
        rt.queue_exec_output("starting");
        rt.queue_exec_output("starting");
        rt.set_exec_output(HEALTHY_TOKEN);
        let p = poller(&rt);
        assert!(p.wait_for_status(ServiceHealth::Healthy, Duration::from_secs(5), false));
        assert_eq!(rt.commands().len(), 3);
        assert_eq!(p.last_observed(), Some(ServiceHealth::Healthy));
    }

    #[test]
    fn wait_times_out_on_shutdown() {
        let rt = Arc::new(MockRuntime::new());
        rt.set_status(LifecycleState::Exited);
        let p = poller(&rt);
        let started = Instant::now();
        assert!(!p.wait_for_status(ServiceHealth::Healthy, Duration::from_millis(5), false));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(p.last_observed(), Some(ServiceHealth::Shutdown));
    }

    #[test]
    fn zero_timeout_still_polls_once() {
        let rt = Arc::new(MockRuntime::new());
        rt.set_status(LifecycleState::Paused);
        let p = poller(&rt);
        assert!(p.wait_for_status(ServiceHealth::Paused, Duration::ZERO, false));
    }

    #[test]
    fn unbounded_timeout_does_not_overflow() {
        let rt = Arc::new(MockRuntime::new());
        rt.set_status(LifecycleState::Running);
        rt.queue_exec_output("starting");
        rt.set_exec_output(HEALTHY_TOKEN);
        let p = poller(&rt);
        assert!(p.wait_for_status(ServiceHealth::Healthy, Duration::MAX, false));
        assert!(p.wait_for_status(
            ServiceHealth::Healthy,
            Duration::from_secs(u64::MAX),
            false
        ));
    }

    #[test]
    fn missing_container_ends_wait_when_fatal() {
        let rt = Arc::new(MockRuntime::new());
        rt.set_status(LifecycleState::NotRunning);
        let p = poller(&rt).with_interval(Duration::from_secs(1));
        let started = Instant::now();
        assert!(!p.wait_for_status(ServiceHealth::Healthy, Duration::from_secs(30), true));
        assert!(started.elapsed() < Duration::from_secs(1));

        assert!(p.wait_for_status(ServiceHealth::Shutdown, Duration::from_secs(1), true));
    }
}
