use crate::backend::{ContainerHandle, ContainerRuntime};
use crate::RuntimeError;
use k2hdkc_schema::{CommandLine, ContainerId, ContainerSpec, LifecycleState, HEALTHY_TOKEN};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

const SERVICE_CONTAINER: &str = "database";

struct MockState {
    status: LifecycleState,
    queued_status: VecDeque<LifecycleState>,
    exec_output: String,
    queued_exec_output: VecDeque<String>,
    healthy_on_start: bool,
    containers: BTreeMap<String, ContainerHandle>,
    container_logs: BTreeMap<String, String>,
    started: Vec<ContainerSpec>,
    runs: Vec<ContainerSpec>,
    commands: Vec<CommandLine>,
    removed: Vec<String>,
    stop_count: usize,
    fail_start: Option<String>,
    fail_run: Option<String>,
    fail_exec: bool,
    fail_status: bool,
    fail_stop: bool,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            status: LifecycleState::NotRunning,
            queued_status: VecDeque::new(),
            exec_output: String::new(),
            queued_exec_output: VecDeque::new(),
            healthy_on_start: true,
            containers: BTreeMap::new(),
            container_logs: BTreeMap::new(),
            started: Vec::new(),
            runs: Vec::new(),
            commands: Vec::new(),
            removed: Vec::new(),
            stop_count: 0,
            fail_start: None,
            fail_run: None,
            fail_exec: false,
            fail_status: false,
            fail_stop: false,
        }
    }
}

/// In-memory runtime for tests.
///
/// Starting the service container marks it running and, unless disabled with
/// [`MockRuntime::set_healthy_on_start`], makes every command executed in it
/// print the healthy token. Queued statuses and outputs are consumed one per
/// call before falling back to the current value.
#[derive(Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MockState>, RuntimeError> {
        self.state
            .lock()
            .map_err(|e| RuntimeError::ExecFailed(format!("mutex poisoned: {e}")))
    }

    fn inspect(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_status(&self, status: LifecycleState) {
        self.inspect().status = status;
    }

    pub fn queue_status(&self, status: LifecycleState) {
        self.inspect().queued_status.push_back(status);
    }

    pub fn set_exec_output(&self, output: impl Into<String>) {
        self.inspect().exec_output = output.into();
    }

    pub fn queue_exec_output(&self, output: impl Into<String>) {
        self.inspect().queued_exec_output.push_back(output.into());
    }

    pub fn set_healthy_on_start(&self, healthy: bool) {
        self.inspect().healthy_on_start = healthy;
    }

    /// Register an existing container, e.g. a leftover restore container.
    pub fn add_container(&self, name: &str) {
        self.inspect()
            .containers
            .insert(name.to_owned(), mock_handle(name));
    }

    pub fn fail_start(&self, stderr: impl Into<String>) {
        self.inspect().fail_start = Some(stderr.into());
    }

    /// Make the next auxiliary containers exit with an error and these logs.
    pub fn fail_run(&self, logs: impl Into<String>) {
        self.inspect().fail_run = Some(logs.into());
    }

    pub fn fail_exec(&self, fail: bool) {
        self.inspect().fail_exec = fail;
    }

    pub fn fail_status(&self, fail: bool) {
        self.inspect().fail_status = fail;
    }

    pub fn fail_stop(&self, fail: bool) {
        self.inspect().fail_stop = fail;
    }

    pub fn started(&self) -> Vec<ContainerSpec> {
        self.inspect().started.clone()
    }

    pub fn runs(&self) -> Vec<ContainerSpec> {
        self.inspect().runs.clone()
    }

    pub fn commands(&self) -> Vec<CommandLine> {
        self.inspect().commands.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.inspect().removed.clone()
    }

    pub fn containers(&self) -> Vec<String> {
        self.inspect().containers.keys().cloned().collect()
    }

    pub fn stop_count(&self) -> usize {
        self.inspect().stop_count
    }
}

fn mock_handle(name: &str) -> ContainerHandle {
    ContainerHandle {
        id: ContainerId::new(format!("mock-{name}")),
        name: name.to_owned(),
    }
}

impl ContainerRuntime for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    fn available(&self) -> bool {
        true
    }

    fn start_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        let mut state = self.lock()?;
        state.started.push(spec.clone());
        if let Some(stderr) = state.fail_start.clone() {
            return Err(RuntimeError::CommandFailed {
                command: format!("mock run {}", spec.image),
                code: Some(125),
                stderr,
            });
        }

        let name = if spec.name.is_empty() {
            SERVICE_CONTAINER
        } else {
            &spec.name
        };
        let handle = mock_handle(name);
        state.containers.insert(name.to_owned(), handle.clone());
        state.status = LifecycleState::Running;
        if state.healthy_on_start {
            state.exec_output = format!("k2hdkc is {HEALTHY_TOKEN}\n");
        }
        Ok(handle)
    }

    fn run(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        let mut state = self.lock()?;
        if state.containers.contains_key(&spec.name) {
            return Err(RuntimeError::ExecFailed(format!(
                "container name '{}' is already in use",
                spec.name
            )));
        }
        state.runs.push(spec.clone());
        let handle = mock_handle(&spec.name);
        state
            .containers
            .insert(spec.name.clone(), handle.clone());

        if let Some(logs) = state.fail_run.clone() {
            state.container_logs.insert(spec.name.clone(), logs.clone());
            return Err(RuntimeError::ContainerError {
                container: spec.name.clone(),
                logs,
            });
        }
        Ok(handle)
    }

    fn container_status(&self) -> Result<LifecycleState, RuntimeError> {
        let mut state = self.lock()?;
        if state.fail_status {
            return Err(RuntimeError::ExecFailed(
                "mock runtime unreachable".to_owned(),
            ));
        }
        Ok(match state.queued_status.pop_front() {
            Some(status) => status,
            None => state.status.clone(),
        })
    }

    fn run_command(&self, command: &CommandLine) -> Result<String, RuntimeError> {
        let mut state = self.lock()?;
        state.commands.push(command.clone());
        if state.fail_exec {
            return Err(RuntimeError::CommandFailed {
                command: command.redacted(),
                code: Some(1),
                stderr: "mock exec failure".to_owned(),
            });
        }
        Ok(match state.queued_exec_output.pop_front() {
            Some(output) => output,
            None => state.exec_output.clone(),
        })
    }

    fn get_container(&self, name: &str) -> Result<ContainerHandle, RuntimeError> {
        let state = self.lock()?;
        state
            .containers
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound(name.to_owned()))
    }

    fn remove(&self, handle: &ContainerHandle, _force: bool) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        state.containers.remove(&handle.name);
        state.container_logs.remove(&handle.name);
        state.removed.push(handle.name.clone());
        Ok(())
    }

    fn logs(&self, handle: &ContainerHandle) -> Result<String, RuntimeError> {
        let state = self.lock()?;
        Ok(state
            .container_logs
            .get(&handle.name)
            .cloned()
            .unwrap_or_default())
    }

    fn stop_and_unregister(&self) -> Result<(), RuntimeError> {
        let mut state = self.lock()?;
        state.stop_count += 1;
        if state.fail_stop {
            return Err(RuntimeError::ExecFailed("mock stop failure".to_owned()));
        }
        state.status = LifecycleState::Exited;
        state.exec_output.clear();
        Ok(())
    }
}
