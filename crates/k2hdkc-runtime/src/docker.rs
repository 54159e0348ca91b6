//! Container runtime backed by the `docker` command line client.

use crate::backend::{ContainerHandle, ContainerRuntime};
use crate::exec::{ExecutionResult, Executor, DEFAULT_TIMEOUT};
use crate::RuntimeError;
use k2hdkc_schema::{
    AgentConfig, CommandLine, ContainerId, ContainerSpec, LifecycleState, NetworkMode,
};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Name of the database service container.
pub const SERVICE_CONTAINER: &str = "database";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerState {
    status: String,
    #[serde(default)]
    exit_code: i64,
}

pub struct DockerCli {
    binary: String,
    service_name: String,
    helper_path: String,
    timeout: Duration,
    executor: Executor,
}

impl Default for DockerCli {
    fn default() -> Self {
        Self {
            binary: "docker".to_owned(),
            service_name: SERVICE_CONTAINER.to_owned(),
            helper_path: "/usr/libexec/k2hdkctrove.sh".to_owned(),
            timeout: DEFAULT_TIMEOUT,
            executor: Executor::new(),
        }
    }
}

impl DockerCli {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            helper_path: config.helper_path.clone(),
            timeout: config.command_timeout(),
            ..Self::default()
        }
    }

    /// Use a different client binary, e.g. a wrapper script.
    #[must_use]
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn docker(&self) -> CommandLine {
        CommandLine::new(&self.binary)
    }

    /// Run a docker command, turning timeouts and non-zero exits into errors.
    fn run_checked(&self, command: &CommandLine) -> Result<ExecutionResult, RuntimeError> {
        let result = self.executor.run(command, self.timeout)?;
        if result.timed_out() {
            return Err(RuntimeError::TimedOut {
                command: command.redacted(),
                timeout_secs: self.timeout.as_secs(),
            });
        }
        if !result.success() {
            return Err(RuntimeError::CommandFailed {
                command: command.redacted(),
                code: result.exit_code(),
                stderr: result.stderr.trim().to_owned(),
            });
        }
        Ok(result)
    }

    /// `docker run -d ...` for `spec`.
    pub fn run_command_line(&self, spec: &ContainerSpec) -> CommandLine {
        let mut cmd = self
            .docker()
            .arg("run")
            .arg("--detach")
            .pair("--name", &spec.name)
            .option("--network", spec.network_mode.to_string())
            .option("--restart", spec.restart_policy.to_string());
        if !spec.user.is_empty() {
            cmd = cmd.pair("--user", &spec.user);
        }
        for v in &spec.volumes {
            let mode = if v.read_only { "ro" } else { "rw" };
            cmd = cmd.pair("--volume", format!("{}:{}:{mode}", v.host, v.container));
        }
        if spec.network_mode != NetworkMode::Host {
            for p in &spec.ports {
                cmd = cmd.pair("--publish", p.to_string());
            }
        }
        for (k, v) in &spec.environment {
            cmd = cmd.pair("--env", format!("{k}={v}"));
        }
        for (k, v) in &spec.sysctls {
            cmd = cmd.pair("--sysctl", format!("{k}={v}"));
        }
        cmd = cmd.arg(&spec.image);
        if let Some(command) = &spec.command {
            cmd = cmd.append(command);
        }
        cmd
    }

    fn inspect_state(&self, name: &str) -> Result<Option<ContainerState>, RuntimeError> {
        let cmd = self
            .docker()
            .arg("inspect")
            .pair("--format", "{{json .State}}")
            .arg(name);
        match self.run_checked(&cmd) {
            Ok(result) => {
                let state = serde_json::from_str(result.stdout.trim()).map_err(|e| {
                    RuntimeError::ExecFailed(format!("failed to parse state of '{name}': {e}"))
                })?;
                Ok(Some(state))
            }
            Err(RuntimeError::CommandFailed { stderr, .. }) if is_missing(&stderr) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn service_name<'a>(&'a self, spec: &'a ContainerSpec) -> &'a str {
        if spec.name.is_empty() {
            &self.service_name
        } else {
            &spec.name
        }
    }

    fn container_failure(&self, name: &str, fallback: String) -> RuntimeError {
        let handle = ContainerHandle {
            id: ContainerId::new(name),
            name: name.to_owned(),
        };
        let logs = match self.logs(&handle) {
            Ok(logs) if !logs.trim().is_empty() => logs,
            Ok(_) => fallback,
            Err(e) => {
                debug!("could not read logs of {name}: {e}");
                fallback
            }
        };
        RuntimeError::ContainerError {
            container: name.to_owned(),
            logs,
        }
    }
}

/// Handle from the id docker printed, falling back to the name.
fn handle_for(name: &str, output: &str) -> ContainerHandle {
    let id = output.trim();
    ContainerHandle {
        id: ContainerId::new(if id.is_empty() { name } else { id }),
        name: name.to_owned(),
    }
}

fn is_missing(stderr: &str) -> bool {
    stderr.contains("No such object") || stderr.contains("No such container")
}

impl ContainerRuntime for DockerCli {
    fn name(&self) -> &str {
        "docker"
    }

    fn available(&self) -> bool {
        let cmd = self
            .docker()
            .arg("version")
            .pair("--format", "{{.Server.Version}}");
        self.run_checked(&cmd).is_ok()
    }

    fn start_container(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        let name = self.service_name(spec).to_owned();
        let mut spec = spec.clone();
        spec.name.clone_from(&name);

        if let Ok(existing) = self.get_container(&name) {
            info!("removing stale service container {name}");
            self.remove(&existing, true)?;
        }

        let result = self.run_checked(&self.run_command_line(&spec))?;
        let handle = handle_for(&name, &result.stdout);
        info!("started service container {name} ({})", handle.id);
        Ok(handle)
    }

    fn run(&self, spec: &ContainerSpec) -> Result<ContainerHandle, RuntimeError> {
        let result = match self.run_checked(&self.run_command_line(spec)) {
            Ok(result) => result,
            // 126/127: the container was created but its command could not start.
            Err(RuntimeError::CommandFailed {
                code: Some(126 | 127),
                stderr,
                ..
            }) => return Err(self.container_failure(&spec.name, stderr)),
            Err(e) => return Err(e),
        };
        let handle = handle_for(&spec.name, &result.stdout);

        if let Some(state) = self.inspect_state(&spec.name)? {
            if state.status == "exited" && state.exit_code != 0 {
                warn!(
                    "container {} exited with code {}",
                    spec.name, state.exit_code
                );
                return Err(self.container_failure(
                    &spec.name,
                    format!("exited with code {}", state.exit_code),
                ));
            }
        }
        Ok(handle)
    }

    fn container_status(&self) -> Result<LifecycleState, RuntimeError> {
        match self.inspect_state(&self.service_name)? {
            Some(state) => Ok(LifecycleState::parse(&state.status)),
            None => Ok(LifecycleState::NotRunning),
        }
    }

    fn run_command(&self, command: &CommandLine) -> Result<String, RuntimeError> {
        let cmd = self
            .docker()
            .arg("exec")
            .arg(&self.service_name)
            .append(command);
        Ok(self.run_checked(&cmd)?.stdout)
    }

    fn get_container(&self, name: &str) -> Result<ContainerHandle, RuntimeError> {
        let cmd = self
            .docker()
            .arg("inspect")
            .pair("--format", "{{.Id}}")
            .arg(name);
        match self.run_checked(&cmd) {
            Ok(result) => Ok(handle_for(name, &result.stdout)),
            Err(RuntimeError::CommandFailed { stderr, .. }) if is_missing(&stderr) => {
                Err(RuntimeError::NotFound(name.to_owned()))
            }
            Err(e) => Err(e),
        }
    }

    fn remove(&self, handle: &ContainerHandle, force: bool) -> Result<(), RuntimeError> {
        let mut cmd = self.docker().arg("rm");
        if force {
            cmd = cmd.arg("--force");
        }
        cmd = cmd.arg(handle.id.as_str());
        match self.run_checked(&cmd) {
            Ok(_) => Ok(()),
            Err(RuntimeError::CommandFailed { stderr, .. }) if is_missing(&stderr) => {
                debug!("container {} already removed", handle.name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn logs(&self, handle: &ContainerHandle) -> Result<String, RuntimeError> {
        let cmd = self.docker().arg("logs").arg(handle.id.as_str());
        let result = self.run_checked(&cmd)?;
        Ok(format!("{}{}", result.stdout, result.stderr))
    }

    fn stop_and_unregister(&self) -> Result<(), RuntimeError> {
        let unregister = CommandLine::new(&self.helper_path).arg("stop");
        if let Err(e) = self.run_command(&unregister) {
            warn!("could not stop the database and unregister the node: {e}");
        }
        let cmd = self.docker().arg("stop").arg(&self.service_name);
        match self.run_checked(&cmd) {
            Ok(_) => Ok(()),
            Err(RuntimeError::CommandFailed { stderr, .. }) if is_missing(&stderr) => {
                Err(RuntimeError::NotFound(self.service_name.clone()))
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k2hdkc_schema::{PortBinding, RestartPolicy, VolumeMount};
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// A stand-in `docker` that answers from a shell `case` on its arguments.
    fn fake_docker(dir: &Path, body: &str) -> String {
        let path = dir.join("docker");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn restore_like_spec() -> ContainerSpec {
        ContainerSpec {
            image: "backup:latest".to_owned(),
            name: "db_restore".to_owned(),
            network_mode: NetworkMode::Host,
            volumes: vec![VolumeMount::same_path("/var/lib/antpickax/k2hdkc")],
            ports: vec![PortBinding {
                container_port: 8020,
                host_port: 8020,
            }],
            user: "1001:1001".to_owned(),
            environment: [("cluster-name".to_owned(), "c1".to_owned())].into(),
            command: Some(
                CommandLine::new("/usr/bin/python3")
                    .arg("main.py")
                    .secret_option("--os-token", "tok"),
            ),
            restart_policy: RestartPolicy::UnlessStopped,
            sysctls: [("net.core.somaxconn".to_owned(), "1024".to_owned())].into(),
        }
    }

    #[test]
    fn run_command_line_layout() {
        let cmd = DockerCli::new().run_command_line(&restore_like_spec());
        assert_eq!(
            cmd.argv(),
            [
                "run",
                "--detach",
                "--name",
                "db_restore",
                "--network=host",
                "--restart=unless-stopped",
                "--user",
                "1001:1001",
                "--volume",
                "/var/lib/antpickax/k2hdkc:/var/lib/antpickax/k2hdkc:rw",
                "--env",
                "cluster-name=c1",
                "--sysctl",
                "net.core.somaxconn=1024",
                "backup:latest",
                "/usr/bin/python3",
                "main.py",
                "--os-token=tok",
            ]
        );
        assert!(cmd.redacted().ends_with("--os-token=***"));
    }

    #[test]
    fn ports_published_only_off_host_network() {
        let mut spec = restore_like_spec();
        spec.network_mode = NetworkMode::Bridge;
        let argv = DockerCli::new().run_command_line(&spec).argv();
        let idx = argv.iter().position(|a| a == "--publish").unwrap();
        assert_eq!(argv[idx + 1], "8020:8020/tcp");
    }

    #[test]
    fn status_parses_inspect_output() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_docker(
            dir.path(),
            r#"case "$1" in inspect) echo '{"Status":"paused","ExitCode":0}';; esac"#,
        );
        let docker = DockerCli::new().with_binary(bin);
        assert_eq!(docker.container_status().unwrap(), LifecycleState::Paused);
    }

    #[test]
    fn missing_container_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_docker(
            dir.path(),
            r#"echo "Error: No such object: database" >&2; exit 1"#,
        );
        let docker = DockerCli::new().with_binary(bin);
        assert_eq!(
            docker.container_status().unwrap(),
            LifecycleState::NotRunning
        );
        assert!(matches!(
            docker.get_container("db_restore"),
            Err(RuntimeError::NotFound(_))
        ));
        let handle = ContainerHandle {
            id: ContainerId::new("db_restore"),
            name: "db_restore".to_owned(),
        };
        docker.remove(&handle, true).unwrap();
    }

    #[test]
    fn run_command_returns_exec_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_docker(
            dir.path(),
            r#"[ "$1" = exec ] && [ "$2" = database ] && echo "k2hdkc HEALTHY""#,
        );
        let docker = DockerCli::new().with_binary(bin);
        let out = docker
            .run_command(&CommandLine::new("/usr/libexec/k2hdkctrove.sh").arg("status"))
            .unwrap();
        assert_eq!(out.trim(), "k2hdkc HEALTHY");
    }

    #[test]
    fn stop_runs_helper_without_a_shell() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("calls.log");
        let bin = fake_docker(
            dir.path(),
            &format!(
                r#"for a in "$@"; do printf '[%s]' "$a" >> '{}'; done; echo >> '{}'"#,
                log.display(),
                log.display()
            ),
        );
        let config = AgentConfig {
            helper_path: "/opt/k2hdkc tools/k2hdkctrove.sh".to_owned(),
            ..AgentConfig::default()
        };
        DockerCli::from_config(&config)
            .with_binary(bin)
            .stop_and_unregister()
            .unwrap();
        let calls = std::fs::read_to_string(&log).unwrap();
        let calls: Vec<&str> = calls.lines().collect();
        assert_eq!(
            calls,
            [
                "[exec][database][/opt/k2hdkc tools/k2hdkctrove.sh][stop]",
                "[stop][database]",
            ]
        );
    }

    #[test]
    fn exited_container_is_container_error_with_logs() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_docker(
            dir.path(),
            r#"case "$1" in
  run) echo abc123;;
  inspect) echo '{"Status":"exited","ExitCode":2}';;
  logs) echo "restore failed: checksum mismatch";;
esac"#,
        );
        let docker = DockerCli::new().with_binary(bin);
        match docker.run(&restore_like_spec()) {
            Err(RuntimeError::ContainerError { container, logs }) => {
                assert_eq!(container, "db_restore");
                assert!(logs.contains("checksum mismatch"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn slow_docker_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_docker(dir.path(), "exec sleep 30");
        let docker = DockerCli::new()
            .with_binary(bin)
            .with_timeout(Duration::from_millis(200));
        assert!(matches!(
            docker.container_status(),
            Err(RuntimeError::TimedOut { .. })
        ));
    }
}
