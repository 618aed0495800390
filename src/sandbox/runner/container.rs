//! Container backend: runs code through a Docker-CLI compatible engine.
//!
//! One `<runtime> run --rm` per execution. Only the workspace directory is
//! bind-mounted (at `/code`), networking is disabled, capabilities are
//! dropped and the container runs as the invoking host user so files it
//! creates in the workspace stay removable.
//!
//! Killing the `docker run` client does not stop the container it started,
//! so on timeout the client's process group is SIGKILLed *and* the
//! container is force-removed by name.
//!
//! The engine exits 125 for its own failures, but user code can exit 125
//! too. The engine writes the container id to `--cidfile` once the
//! container exists, so 125 is only a start failure when that file was
//! never written.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, killpg};
use nix::unistd::{Pid, getgid, getuid};
use tracing::{debug, instrument, trace, warn};

use super::{OutputDrains, ProcessRunner, Supervision, supervise};
use crate::sandbox::config::DEFAULT_MAX_OUTPUT_BYTES;
use crate::sandbox::outcome::ExecutionOutcome;
use crate::sandbox::registry::ExecutionProfile;
use crate::sandbox::workspace::{WORKSPACE_MOUNT_POINT, Workspace};

/// Exit status `docker run` / `podman run` use for their own failures.
const RUNTIME_ERROR_EXIT: i32 = 125;

/// Prefix of container names created by this service.
const CONTAINER_NAME_PREFIX: &str = "code-sandbox-";

/// Extension of the container id file kept next to each workspace.
const CIDFILE_EXTENSION: &str = "cid";

/// Upper bound on `rm --force` during teardown.
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Runs executions in containers via the runtime's CLI.
#[derive(Debug, Clone)]
pub struct ContainerRunner {
    binary: String,
    memory_limit: Option<String>,
    pids_limit: Option<u32>,
    max_output_bytes: usize,
}

impl ContainerRunner {
    /// Creates a runner invoking `binary` (e.g. `docker`, `podman`, or a full path).
    #[must_use]
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            memory_limit: None,
            pids_limit: None,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    /// Sets `--memory`.
    #[must_use]
    pub fn with_memory_limit(mut self, limit: Option<String>) -> Self {
        self.memory_limit = limit;
        self
    }

    /// Sets `--pids-limit`.
    #[must_use]
    pub fn with_pids_limit(mut self, limit: Option<u32>) -> Self {
        self.pids_limit = limit;
        self
    }

    /// Sets the per-stream capture limit.
    #[must_use]
    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    /// Returns the runtime binary.
    #[must_use]
    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Container name used for a workspace.
    #[must_use]
    pub fn container_name(workspace: &Workspace) -> String {
        format!("{CONTAINER_NAME_PREFIX}{}", workspace.id())
    }

    /// Container id file for a workspace. Lives beside the workspace, never
    /// inside the mounted directory.
    #[must_use]
    pub fn cidfile_path(workspace: &Workspace) -> PathBuf {
        workspace.sidecar_path(CIDFILE_EXTENSION)
    }

    /// Builds the `run` invocation for a profile and workspace.
    ///
    /// Options must all come before the image: anything after it is passed
    /// to the container as its command.
    pub(crate) fn build_command(&self, profile: &ExecutionProfile, workspace: &Workspace) -> Command {
        let mut command = Command::new(&self.binary);

        command
            .arg("run")
            .arg("--rm")
            .arg(format!("--name={}", Self::container_name(workspace)))
            .arg(format!("--cidfile={}", Self::cidfile_path(workspace).display()))
            .arg("--network=none")
            .arg("--cap-drop=ALL")
            .arg("--security-opt=no-new-privileges")
            .arg(format!("--user={}:{}", getuid(), getgid()));

        if let Some(memory) = &self.memory_limit {
            command.arg(format!("--memory={memory}"));
        }
        if let Some(pids) = self.pids_limit {
            command.arg(format!("--pids-limit={pids}"));
        }

        command
            .arg(format!(
                "--mount=type=bind,source={},target={WORKSPACE_MOUNT_POINT}",
                workspace.dir().display()
            ))
            .arg(format!("--workdir={WORKSPACE_MOUNT_POINT}"))
            .arg(&profile.isolated_runtime_name)
            .args(profile.command_for(&workspace.file_name()));

        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own process group, so a timeout can take down everything the client spawned.
            .process_group(0);

        command
    }

    /// Spawns the client and supervises it until exit or `timeout`.
    fn launch(
        &self,
        command: &mut Command,
        name: &str,
        cidfile: &Path,
        timeout: Duration,
    ) -> ExecutionOutcome {
        trace!("Spawning container runtime");
        let start = Instant::now();
        let deadline = start + timeout;

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                debug!(error = %e, "Container runtime could not be spawned");
                return ExecutionOutcome::RunnerStartFailure {
                    reason: format!("failed to spawn container runtime '{}': {e}", self.binary),
                };
            }
        };

        // process_group(0) makes the child its own group leader.
        let pgid = child.id();
        let drains =
            OutputDrains::spawn(child.stdout.take(), child.stderr.take(), self.max_output_bytes);

        match supervise(deadline, || child.try_wait()) {
            Supervision::Exited(status) => {
                let exit_code = exit_code(status);
                let Some(outcome) = drains.complete(exit_code, deadline) else {
                    debug!("Output still open after exit, tearing down container");
                    self.teardown(pgid, name);
                    return ExecutionOutcome::TimedOut;
                };

                debug!(exit_code, elapsed_ms = %start.elapsed().as_millis(), "Container exited");
                if exit_code == RUNTIME_ERROR_EXIT && !container_created(cidfile) {
                    if let ExecutionOutcome::Completed { stderr, .. } = &outcome {
                        let detail = match stderr.trim() {
                            "" => format!("exited with status {RUNTIME_ERROR_EXIT}"),
                            text => text.to_string(),
                        };
                        return ExecutionOutcome::RunnerStartFailure {
                            reason: format!("container runtime '{}' failed: {detail}", self.binary),
                        };
                    }
                }
                outcome
            }
            Supervision::TimedOut => {
                debug!(elapsed_ms = %start.elapsed().as_millis(), "Execution timed out, killing container");
                self.teardown(pgid, name);
                let _ = child.kill();
                let _ = child.wait();
                ExecutionOutcome::TimedOut
            }
            Supervision::Failed(reason) => {
                warn!(%reason, "Lost track of container runtime");
                self.teardown(pgid, name);
                let _ = child.kill();
                let _ = child.wait();
                ExecutionOutcome::RunnerStartFailure {
                    reason: format!("failed to wait for container runtime: {reason}"),
                }
            }
        }
    }

    /// Kills the client's process group and force-removes the container.
    fn teardown(&self, pgid: u32, name: &str) {
        if let Ok(raw) = i32::try_from(pgid) {
            if let Err(e) = killpg(Pid::from_raw(raw), Signal::SIGKILL) {
                trace!(pgid, error = %e, "Process group already gone");
            }
        }

        let mut removal = match Command::new(&self.binary)
            .args(["rm", "--force", name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                warn!(container = %name, error = %e, "Failed to invoke container removal");
                return;
            }
        };

        match supervise(Instant::now() + TEARDOWN_TIMEOUT, || removal.try_wait()) {
            Supervision::Exited(status) if status.success() => {
                debug!(container = %name, "Container removed");
            }
            Supervision::Exited(status) => {
                debug!(container = %name, ?status, "Container removal reported failure");
            }
            Supervision::TimedOut => {
                let _ = removal.kill();
                let _ = removal.wait();
                warn!(
                    container = %name,
                    timeout_ms = %TEARDOWN_TIMEOUT.as_millis(),
                    "Container removal did not finish, container may be left running"
                );
            }
            Supervision::Failed(reason) => {
                let _ = removal.kill();
                let _ = removal.wait();
                warn!(container = %name, %reason, "Lost track of container removal");
            }
        }
    }
}

/// Returns true if the engine recorded a container id, i.e. the container
/// was created.
fn container_created(cidfile: &Path) -> bool {
    fs::read_to_string(cidfile).is_ok_and(|id| !id.trim().is_empty())
}

/// Removes the id file; the engine refuses to start if it already exists.
fn remove_cidfile(cidfile: &Path) {
    match fs::remove_file(cidfile) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %cidfile.display(), error = %e, "Failed to remove container id file"),
    }
}

impl ProcessRunner for ContainerRunner {
    fn name(&self) -> &str {
        &self.binary
    }

    #[instrument(
        skip(self, profile, workspace),
        fields(runtime = %self.binary, image = %profile.isolated_runtime_name, workspace = %workspace.id(), timeout_ms = %timeout.as_millis())
    )]
    fn run(
        &self,
        profile: &ExecutionProfile,
        workspace: &Workspace,
        timeout: Duration,
    ) -> ExecutionOutcome {
        let name = Self::container_name(workspace);
        let cidfile = Self::cidfile_path(workspace);
        remove_cidfile(&cidfile);
        let mut command = self.build_command(profile, workspace);

        let outcome = self.launch(&mut command, &name, &cidfile, timeout);
        remove_cidfile(&cidfile);
        outcome
    }
}

/// Numeric exit code; signals map to `128 + signo` like a shell reports them.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signo| 128 + signo))
        .unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::workspace::WorkspaceManager;
    use tempfile::TempDir;

    fn args_of(command: &Command) -> Vec<String> {
        command
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_build_command_layout() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let manager = WorkspaceManager::new(temp_dir.path());
        let workspace = manager.acquire("print('hi')", "py").expect("acquire failed");

        let profile = ExecutionProfile::new("python", "py", "python:3.11-slim", ["python3", "{file}"]);
        let runner = ContainerRunner::new("docker")
            .with_memory_limit(Some("128m".into()))
            .with_pids_limit(Some(32));
        let command = runner.build_command(&profile, &workspace);

        assert_eq!(command.get_program(), "docker");
        let args = args_of(&command);
        assert_eq!(args[0], "run");
        assert!(args.contains(&"--rm".to_string()));
        assert!(args.contains(&"--network=none".to_string()));
        assert!(args.contains(&"--memory=128m".to_string()));
        assert!(args.contains(&"--pids-limit=32".to_string()));
        assert!(args.contains(&format!("--name=code-sandbox-{}", workspace.id())));
        assert!(args.contains(&format!(
            "--cidfile={}",
            temp_dir.path().join(format!("{}.cid", workspace.id())).display()
        )));
        assert!(args.contains(&format!(
            "--mount=type=bind,source={},target=/code",
            workspace.dir().display()
        )));

        // Image comes after every option, followed by the entrypoint.
        let image_pos = args.iter().position(|a| a == "python:3.11-slim").unwrap();
        assert!(args[..image_pos].iter().all(|a| a.starts_with("--") || a == "run"));
        assert_eq!(
            &args[image_pos + 1..],
            &["python3".to_string(), workspace.file_name()]
        );

        manager.release(workspace);
    }

    #[test]
    fn test_build_command_without_limits() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let manager = WorkspaceManager::new(temp_dir.path());
        let workspace = manager.acquire("1", "js").expect("acquire failed");

        let profile = ExecutionProfile::new("javascript", "js", "node:20-alpine", ["node", "{file}"]);
        let command = ContainerRunner::new("podman").build_command(&profile, &workspace);
        let args = args_of(&command);

        assert_eq!(command.get_program(), "podman");
        assert!(!args.iter().any(|a| a.starts_with("--memory")));
        assert!(!args.iter().any(|a| a.starts_with("--pids-limit")));

        manager.release(workspace);
    }

    #[test]
    fn test_missing_runtime_is_start_failure() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let manager = WorkspaceManager::new(temp_dir.path());
        let workspace = manager.acquire("print(1)", "py").expect("acquire failed");

        let profile = ExecutionProfile::new("python", "py", "python:3.11-slim", ["python3", "{file}"]);
        let runner = ContainerRunner::new("/nonexistent/bin/docker");
        let outcome = runner.run(&profile, &workspace, Duration::from_secs(5));

        match outcome {
            ExecutionOutcome::RunnerStartFailure { reason } => {
                assert!(reason.contains("/nonexistent/bin/docker"), "reason: {reason}");
            }
            other => panic!("expected RunnerStartFailure, got {other:?}"),
        }

        manager.release(workspace);
    }

    #[test]
    fn test_container_created_needs_recorded_id() {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let cidfile = temp_dir.path().join("run.cid");

        assert!(!container_created(&cidfile));
        fs::write(&cidfile, "").unwrap();
        assert!(!container_created(&cidfile));
        fs::write(&cidfile, "4f2a9c0d1e7b\n").unwrap();
        assert!(container_created(&cidfile));

        remove_cidfile(&cidfile);
        assert!(!cidfile.exists());
        // Already gone is fine.
        remove_cidfile(&cidfile);
    }

    #[test]
    fn test_exit_code_from_signal() {
        assert_eq!(exit_code(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_code(ExitStatus::from_raw(3 << 8)), 3);
        assert_eq!(exit_code(ExitStatus::from_raw(9)), 137);
    }
}
