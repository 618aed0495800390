//! Namespace backend: runs code directly on the host toolchain inside fresh
//! Linux namespaces via hakoniwa.
//!
//! The sandbox sees a read-only view of the host's `/bin`, `/etc`, `/lib*`,
//! `/sbin` and `/usr`, fresh `/proc`, `/dev` and `/tmp`, and the workspace
//! bind-mounted read-write at `/code`. Networking is loopback only. The
//! child is PID 1 of its own PID namespace, so killing it takes every
//! descendant with it.
//!
//! The profile's `isolated_runtime_name` is ignored here; the entrypoint
//! must name an interpreter installed on the host.

use std::fs::File;
use std::path::Path;
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use hakoniwa::{Container, Namespace, Stdio};
use tracing::{debug, instrument, trace, warn};

use super::{OutputDrains, ProcessRunner, Supervision, supervise};
use crate::sandbox::config::DEFAULT_MAX_OUTPUT_BYTES;
use crate::sandbox::outcome::ExecutionOutcome;
use crate::sandbox::registry::ExecutionProfile;
use crate::sandbox::workspace::{WORKSPACE_MOUNT_POINT, Workspace};

/// Hostname inside the sandbox.
const SANDBOX_HOSTNAME: &str = "sandbox";

/// Serializes namespace and mount creation.
///
/// Concurrent user-namespace and procfs setup contends on kernel locks and
/// causes intermittent spawn stalls. Only build + spawn hold this lock; the
/// executions themselves still run in parallel.
static SETUP_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

fn setup_lock() -> &'static Mutex<()> {
    SETUP_LOCK.get_or_init(|| Mutex::new(()))
}

/// Runs executions in hakoniwa namespace sandboxes.
#[derive(Debug, Clone)]
pub struct NamespaceRunner {
    max_output_bytes: usize,
}

impl Default for NamespaceRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceRunner {
    /// Creates a runner with the default per-stream capture limit.
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    /// Sets the per-stream capture limit.
    #[must_use]
    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    fn build_container(workspace: &Workspace) -> Result<Container, String> {
        let mut container = Container::new();

        container
            .unshare(Namespace::Ipc)
            .unshare(Namespace::Network)
            .unshare(Namespace::Uts);
        container.hostname(SANDBOX_HOSTNAME);

        container
            .rootfs("/")
            .map_err(|e| format!("failed to set rootfs: {e}"))?;

        container
            .procfsmount("/proc")
            .devfsmount("/dev")
            .tmpfsmount("/tmp");

        let host_dir = workspace.dir().to_string_lossy();
        container.bindmount_rw(&host_dir, WORKSPACE_MOUNT_POINT);

        Ok(container)
    }
}

impl ProcessRunner for NamespaceRunner {
    fn name(&self) -> &str {
        "namespace"
    }

    #[instrument(
        skip(self, profile, workspace),
        fields(language = %profile.language, workspace = %workspace.id(), timeout_ms = %timeout.as_millis())
    )]
    fn run(
        &self,
        profile: &ExecutionProfile,
        workspace: &Workspace,
        timeout: Duration,
    ) -> ExecutionOutcome {
        let argv = profile.command_for(&workspace.file_name());
        let Some((program, args)) = argv.split_first() else {
            return ExecutionOutcome::RunnerStartFailure {
                reason: format!("profile '{}' has an empty entrypoint", profile.language),
            };
        };
        let Some(resolved) = resolve_command(program) else {
            return ExecutionOutcome::RunnerStartFailure {
                reason: format!("interpreter not found on host: {program}"),
            };
        };
        debug!(%resolved, "Resolved interpreter");

        let stdin = match File::open("/dev/null") {
            Ok(null) => null,
            Err(e) => {
                return ExecutionOutcome::RunnerStartFailure {
                    reason: format!("failed to open /dev/null for stdin: {e}"),
                };
            }
        };

        trace!("Acquiring setup lock");
        let setup_guard = setup_lock().lock().unwrap_or_else(PoisonError::into_inner);

        let container = match Self::build_container(workspace) {
            Ok(container) => container,
            Err(reason) => return ExecutionOutcome::RunnerStartFailure { reason },
        };

        let mut cmd = container.command(&resolved);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        cmd.args(&args);
        cmd.stdin(stdin);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.current_dir(WORKSPACE_MOUNT_POINT);
        for (key, value) in default_env_vars() {
            cmd.env(key, value);
        }

        let start = Instant::now();
        let deadline = start + timeout;

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                return ExecutionOutcome::RunnerStartFailure {
                    reason: format!("failed to spawn namespace sandbox: {e}"),
                };
            }
        };

        // Let the child finish its mount setup before the next one starts.
        std::thread::sleep(Duration::from_millis(5));
        drop(setup_guard);
        trace!("Setup lock released, child running");

        let drains =
            OutputDrains::spawn(child.stdout.take(), child.stderr.take(), self.max_output_bytes);

        match supervise(deadline, || child.try_wait()) {
            Supervision::Exited(status) => {
                debug!(exit_code = status.code, elapsed_ms = %start.elapsed().as_millis(), "Sandbox exited");
                drains
                    .complete(status.code, deadline)
                    .unwrap_or(ExecutionOutcome::TimedOut)
            }
            Supervision::TimedOut => {
                debug!(elapsed_ms = %start.elapsed().as_millis(), "Execution timed out, sending SIGKILL");
                let _ = child.kill();
                let _ = child.wait();
                ExecutionOutcome::TimedOut
            }
            Supervision::Failed(reason) => {
                warn!(%reason, "Lost track of sandbox");
                let _ = child.kill();
                let _ = child.wait();
                ExecutionOutcome::RunnerStartFailure {
                    reason: format!("failed to wait for sandbox: {reason}"),
                }
            }
        }
    }
}

/// Resolves an interpreter name against a fixed list of system directories.
///
/// The host `$PATH` is not consulted. Names containing `/` are used as given.
fn resolve_command(command: &str) -> Option<String> {
    if command.contains('/') {
        return Some(command.to_string());
    }

    ["/usr/local/bin", "/usr/bin", "/bin", "/usr/sbin", "/sbin"]
        .iter()
        .map(|dir| format!("{dir}/{command}"))
        .find(|candidate| Path::new(candidate).exists())
}

fn default_env_vars() -> [(&'static str, &'static str); 3] {
    [
        (
            "PATH",
            "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin",
        ),
        ("HOME", "/tmp"),
        ("TERM", "xterm"),
    ]
}
