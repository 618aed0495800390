//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use code_sandbox::sandbox::{
    ContainerRunner, ExecutionProfile, Executor, Isolation, ProcessRunner, RuntimeRegistry,
    ServiceConfig,
};
use tempfile::TempDir;

/// A shell script standing in for `docker`.
///
/// `run` finds the workspace from `--mount`, skips the remaining options and
/// the image, records a container id in `--cidfile`, then execs the
/// entrypoint inside the workspace directory. Images named `missing/*` fail
/// like an unknown image does (exit 125, no id recorded). `rm` sleeps for a
/// configurable number of seconds. Every invocation is appended to the log.
pub struct StubRuntime {
    _dir: TempDir,
    pub binary: PathBuf,
    pub log: PathBuf,
}

const STUB_SCRIPT: &str = r#"#!/bin/sh
echo "$*" >> "__LOG__"
cmd="$1"
shift
case "$cmd" in
  version) echo "stub-runtime 1.0"; exit 0 ;;
  rm) exec sleep __RM_DELAY__ ;;
  kill) exit 0 ;;
  run) ;;
  *) echo "unknown command: $cmd" >&2; exit 125 ;;
esac
dir=""
cidfile=""
while [ $# -gt 0 ]; do
  case "$1" in
    --cidfile=*) cidfile="${1#--cidfile=}"; shift ;;
    --mount=*) dir=$(printf '%s\n' "$1" | sed -n 's/.*source=\([^,]*\).*/\1/p'); shift ;;
    --*) shift ;;
    *) break ;;
  esac
done
image="$1"
shift
case "$image" in
  missing/*) echo "Unable to find image '$image' locally" >&2; exit 125 ;;
esac
[ -n "$dir" ] || { echo "no workspace mount" >&2; exit 125; }
cd "$dir" || exit 125
[ -z "$cidfile" ] || echo "0123456789abcdef" > "$cidfile"
exec "$@"
"#;

/// Returns the process-wide stub runtime.
///
/// Created once: writing and then executing a fresh script while other
/// test threads fork can fail with ETXTBSY.
pub fn stub_runtime() -> &'static StubRuntime {
    static STUB: OnceLock<StubRuntime> = OnceLock::new();
    STUB.get_or_init(|| StubRuntime::write(0))
}

/// Seconds the hanging stub's `rm` sleeps for.
pub const HANGING_RM_SECS: u64 = 30;

/// A stub runtime whose `rm` hangs for [`HANGING_RM_SECS`].
pub fn hanging_rm_runtime() -> &'static StubRuntime {
    static STUB: OnceLock<StubRuntime> = OnceLock::new();
    STUB.get_or_init(|| StubRuntime::write(HANGING_RM_SECS))
}

impl StubRuntime {
    fn write(rm_delay_secs: u64) -> Self {
        let dir = TempDir::new().expect("failed to create stub dir");
        let binary = dir.path().join("fake-docker");
        let log = dir.path().join("invocations.log");

        let script = STUB_SCRIPT
            .replace("__LOG__", &log.to_string_lossy())
            .replace("__RM_DELAY__", &rm_delay_secs.to_string());
        fs::write(&binary, script).expect("failed to write stub runtime");
        fs::set_permissions(&binary, fs::Permissions::from_mode(0o755))
            .expect("failed to chmod stub runtime");

        Self {
            _dir: dir,
            binary,
            log,
        }
    }

    pub fn binary_str(&self) -> String {
        self.binary.to_string_lossy().into_owned()
    }

    /// All logged invocations so far, across every test in this binary.
    pub fn invocations(&self) -> Vec<String> {
        fs::read_to_string(&self.log)
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }
}

/// A profile running POSIX shell snippets, so tests need no interpreters
/// beyond `/bin/sh`.
pub fn shell_profile() -> ExecutionProfile {
    ExecutionProfile::new("shell", "sh", "stub/shell", ["sh", "{file}"]).with_alias("sh")
}

/// Builtin profiles plus `shell` and a profile whose image never exists.
pub fn test_registry() -> RuntimeRegistry {
    RuntimeRegistry::builtin()
        .with_profile(shell_profile())
        .and_then(|r| {
            r.with_profile(ExecutionProfile::new(
                "ghost",
                "sh",
                "missing/ghost:latest",
                ["sh", "{file}"],
            ))
        })
        .expect("test profiles are valid")
}

/// Configuration using the stub runtime and a private scratch root.
pub fn stub_config(scratch: &TempDir) -> ServiceConfig {
    ServiceConfig::default()
        .with_scratch_root(scratch.path())
        .with_isolation(Isolation::Container {
            binary: stub_runtime().binary_str(),
        })
}

/// Executor backed by the stub runtime.
pub fn stub_executor(scratch: &TempDir) -> Executor {
    Executor::new(stub_config(scratch), test_registry()).expect("valid config")
}

/// Runner backed by the stub runtime.
pub fn stub_runner() -> Arc<dyn ProcessRunner> {
    Arc::new(ContainerRunner::new(stub_runtime().binary_str()))
}

/// Returns true if the scratch root holds no workspace.
pub fn scratch_is_empty(scratch: &TempDir) -> bool {
    fs::read_dir(scratch.path()).map_or(true, |mut entries| entries.next().is_none())
}

/// Returns true while `pid` is a live (non-zombie) process.
pub fn process_alive(pid: u32) -> bool {
    let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // State is the first field after the parenthesized command name.
    let state = stat
        .rsplit_once(')')
        .and_then(|(_, rest)| rest.trim_start().chars().next());
    !matches!(state, Some('Z' | 'X') | None)
}

/// Polls until `pid` is gone or `within` elapses.
pub fn wait_for_exit(pid: u32, within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if !process_alive(pid) {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    !process_alive(pid)
}

/// Reads a pid written by a snippet, waiting for the file to appear.
pub fn read_pid_file(path: &Path, within: Duration) -> u32 {
    let deadline = Instant::now() + within;
    loop {
        if let Ok(text) = fs::read_to_string(path) {
            if let Ok(pid) = text.trim().parse() {
                return pid;
            }
        }
        assert!(Instant::now() < deadline, "pid file never written: {}", path.display());
        thread::sleep(Duration::from_millis(20));
    }
}

/// Returns true if a live process was started with exactly `argv`.
///
/// Scans `/proc`, so it also sees processes inside a PID namespace whose
/// own pids mean nothing on the host.
pub fn process_with_argv_alive(argv: &[&str]) -> bool {
    let mut wanted = argv.join("\0").into_bytes();
    wanted.push(0);

    let Ok(entries) = fs::read_dir("/proc") else {
        return false;
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<u32>().ok())
        .any(|pid| {
            fs::read(format!("/proc/{pid}/cmdline")).is_ok_and(|cmdline| cmdline == wanted)
                && process_alive(pid)
        })
}

/// Polls until no process runs `argv` or `within` elapses.
pub fn wait_for_argv_gone(argv: &[&str], within: Duration) -> bool {
    let deadline = Instant::now() + within;
    while Instant::now() < deadline {
        if !process_with_argv_alive(argv) {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    !process_with_argv_alive(argv)
}

/// Returns true if a real container engine is reachable.
pub fn docker_available() -> bool {
    Command::new("docker")
        .arg("version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}
