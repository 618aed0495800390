//! System requirements checking implementation.

#![allow(unsafe_code)]
// unsafe is limited to the fork used by the user namespace probe.

use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::{Result, SystemRequirementsError};
use crate::sandbox::Isolation;

/// Results of the checks for the selected isolation backend.
#[derive(Debug, Clone)]
pub struct SystemRequirements {
    /// Kernel release string (e.g., "6.8.0-45-generic")
    pub kernel_version: String,
    /// Backend the checks were run for
    pub backend: String,
    /// First line of `<runtime> version`, for the container backend
    pub container_runtime: Option<String>,
    /// Whether unprivileged user namespaces are enabled (namespace backend only)
    pub user_namespaces: bool,
}

/// Checks that the selected isolation backend can be used on this host.
///
/// # Errors
///
/// Returns the first failing requirement.
pub fn check_all(isolation: &Isolation) -> Result<SystemRequirements> {
    let kernel_version = kernel_release()?;

    let (container_runtime, user_namespaces) = match isolation {
        Isolation::Container { binary } => (Some(check_container_runtime(binary)?), false),
        Isolation::Namespace => (None, check_user_namespaces()?),
    };

    Ok(SystemRequirements {
        kernel_version,
        backend: isolation.name().to_string(),
        container_runtime,
        user_namespaces,
    })
}

/// Reads the kernel release via `uname`.
///
/// # Errors
///
/// Returns error if the uname syscall fails.
pub fn kernel_release() -> Result<String> {
    let uname = nix::sys::utsname::uname().map_err(|e| SystemRequirementsError::ReadFailed {
        context: "uname syscall".to_string(),
        source: std::io::Error::from_raw_os_error(e as i32),
    })?;

    Ok(uname.release().to_string_lossy().to_string())
}

/// Checks that a Docker-CLI compatible runtime answers `version`.
///
/// A missing binary and an unreachable daemon both fail here, since
/// `docker version` exits non-zero when it cannot reach the server.
///
/// # Returns
///
/// The first non-empty line the runtime printed.
///
/// # Errors
///
/// Returns `RuntimeUnavailable` with the runtime's own explanation.
pub fn check_container_runtime(binary: &str) -> Result<String> {
    let unavailable = |reason: String| SystemRequirementsError::RuntimeUnavailable {
        runtime: binary.to_string(),
        reason,
    };

    let output = Command::new(binary)
        .arg("version")
        .stdin(Stdio::null())
        .output()
        .map_err(|e| unavailable(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = match stderr.trim() {
            "" => format!("`{binary} version` exited with {}", output.status),
            text => text.to_string(),
        };
        return Err(unavailable(reason).into());
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let version = stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("unknown")
        .to_string();

    debug!(runtime = binary, %version, "Container runtime available");
    Ok(version)
}

/// Check unprivileged user namespaces are enabled.
///
/// Reads `/proc/sys/kernel/unprivileged_userns_clone` if it exists.
/// On some systems (Ubuntu), this file doesn't exist and user namespaces
/// are always enabled, so we fall back to actually testing the capability.
///
/// # Errors
///
/// Returns error if user namespaces are disabled.
pub fn check_user_namespaces() -> Result<bool> {
    let userns_path = Path::new("/proc/sys/kernel/unprivileged_userns_clone");

    if !userns_path.exists() {
        return verify_userns_by_clone();
    }

    let content =
        fs::read_to_string(userns_path).map_err(|e| SystemRequirementsError::ReadFailed {
            context: "unprivileged_userns_clone".to_string(),
            source: e,
        })?;

    if parse_sysctl_flag(&content) {
        Ok(true)
    } else {
        Err(SystemRequirementsError::UserNamespacesDisabled.into())
    }
}

fn parse_sysctl_flag(content: &str) -> bool {
    content.trim().parse::<u32>().unwrap_or(0) == 1
}

/// Verify user namespaces by attempting to unshare CLONE_NEWUSER in a forked child.
fn verify_userns_by_clone() -> Result<bool> {
    use nix::sched::{CloneFlags, unshare};
    use nix::sys::wait::{WaitStatus, waitpid};
    use nix::unistd::{ForkResult, fork};

    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, 0)) => Ok(true),
            _ => Err(SystemRequirementsError::UserNamespacesDisabled.into()),
        },
        Ok(ForkResult::Child) => {
            let result = unshare(CloneFlags::CLONE_NEWUSER);
            std::process::exit(if result.is_ok() { 0 } else { 1 });
        }
        Err(_) => Err(SystemRequirementsError::ReadFailed {
            context: "fork for userns test".to_string(),
            source: std::io::Error::last_os_error(),
        }
        .into()),
    }
}
