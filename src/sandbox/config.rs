//! Configuration for the execution service.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Timeout applied when a request does not carry a usable override.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound for caller-supplied timeout overrides.
pub const DEFAULT_MAX_TIMEOUT: Duration = Duration::from_secs(120);

/// Default bound on executions running at the same time.
pub const DEFAULT_MAX_CONCURRENT: usize = 8;

/// Default per-stream capture limit (1 MiB).
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// How submitted code is confined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Isolation {
    /// A Docker-CLI compatible container engine (`docker`, `podman`).
    Container {
        /// Binary invoked as `<binary> run ...`.
        binary: String,
    },
    /// Linux namespaces set up in-process; needs unprivileged user namespaces.
    Namespace,
}

impl Default for Isolation {
    fn default() -> Self {
        Self::Container {
            binary: String::from("docker"),
        }
    }
}

impl Isolation {
    /// Short name used in logs and startup checks.
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Container { binary } => binary,
            Self::Namespace => "namespace",
        }
    }
}

/// Configuration for the execution service.
///
/// Use the builder methods to customize the service behavior.
///
/// # Example
///
/// ```
/// use code_sandbox::sandbox::{Isolation, ServiceConfig};
/// use std::time::Duration;
///
/// let config = ServiceConfig::default()
///     .with_scratch_root("/var/tmp/code-sandbox")
///     .with_default_timeout(Duration::from_secs(10))
///     .with_max_concurrent(4)
///     .with_isolation(Isolation::Container { binary: "podman".into() });
/// ```
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Directory under which per-request workspaces are created.
    pub scratch_root: PathBuf,

    /// Timeout used when the request carries none (or an out-of-range one).
    pub default_timeout: Duration,

    /// Largest timeout override a caller may ask for.
    pub max_timeout: Duration,

    /// Maximum executions in flight at once.
    pub max_concurrent: usize,

    /// Isolation backend.
    pub isolation: Isolation,

    /// Bytes kept per captured stream; the rest is drained and dropped.
    pub max_output_bytes: usize,

    /// Container memory limit, in the runtime's syntax (e.g. `256m`).
    pub memory_limit: Option<String>,

    /// Container process limit.
    pub pids_limit: Option<u32>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            scratch_root: default_scratch_root(),
            default_timeout: DEFAULT_TIMEOUT,
            max_timeout: DEFAULT_MAX_TIMEOUT,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            isolation: Isolation::default(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            memory_limit: Some(String::from("256m")),
            pids_limit: Some(64),
        }
    }
}

impl ServiceConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the scratch root for workspaces.
    #[must_use]
    pub fn with_scratch_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.scratch_root = path.into();
        self
    }

    /// Sets the default execution timeout.
    #[must_use]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Sets the largest accepted timeout override.
    #[must_use]
    pub fn with_max_timeout(mut self, timeout: Duration) -> Self {
        self.max_timeout = timeout;
        self
    }

    /// Sets the concurrent execution bound.
    #[must_use]
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    /// Sets the isolation backend.
    #[must_use]
    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    /// Sets the per-stream capture limit.
    #[must_use]
    pub fn with_max_output_bytes(mut self, bytes: usize) -> Self {
        self.max_output_bytes = bytes;
        self
    }

    /// Sets the container memory limit. `None` leaves it to the runtime.
    #[must_use]
    pub fn with_memory_limit(mut self, limit: Option<String>) -> Self {
        self.memory_limit = limit;
        self
    }

    /// Sets the container process limit. `None` leaves it to the runtime.
    #[must_use]
    pub fn with_pids_limit(mut self, limit: Option<u32>) -> Self {
        self.pids_limit = limit;
        self
    }

    /// Checks that the values are usable together.
    ///
    /// # Errors
    ///
    /// Returns the first inconsistency found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.default_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.default_timeout > self.max_timeout {
            return Err(ConfigError::TimeoutAboveMaximum {
                default_ms: self.default_timeout.as_millis(),
                max_ms: self.max_timeout.as_millis(),
            });
        }
        if let Isolation::Container { binary } = &self.isolation {
            if binary.trim().is_empty() {
                return Err(ConfigError::EmptyRuntimeBinary);
            }
        }
        Ok(())
    }
}

/// Returns the default scratch root.
///
/// Uses `XDG_CACHE_HOME` if set, then `~/.cache`, then `/tmp`.
#[must_use]
pub fn default_scratch_root() -> PathBuf {
    if let Ok(xdg_cache) = std::env::var("XDG_CACHE_HOME") {
        return PathBuf::from(xdg_cache).join("code-sandbox");
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".cache").join("code-sandbox");
    }

    PathBuf::from("/tmp/code-sandbox")
}
