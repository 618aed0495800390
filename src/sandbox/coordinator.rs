//! Execution coordinator: the public entry point of the service.
//!
//! `Received → Validated → Provisioned → Running → {Completed | TimedOut |
//! RunnerStartFailure} → Cleaned`
//!
//! Validation and language resolution happen before anything touches the
//! disk. Workspace allocation, the run itself and cleanup happen on the
//! blocking pool while holding a concurrency permit.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, instrument, warn};

use super::config::ServiceConfig;
use super::outcome::{ExecutionOutcome, ExecutionRequest};
use super::registry::RuntimeRegistry;
use super::runner::{self, ProcessRunner};
use super::workspace::WorkspaceManager;
use crate::error::{ConfigError, ExecutionError};

/// Runs execution requests end to end.
///
/// Cheap to clone; clones share the registry, runner and concurrency limit.
#[derive(Debug, Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: ServiceConfig,
    registry: RuntimeRegistry,
    workspaces: WorkspaceManager,
    runner: Arc<dyn ProcessRunner>,
    permits: Arc<Semaphore>,
}

impl Executor {
    /// Creates an executor using the runner selected by `config.isolation`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration is inconsistent.
    pub fn new(config: ServiceConfig, registry: RuntimeRegistry) -> Result<Self, ConfigError> {
        let runner = runner::from_config(&config);
        Self::with_runner(config, registry, runner)
    }

    /// Creates an executor with an explicit runner.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration is inconsistent.
    pub fn with_runner(
        config: ServiceConfig,
        registry: RuntimeRegistry,
        runner: Arc<dyn ProcessRunner>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        debug!(
            runner = runner.name(),
            scratch_root = %config.scratch_root.display(),
            max_concurrent = config.max_concurrent,
            languages = ?registry.languages(),
            "Executor ready"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                workspaces: WorkspaceManager::new(&config.scratch_root),
                permits: Arc::new(Semaphore::new(config.max_concurrent)),
                config,
                registry,
                runner,
            }),
        })
    }

    /// Executes one request.
    ///
    /// Everything the submitted code does is reported as an
    /// [`ExecutionOutcome`]; only malformed requests and unusable scratch
    /// storage are errors. The workspace is removed on every path, including
    /// a panicking runner.
    ///
    /// # Errors
    ///
    /// - `ExecutionError::Validation` if language or source is missing
    /// - `ExecutionError::Workspace` if the source cannot be materialized
    #[instrument(skip(self, request), fields(language = %request.language, bytes = request.source.len()))]
    pub async fn execute(
        &self,
        request: ExecutionRequest,
    ) -> Result<ExecutionOutcome, ExecutionError> {
        request.validate()?;

        let profile = match self.inner.registry.resolve(&request.language) {
            Ok(profile) => profile.clone(),
            Err(e) => {
                debug!(error = %e, "Rejecting request");
                return Ok(ExecutionOutcome::UnsupportedLanguage {
                    language: request.language,
                });
            }
        };

        let timeout = self.effective_timeout(request.timeout);

        let Ok(permit) = Arc::clone(&self.inner.permits).acquire_owned().await else {
            return Ok(ExecutionOutcome::RunnerStartFailure {
                reason: "executor is shutting down".to_string(),
            });
        };

        let inner = Arc::clone(&self.inner);
        let source = request.source;
        let task = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let workspace = inner.workspaces.acquire(&source, &profile.file_extension)?;
            debug!(workspace = %workspace.id(), timeout_ms = %timeout.as_millis(), "Workspace provisioned");

            let outcome = inner.runner.run(&profile, &workspace, timeout);
            inner.workspaces.release(workspace);
            Ok::<_, ExecutionError>(outcome)
        });

        let outcome = match task.await {
            Ok(result) => result?,
            // The workspace was owned by the task; unwinding dropped and removed it.
            Err(e) => {
                warn!(error = %e, "Runner task failed");
                ExecutionOutcome::RunnerStartFailure {
                    reason: format!("runner task failed: {e}"),
                }
            }
        };

        debug!(outcome = outcome.label(), exit_code = ?outcome.exit_code(), "Execution finished");
        Ok(outcome)
    }

    /// Timeout applied to a request.
    ///
    /// Overrides outside `(0, max_timeout]` fall back to the default.
    #[must_use]
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        let config = &self.inner.config;
        match requested {
            Some(timeout) if !timeout.is_zero() && timeout <= config.max_timeout => timeout,
            Some(timeout) => {
                debug!(requested_ms = %timeout.as_millis(), "Timeout override out of range, using default");
                config.default_timeout
            }
            None => config.default_timeout,
        }
    }

    #[must_use]
    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn registry(&self) -> &RuntimeRegistry {
        &self.inner.registry
    }

    #[must_use]
    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.inner.workspaces
    }

    /// Name of the active runner backend.
    #[must_use]
    pub fn runner_name(&self) -> &str {
        self.inner.runner.name()
    }
}
