//! Request and outcome types for one execution.

use std::time::Duration;

use crate::error::ValidationError;

/// Source code to run, tagged with its language.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    /// Language identifier resolved through the runtime registry.
    pub language: String,
    /// Source text, treated as opaque.
    pub source: String,
    /// Caller-requested timeout; only honored within the configured bound.
    pub timeout: Option<Duration>,
}

impl ExecutionRequest {
    /// Creates a request that uses the default timeout.
    pub fn new(language: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            source: source.into(),
            timeout: None,
        }
    }

    /// Requests a specific timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Checks that both language and source are present.
    ///
    /// # Errors
    ///
    /// Returns `MissingLanguage` for a blank language and `MissingSource`
    /// for an empty source.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.language.trim().is_empty() {
            return Err(ValidationError::MissingLanguage);
        }
        if self.source.is_empty() {
            return Err(ValidationError::MissingSource);
        }
        Ok(())
    }
}

/// Result of one execution attempt. Exactly one variant per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    /// The process ran to completion. A non-zero exit code is still a completion.
    Completed {
        stdout: String,
        stderr: String,
        exit_code: i32,
    },
    /// The process was still running at the deadline and was killed.
    TimedOut,
    /// The isolation runtime could not be started or supervised.
    RunnerStartFailure { reason: String },
    /// No profile is registered for the requested language.
    UnsupportedLanguage { language: String },
}

impl ExecutionOutcome {
    /// Short label for logs.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Completed { .. } => "completed",
            Self::TimedOut => "timed_out",
            Self::RunnerStartFailure { .. } => "runner_start_failure",
            Self::UnsupportedLanguage { .. } => "unsupported_language",
        }
    }

    /// Exit code of a completed run.
    #[must_use]
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Completed { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }

    /// Returns true for a completed run that exited 0 and wrote nothing to stderr.
    #[must_use]
    pub fn is_clean_success(&self) -> bool {
        matches!(self, Self::Completed { exit_code: 0, stderr, .. } if stderr.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_accepts_complete_request() {
        assert!(ExecutionRequest::new("python", "print(1)").validate().is_ok());
    }

    #[test]
    fn test_validate_missing_language() {
        assert_eq!(
            ExecutionRequest::new("", "print(1)").validate(),
            Err(ValidationError::MissingLanguage)
        );
        assert_eq!(
            ExecutionRequest::new("  ", "print(1)").validate(),
            Err(ValidationError::MissingLanguage)
        );
    }

    #[test]
    fn test_validate_missing_source() {
        assert_eq!(
            ExecutionRequest::new("python", "").validate(),
            Err(ValidationError::MissingSource)
        );
    }

    #[test]
    fn test_whitespace_source_is_accepted() {
        assert!(ExecutionRequest::new("python", "\n").validate().is_ok());
    }

    #[test]
    fn test_outcome_helpers() {
        let ok = ExecutionOutcome::Completed {
            stdout: "ok\n".into(),
            stderr: String::new(),
            exit_code: 0,
        };
        assert_eq!(ok.label(), "completed");
        assert_eq!(ok.exit_code(), Some(0));
        assert!(ok.is_clean_success());

        let warned = ExecutionOutcome::Completed {
            stdout: "ok\n".into(),
            stderr: "warning\n".into(),
            exit_code: 0,
        };
        assert!(!warned.is_clean_success());

        assert_eq!(ExecutionOutcome::TimedOut.exit_code(), None);
        assert_eq!(ExecutionOutcome::TimedOut.label(), "timed_out");
    }
}
