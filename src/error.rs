//! Error types for the code sandbox service.
//!
//! Uses thiserror for deriving std::error::Error and miette for rich diagnostics.
//!
//! Only environment and client faults are errors here. Whatever the submitted
//! code does (non-zero exit, output on stderr, running past its budget) is
//! reported as an [`ExecutionOutcome`](crate::sandbox::ExecutionOutcome).

use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the application.
#[derive(Error, Debug, Diagnostic)]
pub enum Error {
    /// System requirements not met
    #[error("System requirements check failed")]
    #[diagnostic(code(sandbox::system::requirements))]
    SystemRequirements(#[from] SystemRequirementsError),

    /// Invalid service configuration
    #[error("Invalid configuration")]
    #[diagnostic(code(sandbox::config))]
    Config(#[from] ConfigError),

    /// Runtime profile registry could not be built
    #[error("Runtime registry error")]
    #[diagnostic(code(sandbox::registry))]
    Registry(#[from] RegistryError),

    /// Scratch storage error outside of a request (startup sweep)
    #[error("Workspace storage error")]
    #[diagnostic(code(sandbox::workspace))]
    Workspace(#[from] WorkspaceError),

    /// HTTP server error
    #[error("HTTP server error")]
    #[diagnostic(code(sandbox::server))]
    Server(#[from] ServerError),

    /// I/O error
    #[error("I/O error: {0}")]
    #[diagnostic(code(sandbox::io))]
    Io(#[from] std::io::Error),
}

/// Errors returned by the execution coordinator instead of an outcome.
///
/// Validation errors are raised before any resource is touched; workspace
/// errors before any process is launched.
#[derive(Error, Debug, Diagnostic)]
pub enum ExecutionError {
    /// The request is malformed (client fault).
    #[error(transparent)]
    #[diagnostic(transparent)]
    Validation(#[from] ValidationError),

    /// Scratch storage is unavailable (environment fault).
    #[error(transparent)]
    #[diagnostic(transparent)]
    Workspace(#[from] WorkspaceError),
}

/// Missing or empty request fields.
#[derive(Error, Debug, Diagnostic, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Missing language in request")]
    #[diagnostic(code(sandbox::validation::language))]
    MissingLanguage,

    #[error("Missing source code in request")]
    #[diagnostic(code(sandbox::validation::source))]
    MissingSource,
}

/// Errors related to per-request scratch storage.
#[derive(Error, Debug, Diagnostic)]
pub enum WorkspaceError {
    /// The scratch root cannot be created or is not usable.
    #[error("Scratch root {} is not usable", path.display())]
    #[diagnostic(
        code(sandbox::workspace::storage_unavailable),
        help("Point --scratch-root at a writable directory")
    )]
    StorageUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The per-request directory could not be created.
    #[error("Failed to create workspace directory {}", path.display())]
    #[diagnostic(code(sandbox::workspace::create))]
    CreateFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The source artifact could not be written.
    #[error("Failed to write source file {}", path.display())]
    #[diagnostic(code(sandbox::workspace::write))]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file extension would escape the workspace directory.
    #[error("Invalid source file extension: {0:?}")]
    #[diagnostic(code(sandbox::workspace::extension))]
    InvalidExtension(String),
}

/// Errors related to language profiles.
#[derive(Error, Debug, Diagnostic)]
pub enum RegistryError {
    /// No profile is registered for the language.
    #[error("Unsupported language: {language}")]
    #[diagnostic(code(sandbox::registry::unsupported))]
    UnsupportedLanguage { language: String },

    /// A profile is missing a required field or carries an unsafe value.
    #[error("Invalid profile for language {language:?}: {reason}")]
    #[diagnostic(code(sandbox::registry::invalid_profile))]
    InvalidProfile { language: String, reason: String },

    /// Profile file could not be read.
    #[error("Failed to read profile file {}", path.display())]
    #[diagnostic(code(sandbox::registry::read))]
    ReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Profile file is not a valid JSON profile list.
    #[error("Failed to parse profile file {}", path.display())]
    #[diagnostic(
        code(sandbox::registry::parse),
        help("Expected a JSON array of objects with language, fileExtension, isolatedRuntimeName and entrypointTemplate")
    )]
    ParseFailed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors related to service configuration values.
#[derive(Error, Debug, Diagnostic, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_concurrent must be at least 1")]
    #[diagnostic(code(sandbox::config::max_concurrent))]
    ZeroConcurrency,

    #[error("Default timeout must be greater than zero")]
    #[diagnostic(code(sandbox::config::default_timeout))]
    ZeroTimeout,

    #[error("Default timeout {default_ms}ms exceeds maximum timeout {max_ms}ms")]
    #[diagnostic(code(sandbox::config::timeout_bounds))]
    TimeoutAboveMaximum { default_ms: u128, max_ms: u128 },

    #[error("Container runtime binary cannot be empty")]
    #[diagnostic(
        code(sandbox::config::runtime_binary),
        help("Use --runtime-bin docker or --runtime-bin podman")
    )]
    EmptyRuntimeBinary,
}

/// Errors related to system requirements validation.
#[derive(Error, Debug, Diagnostic)]
pub enum SystemRequirementsError {
    /// Container runtime binary missing or its daemon unreachable
    #[error("Container runtime {runtime:?} is not available: {reason}")]
    #[diagnostic(
        code(sandbox::system::container_runtime),
        help("Install Docker or Podman and make sure the current user can reach its daemon")
    )]
    RuntimeUnavailable { runtime: String, reason: String },

    /// Unprivileged user namespaces not enabled
    #[error("Unprivileged user namespaces are not enabled")]
    #[diagnostic(
        code(sandbox::system::userns),
        help("Enable with: sysctl -w kernel.unprivileged_userns_clone=1")
    )]
    UserNamespacesDisabled,

    /// Failed to read system information
    #[error("Failed to read system information: {context}")]
    #[diagnostic(code(sandbox::system::read_failed))]
    ReadFailed {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors related to the HTTP server.
#[derive(Error, Debug, Diagnostic)]
pub enum ServerError {
    /// Failed to bind the listening socket
    #[error("Failed to bind {addr}")]
    #[diagnostic(code(sandbox::server::bind))]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Transport error while serving
    #[error("Transport error: {0}")]
    #[diagnostic(code(sandbox::server::transport))]
    Transport(String),
}

/// Result type alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
