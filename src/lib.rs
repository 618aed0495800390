//! Code Sandbox - run untrusted snippets in isolated, time-bounded environments.
//!
//! Each request carries a language tag and source text. The source is written
//! to a private scratch workspace, run inside a container (or a Linux
//! namespace sandbox) with only that workspace mounted, and the captured
//! output is returned. The workspace is removed whatever the outcome.
//!
//! # Platform Requirements
//!
//! - Linux
//! - A Docker-CLI compatible container runtime (`docker`, `podman`), or
//!   unprivileged user namespaces for the namespace backend
//!
//! # Example
//!
//! ```no_run
//! use code_sandbox::sandbox::{Executor, RuntimeRegistry, ServiceConfig};
//! use code_sandbox::{server, system};
//!
//! #[tokio::main]
//! async fn main() -> miette::Result<()> {
//!     let config = ServiceConfig::default();
//!
//!     // Validate the isolation backend
//!     system::check_all(&config.isolation)?;
//!
//!     let executor = Executor::new(config, RuntimeRegistry::builtin())
//!         .map_err(code_sandbox::Error::from)?;
//!
//!     // Start HTTP server
//!     server::run("127.0.0.1:4000".parse().unwrap(), executor).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod sandbox;
pub mod server;
pub mod system;

// Re-export commonly used types
pub use error::{Error, ExecutionError, Result};
pub use sandbox::{ExecutionOutcome, ExecutionRequest, Executor, RuntimeRegistry, ServiceConfig};
