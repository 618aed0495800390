//! Sandboxed execution of untrusted source code.
//!
//! A request flows through four parts:
//!
//! - [`RuntimeRegistry`]: language identifier → [`ExecutionProfile`]
//! - [`WorkspaceManager`]: one scratch directory per request, always removed
//! - [`ProcessRunner`]: launches the isolated process, captures output, enforces the timeout
//! - [`Executor`]: validates, wires the above together and bounds concurrency
//!
//! # Example
//!
//! ```no_run
//! use code_sandbox::sandbox::{ExecutionRequest, Executor, RuntimeRegistry, ServiceConfig};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let executor = Executor::new(ServiceConfig::default(), RuntimeRegistry::builtin())?;
//! let outcome = executor
//!     .execute(ExecutionRequest::new("python", "print('hello')"))
//!     .await?;
//!
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

mod config;
mod coordinator;
mod outcome;
mod registry;
pub mod runner;
mod workspace;

pub use config::{
    DEFAULT_MAX_CONCURRENT, DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_MAX_TIMEOUT, DEFAULT_TIMEOUT,
    Isolation, ServiceConfig, default_scratch_root,
};
pub use coordinator::Executor;
pub use outcome::{ExecutionOutcome, ExecutionRequest};
pub use registry::{ExecutionProfile, FILE_PLACEHOLDER, RuntimeRegistry, load_profiles};
pub use runner::{ContainerRunner, NamespaceRunner, ProcessRunner};
pub use workspace::{WORKSPACE_MOUNT_POINT, Workspace, WorkspaceManager};
