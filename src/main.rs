//! Code Sandbox - Entry Point
//!
//! This is the main entry point for the HTTP execution service binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use miette::Result;
use tracing::{Level, error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use code_sandbox::sandbox::{
    DEFAULT_MAX_CONCURRENT, DEFAULT_MAX_OUTPUT_BYTES, Executor, Isolation, RuntimeRegistry,
    ServiceConfig, WorkspaceManager, default_scratch_root,
};
use code_sandbox::{Error, server, system};

/// Isolation backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Docker-CLI compatible container runtime
    Container,
    /// Linux namespaces on the host toolchain
    Namespace,
}

/// Code Sandbox - run untrusted code snippets in isolated environments.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "SANDBOX_BIND", default_value = "127.0.0.1:4000")]
    bind: SocketAddr,

    /// Directory holding per-request workspaces (default: ~/.cache/code-sandbox)
    #[arg(long, env = "SANDBOX_SCRATCH_ROOT")]
    scratch_root: Option<PathBuf>,

    /// Isolation backend
    #[arg(long, env = "SANDBOX_ISOLATION", value_enum, default_value_t = Backend::Container)]
    isolation: Backend,

    /// Container runtime binary (container backend)
    #[arg(long, env = "SANDBOX_RUNTIME_BIN", default_value = "docker")]
    runtime_bin: String,

    /// JSON file with additional language profiles
    #[arg(long, env = "SANDBOX_PROFILES")]
    profiles: Option<PathBuf>,

    /// Timeout applied when a request does not ask for one
    #[arg(long, env = "SANDBOX_DEFAULT_TIMEOUT_MS", default_value_t = 30_000)]
    default_timeout_ms: u64,

    /// Largest timeout a request may ask for
    #[arg(long, env = "SANDBOX_MAX_TIMEOUT_MS", default_value_t = 120_000)]
    max_timeout_ms: u64,

    /// Maximum number of executions running at once
    #[arg(long, env = "SANDBOX_MAX_CONCURRENT", default_value_t = DEFAULT_MAX_CONCURRENT)]
    max_concurrent: usize,

    /// Memory limit passed to the container runtime (e.g. 256m)
    #[arg(long, env = "SANDBOX_MEMORY", default_value = "256m")]
    memory: String,

    /// Process limit passed to the container runtime (0 disables)
    #[arg(long, env = "SANDBOX_PIDS_LIMIT", default_value_t = 64)]
    pids_limit: u32,

    /// Bytes kept per output stream
    #[arg(long, env = "SANDBOX_MAX_OUTPUT_BYTES", default_value_t = DEFAULT_MAX_OUTPUT_BYTES)]
    max_output_bytes: usize,

    /// Skip isolation backend checks at startup
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,
}

impl Args {
    fn service_config(&self) -> ServiceConfig {
        let isolation = match self.isolation {
            Backend::Container => Isolation::Container {
                binary: self.runtime_bin.clone(),
            },
            Backend::Namespace => Isolation::Namespace,
        };

        let memory = Some(self.memory.trim().to_string()).filter(|m| !m.is_empty());
        let pids = Some(self.pids_limit).filter(|&n| n > 0);

        ServiceConfig::default()
            .with_scratch_root(
                self.scratch_root
                    .clone()
                    .unwrap_or_else(default_scratch_root),
            )
            .with_isolation(isolation)
            .with_default_timeout(Duration::from_millis(self.default_timeout_ms))
            .with_max_timeout(Duration::from_millis(self.max_timeout_ms))
            .with_max_concurrent(self.max_concurrent)
            .with_max_output_bytes(self.max_output_bytes)
            .with_memory_limit(memory)
            .with_pids_limit(pids)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing; logs go to stderr
    let filter = if args.verbose {
        EnvFilter::from_default_env().add_directive(Level::DEBUG.into())
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    info!("Code Sandbox v{}", env!("CARGO_PKG_VERSION"));

    let config = args.service_config();

    let mut registry = RuntimeRegistry::builtin();
    if let Some(path) = &args.profiles {
        let loaded = registry.extend_from_file(path).map_err(Error::from)?;
        info!(count = loaded, path = %path.display(), "Loaded language profiles");
    }
    info!(languages = ?registry.languages(), "Language profiles ready");

    if args.skip_checks {
        warn!("Skipping isolation backend checks (--skip-checks)");
    } else {
        info!(backend = config.isolation.name(), "Checking isolation backend...");

        match system::check_all(&config.isolation) {
            Ok(reqs) => {
                info!(
                    "Isolation backend ready: kernel {}, backend {}, runtime {}",
                    reqs.kernel_version,
                    reqs.backend,
                    reqs.container_runtime.as_deref().unwrap_or("n/a")
                );
            }
            Err(e) => {
                error!("Isolation backend check failed");
                return Err(e.into());
            }
        }
    }

    let removed = WorkspaceManager::new(&config.scratch_root).sweep_stale();
    if removed > 0 {
        warn!(removed, "Removed workspaces left over from a previous run");
    }

    let executor = Executor::new(config, registry).map_err(Error::from)?;

    server::run(args.bind, executor).await?;
    Ok(())
}
