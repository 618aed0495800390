//! Process runners: launch one isolated execution and report its outcome.
//!
//! # Notes on stdout/stderr capture and timeouts
//!
//! A child that fills a pipe nobody reads blocks forever, so waiting for exit before reading would
//! deadlock on large output. Both streams are drained on their own threads from spawn onwards, and
//! the drains keep reading past the capture limit so the producer never stalls.
//!
//! Timeouts are enforced with millisecond precision by polling `try_wait` against a deadline. On
//! expiry the whole isolated environment is killed, not just the direct child, and whatever was
//! captured is discarded: a timeout is its own outcome, never a truncated success.
//!
//! Drain threads are never joined unconditionally. A grandchild that escapes the kill could keep a
//! pipe open forever; collection therefore waits on a channel with the remaining deadline instead.

mod container;
mod namespace;

use std::fmt;
use std::io::{ErrorKind, Read};
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::trace;

use super::config::{Isolation, ServiceConfig};
use super::outcome::ExecutionOutcome;
use super::registry::ExecutionProfile;
use super::workspace::Workspace;

pub use container::ContainerRunner;
pub use namespace::NamespaceRunner;

/// How often a running child is polled for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Extra time granted after exit for the drains to hand over their buffers.
const DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Runs one execution profile against one workspace.
///
/// Implementations hold no per-request state and are shared between
/// concurrent requests.
pub trait ProcessRunner: Send + Sync + fmt::Debug {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Runs the workspace's source file under `profile`, bounded by `timeout`.
    ///
    /// Never returns `UnsupportedLanguage`; that is decided before a runner is involved.
    fn run(&self, profile: &ExecutionProfile, workspace: &Workspace, timeout: Duration)
    -> ExecutionOutcome;
}

/// Builds the runner selected by the configuration.
#[must_use]
pub fn from_config(config: &ServiceConfig) -> Arc<dyn ProcessRunner> {
    match &config.isolation {
        Isolation::Container { binary } => Arc::new(
            ContainerRunner::new(binary.clone())
                .with_memory_limit(config.memory_limit.clone())
                .with_pids_limit(config.pids_limit)
                .with_max_output_bytes(config.max_output_bytes),
        ),
        Isolation::Namespace => {
            Arc::new(NamespaceRunner::new().with_max_output_bytes(config.max_output_bytes))
        }
    }
}

/// Bytes captured from one stream, up to a limit.
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    dropped: usize,
}

impl Captured {
    fn push(&mut self, chunk: &[u8], limit: usize) {
        let room = limit.saturating_sub(self.bytes.len());
        let kept = room.min(chunk.len());
        self.bytes.extend_from_slice(&chunk[..kept]);
        self.dropped += chunk.len() - kept;
    }

    fn into_string(self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.dropped > 0 {
            text.push_str(&format!("\n[output truncated: {} bytes omitted]", self.dropped));
        }
        text
    }
}

/// A stream being drained on its own thread.
struct StreamDrain {
    rx: mpsc::Receiver<Captured>,
}

impl StreamDrain {
    /// Starts draining `reader`, keeping at most `limit` bytes.
    fn spawn<R: Read + Send + 'static>(reader: Option<R>, limit: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Captured>();

        thread::spawn(move || {
            let mut captured = Captured::default();
            if let Some(mut r) = reader {
                let mut chunk = [0u8; 8192];
                loop {
                    match r.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => captured.push(&chunk[..n], limit),
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(_) => break,
                    }
                }
            }
            let _ = tx.send(captured);
        });

        Self { rx }
    }

    /// Waits for the stream to close, at most until `deadline`.
    fn collect(self, deadline: Instant) -> Option<Captured> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        self.rx.recv_timeout(remaining).ok()
    }
}

/// The two output streams of a running child.
pub(crate) struct OutputDrains {
    stdout: StreamDrain,
    stderr: StreamDrain,
}

impl OutputDrains {
    /// Starts draining both streams concurrently.
    pub(crate) fn spawn<O, E>(stdout: Option<O>, stderr: Option<E>, limit: usize) -> Self
    where
        O: Read + Send + 'static,
        E: Read + Send + 'static,
    {
        Self {
            stdout: StreamDrain::spawn(stdout, limit),
            stderr: StreamDrain::spawn(stderr, limit),
        }
    }

    /// Assembles a `Completed` outcome once both streams have closed.
    ///
    /// Returns `None` if a stream is still open at `deadline` (plus a short
    /// grace period), meaning something inside the sandbox outlived the main
    /// process and the caller must tear it down.
    pub(crate) fn complete(self, exit_code: i32, deadline: Instant) -> Option<ExecutionOutcome> {
        let deadline = deadline.max(Instant::now() + DRAIN_GRACE);
        let stdout = self.stdout.collect(deadline)?;
        let stderr = self.stderr.collect(deadline)?;

        Some(ExecutionOutcome::Completed {
            stdout: stdout.into_string(),
            stderr: stderr.into_string(),
            exit_code,
        })
    }
}

/// What happened while waiting for a child.
pub(crate) enum Supervision<S> {
    Exited(S),
    TimedOut,
    Failed(String),
}

/// Polls `try_wait` until the child exits, the deadline passes, or polling fails.
pub(crate) fn supervise<S, E, F>(deadline: Instant, mut try_wait: F) -> Supervision<S>
where
    E: fmt::Display,
    F: FnMut() -> Result<Option<S>, E>,
{
    loop {
        match try_wait() {
            Ok(Some(status)) => return Supervision::Exited(status),
            Ok(None) => {
                if Instant::now() >= deadline {
                    trace!("Deadline reached");
                    return Supervision::TimedOut;
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Supervision::Failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_captured_respects_limit() {
        let mut captured = Captured::default();
        captured.push(b"hello", 8);
        captured.push(b"world", 8);
        assert_eq!(captured.bytes, b"hellowor");
        assert_eq!(captured.dropped, 2);

        let text = captured.into_string();
        assert!(text.starts_with("hellowor"));
        assert!(text.contains("2 bytes omitted"));
    }

    #[test]
    fn test_captured_without_truncation() {
        let mut captured = Captured::default();
        captured.push("héllo".as_bytes(), 1024);
        assert_eq!(captured.into_string(), "héllo");
    }

    #[test]
    fn test_drains_collect_both_streams() {
        let drains = OutputDrains::spawn(
            Some(Cursor::new(b"out".to_vec())),
            Some(Cursor::new(b"err".to_vec())),
            1024,
        );
        let outcome = drains.complete(3, Instant::now() + Duration::from_secs(5));
        assert_eq!(
            outcome,
            Some(ExecutionOutcome::Completed {
                stdout: "out".into(),
                stderr: "err".into(),
                exit_code: 3,
            })
        );
    }

    #[test]
    fn test_drains_handle_missing_pipe() {
        let drains = OutputDrains::spawn(None::<Cursor<Vec<u8>>>, None::<Cursor<Vec<u8>>>, 16);
        let outcome = drains.complete(0, Instant::now());
        assert_eq!(outcome.and_then(|o| o.exit_code()), Some(0));
    }

    #[test]
    fn test_supervise_exits() {
        let mut polls = 0;
        let result = supervise(Instant::now() + Duration::from_secs(5), || {
            polls += 1;
            Ok::<_, std::io::Error>(if polls == 3 { Some(7) } else { None })
        });
        assert!(matches!(result, Supervision::Exited(7)));
    }

    #[test]
    fn test_supervise_times_out() {
        let start = Instant::now();
        let result = supervise(start + Duration::from_millis(50), || {
            Ok::<Option<i32>, std::io::Error>(None)
        });
        assert!(matches!(result, Supervision::TimedOut));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_supervise_reports_failure() {
        let result = supervise(Instant::now() + Duration::from_secs(5), || {
            Err::<Option<i32>, _>(std::io::Error::other("boom"))
        });
        assert!(matches!(result, Supervision::Failed(ref reason) if reason == "boom"));
    }

    #[test]
    fn test_from_config_selects_backend() {
        let container = from_config(&ServiceConfig::default());
        assert_eq!(container.name(), "docker");

        let namespace = from_config(&ServiceConfig::default().with_isolation(Isolation::Namespace));
        assert_eq!(namespace.name(), "namespace");
    }
}
