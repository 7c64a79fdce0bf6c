//! Graceful shutdown coordination
//!
//! [`JobTracker`] counts outstanding jobs and lets a stopper wait for them to
//! finish. [`ProcessShutdownManager`] terminates child processes with
//! escalating signals.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::Notify;
use tokio::time::timeout;

/// Time allowed for a force-killed process to be reaped
const FORCED_REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Tracks outstanding jobs and the closing state of their owner.
///
/// Cloning shares the same counters.
#[derive(Debug, Clone, Default)]
pub struct JobTracker {
    inner: Arc<TrackerState>,
}

#[derive(Debug, Default)]
struct TrackerState {
    closing: AtomicBool,
    active: AtomicUsize,
    idle: Notify,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new job unless the tracker is closing.
    ///
    /// The counter is raised before the closing flag is read, so a job
    /// admitted here is always visible to a concurrent [`JobTracker::wait_idle`].
    pub fn try_begin(&self) -> Option<JobGuard> {
        self.inner.active.fetch_add(1, Ordering::SeqCst);
        let guard = JobGuard {
            state: self.inner.clone(),
        };
        if self.inner.closing.load(Ordering::SeqCst) {
            drop(guard);
            return None;
        }
        Some(guard)
    }

    /// Stop admitting new jobs. Returns `true` on the first call only.
    pub fn close(&self) -> bool {
        !self.inner.closing.swap(true, Ordering::SeqCst)
    }

    pub fn is_closing(&self) -> bool {
        self.inner.closing.load(Ordering::SeqCst)
    }

    /// Current number of outstanding jobs
    pub fn active_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Wait until no job is outstanding.
    ///
    /// With a limit, gives up after it elapses and reports how many jobs
    /// were still running.
    pub async fn wait_idle(&self, limit: Option<Duration>) -> Result<(), ShutdownError> {
        match limit {
            None => {
                self.idle().await;
                Ok(())
            }
            Some(limit) => match timeout(limit, self.idle()).await {
                Ok(()) => Ok(()),
                Err(_) => {
                    let remaining = self.active_count();
                    warn!(
                        "Gave up waiting for jobs after {:?}, {} still active",
                        limit, remaining
                    );
                    Err(ShutdownError::TasksRemaining(remaining))
                }
            },
        }
    }

    async fn idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register interest before reading the counter so a release in
            // between is not missed
            notified.as_mut().enable();

            let active = self.active_count();
            if active == 0 {
                return;
            }
            debug!("Waiting for {} outstanding jobs", active);
            notified.await;
        }
    }
}

/// Keeps one job registered with a [`JobTracker`] until dropped
#[derive(Debug)]
pub struct JobGuard {
    state: Arc<TrackerState>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if self.state.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.state.idle.notify_waiters();
        }
    }
}

/// Shutdown error types
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    /// Jobs still running when the wait ended
    #[error("Shutdown completed with {0} jobs still active")]
    TasksRemaining(usize),

    /// Signalling or reaping a process failed
    #[error("Process shutdown error: {0}")]
    ProcessError(String),

    /// Process survived a forced kill
    #[error("Process {0} unresponsive to termination")]
    Unresponsive(u32),
}

/// Process shutdown manager for external processes
pub struct ProcessShutdownManager;

impl ProcessShutdownManager {
    /// Terminate a child process: SIGTERM, wait `graceful_timeout`, then SIGKILL.
    ///
    /// A child that has already exited is simply reaped.
    pub async fn shutdown_process(
        child: &mut tokio::process::Child,
        graceful_timeout: Duration,
    ) -> Result<std::process::ExitStatus, ShutdownError> {
        if let Ok(Some(status)) = child.try_wait() {
            debug!("Process already exited with status: {:?}", status);
            return Ok(status);
        }

        let pid = child.id();
        if let Some(id) = pid {
            debug!("Initiating graceful shutdown for process {}", id);
            Self::terminate(id);
        }

        // Wait for graceful termination
        match timeout(graceful_timeout, child.wait()).await {
            Ok(Ok(status)) => {
                debug!("Process terminated gracefully with status: {:?}", status);
                return Ok(status);
            }
            Ok(Err(e)) => {
                error!("Error waiting for process: {}", e);
            }
            Err(_) => {
                warn!(
                    "Process {:?} did not terminate within {:?}, killing it",
                    pid, graceful_timeout
                );
            }
        }

        if let Err(e) = child.start_kill() {
            if let Ok(Some(status)) = child.try_wait() {
                return Ok(status);
            }
            error!("Failed to kill process: {}", e);
            return Err(ShutdownError::ProcessError(e.to_string()));
        }

        match timeout(FORCED_REAP_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                info!("Process {:?} killed with status: {:?}", pid, status);
                Ok(status)
            }
            Ok(Err(e)) => {
                error!("Error waiting for killed process: {}", e);
                Err(ShutdownError::ProcessError(e.to_string()))
            }
            Err(_) => {
                error!("Process did not terminate even after force kill");
                Err(ShutdownError::Unresponsive(pid.unwrap_or_default()))
            }
        }
    }

    #[cfg(unix)]
    fn terminate(id: u32) {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if let Err(e) = signal::kill(Pid::from_raw(id as i32), Signal::SIGTERM) {
            warn!("Failed to send SIGTERM to process {}: {}", id, e);
        }
    }

    #[cfg(not(unix))]
    fn terminate(id: u32) {
        // No polite termination signal; the grace period just lets it exit on its own
        debug!("No SIGTERM on this platform for process {}", id);
    }
}
