//! Worker process management
//!
//! Each [`WorkerProcess`] is one OS process started from the pool's worker
//! executable. It learns where to connect and who it is from the `REALLY_*`
//! environment variables.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, info, warn};

use really_config::{OutputMode, PoolConfig, WorkerEnvironment};
use really_resilience::ProcessShutdownManager;

use crate::error::ExecutionError;

/// How to start a worker: executable, arguments and output handling
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub output: OutputMode,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            output: OutputMode::default(),
        }
    }

    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            program: config.script.clone(),
            args: config.worker_args.clone(),
            output: config.output,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn output(mut self, output: OutputMode) -> Self {
        self.output = output;
        self
    }
}

/// A single worker process handle
#[derive(Debug)]
pub struct WorkerProcess {
    id: u32,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    exit_status: Option<ExitStatus>,
    killed: bool,
}

impl WorkerProcess {
    /// Spawn a new worker process
    pub fn spawn(
        command: &WorkerCommand,
        environment: &WorkerEnvironment,
    ) -> Result<Self, ExecutionError> {
        let id = environment.identifier;
        debug!(worker = id, program = %command.program.display(), "Spawning worker process");

        let (stdout_mode, stderr_mode) = match command.output {
            OutputMode::Inherit => (Stdio::inherit(), Stdio::inherit()),
            OutputMode::Capture | OutputMode::Forward => (Stdio::piped(), Stdio::piped()),
        };

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(environment.to_vars())
            .stdin(Stdio::null())
            .stdout(stdout_mode)
            .stderr(stderr_mode)
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|source| ExecutionError::SpawnError { id, source })?;
        let pid = child.id();

        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        if command.output == OutputMode::Forward {
            if let Some(stream) = stdout.take() {
                tokio::spawn(forward_lines(id, "stdout", stream));
            }
            if let Some(stream) = stderr.take() {
                tokio::spawn(forward_lines(id, "stderr", stream));
            }
        }

        info!(worker = id, pid = ?pid, "Worker process started");

        Ok(Self {
            id,
            pid,
            started_at: Utc::now(),
            child,
            stdout,
            stderr,
            exit_status: None,
            killed: false,
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// OS process id; `None` once the process has been reaped
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_killed(&self) -> bool {
        self.killed
    }

    /// Exit status recorded by [`WorkerProcess::kill`]
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit_status
    }

    /// Check without blocking whether the process has exited on its own
    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    /// Captured stdout; `None` unless the output mode is capture
    pub fn stdout(&mut self) -> Result<Option<&mut ChildStdout>, ExecutionError> {
        self.ensure_alive("stdout")?;
        Ok(self.stdout.as_mut())
    }

    /// Captured stderr; `None` unless the output mode is capture
    pub fn stderr(&mut self) -> Result<Option<&mut ChildStderr>, ExecutionError> {
        self.ensure_alive("stderr")?;
        Ok(self.stderr.as_mut())
    }

    /// Take ownership of the captured stdout
    pub fn take_stdout(&mut self) -> Result<Option<ChildStdout>, ExecutionError> {
        self.ensure_alive("stdout")?;
        Ok(self.stdout.take())
    }

    /// Take ownership of the captured stderr
    pub fn take_stderr(&mut self) -> Result<Option<ChildStderr>, ExecutionError> {
        self.ensure_alive("stderr")?;
        Ok(self.stderr.take())
    }

    fn ensure_alive(&self, stream: &str) -> Result<(), ExecutionError> {
        if self.killed {
            return Err(ExecutionError::InvariantViolation(format!(
                "{} of worker {} accessed after kill",
                stream, self.id
            )));
        }
        Ok(())
    }

    /// Close the captured streams and terminate the process.
    ///
    /// SIGTERM first, SIGKILL after `grace_period`. Calls after the first are
    /// no-ops.
    pub async fn kill(&mut self, grace_period: Duration) -> Result<(), ExecutionError> {
        if self.killed {
            return Ok(());
        }
        self.killed = true;
        self.stdout = None;
        self.stderr = None;

        let status = ProcessShutdownManager::shutdown_process(&mut self.child, grace_period).await?;
        info!(worker = self.id, pid = ?self.pid, %status, "Worker process stopped");
        self.exit_status = Some(status);
        self.pid = None;
        Ok(())
    }
}

async fn forward_lines<R>(id: u32, stream: &'static str, reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(target: "really::worker", worker = id, stream, "{}", line),
            Ok(None) => break,
            Err(e) => {
                warn!(worker = id, stream, "Stopped forwarding worker output: {}", e);
                break;
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn shell(script: &str) -> WorkerCommand {
        WorkerCommand::new("/bin/sh").arg("-c").arg(script)
    }

    fn environment(id: u32) -> WorkerEnvironment {
        WorkerEnvironment::new("tcp://127.0.0.1:1", id, 4)
    }

    #[tokio::test]
    async fn test_environment_and_capture() {
        let command = shell(
            "echo \"$REALLY_SERVER $REALLY_IDENTIFIER $REALLY_CONCURRENCY_LEVEL\"; echo oops >&2",
        );
        let mut worker = WorkerProcess::spawn(&command, &environment(6)).unwrap();
        assert_eq!(worker.id(), 6);
        assert!(worker.pid().is_some());

        let mut out = String::new();
        worker
            .take_stdout()
            .unwrap()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert_eq!(out.trim(), "tcp://127.0.0.1:1 6 4");

        let mut err = String::new();
        worker
            .stderr()
            .unwrap()
            .unwrap()
            .read_to_string(&mut err)
            .await
            .unwrap();
        assert_eq!(err.trim(), "oops");

        worker.kill(Duration::from_secs(1)).await.unwrap();
        assert!(worker.exit_status().unwrap().success());
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let mut worker = WorkerProcess::spawn(&shell("sleep 30"), &environment(0)).unwrap();
        assert!(!worker.has_exited());

        worker.kill(Duration::from_secs(2)).await.unwrap();
        assert!(worker.is_killed());
        assert!(worker.pid().is_none());
        assert!(!worker.exit_status().unwrap().success());

        worker.kill(Duration::from_secs(2)).await.unwrap();
        assert!(worker.is_killed());
    }

    #[tokio::test]
    async fn test_streams_after_kill_are_invariant_violations() {
        let mut worker = WorkerProcess::spawn(&shell("sleep 30"), &environment(1)).unwrap();
        worker.kill(Duration::from_secs(2)).await.unwrap();

        assert!(matches!(
            worker.stdout(),
            Err(ExecutionError::InvariantViolation(_))
        ));
        assert!(matches!(
            worker.stderr(),
            Err(ExecutionError::InvariantViolation(_))
        ));
        assert!(matches!(
            worker.take_stdout(),
            Err(ExecutionError::InvariantViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_forward_and_inherit_expose_no_streams() {
        for mode in [OutputMode::Forward, OutputMode::Inherit] {
            let command = shell("echo forwarded").output(mode);
            let mut worker = WorkerProcess::spawn(&command, &environment(2)).unwrap();
            assert!(worker.stdout().unwrap().is_none());
            assert!(worker.stderr().unwrap().is_none());
            worker.kill(Duration::from_secs(1)).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let command = WorkerCommand::new("/nonexistent/really-worker");
        let err = WorkerProcess::spawn(&command, &environment(3)).unwrap_err();
        assert!(matches!(err, ExecutionError::SpawnError { id: 3, .. }));
    }
}
