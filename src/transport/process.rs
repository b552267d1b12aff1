//! Worker process spawning and teardown.
//!
//! The worker speaks the frame protocol on its stdin/stdout; stderr is
//! inherited so worker diagnostics land next to the host's own logs.
//!
//! # Example
//!
//! ```no_run
//! use pipe_offload::transport::WorkerCommand;
//!
//! let command = WorkerCommand::from_command_line("python -m my_worker --threads 2").unwrap();
//! assert_eq!(command.program(), "python");
//! ```

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, ChildStdin, ChildStdout, Command};

use crate::error::{OffloadError, Result};

/// How long `terminate` waits for a worker to exit after its stdin closes.
pub const DEFAULT_EXIT_GRACE: Duration = Duration::from_secs(1);

/// Launch description for a worker process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    program: OsString,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
    cwd: Option<PathBuf>,
}

impl WorkerCommand {
    /// Create a command for the given program with no arguments.
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
        }
    }

    /// Parse a whitespace-separated command line (no shell quoting).
    ///
    /// # Errors
    ///
    /// `Config` if the line is empty.
    pub fn from_command_line(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| OffloadError::Config("worker command is empty".to_string()))?;
        Ok(Self::new(program).args(parts))
    }

    /// Append one argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the worker (on top of the inherited environment).
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set the worker's working directory.
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn program(&self) -> &OsStr {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    pub fn get_current_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// Spawn the worker with piped stdin/stdout.
    ///
    /// The child is killed if its handle is dropped.
    ///
    /// # Errors
    ///
    /// `WorkerUnavailable` if the process cannot be started.
    pub fn spawn(&self) -> Result<WorkerProcess> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(dir) = &self.cwd {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| {
            OffloadError::WorkerUnavailable(format!(
                "failed to spawn {}: {e}",
                self.program.to_string_lossy()
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| OffloadError::WorkerUnavailable("worker stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| OffloadError::WorkerUnavailable("worker stdout not captured".into()))?;

        tracing::debug!(
            program = %self.program.to_string_lossy(),
            pid = ?child.id(),
            "spawned worker"
        );

        Ok(WorkerProcess {
            child,
            stdin,
            stdout,
        })
    }
}

/// A spawned worker with its protocol pipes.
#[derive(Debug)]
pub struct WorkerProcess {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
}

/// Stop a worker: wait up to `grace` for it to exit on its own, then kill it.
///
/// Callers close the worker's stdin first so a well-behaved worker sees
/// end-of-stream and exits within the grace period.
pub async fn terminate(child: &mut Child, grace: Duration) {
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(%status, "worker exited");
        }
        Ok(Err(e)) => {
            tracing::warn!("failed to wait for worker: {}", e);
        }
        Err(_) => {
            tracing::debug!(pid = ?child.id(), "worker did not exit in time, killing");
            if let Err(e) = child.kill().await {
                tracing::warn!("failed to kill worker: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_command_line() {
        let command = WorkerCommand::from_command_line("  worker --wire json  -v ").unwrap();
        assert_eq!(command.program(), "worker");
        assert_eq!(command.get_args(), &["--wire", "json", "-v"]);
    }

    #[test]
    fn test_from_command_line_empty() {
        assert!(matches!(
            WorkerCommand::from_command_line("   "),
            Err(OffloadError::Config(_))
        ));
    }

    #[test]
    fn test_builder_methods() {
        let command = WorkerCommand::new("worker")
            .arg("--fast")
            .env("A", "1")
            .current_dir("/tmp");
        assert_eq!(command.get_args(), &["--fast"]);
        assert_eq!(command.get_current_dir(), Some(Path::new("/tmp")));
    }

    #[tokio::test]
    async fn test_spawn_missing_program() {
        let command = WorkerCommand::new("/nonexistent/pipe-offload-worker-binary");
        assert!(matches!(
            command.spawn(),
            Err(OffloadError::WorkerUnavailable(_))
        ));
    }
}
