//! Child-process execution seam.
//!
//! Every external command the bootstrapper runs goes through the
//! [`CommandRunner`] trait so the orchestrator and upgrade engine can be
//! exercised against scripted runners in tests.

use std::io;
use std::process::Command;

use camino::Utf8PathBuf;
use thiserror::Error;
use tracing::debug;

/// Tracing target for child-process execution.
const EXEC_TARGET: &str = "corral_boot::exec";

/// A fully described child-process invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    program: Utf8PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl Invocation {
    /// Builds an invocation of the given program.
    #[must_use]
    pub fn new(program: impl Into<Utf8PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends every argument in the iterator.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets an environment variable for the child only.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Program to execute.
    #[must_use]
    pub fn program(&self) -> &Utf8PathBuf {
        &self.program
    }

    /// Arguments in order.
    #[must_use]
    pub fn argv(&self) -> &[String] {
        &self.args
    }

    /// Child-only environment variables.
    #[must_use]
    pub fn environment(&self) -> &[(String, String)] {
        &self.env
    }
}

/// Outcome of a completed child process.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    success: bool,
    stderr: String,
}

impl CommandOutput {
    /// Builds an outcome record.
    #[must_use]
    pub fn new(success: bool, stderr: impl Into<String>) -> Self {
        Self {
            success,
            stderr: stderr.into(),
        }
    }

    /// Whether the child exited successfully.
    #[must_use]
    pub fn success(&self) -> bool {
        self.success
    }

    /// Captured standard error.
    #[must_use]
    pub fn stderr(&self) -> &str {
        &self.stderr
    }
}

/// Errors raised while spawning or reaping a child process.
#[derive(Debug, Error)]
pub enum ExecError {
    /// The program could not be spawned.
    #[error("failed to run '{program}': {source}")]
    Spawn {
        /// Program involved.
        program: Utf8PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
}

/// Runs fully described invocations to completion.
pub trait CommandRunner: Send + Sync {
    /// Runs the invocation and captures its outcome.
    ///
    /// # Errors
    ///
    /// Returns [`ExecError::Spawn`] when the program cannot be started.
    /// A child that starts but exits non-zero is reported through
    /// [`CommandOutput::success`], not as an error.
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput, ExecError>;
}

/// Runner that spawns real child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput, ExecError> {
        debug!(
            target: EXEC_TARGET,
            program = %invocation.program(),
            args = ?invocation.argv(),
            "running command"
        );
        let output = Command::new(invocation.program())
            .args(invocation.argv())
            .envs(invocation.environment().iter().map(|(k, v)| (k, v)))
            .output()
            .map_err(|source| ExecError::Spawn {
                program: invocation.program().clone(),
                source,
            })?;
        Ok(CommandOutput::new(
            output.status.success(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }
}

/// Replaces the current process image with the invocation.
///
/// Only returns on failure; on success the new program owns the process.
#[cfg(unix)]
pub fn hand_off(invocation: &Invocation) -> ExecError {
    use std::os::unix::process::CommandExt;

    let source = Command::new(invocation.program())
        .args(invocation.argv())
        .envs(invocation.environment().iter().map(|(k, v)| (k, v)))
        .exec();
    ExecError::Spawn {
        program: invocation.program().clone(),
        source,
    }
}

/// Runs the invocation to completion and exits with its status.
///
/// Only returns on failure; platforms without `exec` supervise the child
/// instead of replacing the process image.
#[cfg(not(unix))]
pub fn hand_off(invocation: &Invocation) -> ExecError {
    let status = Command::new(invocation.program())
        .args(invocation.argv())
        .envs(invocation.environment().iter().map(|(k, v)| (k, v)))
        .status();
    match status {
        Ok(status) => std::process::exit(status.code().unwrap_or(1)),
        Err(source) => ExecError::Spawn {
            program: invocation.program().clone(),
            source,
        },
    }
}
