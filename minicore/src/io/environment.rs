//! Command execution environments.
//!
//! The [`Environment`] trait decouples the agent loop from how commands are
//! actually run. [`LocalEnvironment`] runs them through a shell on this host;
//! tests use scripted environments that never spawn processes.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::interrupt::Interrupt;
use crate::io::config::EnvironmentConfig;
use crate::io::process::run_command_with_timeout;

/// Captured streams of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// Bytes the process layer discarded beyond its capture limit.
    pub dropped_bytes: usize,
}

impl ExecOutput {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            dropped_bytes: 0,
        }
    }
}

/// Result of [`Environment::execute`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    /// The command ran to completion. `exit_code` is `None` if a signal ended it.
    Exited {
        output: ExecOutput,
        exit_code: Option<i32>,
    },
    /// The command exceeded its timeout and was killed.
    TimedOut { output: ExecOutput },
    /// The command was killed by a forced interrupt.
    Interrupted { output: ExecOutput },
}

impl ExecOutcome {
    pub fn exited(stdout: impl Into<String>, stderr: impl Into<String>, exit_code: i32) -> Self {
        ExecOutcome::Exited {
            output: ExecOutput::new(stdout, stderr),
            exit_code: Some(exit_code),
        }
    }

    pub fn output(&self) -> &ExecOutput {
        match self {
            ExecOutcome::Exited { output, .. }
            | ExecOutcome::TimedOut { output }
            | ExecOutcome::Interrupted { output } => output,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            ExecOutcome::Exited { exit_code, .. } => *exit_code,
            ExecOutcome::TimedOut { .. } | ExecOutcome::Interrupted { .. } => None,
        }
    }
}

/// Abstraction over where and how commands run.
pub trait Environment {
    /// Run `command` in `cwd`, killing it after `timeout`.
    ///
    /// Timeouts and interrupts are outcomes, not errors. `Err` means the
    /// command could not be run at all.
    fn execute(&self, command: &str, cwd: &Path, timeout: Duration) -> Result<ExecOutcome>;
}

impl<T: Environment + ?Sized> Environment for Box<T> {
    fn execute(&self, command: &str, cwd: &Path, timeout: Duration) -> Result<ExecOutcome> {
        (**self).execute(command, cwd, timeout)
    }
}

impl<T: Environment + ?Sized> Environment for Arc<T> {
    fn execute(&self, command: &str, cwd: &Path, timeout: Duration) -> Result<ExecOutcome> {
        (**self).execute(command, cwd, timeout)
    }
}

/// Runs commands through a local shell (`bash -c` by default).
#[derive(Debug, Clone)]
pub struct LocalEnvironment {
    shell: Vec<String>,
    env: BTreeMap<String, String>,
    output_limit_bytes: usize,
    interrupt: Option<Interrupt>,
}

impl LocalEnvironment {
    pub fn new(config: &EnvironmentConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            env: config.env.clone(),
            output_limit_bytes: config.output_limit_bytes,
            interrupt: None,
        }
    }

    /// Kill in-flight commands when `interrupt` is forced.
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = Some(interrupt);
        self
    }

    fn build_command(&self, command: &str, cwd: &Path) -> Result<Command> {
        let (program, args) = self
            .shell
            .split_first()
            .ok_or_else(|| anyhow!("environment.shell must not be empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).arg(command).current_dir(cwd).envs(&self.env);
        Ok(cmd)
    }
}

impl Environment for LocalEnvironment {
    #[instrument(skip_all, fields(cwd = %cwd.display(), timeout_secs = timeout.as_secs()))]
    fn execute(&self, command: &str, cwd: &Path, timeout: Duration) -> Result<ExecOutcome> {
        if !cwd.is_dir() {
            return Err(anyhow!("working directory {} does not exist", cwd.display()));
        }
        debug!(command, "executing");
        let cmd = self.build_command(command, cwd)?;
        let out = run_command_with_timeout(
            cmd,
            None,
            timeout,
            self.output_limit_bytes,
            self.interrupt.as_ref(),
        )
        .with_context(|| format!("run command in {}", cwd.display()))?;

        let output = ExecOutput {
            stdout: out.stdout_lossy(),
            stderr: out.stderr_lossy(),
            dropped_bytes: out.stdout_truncated + out.stderr_truncated,
        };
        if out.interrupted {
            return Ok(ExecOutcome::Interrupted { output });
        }
        if out.timed_out {
            warn!(timeout_secs = timeout.as_secs(), "command timed out");
            return Ok(ExecOutcome::TimedOut { output });
        }
        Ok(ExecOutcome::Exited {
            output,
            exit_code: out.exit_code(),
        })
    }
}
