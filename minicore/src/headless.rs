//! `mini run`: resolve config and workspace, then drive one agent run with the
//! event stream on stdout.
//!
//! Anything that goes wrong before the loop starts is reported as a single
//! `error` event and exit code [`INVALID`]. Once the loop runs, every outcome
//! (including model failures and interrupts) exits [`OK`]; the `finish`
//! event carries the status.

use std::env;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use tracing::{error, info, instrument, warn};

use crate::agent::AgentLoop;
use crate::core::types::Task;
use crate::exit_codes::{INVALID, OK};
use crate::interrupt::Interrupt;
use crate::io::config::{AgentConfig, CONFIG_DIR_ENV, ConfigLookup, Overrides, resolve_config};
use crate::io::environment::LocalEnvironment;
use crate::io::events::{ErrorData, Event, EventEmitter};
use crate::io::model::build_model;
use crate::io::signals;
use crate::io::workspace::ensure_workspace;

/// Inputs of one `mini run` invocation.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub task: Option<String>,
    /// Defaults to the current directory.
    pub workdir: Option<PathBuf>,
    pub profile: Option<String>,
    pub config: Option<PathBuf>,
    pub overrides: Overrides,
    /// Trajectory path; defaults to `.miniswe/data/last_run.traj.json`.
    pub output: Option<PathBuf>,
}

/// Everything the loop needs, resolved.
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub task: Task,
    pub config: AgentConfig,
    pub trajectory_path: PathBuf,
}

/// Validate `request` and resolve config and paths. `env` reads environment
/// variables.
pub fn prepare_run<F>(request: &RunRequest, env: F) -> Result<PreparedRun>
where
    F: Fn(&str) -> Option<String>,
{
    let task = request
        .task
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| anyhow!("missing --task: a task description is required"))?;

    let workdir = match &request.workdir {
        Some(dir) => dir.clone(),
        None => env::current_dir().context("read current directory")?,
    };
    if !workdir.is_dir() {
        return Err(anyhow!("workdir {} is not a directory", workdir.display()));
    }
    let workdir = workdir
        .canonicalize()
        .with_context(|| format!("resolve workdir {}", workdir.display()))?;

    let config_dir = env(CONFIG_DIR_ENV).map(PathBuf::from);
    let lookup = ConfigLookup {
        explicit: request.config.as_deref(),
        profile: request.profile.as_deref(),
        config_dir: config_dir.as_deref(),
        ..ConfigLookup::new(&workdir)
    };
    let (config, _source) = resolve_config(&lookup, &env, &request.overrides)?;

    let paths = ensure_workspace(&workdir)?;
    let trajectory_path = request
        .output
        .clone()
        .unwrap_or_else(|| paths.last_run_path.clone());

    Ok(PreparedRun {
        task: Task::new(task, &workdir),
        config,
        trajectory_path,
    })
}

/// Execute `mini run`, writing events to `out`. Returns the exit code.
#[instrument(skip_all)]
pub fn run<W: Write>(request: &RunRequest, mut out: W) -> i32 {
    let prepared = match prepare_run(request, |key| env::var(key).ok()) {
        Ok(prepared) => prepared,
        Err(err) => {
            report_setup_error(&mut out, &err);
            return INVALID;
        }
    };
    let model = match build_model(&prepared.config.model) {
        Ok(model) => model,
        Err(err) => {
            report_setup_error(&mut out, &err);
            return INVALID;
        }
    };

    let interrupt = Interrupt::new();
    if let Err(err) = signals::install(interrupt.clone()) {
        warn!(err = %format!("{err:#}"), "signal handling unavailable");
    }
    let environment =
        LocalEnvironment::new(&prepared.config.environment).with_interrupt(interrupt.clone());
    let emitter = EventEmitter::new(out, prepared.config.headless.include_timestamps);

    let outcome = AgentLoop::new(
        model,
        environment,
        &prepared.config,
        emitter,
        &prepared.trajectory_path,
    )
    .with_interrupt(interrupt)
    .run(prepared.task);

    info!(status = %outcome.status, steps = outcome.steps, "run complete");
    OK
}

/// Report a failure that happened before the loop as one `error` event.
fn report_setup_error<W: Write>(out: W, err: &anyhow::Error) {
    let message = err.to_string();
    let chain = format!("{err:#}");
    let mut emitter = EventEmitter::new(out, true);
    let emitted = emitter.emit(&Event::Error(ErrorData {
        kind: crate::agent::classify(err),
        step: None,
        recoverable: false,
        detail: (chain != message).then_some(chain),
        message,
    }));
    if let Err(emit_err) = emitted {
        error!(err = %format!("{emit_err:#}"), "failed to report setup error");
    }
}
