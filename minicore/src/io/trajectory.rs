//! Trajectory recording for one agent run.
//!
//! Steps and messages accumulate in memory; [`TrajectoryRecorder::finalize`]
//! writes a single JSON snapshot (temp file + rename). If a recorder is dropped
//! without being finalized, it writes an `error` snapshot on the way out.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::cost::CostState;
use crate::core::types::{Message, Step, StopReason, Task};
use crate::io::write_atomic;

/// Persisted form of a finished run (`*.traj.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub task: Task,
    pub model: String,
    /// RFC 3339.
    pub started_at: String,
    /// RFC 3339.
    pub ended_at: String,
    pub exit_status: StopReason,
    pub result: String,
    pub total_cost: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub model_calls: u32,
    pub steps: Vec<Step>,
    pub messages: Vec<Message>,
    /// Failure description for `error` stops.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<String>,
}

/// How the run ended, as handed to [`TrajectoryRecorder::finalize`].
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub status: StopReason,
    pub result: String,
    pub cost: CostState,
    pub diagnostic: Option<String>,
}

/// Append-only log of a run, persisted once.
#[derive(Debug)]
pub struct TrajectoryRecorder {
    path: PathBuf,
    task: Task,
    model: String,
    started_at: String,
    steps: Vec<Step>,
    messages: Vec<Message>,
    finalized: bool,
}

impl TrajectoryRecorder {
    pub fn new(path: impl Into<PathBuf>, task: Task, model: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            task,
            model: model.into(),
            started_at: now_rfc3339(),
            steps: Vec::new(),
            messages: Vec::new(),
            finalized: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append the next step. Ordinals must run 1, 2, 3, ... without gaps.
    pub fn append(&mut self, step: Step) -> Result<()> {
        if self.finalized {
            return Err(anyhow!("trajectory already finalized"));
        }
        let expected = self.steps.len() as u32 + 1;
        if step.step != expected {
            return Err(anyhow!(
                "step ordinal {} out of order, expected {expected}",
                step.step
            ));
        }
        self.steps.push(step);
        Ok(())
    }

    /// Replace the recorded conversation with `messages`.
    pub fn set_messages(&mut self, messages: &[Message]) {
        self.messages = messages.to_vec();
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    /// Write the snapshot. Only the first call does anything; later calls fail.
    pub fn finalize(&mut self, summary: RunSummary) -> Result<PathBuf> {
        if self.finalized {
            return Err(anyhow!("trajectory already finalized"));
        }
        self.finalized = true;

        let trajectory = Trajectory {
            task: self.task.clone(),
            model: self.model.clone(),
            started_at: self.started_at.clone(),
            ended_at: now_rfc3339(),
            exit_status: summary.status,
            result: summary.result,
            total_cost: summary.cost.total_cost,
            input_tokens: summary.cost.input_tokens,
            output_tokens: summary.cost.output_tokens,
            model_calls: summary.cost.calls,
            steps: std::mem::take(&mut self.steps),
            messages: std::mem::take(&mut self.messages),
            diagnostic: summary.diagnostic,
        };
        let written = write_trajectory(&self.path, &trajectory);
        let status = trajectory.exit_status;
        self.steps = trajectory.steps;
        written?;
        info!(
            path = %self.path.display(),
            status = %status,
            steps = self.steps.len(),
            "trajectory saved"
        );
        Ok(self.path.clone())
    }

    /// Totals reconstructed from the recorded steps.
    fn cost_from_steps(&self) -> CostState {
        self.steps.iter().fold(CostState::default(), |mut acc, step| {
            acc.input_tokens += step.input_tokens;
            acc.output_tokens += step.output_tokens;
            acc.total_cost += step.cost;
            acc.calls += 1;
            acc
        })
    }
}

impl Drop for TrajectoryRecorder {
    fn drop(&mut self) {
        if self.finalized {
            return;
        }
        warn!(path = %self.path.display(), "trajectory dropped without finalize, saving");
        let summary = RunSummary {
            status: StopReason::Error,
            result: String::new(),
            cost: self.cost_from_steps(),
            diagnostic: Some("run ended before the trajectory was finalized".to_string()),
        };
        if let Err(err) = self.finalize(summary) {
            warn!(err = %format!("{err:#}"), "failed to save trajectory on drop");
        }
    }
}

/// Load a saved trajectory.
pub fn load_trajectory(path: &Path) -> Result<Trajectory> {
    debug!(path = %path.display(), "loading trajectory");
    let contents =
        fs::read_to_string(path).with_context(|| format!("read trajectory {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse trajectory {}", path.display()))
}

fn write_trajectory(path: &Path, trajectory: &Trajectory) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(trajectory).context("serialize trajectory")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
