//! The agent loop: query the model, run its command, repeat until done.
//!
//! One [`AgentLoop`] drives one run. It owns the cost tracker, the event
//! emitter and (for the duration of [`AgentLoop::run`]) the trajectory
//! recorder. Every run, however it ends, emits `start` first and `finish`
//! last and leaves a finalized trajectory behind.

use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::core::cost::{Budget, CostTracker};
use crate::core::parser::{
    ParsedAction, completion_from_output, detect_completion, extract_thought, parse_action,
};
use crate::core::truncate::truncate_output;
use crate::core::types::{AgentState, ErrorKind, Message, Step, StepOutput, StopReason, Task};
use crate::interrupt::Interrupt;
use crate::io::config::{AgentConfig, AgentSettings};
use crate::io::environment::{Environment, ExecOutcome};
use crate::io::events::{
    CommandData, CostData, ErrorData, Event, EventEmitter, FinishData, OutputData, StartData,
    ThoughtData,
};
use crate::io::model::{Model, ModelError};
use crate::io::prompt::{Observation, PromptEngine};
use crate::io::trajectory::{RunSummary, TrajectoryRecorder};

/// Loop limits and knobs, taken from [`AgentConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct AgentOptions {
    pub budget: Budget,
    pub max_format_errors: u32,
    pub abort_on_timeout: bool,
    pub command_timeout: Duration,
    pub max_output_length: usize,
}

impl AgentOptions {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            budget: config.agent.budget(),
            max_format_errors: config.agent.max_format_errors,
            abort_on_timeout: config.agent.abort_on_timeout,
            command_timeout: config.environment.timeout(),
            max_output_length: config.headless.max_output_length,
        }
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub status: StopReason,
    pub result: String,
    pub steps: usize,
    pub total_cost: f64,
    /// `None` if the trajectory could not be written.
    pub trajectory: Option<PathBuf>,
    pub diagnostic: Option<String>,
}

/// Failures raised by the loop itself (as opposed to its collaborators).
#[derive(Debug, Error)]
enum LoopError {
    #[error("command timed out after {timeout_secs}s: {command}")]
    Timeout { command: String, timeout_secs: u64 },
    #[error("{count} consecutive responses without exactly one command")]
    FormatErrors { count: u32 },
    #[error("iteration panicked: {0}")]
    Panic(String),
}

/// Terminal error details carried to the `error` event and the trajectory.
#[derive(Debug, Clone)]
struct StopError {
    kind: ErrorKind,
    message: String,
    detail: Option<String>,
    step: Option<u32>,
}

impl StopError {
    fn from_anyhow(err: &anyhow::Error, step: Option<u32>) -> Self {
        let message = err.to_string();
        let chain = format!("{err:#}");
        Self {
            kind: classify(err),
            detail: (chain != message).then_some(chain),
            message,
            step,
        }
    }
}

/// Why and how the loop stopped.
#[derive(Debug, Clone)]
struct Stop {
    reason: StopReason,
    result: String,
    error: Option<StopError>,
}

impl Stop {
    fn completed(result: String) -> Self {
        Self {
            reason: StopReason::Completed,
            result,
            error: None,
        }
    }

    fn interrupted() -> Self {
        Self {
            reason: StopReason::Interrupted,
            result: String::new(),
            error: None,
        }
    }

    fn limit(reason: StopReason, message: String, step: u32) -> Self {
        Self {
            reason,
            result: message.clone(),
            error: Some(StopError {
                kind: ErrorKind::BudgetExceeded,
                message,
                detail: None,
                step: Some(step),
            }),
        }
    }

    fn failed(error: StopError) -> Self {
        Self {
            reason: StopReason::Error,
            result: error.message.clone(),
            error: Some(error),
        }
    }
}

/// Map an error to the taxonomy reported in `error` events.
pub fn classify(err: &anyhow::Error) -> ErrorKind {
    if err.downcast_ref::<ModelError>().is_some() {
        return ErrorKind::ModelFailure;
    }
    match err.downcast_ref::<LoopError>() {
        Some(LoopError::Timeout { .. }) => ErrorKind::ExecutionTimeout,
        Some(LoopError::FormatErrors { .. }) => ErrorKind::ParseAmbiguity,
        Some(LoopError::Panic(_)) | None => ErrorKind::Unclassified,
    }
}

pub struct AgentLoop<M: Model, E: Environment, W: Write> {
    model: M,
    env: E,
    settings: AgentSettings,
    options: AgentOptions,
    tracker: CostTracker,
    emitter: EventEmitter<W>,
    trajectory_path: PathBuf,
    interrupt: Interrupt,
    state: AgentState,
    messages: Vec<Message>,
    format_errors: u32,
}

impl<M: Model, E: Environment, W: Write> AgentLoop<M, E, W> {
    pub fn new(
        model: M,
        env: E,
        config: &AgentConfig,
        emitter: EventEmitter<W>,
        trajectory_path: impl Into<PathBuf>,
    ) -> Self {
        let options = AgentOptions::from_config(config);
        Self {
            model,
            env,
            settings: config.agent.clone(),
            tracker: CostTracker::new(options.budget),
            options,
            emitter,
            trajectory_path: trajectory_path.into(),
            interrupt: Interrupt::new(),
            state: AgentState::Running,
            messages: Vec::new(),
            format_errors: 0,
        }
    }

    /// Stop at the next iteration boundary once `interrupt` is requested.
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    /// Run `task` to a stop. Never fails: every problem becomes a stop reason.
    #[instrument(skip_all, fields(model = %self.model.name(), cwd = %task.cwd.display()))]
    pub fn run(mut self, task: Task) -> RunOutcome {
        let started = Instant::now();
        let mut recorder =
            TrajectoryRecorder::new(&self.trajectory_path, task.clone(), self.model.name());

        let mut stop = self.start(&task).err().map(|err| {
            error!(err = %format!("{err:#}"), "run setup failed");
            Stop::failed(StopError::from_anyhow(&err, None))
        });
        let mut prompts = None;
        if stop.is_none() {
            match self.initial_messages(&task) {
                Ok(engine) => prompts = Some(engine),
                Err(err) => stop = Some(Stop::failed(StopError::from_anyhow(&err, None))),
            }
        }
        recorder.set_messages(&self.messages);

        let mut ordinal = 0u32;
        while stop.is_none() {
            let Some(prompts) = prompts.as_ref() else {
                break;
            };
            if self.interrupt.is_requested() {
                info!(step = ordinal, "interrupt requested, not starting another step");
                stop = Some(Stop::interrupted());
                break;
            }

            ordinal += 1;
            self.transition(AgentState::Running);
            let mut step = Step::new(ordinal);
            let attempt =
                panic::catch_unwind(AssertUnwindSafe(|| self.iterate(&task, prompts, &mut step)))
                    .unwrap_or_else(|payload| {
                        Err(LoopError::Panic(panic_message(&*payload)).into())
                    });

            let appended = recorder.append(step);
            recorder.set_messages(&self.messages);

            stop = match (attempt, appended) {
                (Ok(Some(stop)), _) if stop.reason == StopReason::Completed => Some(stop),
                (Err(err), _) | (Ok(_), Err(err)) => {
                    warn!(step = ordinal, err = %format!("{err:#}"), "step failed");
                    Some(Stop::failed(StopError::from_anyhow(&err, Some(ordinal))))
                }
                (Ok(Some(stop)), Ok(())) => Some(stop),
                (Ok(None), Ok(())) => self.check_budget(ordinal),
            };
        }

        let stop = stop.unwrap_or_else(Stop::interrupted);
        self.finish(stop, recorder, started)
    }

    fn start(&mut self, task: &Task) -> Result<()> {
        info!(task_len = task.problem_statement.len(), "agent run starting");
        self.emitter.emit(&Event::Start(StartData {
            task: task.problem_statement.clone(),
            model: self.model.name().to_string(),
            cwd: task.cwd.display().to_string(),
        }))
    }

    fn initial_messages(&mut self, task: &Task) -> Result<PromptEngine> {
        let prompts = PromptEngine::new(task, &self.settings)?;
        self.messages = vec![
            Message::system(prompts.render_system()?),
            Message::user(prompts.render_instance()?),
        ];
        Ok(prompts)
    }

    /// One query/parse/execute pass. Fills `step` as it goes so a failure
    /// part-way still leaves a useful record.
    fn iterate(
        &mut self,
        task: &Task,
        prompts: &PromptEngine,
        step: &mut Step,
    ) -> Result<Option<Stop>> {
        let ordinal = step.step;

        self.transition(AgentState::AwaitingModel);
        let response = self.model.query(&self.messages)?;
        step.response = response.content.clone();
        step.input_tokens = response.input_tokens;
        step.output_tokens = response.output_tokens;
        step.cost = self
            .tracker
            .record(response.input_tokens, response.output_tokens, response.cost);
        self.messages.push(Message::assistant(&response.content));

        self.emitter.emit(&Event::Thought(ThoughtData {
            content: extract_thought(&response.content),
            step: ordinal,
        }))?;
        self.emitter.emit(&Event::Cost(CostData {
            step_cost: step.cost,
            total_cost: self.tracker.total_cost(),
            input_tokens: response.input_tokens,
            output_tokens: response.output_tokens,
            model: self.model.name().to_string(),
            step: ordinal,
        }))?;

        if let Some(summary) = detect_completion(&response.content) {
            info!(step = ordinal, "model declared completion");
            return Ok(Some(Stop::completed(summary)));
        }
        if self.interrupt.is_requested() {
            debug!(step = ordinal, "interrupted after model call");
            return Ok(Some(Stop::interrupted()));
        }

        match parse_action(&response.content) {
            ParsedAction::Command(command) => {
                self.format_errors = 0;
                step.command = Some(command.clone());
                self.execute(task, prompts, step, &command)
            }
            other => {
                self.format_errors += 1;
                let count = other.count();
                let correction = prompts.render_format_error(count)?;
                step.format_error = Some(correction.clone());
                if self.format_errors > self.options.max_format_errors {
                    return Err(LoopError::FormatErrors {
                        count: self.format_errors,
                    }
                    .into());
                }
                debug!(step = ordinal, count, consecutive = self.format_errors, "format error");
                self.messages.push(Message::user(correction));
                self.emitter.emit(&Event::Error(ErrorData {
                    message: format!("expected exactly one command block, found {count}"),
                    kind: ErrorKind::ParseAmbiguity,
                    step: Some(ordinal),
                    recoverable: true,
                    detail: None,
                }))?;
                Ok(None)
            }
        }
    }

    fn execute(
        &mut self,
        task: &Task,
        prompts: &PromptEngine,
        step: &mut Step,
        command: &str,
    ) -> Result<Option<Stop>> {
        let ordinal = step.step;
        self.transition(AgentState::Executing);
        self.emitter.emit(&Event::Command(CommandData {
            command: command.to_string(),
            cwd: task.cwd.display().to_string(),
            step: ordinal,
        }))?;

        let timeout = self.options.command_timeout;
        let executed =
            panic::catch_unwind(AssertUnwindSafe(|| self.env.execute(command, &task.cwd, timeout)))
                .unwrap_or_else(|payload| Err(LoopError::Panic(panic_message(&*payload)).into()));
        let outcome = match executed {
            Ok(outcome) => outcome,
            Err(err) => {
                // Every emitted command gets its output, even when nothing ran.
                let chain = format!("{err:#}");
                step.output = Some(StepOutput {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: None,
                    error: Some(chain.clone()),
                });
                self.emitter.emit(&Event::Output(OutputData {
                    stdout: String::new(),
                    stderr: String::new(),
                    exit_code: None,
                    truncated: false,
                    step: ordinal,
                    timed_out: false,
                    error: Some(chain),
                }))?;
                return Err(err);
            }
        };
        let raw = outcome.output();
        let (stdout, stdout_cut) = truncate_output(&raw.stdout, self.options.max_output_length);
        let (stderr, stderr_cut) = truncate_output(&raw.stderr, self.options.max_output_length);
        step.truncated = stdout_cut || stderr_cut || raw.dropped_bytes > 0;

        let (error, timed_out) = match &outcome {
            ExecOutcome::Exited { .. } => (None, false),
            ExecOutcome::TimedOut { .. } => (
                Some(format!("command timed out after {}s", timeout.as_secs())),
                true,
            ),
            ExecOutcome::Interrupted { .. } => {
                (Some("command killed by interrupt".to_string()), false)
            }
        };
        step.output = Some(StepOutput {
            stdout: stdout.clone(),
            stderr: stderr.clone(),
            exit_code: outcome.exit_code(),
            error: error.clone(),
        });
        self.emitter.emit(&Event::Output(OutputData {
            stdout: stdout.clone(),
            stderr: stderr.clone(),
            exit_code: outcome.exit_code(),
            truncated: step.truncated,
            step: ordinal,
            timed_out,
            error,
        }))?;

        match outcome {
            ExecOutcome::Exited { output, exit_code } => {
                if let Some(submission) = completion_from_output(&output.stdout) {
                    info!(step = ordinal, "command submitted final output");
                    return Ok(Some(Stop::completed(submission)));
                }
                let observation = prompts.render_observation(&Observation {
                    exit_code,
                    stdout: &stdout,
                    stderr: &stderr,
                    truncated: step.truncated,
                })?;
                self.messages.push(Message::user(observation));
                Ok(None)
            }
            ExecOutcome::TimedOut { .. } => {
                warn!(step = ordinal, timeout_secs = timeout.as_secs(), "command timed out");
                if self.options.abort_on_timeout {
                    return Err(LoopError::Timeout {
                        command: command.to_string(),
                        timeout_secs: timeout.as_secs(),
                    }
                    .into());
                }
                let message = prompts.render_timeout(command, timeout.as_secs(), &stdout)?;
                self.messages.push(Message::user(message));
                Ok(None)
            }
            ExecOutcome::Interrupted { .. } => Ok(Some(Stop::interrupted())),
        }
    }

    fn check_budget(&self, ordinal: u32) -> Option<Stop> {
        let budget = self.tracker.budget();
        if self.tracker.cost_limit_exceeded() {
            let message = format!(
                "cost limit ${:.4} exceeded (spent ${:.4})",
                budget.cost_limit,
                self.tracker.total_cost()
            );
            info!(step = ordinal, "{message}");
            return Some(Stop::limit(StopReason::CostLimit, message, ordinal));
        }
        if self.tracker.step_limit_reached(ordinal) {
            let message = format!("step limit of {} reached", budget.step_limit);
            info!(step = ordinal, "{message}");
            return Some(Stop::limit(StopReason::StepLimit, message, ordinal));
        }
        None
    }

    fn finish(
        mut self,
        stop: Stop,
        mut recorder: TrajectoryRecorder,
        started: Instant,
    ) -> RunOutcome {
        self.transition(AgentState::Stopped(stop.reason));

        if let Some(err) = &stop.error {
            let emitted = self.emitter.emit(&Event::Error(ErrorData {
                message: err.message.clone(),
                kind: err.kind,
                step: err.step,
                recoverable: false,
                detail: err.detail.clone(),
            }));
            if let Err(emit_err) = emitted {
                warn!(err = %format!("{emit_err:#}"), "failed to emit error event");
            }
        }

        let diagnostic = stop
            .error
            .as_ref()
            .filter(|_| stop.reason == StopReason::Error)
            .map(|err| err.detail.clone().unwrap_or_else(|| err.message.clone()));
        let total_steps = recorder.steps().len();
        let trajectory = match recorder.finalize(RunSummary {
            status: stop.reason,
            result: stop.result.clone(),
            cost: self.tracker.state(),
            diagnostic: diagnostic.clone(),
        }) {
            Ok(path) => Some(path),
            Err(err) => {
                error!(err = %format!("{err:#}"), "failed to save trajectory");
                None
            }
        };

        let duration_secs = started.elapsed().as_secs_f64();
        if let Err(err) = self.emitter.emit(&Event::Finish(FinishData {
            status: stop.reason,
            result: stop.result.clone(),
            total_steps,
            total_cost: self.tracker.total_cost(),
            duration_secs,
            trajectory: trajectory.as_ref().map(|p| p.display().to_string()),
        })) {
            error!(err = %format!("{err:#}"), "failed to emit finish event");
        }

        info!(
            status = %stop.reason,
            steps = total_steps,
            cost = self.tracker.total_cost(),
            duration_secs,
            "agent run finished"
        );
        RunOutcome {
            status: stop.reason,
            result: stop.result,
            steps: total_steps,
            total_cost: self.tracker.total_cost(),
            trajectory,
            diagnostic,
        }
    }

    fn transition(&mut self, next: AgentState) {
        debug!(from = ?self.state, to = ?next, "state transition");
        self.state = next;
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn errors_are_classified_by_origin() {
        let model: anyhow::Error = ModelError::RateLimit("429".to_string()).into();
        assert_eq!(classify(&model), ErrorKind::ModelFailure);

        let timeout: anyhow::Error = LoopError::Timeout {
            command: "sleep 9".to_string(),
            timeout_secs: 1,
        }
        .into();
        assert_eq!(classify(&timeout), ErrorKind::ExecutionTimeout);

        let format: anyhow::Error = LoopError::FormatErrors { count: 4 }.into();
        assert_eq!(classify(&format), ErrorKind::ParseAmbiguity);

        assert_eq!(classify(&anyhow!("disk full")), ErrorKind::Unclassified);
    }

    #[test]
    fn stop_error_keeps_context_chain_as_detail() {
        let err = anyhow!("permission denied").context("run command in /work");
        let stop = StopError::from_anyhow(&err, Some(3));
        assert_eq!(stop.message, "run command in /work");
        assert_eq!(
            stop.detail.as_deref(),
            Some("run command in /work: permission denied")
        );
        assert_eq!(stop.kind, ErrorKind::Unclassified);
    }

    #[test]
    fn panic_payloads_become_messages() {
        assert_eq!(panic_message(&"boom"), "boom");
        assert_eq!(panic_message(&"owned".to_string()), "owned");
        assert_eq!(panic_message(&42_u8), "unknown panic");
    }
}
