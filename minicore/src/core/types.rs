//! Shared types for the agent core.
//!
//! These types define the stable contracts between the loop, the recorder and
//! the event stream. Their serialized forms are part of the product output
//! (trajectory files and JSONL events), so renames are breaking changes.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The problem statement and the directory it must be solved in.
///
/// Set once at run start and never changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub problem_statement: String,
    pub cwd: PathBuf,
}

impl Task {
    pub fn new(problem_statement: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            problem_statement: problem_statement.into(),
            cwd: cwd.into(),
        }
    }
}

/// Conversation role for a model message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One entry of the conversation sent to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// What a command produced, as recorded on its step.
///
/// `exit_code` is `None` when the process was killed (timeout or forced
/// interrupt); `error` then carries the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One loop iteration.
///
/// Steps are appended by the agent loop and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// 1-based ordinal.
    pub step: u32,
    /// Raw model response text (empty if the model call failed).
    pub response: String,
    /// Parsed command, absent when parsing failed or the model signalled completion.
    pub command: Option<String>,
    /// Absent when the command was never run.
    pub output: Option<StepOutput>,
    pub truncated: bool,
    /// Corrective message sent back to the model when the response had no usable action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format_error: Option<String>,
    pub cost: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Step {
    /// An empty step for `ordinal`, filled in as the iteration progresses.
    pub fn new(ordinal: u32) -> Self {
        Self {
            step: ordinal,
            response: String::new(),
            command: None,
            output: None,
            truncated: false,
            format_error: None,
            cost: 0.0,
            input_tokens: 0,
            output_tokens: 0,
        }
    }
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    CostLimit,
    StepLimit,
    Error,
    Interrupted,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopReason::Completed => "completed",
            StopReason::CostLimit => "cost_limit",
            StopReason::StepLimit => "step_limit",
            StopReason::Error => "error",
            StopReason::Interrupted => "interrupted",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Agent loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Running,
    AwaitingModel,
    Executing,
    Stopped(StopReason),
}

impl AgentState {
    pub fn is_stopped(&self) -> bool {
        matches!(self, AgentState::Stopped(_))
    }
}

/// Error classification carried by `error` events and error stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Authentication, rate-limit or API failure surfaced by the model backend.
    ModelFailure,
    /// The response had zero or several actions.
    ParseAmbiguity,
    /// A command exceeded its timeout.
    ExecutionTimeout,
    /// Cost or step ceiling reached.
    BudgetExceeded,
    /// Anything else.
    Unclassified,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ModelFailure => "model_failure",
            ErrorKind::ParseAmbiguity => "parse_ambiguity",
            ErrorKind::ExecutionTimeout => "execution_timeout",
            ErrorKind::BudgetExceeded => "budget_exceeded",
            ErrorKind::Unclassified => "unclassified",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_reason_serializes_as_snake_case() {
        let json = serde_json::to_string(&StopReason::CostLimit).expect("serialize");
        assert_eq!(json, "\"cost_limit\"");
        assert_eq!(StopReason::StepLimit.to_string(), "step_limit");
    }

    #[test]
    fn message_roles_serialize_lowercase() {
        let json = serde_json::to_string(&Message::assistant("hi")).expect("serialize");
        assert_eq!(json, r#"{"role":"assistant","content":"hi"}"#);
    }

    #[test]
    fn step_output_omits_missing_error() {
        let output = StepOutput {
            stdout: "ok".to_string(),
            stderr: String::new(),
            exit_code: Some(0),
            error: None,
        };
        let json = serde_json::to_string(&output).expect("serialize");
        assert!(!json.contains("error"));
    }

    #[test]
    fn only_stopped_state_is_terminal() {
        assert!(!AgentState::Running.is_stopped());
        assert!(!AgentState::Executing.is_stopped());
        assert!(AgentState::Stopped(StopReason::Interrupted).is_stopped());
    }
}
