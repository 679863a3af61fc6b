//! JSON Lines event stream for supervising processes.
//!
//! Each record is one line: `{"type": ..., "timestamp": ..., "data": {...}}`.
//! Records are written and flushed in call order; a blocked reader blocks the
//! agent rather than losing events.

use std::io::Write;

use anyhow::{Context, Result, anyhow};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::core::types::{ErrorKind, StopReason};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartData {
    pub task: String,
    pub model: String,
    pub cwd: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThoughtData {
    pub content: String,
    pub step: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandData {
    pub command: String,
    pub cwd: String,
    pub step: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputData {
    pub stdout: String,
    pub stderr: String,
    /// `null` when the command was killed.
    pub exit_code: Option<i32>,
    pub truncated: bool,
    pub step: u32,
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Usage of one model call. Token counts are for the call, cost is given
/// both per call and cumulative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostData {
    pub step_cost: f64,
    pub total_cost: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub model: String,
    pub step: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    pub message: String,
    pub kind: ErrorKind,
    /// `null` for failures outside any step.
    pub step: Option<u32>,
    pub recoverable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishData {
    pub status: StopReason,
    pub result: String,
    pub total_steps: usize,
    pub total_cost: f64,
    pub duration_secs: f64,
    /// Path of the persisted trajectory, `null` if it could not be written.
    pub trajectory: Option<String>,
}

/// Lifecycle occurrences, in the order a run produces them.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Start(StartData),
    Thought(ThoughtData),
    Command(CommandData),
    Output(OutputData),
    Cost(CostData),
    Error(ErrorData),
    Finish(FinishData),
}

impl Event {
    /// Value of the record's `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Start(_) => "start",
            Event::Thought(_) => "thought",
            Event::Command(_) => "command",
            Event::Output(_) => "output",
            Event::Cost(_) => "cost",
            Event::Error(_) => "error",
            Event::Finish(_) => "finish",
        }
    }
}

#[derive(Serialize)]
struct Record<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    timestamp: Option<String>,
    data: &'a T,
}

fn render<T: Serialize>(kind: &str, timestamp: Option<String>, data: &T) -> Result<String> {
    serde_json::to_string(&Record {
        kind,
        timestamp,
        data,
    })
    .with_context(|| format!("serialize {kind} event"))
}

/// Render `event` as one JSON line (without the trailing newline).
pub fn render_event(event: &Event, timestamp: Option<String>) -> Result<String> {
    let kind = event.kind();
    match event {
        Event::Start(d) => render(kind, timestamp, d),
        Event::Thought(d) => render(kind, timestamp, d),
        Event::Command(d) => render(kind, timestamp, d),
        Event::Output(d) => render(kind, timestamp, d),
        Event::Cost(d) => render(kind, timestamp, d),
        Event::Error(d) => render(kind, timestamp, d),
        Event::Finish(d) => render(kind, timestamp, d),
    }
}

/// Writes events to `W`, one flushed line per call.
///
/// Nothing may follow `finish`: later emits are rejected.
pub struct EventEmitter<W: Write> {
    writer: W,
    include_timestamps: bool,
    emitted: usize,
    finished: bool,
}

impl<W: Write> EventEmitter<W> {
    pub fn new(writer: W, include_timestamps: bool) -> Self {
        Self {
            writer,
            include_timestamps,
            emitted: 0,
            finished: false,
        }
    }

    pub fn emit(&mut self, event: &Event) -> Result<()> {
        if self.finished {
            return Err(anyhow!("event stream already finished, dropped {}", event.kind()));
        }
        let timestamp = self
            .include_timestamps
            .then(|| Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        let mut line = render_event(event, timestamp)?;
        line.push('\n');
        self.writer
            .write_all(line.as_bytes())
            .with_context(|| format!("write {} event", event.kind()))?;
        self.writer
            .flush()
            .with_context(|| format!("flush {} event", event.kind()))?;
        self.emitted += 1;
        if matches!(event, Event::Finish(_)) {
            self.finished = true;
        }
        trace!(kind = event.kind(), seq = self.emitted, "event emitted");
        Ok(())
    }

    /// Number of events written so far.
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}
