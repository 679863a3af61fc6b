//! Test-only helpers: scripted collaborators and an in-memory event sink.

use std::collections::VecDeque;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde_json::Value;
use tempfile::TempDir;

use crate::agent::{AgentLoop, RunOutcome};
use crate::core::parser::format_action;
use crate::core::types::{Message, Task};
use crate::interrupt::Interrupt;
use crate::io::config::AgentConfig;
use crate::io::environment::{Environment, ExecOutcome};
use crate::io::events::EventEmitter;
use crate::io::model::{Model, ModelError, ModelResponse};

/// One queued model answer.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text { content: String, cost: f64 },
    Fail(ModelError),
    /// Panic inside `query`, as a buggy backend would.
    Panic(String),
}

/// A response proposing `command`, costing `cost`.
pub fn command_reply(command: &str, cost: f64) -> ScriptedReply {
    ScriptedReply::Text {
        content: format!("Running the next command.\n\n{}", format_action(command)),
        cost,
    }
}

/// A free-form response costing `cost`.
pub fn text_reply(content: &str, cost: f64) -> ScriptedReply {
    ScriptedReply::Text {
        content: content.to_string(),
        cost,
    }
}

/// Model that answers from a queue and records every conversation it saw.
///
/// An exhausted queue is an (unclassified) error.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<ScriptedReply>>,
    seen: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Conversations passed to `query`, one per call.
    pub fn conversations(&self) -> Vec<Vec<Message>> {
        self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
    }
}

impl Model for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    fn query(&self, messages: &[Message]) -> Result<ModelResponse> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(messages.to_vec());
        }
        let reply = self
            .replies
            .lock()
            .map_err(|_| anyhow!("scripted model lock poisoned"))?
            .pop_front()
            .ok_or_else(|| anyhow!("scripted model has no replies left"))?;
        match reply {
            ScriptedReply::Text { content, cost } => Ok(ModelResponse {
                input_tokens: 100,
                output_tokens: content.len() as u64,
                content,
                cost,
            }),
            ScriptedReply::Fail(err) => Err(err.into()),
            ScriptedReply::Panic(message) => panic!("{message}"),
        }
    }
}

/// One queued command result.
#[derive(Debug, Clone)]
pub enum ScriptedExec {
    Outcome(ExecOutcome),
    Fail(String),
    /// Panic inside `execute`.
    Panic(String),
    /// Request (or force) `interrupt` while "running", then return `outcome`.
    Interrupting {
        interrupt: Interrupt,
        force: bool,
        outcome: ExecOutcome,
    },
}

/// Environment that answers from a queue and records the commands it ran.
///
/// An exhausted queue answers every command with exit code 0 and no output.
pub struct ScriptedEnvironment {
    results: Mutex<VecDeque<ScriptedExec>>,
    commands: Mutex<Vec<(String, PathBuf, Duration)>>,
}

impl ScriptedEnvironment {
    pub fn new(results: Vec<ScriptedExec>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            commands: Mutex::new(Vec::new()),
        }
    }

    /// Commands run so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .map(|c| c.iter().map(|(command, _, _)| command.clone()).collect())
            .unwrap_or_default()
    }

    /// Timeout passed with each command.
    pub fn timeouts(&self) -> Vec<Duration> {
        self.commands
            .lock()
            .map(|c| c.iter().map(|(_, _, timeout)| *timeout).collect())
            .unwrap_or_default()
    }
}

impl Environment for ScriptedEnvironment {
    fn execute(&self, command: &str, cwd: &Path, timeout: Duration) -> Result<ExecOutcome> {
        if let Ok(mut commands) = self.commands.lock() {
            commands.push((command.to_string(), cwd.to_path_buf(), timeout));
        }
        let next = self
            .results
            .lock()
            .map_err(|_| anyhow!("scripted environment lock poisoned"))?
            .pop_front();
        match next {
            None => Ok(ExecOutcome::exited("", "", 0)),
            Some(ScriptedExec::Outcome(outcome)) => Ok(outcome),
            Some(ScriptedExec::Fail(message)) => Err(anyhow!(message)),
            Some(ScriptedExec::Panic(message)) => panic!("{message}"),
            Some(ScriptedExec::Interrupting {
                interrupt,
                force,
                outcome,
            }) => {
                if force {
                    interrupt.force();
                } else {
                    interrupt.request();
                }
                Ok(outcome)
            }
        }
    }
}

/// Environment whose every command fails to start.
#[derive(Debug, Clone)]
pub struct FailingEnvironment {
    message: String,
}

impl FailingEnvironment {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Environment for FailingEnvironment {
    fn execute(&self, _command: &str, cwd: &Path, _timeout: Duration) -> Result<ExecOutcome> {
        Err(anyhow!("{}", self.message))
            .with_context(|| format!("run command in {}", cwd.display()))
    }
}

/// Shared in-memory writer for the event stream.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        self.buffer
            .lock()
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default()
    }

    /// Every record written so far, parsed.
    pub fn events(&self) -> Vec<Value> {
        self.contents()
            .lines()
            .map(|line| serde_json::from_str(line).expect("event line should be JSON"))
            .collect()
    }

    /// The `type` of every record, in order.
    pub fn kinds(&self) -> Vec<String> {
        self.events()
            .iter()
            .map(|e| e["type"].as_str().unwrap_or_default().to_string())
            .collect()
    }
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer
            .lock()
            .map_err(|_| io::Error::other("sink lock poisoned"))?
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A temporary task directory plus the config a test run uses.
pub struct TestRun {
    pub dir: TempDir,
    pub config: AgentConfig,
    pub sink: MemorySink,
}

impl TestRun {
    /// Timestamps off and no cost limit, so event streams are comparable.
    pub fn new() -> Result<Self> {
        let mut config = AgentConfig::default();
        config.headless.include_timestamps = false;
        config.agent.cost_limit = 0.0;
        Ok(Self {
            dir: tempfile::tempdir()?,
            config,
            sink: MemorySink::new(),
        })
    }

    pub fn task(&self) -> Task {
        Task::new("Fix the failing test", self.dir.path())
    }

    pub fn trajectory_path(&self) -> PathBuf {
        self.dir.path().join("run.traj.json")
    }

    /// Build a loop over `model` and `env` writing into this run's sink.
    pub fn agent<M: Model, E: Environment>(
        &self,
        model: M,
        env: E,
    ) -> AgentLoop<M, E, MemorySink> {
        let emitter = EventEmitter::new(
            self.sink.clone(),
            self.config.headless.include_timestamps,
        );
        AgentLoop::new(model, env, &self.config, emitter, self.trajectory_path())
    }

    /// Run to completion with fresh scripted collaborators.
    pub fn run(&self, replies: Vec<ScriptedReply>, execs: Vec<ScriptedExec>) -> RunOutcome {
        self.agent(ScriptedModel::new(replies), ScriptedEnvironment::new(execs))
            .run(self.task())
    }
}
