//! Model backend that delegates each query to a local program.
//!
//! The program receives `{"model": ..., "messages": [...]}` on stdin and must
//! print `{"content": ..., "input_tokens": ..., "output_tokens": ..., "cost": ...}`
//! on stdout. Token counts and cost are optional.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::core::types::Message;
use crate::io::config::ModelConfig;
use crate::io::model::pricing::CostCalculator;
use crate::io::model::{Model, ModelError, ModelResponse};
use crate::io::process::run_command_with_timeout;

const OUTPUT_LIMIT_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Serialize)]
struct CommandRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
}

#[derive(Debug, Deserialize)]
struct CommandReply {
    content: String,
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cost: Option<f64>,
}

pub struct CommandModel {
    program: Vec<String>,
    name: String,
    timeout: Duration,
    calculator: CostCalculator,
}

impl CommandModel {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        if config.command.is_empty() {
            return Err(anyhow!("model.command must be set for the command backend"));
        }
        Ok(Self {
            program: config.command.clone(),
            name: config.model_name.clone(),
            timeout: config.timeout(),
            calculator: CostCalculator::new(config),
        })
    }
}

impl Model for CommandModel {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(model = %self.name, program = %self.program[0]))]
    fn query(&self, messages: &[Message]) -> Result<ModelResponse> {
        let request = serde_json::to_vec(&CommandRequest {
            model: &self.name,
            messages,
        })
        .context("serialize model request")?;

        let mut cmd = Command::new(&self.program[0]);
        cmd.args(&self.program[1..]);
        let out = run_command_with_timeout(
            cmd,
            Some(&request),
            self.timeout,
            OUTPUT_LIMIT_BYTES,
            None,
        )
        .map_err(|e| ModelError::Api(format!("run model command {}: {e:#}", self.program[0])))?;

        if out.timed_out {
            warn!(timeout_secs = self.timeout.as_secs(), "model command timed out");
            return Err(ModelError::Api(format!(
                "model command timed out after {}s",
                self.timeout.as_secs()
            ))
            .into());
        }
        if out.exit_code() != Some(0) {
            let stderr = out.stderr_lossy();
            return Err(ModelError::Api(format!(
                "model command exited with {:?}: {}",
                out.exit_code(),
                stderr.trim()
            ))
            .into());
        }
        if out.stdout_truncated > 0 {
            return Err(ModelError::Api("model command output too large".to_string()).into());
        }

        let reply: CommandReply = serde_json::from_slice(&out.stdout)
            .map_err(|e| ModelError::Api(format!("malformed model command output: {e}")))?;
        let cost = self
            .calculator
            .price(reply.input_tokens, reply.output_tokens, reply.cost)?;
        debug!(cost, "model command reply parsed");
        Ok(ModelResponse {
            content: reply.content,
            input_tokens: reply.input_tokens,
            output_tokens: reply.output_tokens,
            cost,
        })
    }
}
