//! OpenAI-compatible chat completions backend.
//!
//! Works against api.openai.com or any proxy that speaks the same protocol
//! (`model.api_base` / `MINI_API_BASE`).

use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::types::Message;
use crate::io::config::ModelConfig;
use crate::io::model::pricing::CostCalculator;
use crate::io::model::{Model, ModelError, ModelResponse, split_model_name};

const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";

/// Key sent to proxies that do their own auth.
const PROXY_PLACEHOLDER_KEY: &str = "sk-proxy-placeholder";

/// Exponential backoff for retryable failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            min_delay: Duration::from_secs(4),
            max_delay: Duration::from_secs(60),
        }
    }

    /// Delay after the `attempt`-th failure (1-based): `2^(attempt-1)` seconds,
    /// clamped to `[min_delay, max_delay]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let secs = 1u64
            .checked_shl(attempt.saturating_sub(1).min(63))
            .unwrap_or(u64::MAX);
        Duration::from_secs(secs).clamp(self.min_delay, self.max_delay.max(self.min_delay))
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// Outcome of a single HTTP attempt that did not succeed.
#[derive(Debug, PartialEq, Eq)]
enum Failure {
    Retry(ModelError),
    Fatal(ModelError),
}

/// Model served over an OpenAI-compatible HTTP API.
pub struct OpenAiModel {
    client: Client,
    endpoint: String,
    api_base: Option<String>,
    api_key: Option<String>,
    name: String,
    request_model: String,
    temperature: f64,
    max_tokens: Option<u32>,
    retry: RetryPolicy,
    calculator: CostCalculator,
}

impl OpenAiModel {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .context("build HTTP client")?;
        let base = config
            .api_base
            .as_deref()
            .unwrap_or(DEFAULT_API_BASE)
            .trim_end_matches('/');
        let api_key = match (&config.api_key, &config.api_base) {
            (Some(key), _) => Some(key.clone()),
            (None, Some(_)) => {
                debug!("injecting placeholder API key for proxy");
                Some(PROXY_PLACEHOLDER_KEY.to_string())
            }
            (None, None) => None,
        };
        let (provider, bare) = split_model_name(&config.model_name);
        if let Some(provider) = provider {
            debug!(provider, model = bare, "using explicit provider prefix");
        }
        Ok(Self {
            client,
            endpoint: format!("{base}/chat/completions"),
            api_base: config.api_base.clone(),
            api_key,
            name: config.model_name.clone(),
            request_model: bare.to_string(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            retry: RetryPolicy::new(config.retry_attempts),
            calculator: CostCalculator::new(config),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn send_once(&self, request: &ChatRequest<'_>) -> Result<ChatResponse, Failure> {
        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().map_err(|e| {
            Failure::Retry(ModelError::Api(format!("request to {} failed: {e}", self.endpoint)))
        })?;
        let status = response.status().as_u16();
        let body = response.text().map_err(|e| {
            Failure::Retry(ModelError::Api(format!("read response body: {e}")))
        })?;
        if !(200..300).contains(&status) {
            return Err(classify_status(status, &body, self.api_base.as_deref()));
        }
        parse_response(&body).map_err(Failure::Fatal)
    }
}

impl Model for OpenAiModel {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(model = %self.name, messages = messages.len()))]
    fn query(&self, messages: &[Message]) -> Result<ModelResponse> {
        let request = ChatRequest {
            model: &self.request_model,
            messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
        };

        let mut attempt = 1;
        let parsed = loop {
            match self.send_once(&request) {
                Ok(parsed) => break parsed,
                Err(Failure::Retry(err)) if attempt < self.retry.attempts => {
                    let delay = self.retry.delay(attempt);
                    warn!(attempt, delay_secs = delay.as_secs(), err = %err, "retrying model query");
                    thread::sleep(delay);
                    attempt += 1;
                }
                Err(Failure::Retry(err) | Failure::Fatal(err)) => {
                    warn!(attempt, err = %err, "model query failed");
                    return Err(err.into());
                }
            }
        };

        let usage = parsed.usage.unwrap_or_default();
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        let cost = self
            .calculator
            .price(usage.prompt_tokens, usage.completion_tokens, None)?;
        info!(
            input_tokens = usage.prompt_tokens,
            output_tokens = usage.completion_tokens,
            cost,
            "model query complete"
        );
        Ok(ModelResponse {
            content,
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            cost,
        })
    }
}

fn classify_status(status: u16, body: &str, api_base: Option<&str>) -> Failure {
    let detail = body.chars().take(500).collect::<String>();
    match status {
        401 | 403 => {
            let mut message = format!("status {status}: {detail}");
            if let Some(base) = api_base {
                message.push_str(&format!(" (API base: {base})"));
            }
            message.push_str(". Set MINI_API_KEY or model.api_key.");
            Failure::Fatal(ModelError::Authentication(message))
        }
        429 => Failure::Retry(ModelError::RateLimit(format!("status 429: {detail}"))),
        500..=599 => Failure::Retry(ModelError::Api(format!("status {status}: {detail}"))),
        _ => Failure::Fatal(ModelError::Api(format!("status {status}: {detail}"))),
    }
}

fn parse_response(body: &str) -> Result<ChatResponse, ModelError> {
    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| ModelError::Api(format!("malformed response: {e}")))?;
    if parsed.choices.is_empty() {
        return Err(ModelError::Api("response contained no choices".to_string()));
    }
    Ok(parsed)
}
