//! Model abstraction for querying a language model.
//!
//! The [`Model`] trait decouples the agent loop from the backend that answers
//! queries. Backends are selected by `model.backend` in the config; tests use
//! scripted models that return predetermined responses.

pub mod command;
pub mod openai;
pub mod pricing;

use std::sync::Arc;

use anyhow::Result;
use thiserror::Error;

use crate::core::types::Message;
use crate::io::config::{ModelBackend, ModelConfig};

pub use command::CommandModel;
pub use openai::OpenAiModel;
pub use pricing::{CostCalculator, ModelPricing, PricingTable};

/// One completed model call.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Dollar cost of this call.
    pub cost: f64,
}

/// Classified model failure.
///
/// Backends return these inside `anyhow::Error`; the agent loop downcasts to
/// tell model failures apart from everything else.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("authentication failed: {0}")]
    Authentication(String),
    #[error("rate limited: {0}")]
    RateLimit(String),
    #[error("model API error: {0}")]
    Api(String),
    #[error("cost calculation failed: {0}")]
    Cost(String),
}

impl ModelError {
    /// Worth another attempt with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ModelError::RateLimit(_))
    }
}

/// Abstraction over model backends.
pub trait Model {
    /// Configured model name, as reported in events and the trajectory.
    fn name(&self) -> &str;

    /// Answer `messages`. Retryable failures are retried internally; an `Err`
    /// here is final.
    fn query(&self, messages: &[Message]) -> Result<ModelResponse>;
}

impl<T: Model + ?Sized> Model for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn query(&self, messages: &[Message]) -> Result<ModelResponse> {
        (**self).query(messages)
    }
}

impl<T: Model + ?Sized> Model for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn query(&self, messages: &[Message]) -> Result<ModelResponse> {
        (**self).query(messages)
    }
}

/// Build the backend named by `config.backend`.
pub fn build_model(config: &ModelConfig) -> Result<Box<dyn Model>> {
    let model: Box<dyn Model> = match config.backend {
        ModelBackend::Openai => Box::new(OpenAiModel::new(config)?),
        ModelBackend::Command => Box::new(CommandModel::new(config)?),
    };
    Ok(model)
}

/// Split `provider/model` into its parts. Names without a `/` have no provider.
pub fn split_model_name(name: &str) -> (Option<&str>, &str) {
    match name.split_once('/') {
        Some((provider, model)) if !provider.is_empty() && !model.is_empty() => {
            (Some(provider), model)
        }
        _ => (None, name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_prefix_is_split_once() {
        assert_eq!(split_model_name("gpt-4o"), (None, "gpt-4o"));
        assert_eq!(
            split_model_name("openai/gpt-4o"),
            (Some("openai"), "gpt-4o")
        );
        assert_eq!(
            split_model_name("openrouter/meta-llama/llama-3.1-8b"),
            (Some("openrouter"), "meta-llama/llama-3.1-8b")
        );
        assert_eq!(split_model_name("/gpt-4o"), (None, "/gpt-4o"));
    }

    #[test]
    fn model_errors_downcast_through_anyhow() {
        let err: anyhow::Error = ModelError::Authentication("bad key".to_string()).into();
        let err = err.context("query model");
        assert_eq!(
            err.downcast_ref::<ModelError>(),
            Some(&ModelError::Authentication("bad key".to_string()))
        );
        assert!(!ModelError::Api("boom".to_string()).is_retryable());
        assert!(ModelError::RateLimit("slow".to_string()).is_retryable());
    }
}
