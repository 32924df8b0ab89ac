//! LLM provider implementations
//!
//! Each provider implements the common LLM trait while handling its own
//! protocol and authentication.

use std::sync::Arc;

use crate::config::{LlmConfig, LlmProvider};
use crate::errors::PipelineError;
use crate::llm::{HttpLLMClient, LLM};

pub mod gemini;

/// Create an LLM client based on the provider configuration
pub fn create_llm_client(config: &LlmConfig) -> Result<Arc<dyn LLM>, PipelineError> {
    validate_provider_config(config)?;
    match &config.provider {
        LlmProvider::Gemini => gemini::create_client(config),
        LlmProvider::Custom { base_url } => Ok(Arc::new(HttpLLMClient::new(
            base_url.clone(),
            config.model.clone(),
        ))),
    }
}

/// Validate provider-specific configuration
pub fn validate_provider_config(config: &LlmConfig) -> Result<(), PipelineError> {
    if config.model.trim().is_empty() {
        return Err(PipelineError::ConfigError(
            "LLM model cannot be empty".to_string(),
        ));
    }
    match &config.provider {
        LlmProvider::Gemini => {
            if config.auth.api_key.is_none() {
                return Err(PipelineError::CapabilityUnavailable(
                    "No API key found for Gemini. Set GOOGLE_API_KEY or GEMINI_API_KEY, or provide llm.auth.api_key".to_string(),
                ));
            }
        }
        LlmProvider::Custom { base_url } => {
            if base_url.is_empty() {
                return Err(PipelineError::ConfigError(
                    "Custom provider requires a valid 'base_url'".to_string(),
                ));
            }
        }
    }
    Ok(())
}
