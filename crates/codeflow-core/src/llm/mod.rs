//! Language model abstraction used by the step executor.
//!
//! Defines the [`LLM`] trait and a plain HTTP client for endpoints that speak
//! the framework's own JSON shape. Provider-specific clients live under
//! [`providers`].

pub use crate::core_types::{LLMResponse, Message};
use crate::errors::PipelineError;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod providers;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

#[async_trait]
pub trait LLM: Send + Sync {
    async fn generate(
        &self,
        messages: Vec<Message>,
        tools: Option<Vec<ToolMetadata>>,
    ) -> Result<LLMResponse, PipelineError>;
}

pub struct HttpLLMClient {
    pub endpoint_url: String,
    model: String,
    client: Client,
}

impl HttpLLMClient {
    pub fn new(endpoint_url: String, model: String) -> Self {
        Self {
            endpoint_url,
            model,
            client: Client::new(),
        }
    }
}

#[async_trait]
impl LLM for HttpLLMClient {
    async fn generate(
        &self,
        messages: Vec<Message>,
        tools: Option<Vec<ToolMetadata>>,
    ) -> Result<LLMResponse, PipelineError> {
        #[derive(Serialize)]
        struct RequestPayload<'a> {
            model: &'a str,
            messages: &'a Vec<Message>,
            tools: Option<&'a Vec<ToolMetadata>>,
        }

        let payload = RequestPayload {
            model: &self.model,
            messages: &messages,
            tools: tools.as_ref(),
        };

        let request_url = format!(
            "{}/v1/chat/completions",
            self.endpoint_url.trim_end_matches('/')
        );
        log::debug!(
            "POST {} with {} messages (model {})",
            request_url,
            payload.messages.len(),
            self.model
        );

        let response = self
            .client
            .post(&request_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                let err_msg = format!("Chat endpoint {} unreachable: {}", request_url, e);
                log::error!("{}", err_msg);
                PipelineError::LLMError(err_msg)
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let err_msg = format!("Chat endpoint returned {}: {}", status, body);
            log::error!("{}", err_msg);
            return Err(PipelineError::LLMError(err_msg));
        }

        let llm_response = response.json::<LLMResponse>().await.map_err(|e| {
            let err_msg = format!("Chat endpoint sent an unreadable response: {}", e);
            log::error!("{}", err_msg);
            PipelineError::ParsingError(err_msg)
        })?;
        log::debug!(
            "Chat endpoint answered ({} tool calls, finish reason {:?})",
            llm_response.tool_calls.as_ref().map_or(0, Vec::len),
            llm_response.finish_reason
        );
        Ok(llm_response)
    }
}
