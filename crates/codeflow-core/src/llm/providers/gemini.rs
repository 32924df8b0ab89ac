//! Gemini provider for the step executor.
//!
//! Talks to the `generateContent` endpoint of the Generative Language API.
//! Tool calls map to Gemini function declarations; prompt-level blocks are
//! turned into a refusal finish reason so the step executor can report them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{LlmConfig, LlmProvider, ModelParameters};
use crate::core_types::{LLMResponse, Message, Role, ToolCall, Usage};
use crate::errors::PipelineError;
use crate::llm::{ToolMetadata, LLM};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// `LLM` backed by Gemini `generateContent`.
pub struct GeminiClient {
    api_key: String,
    model: String,
    client: Client,
    base_url: String,
    parameters: ModelParameters,
}

impl GeminiClient {
    /// Client for the public endpoint.
    pub fn new(api_key: String, model: String) -> Self {
        Self::with_base_url(api_key, model, DEFAULT_BASE_URL.to_string())
    }

    /// Client for a proxy or mock that speaks the same wire format.
    pub fn with_base_url(api_key: String, model: String, base_url: String) -> Self {
        Self {
            api_key,
            model,
            client: Client::new(),
            base_url,
            parameters: ModelParameters::default(),
        }
    }

    pub fn with_parameters(mut self, parameters: ModelParameters) -> Self {
        self.parameters = parameters;
        self
    }
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GeminiGenerationConfig,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<GeminiTool>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
enum GeminiPart {
    Text {
        text: String,
    },
    FunctionCall {
        #[serde(rename = "functionCall")]
        function_call: GeminiFunctionCall,
    },
    FunctionResponse {
        #[serde(rename = "functionResponse")]
        function_response: GeminiFunctionResponse,
    },
    // thoughts, inline data and anything newer than this client
    Other(Value),
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiFunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
struct GeminiGenerationConfig {
    temperature: f32,
    #[serde(rename = "maxOutputTokens")]
    max_output_tokens: u32,
    #[serde(rename = "topP")]
    top_p: f32,
}

#[derive(Debug, Serialize)]
struct GeminiTool {
    #[serde(rename = "functionDeclarations")]
    function_declarations: Vec<GeminiFunctionDeclaration>,
}

#[derive(Debug, Serialize)]
struct GeminiFunctionDeclaration {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata", default)]
    usage_metadata: Option<GeminiUsage>,
    #[serde(rename = "promptFeedback", default)]
    prompt_feedback: Option<GeminiPromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    #[serde(default)]
    content: Option<GeminiContent>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiPromptFeedback {
    #[serde(rename = "blockReason")]
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiUsage {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: Option<i32>,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: Option<i32>,
    #[serde(rename = "totalTokenCount", default)]
    total_token_count: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    error: GeminiErrorDetails,
}

#[derive(Debug, Deserialize)]
struct GeminiErrorDetails {
    code: u16,
    message: String,
}

impl GeminiClient {
    fn convert_messages_to_gemini_contents(
        &self,
        messages: Vec<Message>,
    ) -> (Option<GeminiContent>, Vec<GeminiContent>) {
        let mut system_instruction = None;
        let mut contents = Vec::new();
        // functionResponse must carry the function name, not the call id
        let mut call_names: HashMap<String, String> = HashMap::new();

        for message in messages {
            match message.role {
                Role::System => {
                    system_instruction = Some(GeminiContent {
                        role: None,
                        parts: vec![GeminiPart::Text {
                            text: message.content,
                        }],
                    });
                }
                Role::User => {
                    contents.push(GeminiContent {
                        role: Some("user".to_string()),
                        parts: vec![GeminiPart::Text {
                            text: message.content,
                        }],
                    });
                }
                Role::Assistant => {
                    let mut parts = Vec::new();
                    if !message.content.is_empty() {
                        parts.push(GeminiPart::Text {
                            text: message.content,
                        });
                    }
                    for tool_call in message.tool_calls.iter().flatten() {
                        if let Some(id) = &tool_call.id {
                            call_names.insert(id.clone(), tool_call.name.clone());
                        }
                        parts.push(GeminiPart::FunctionCall {
                            function_call: GeminiFunctionCall {
                                name: tool_call.name.clone(),
                                args: tool_call.arguments.clone(),
                            },
                        });
                    }
                    contents.push(GeminiContent {
                        role: Some("model".to_string()),
                        parts,
                    });
                }
                Role::Tool => {
                    let name = message
                        .tool_call_id
                        .as_ref()
                        .and_then(|id| call_names.get(id).cloned())
                        .or_else(|| message.tool_call_id.clone())
                        .unwrap_or_else(|| "tool".to_string());
                    contents.push(GeminiContent {
                        role: Some("function".to_string()),
                        parts: vec![GeminiPart::FunctionResponse {
                            function_response: GeminiFunctionResponse {
                                name,
                                response: serde_json::json!({ "content": message.content }),
                            },
                        }],
                    });
                }
            }
        }

        (system_instruction, contents)
    }

    fn convert_tools_to_gemini(&self, tools: Vec<ToolMetadata>) -> Vec<GeminiTool> {
        if tools.is_empty() {
            return vec![];
        }

        let function_declarations = tools
            .into_iter()
            .map(|tool| GeminiFunctionDeclaration {
                name: tool.name,
                description: tool.description,
                parameters: tool.input_schema,
            })
            .collect();

        vec![GeminiTool {
            function_declarations,
        }]
    }

    fn convert_gemini_response_to_llm(
        &self,
        response: GeminiResponse,
    ) -> Result<LLMResponse, PipelineError> {
        let usage = response.usage_metadata.map(|u| Usage {
            prompt_tokens: u.prompt_token_count.unwrap_or(0) as u32,
            completion_tokens: u.candidates_token_count.unwrap_or(0) as u32,
            total_tokens: u.total_token_count.unwrap_or(0) as u32,
        });

        let candidate = match response.candidates.into_iter().next() {
            Some(candidate) => candidate,
            None => {
                let block_reason = response.prompt_feedback.and_then(|f| f.block_reason);
                return match block_reason {
                    Some(reason) => Ok(LLMResponse {
                        content: None,
                        tool_calls: None,
                        finish_reason: Some(map_block_reason(&reason)),
                        usage,
                    }),
                    None => Err(PipelineError::LLMError(
                        "No candidates in Gemini response".to_string(),
                    )),
                };
            }
        };

        let mut content_parts = Vec::new();
        let mut tool_calls = Vec::new();

        for part in candidate.content.map(|c| c.parts).unwrap_or_default() {
            match part {
                GeminiPart::Text { text } => content_parts.push(text),
                GeminiPart::FunctionCall { function_call } => {
                    tool_calls.push(ToolCall {
                        id: Some(format!("call_{}", uuid::Uuid::new_v4().simple())),
                        name: function_call.name,
                        arguments: function_call.args,
                    });
                }
                GeminiPart::FunctionResponse { .. } | GeminiPart::Other(_) => continue,
            }
        }

        let content = if content_parts.is_empty() {
            None
        } else {
            Some(content_parts.join(""))
        };

        let tool_calls = if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        };

        Ok(LLMResponse {
            content,
            tool_calls,
            finish_reason: candidate.finish_reason,
            usage,
        })
    }
}

fn map_block_reason(reason: &str) -> String {
    match reason {
        "BLOCKLIST" | "PROHIBITED_CONTENT" => reason.to_string(),
        _ => "SAFETY".to_string(),
    }
}

#[async_trait]
impl LLM for GeminiClient {
    async fn generate(
        &self,
        messages: Vec<Message>,
        tools: Option<Vec<ToolMetadata>>,
    ) -> Result<LLMResponse, PipelineError> {
        let (system_instruction, contents) = self.convert_messages_to_gemini_contents(messages);

        let generation_config = GeminiGenerationConfig {
            temperature: self.parameters.temperature,
            max_output_tokens: self.parameters.max_tokens,
            top_p: self.parameters.top_p,
        };

        let tools_gemini = tools
            .map(|t| self.convert_tools_to_gemini(t))
            .filter(|t| !t.is_empty());

        let request = GeminiRequest {
            contents,
            generation_config,
            system_instruction,
            tools: tools_gemini,
        };

        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url.trim_end_matches('/'),
            self.model
        );
        log::debug!("Gemini request to {} for model {}", url, self.model);

        let response = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| PipelineError::LLMError(format!("Gemini API request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            if let Ok(gemini_error) = serde_json::from_str::<GeminiError>(&error_text) {
                return Err(PipelineError::LLMError(format!(
                    "Gemini API error {}: {}",
                    gemini_error.error.code, gemini_error.error.message
                )));
            }

            return Err(PipelineError::LLMError(format!(
                "Gemini API request failed with status {}: {}",
                status, error_text
            )));
        }

        let gemini_response: GeminiResponse = response.json().await.map_err(|e| {
            PipelineError::ParsingError(format!("Failed to parse Gemini response: {}", e))
        })?;

        self.convert_gemini_response_to_llm(gemini_response)
    }
}

/// Create a Gemini LLM client from configuration. The API key must already
/// be resolved by the config loader.
pub fn create_client(config: &LlmConfig) -> Result<Arc<dyn LLM>, PipelineError> {
    let api_key = config.auth.api_key.clone().ok_or_else(|| {
        PipelineError::CapabilityUnavailable("No API key configured for Gemini".to_string())
    })?;

    let client = match &config.provider {
        LlmProvider::Gemini => GeminiClient::new(api_key, config.model.clone()),
        LlmProvider::Custom { base_url } => {
            GeminiClient::with_base_url(api_key, config.model.clone(), base_url.clone())
        }
    };

    Ok(Arc::new(client.with_parameters(config.parameters.clone())))
}
