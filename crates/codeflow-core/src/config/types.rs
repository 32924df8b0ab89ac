//! Configuration types for the pipeline
//!
//! Every section has defaults so that an empty (or missing) YAML file yields
//! the built-in write, review, refactor, execute pipeline.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

use crate::agent::{default_agents, AgentSpec, Pipeline, DEFAULT_PIPELINE_NAME};
use crate::errors::PipelineError;

/// Top-level configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CodeflowConfig {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub environment: EnvironmentConfig,
    #[serde(default)]
    pub tracing: TracingConfig,
}

/// Fixed identifiers used when creating sessions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_app_name")]
    pub name: String,
    #[serde(default = "default_user_id")]
    pub user_id: String,
    #[serde(default = "default_session_prefix")]
    pub session_prefix: String,
    /// Oldest sessions are evicted past this many; unbounded when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sessions: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: LlmProvider,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub auth: LlmAuth,
    #[serde(default)]
    pub parameters: ModelParameters,
}

/// LLM provider types
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Gemini,
    /// Any endpoint speaking the plain `/v1/chat/completions` JSON shape
    Custom {
        base_url: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LlmAuth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelParameters {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    #[default]
    Process,
    Docker,
}

/// Sandbox used by the interpreter step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default)]
    pub kind: ExecutorKind,
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_image: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_pipeline_name")]
    pub name: String,
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: usize,
    /// Replaces the built-in agents when non-empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agents: Vec<AgentSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EnvironmentConfig {
    #[serde(default)]
    pub env_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_trace_file")]
    pub trace_file: PathBuf,
}

fn default_app_name() -> String { "codeflow_pipeline".to_string() }
fn default_user_id() -> String { "cli_user_01".to_string() }
fn default_session_prefix() -> String { "pipeline_session_".to_string() }
fn default_provider() -> LlmProvider { LlmProvider::Gemini }
fn default_model() -> String { "gemini-2.0-flash".to_string() }
fn default_temperature() -> f32 { 0.2 }
fn default_max_tokens() -> u32 { 4096 }
fn default_top_p() -> f32 { 0.95 }
fn default_interpreter() -> String { "python3".to_string() }
fn default_timeout_secs() -> u64 { 30 }
fn default_max_output_bytes() -> usize { 64 * 1024 }
fn default_pipeline_name() -> String { DEFAULT_PIPELINE_NAME.to_string() }
fn default_max_tool_rounds() -> usize { 4 }
fn default_trace_file() -> PathBuf { PathBuf::from("codeflow-trace.jsonl") }

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: default_app_name(),
            user_id: default_user_id(),
            session_prefix: default_session_prefix(),
            max_sessions: None,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            auth: LlmAuth::default(),
            parameters: ModelParameters::default(),
        }
    }
}

impl Default for ModelParameters {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            top_p: default_top_p(),
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            kind: ExecutorKind::default(),
            interpreter: default_interpreter(),
            timeout_secs: default_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            docker_image: None,
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: default_pipeline_name(),
            max_tool_rounds: default_max_tool_rounds(),
            agents: Vec::new(),
        }
    }
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            trace_file: default_trace_file(),
        }
    }
}

impl PipelineConfig {
    /// Builds the configured pipeline, falling back to the built-in agents.
    pub fn build(&self) -> Result<Pipeline, PipelineError> {
        let agents = if self.agents.is_empty() {
            default_agents()
        } else {
            self.agents.clone()
        };
        Pipeline::new(self.name.clone(), agents)
    }
}

impl CodeflowConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.app.name.trim().is_empty() {
            return Err(PipelineError::ConfigError("App name cannot be empty".to_string()));
        }
        if self.app.user_id.trim().is_empty() {
            return Err(PipelineError::ConfigError("App user_id cannot be empty".to_string()));
        }
        if self.app.max_sessions == Some(0) {
            return Err(PipelineError::ConfigError(
                "App max_sessions must be greater than 0".to_string(),
            ));
        }

        if self.llm.model.trim().is_empty() {
            return Err(PipelineError::ConfigError("LLM model cannot be empty".to_string()));
        }
        if let LlmProvider::Custom { base_url } = &self.llm.provider {
            if base_url.trim().is_empty() {
                return Err(PipelineError::ConfigError(
                    "Custom provider requires a valid 'base_url'".to_string(),
                ));
            }
        }

        if self.executor.timeout_secs == 0 {
            return Err(PipelineError::ConfigError(
                "Executor timeout_secs must be greater than 0".to_string(),
            ));
        }
        if self.executor.max_output_bytes == 0 {
            return Err(PipelineError::ConfigError(
                "Executor max_output_bytes must be greater than 0".to_string(),
            ));
        }
        if self.executor.interpreter.trim().is_empty() {
            return Err(PipelineError::ConfigError(
                "Executor interpreter cannot be empty".to_string(),
            ));
        }

        if self.pipeline.max_tool_rounds == 0 {
            return Err(PipelineError::ConfigError(
                "Pipeline max_tool_rounds must be greater than 0".to_string(),
            ));
        }
        let mut output_keys = HashSet::new();
        for agent in &self.pipeline.agents {
            if !output_keys.insert(agent.output_key.as_str()) {
                return Err(PipelineError::ConfigError(format!(
                    "Duplicate output_key '{}' in pipeline agents",
                    agent.output_key
                )));
            }
        }
        self.pipeline
            .build()
            .map_err(|e| PipelineError::ConfigError(e.to_string()))?;

        Ok(())
    }
}
