#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use codeflow_core::core_types::{LLMResponse, Message, ToolCall};
use codeflow_core::errors::{ExecutorError, PipelineError};
use codeflow_core::executors::{CodeExecutor, ExecutionResult};
use codeflow_core::llm::{ToolMetadata, LLM};
use serde_json::json;

pub const WRITER: &str = "Write Python code";
pub const REVIEWER: &str = "Code Reviewer";
pub const REFACTORER: &str = "Code Refactorer";
pub const INTERPRETER: &str = "Code Execution Assistant";

/// Answers from per-agent queues, picked by a marker in the system prompt.
#[derive(Default)]
pub struct ScriptedLLM {
    scripts: Mutex<Vec<(String, VecDeque<Result<LLMResponse, PipelineError>>)>>,
    calls: Mutex<HashMap<String, Vec<Vec<Message>>>>,
}

impl ScriptedLLM {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, marker: &str, responses: Vec<Result<LLMResponse, PipelineError>>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .push((marker.to_string(), responses.into()));
        self
    }

    pub fn calls_for(&self, marker: &str) -> Vec<Vec<Message>> {
        self.calls
            .lock()
            .unwrap()
            .get(marker)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl LLM for ScriptedLLM {
    async fn generate(
        &self,
        messages: Vec<Message>,
        _tools: Option<Vec<ToolMetadata>>,
    ) -> Result<LLMResponse, PipelineError> {
        let system = messages
            .first()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let mut scripts = self.scripts.lock().unwrap();
        let (marker, queue) = scripts
            .iter_mut()
            .find(|(marker, _)| system.contains(marker.as_str()))
            .ok_or_else(|| PipelineError::LLMError(format!("no script for prompt: {}", system)))?;
        self.calls
            .lock()
            .unwrap()
            .entry(marker.clone())
            .or_default()
            .push(messages);
        queue
            .pop_front()
            .unwrap_or_else(|| Err(PipelineError::LLMError(format!("script '{}' exhausted", marker))))
    }
}

pub fn text(content: &str) -> Result<LLMResponse, PipelineError> {
    Ok(LLMResponse::text(content))
}

pub fn execute(code: &str) -> Result<LLMResponse, PipelineError> {
    Ok(LLMResponse {
        tool_calls: Some(vec![ToolCall {
            id: Some("call_exec".to_string()),
            name: "execute_code".to_string(),
            arguments: json!({ "language": "python", "code": code }),
        }]),
        ..Default::default()
    })
}

/// Pretends to run code; records what it was given.
#[derive(Default)]
pub struct RecordingExecutor {
    pub runs: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl CodeExecutor for RecordingExecutor {
    async fn execute_code(
        &self,
        language: &str,
        code: &str,
    ) -> Result<ExecutionResult, ExecutorError> {
        self.runs
            .lock()
            .unwrap()
            .push((language.to_string(), code.to_string()));
        Ok(ExecutionResult::success("120"))
    }
}

pub fn shared<T>(value: T) -> Arc<T> {
    Arc::new(value)
}
