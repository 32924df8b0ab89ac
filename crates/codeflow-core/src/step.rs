//! Step execution: the capability behind a single pipeline step.
//!
//! A [`StepExecutor`] turns a rendered prompt into a stream of [`StepEvent`]s
//! ending in exactly one final event. [`LlmStepExecutor`] drives any [`LLM`]
//! with a bounded tool loop; the only tool it offers is `execute_code`, and
//! only to agents granted [`ToolKind::CodeExecution`].

use std::pin::Pin;
use std::sync::Arc;

use async_stream::try_stream;
use async_trait::async_trait;
use futures_util::Stream;
use serde_json::{json, Value};

use crate::agent::{AgentSpec, ToolKind};
use crate::core_types::{Message, ToolCall};
use crate::errors::PipelineError;
use crate::event::{Part, StepEvent};
use crate::executors::{CodeExecutor, ExecutionResult};
use crate::extract::{extract_code, extract_fenced_language};
use crate::llm::{ToolMetadata, LLM};
use crate::prompt::RenderedPrompt;
use crate::session::SessionState;

pub const EXECUTE_CODE_TOOL: &str = "execute_code";
pub const DEFAULT_MAX_TOOL_ROUNDS: usize = 4;

pub type StepStream = Pin<Box<dyn Stream<Item = Result<StepEvent, PipelineError>> + Send>>;

/// Everything a step needs, owned so the returned stream is `'static`.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub agent: AgentSpec,
    pub prompt: RenderedPrompt,
    pub state: SessionState,
}

#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute_step(&self, request: StepRequest) -> Result<StepStream, PipelineError>;
}

pub fn execute_code_tool_metadata() -> ToolMetadata {
    ToolMetadata {
        name: EXECUTE_CODE_TOOL.to_string(),
        description: "Executes source code in an isolated sandbox with a time limit and returns the outcome and the captured stdout/stderr.".to_string(),
        input_schema: json!({
            "type": "object",
            "properties": {
                "language": {
                    "type": "string",
                    "description": "Programming language of the code, e.g. 'python'."
                },
                "code": {
                    "type": "string",
                    "description": "The raw source code to execute."
                }
            },
            "required": ["code"]
        }),
    }
}

pub struct LlmStepExecutor {
    llm: Arc<dyn LLM>,
    code_executor: Option<Arc<dyn CodeExecutor>>,
    max_tool_rounds: usize,
}

impl LlmStepExecutor {
    pub fn new(llm: Arc<dyn LLM>) -> Self {
        Self {
            llm,
            code_executor: None,
            max_tool_rounds: DEFAULT_MAX_TOOL_ROUNDS,
        }
    }

    pub fn with_code_executor(mut self, executor: Arc<dyn CodeExecutor>) -> Self {
        self.code_executor = Some(executor);
        self
    }

    pub fn with_max_tool_rounds(mut self, rounds: usize) -> Self {
        self.max_tool_rounds = rounds.max(1);
        self
    }
}

enum ToolOutcome {
    Executed {
        language: String,
        code: String,
        result: ExecutionResult,
    },
    Rejected(String),
}

/// Pulls language and code out of an `execute_code` call. Fences the model
/// left inside the code argument are stripped.
fn code_arguments(arguments: &Value) -> (String, String) {
    let raw = arguments
        .get("code")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let language = arguments
        .get("language")
        .and_then(Value::as_str)
        .filter(|l| !l.trim().is_empty())
        .map(str::to_string)
        .or_else(|| extract_fenced_language(raw))
        .unwrap_or_else(|| "python".to_string());
    (language, extract_code(Some(raw)))
}

async fn run_tool(
    agent: &AgentSpec,
    call: &ToolCall,
    executor: Option<&Arc<dyn CodeExecutor>>,
) -> ToolOutcome {
    if call.name != EXECUTE_CODE_TOOL || !agent.has_tool(ToolKind::CodeExecution) {
        return ToolOutcome::Rejected(format!(
            "Agent '{}' called tool '{}' which it was not granted",
            agent.name, call.name
        ));
    }

    let (language, code) = code_arguments(&call.arguments);
    let result = if code.is_empty() {
        ExecutionResult::failure("No code provided to execute.")
    } else {
        match executor {
            Some(executor) => match executor.execute_code(&language, &code).await {
                Ok(result) => result,
                Err(e) => {
                    log::error!("Code execution failed: {}", e);
                    ExecutionResult::failure(format!("Code execution failed: {}", e))
                }
            },
            None => {
                log::warn!("Code execution requested, but no code executor is configured");
                ExecutionResult::failure(
                    "Code execution requested, but no code executor is configured.",
                )
            }
        }
    };

    ToolOutcome::Executed {
        language,
        code,
        result,
    }
}

#[async_trait]
impl StepExecutor for LlmStepExecutor {
    async fn execute_step(&self, request: StepRequest) -> Result<StepStream, PipelineError> {
        let llm = self.llm.clone();
        let executor = self.code_executor.clone();
        let max_tool_rounds = self.max_tool_rounds;

        let StepRequest { agent, prompt, .. } = request;
        let tools = if agent.has_tool(ToolKind::CodeExecution) {
            Some(vec![execute_code_tool_metadata()])
        } else {
            None
        };

        let stream = try_stream! {
            let mut messages = vec![Message::system(prompt.system), Message::user(prompt.user)];
            let mut tool_rounds = 0usize;

            loop {
                log::debug!("Agent '{}' calling model with {} messages", agent.name, messages.len());
                let response = llm.generate(messages.clone(), tools.clone()).await?;

                if let Some(reason) = response.refusal_reason() {
                    log::warn!("Agent '{}' response blocked: {}", agent.name, reason);
                    yield StepEvent::error(
                        reason.to_ascii_uppercase(),
                        format!("Model refused to respond (finish reason: {})", reason),
                    );
                    break;
                }

                let content = response.content.clone().unwrap_or_default();
                let tool_calls = response.tool_calls.clone().unwrap_or_default();

                if tool_calls.is_empty() {
                    yield StepEvent::final_text(content);
                    break;
                }

                tool_rounds += 1;
                if tool_rounds > max_tool_rounds {
                    Err::<(), _>(PipelineError::MaxToolRoundsReached(max_tool_rounds))?;
                }

                if !content.trim().is_empty() {
                    yield StepEvent::partial(vec![Part::text(content.clone())]);
                }
                messages.push(Message::assistant(content, Some(tool_calls.clone())));

                let mut rejection = None;
                for call in &tool_calls {
                    match run_tool(&agent, call, executor.as_ref()).await {
                        ToolOutcome::Executed { language, code, result } => {
                            yield StepEvent::partial(vec![Part::ExecutableCode { language, code }]);
                            yield StepEvent::partial(vec![Part::from(&result)]);
                            messages.push(Message::tool(call.id.clone(), result.summary()));
                        }
                        ToolOutcome::Rejected(message) => {
                            rejection = Some(message);
                            break;
                        }
                    }
                }

                if let Some(message) = rejection {
                    log::error!("{}", message);
                    yield StepEvent::error("TOOL_ERROR", message);
                    break;
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
