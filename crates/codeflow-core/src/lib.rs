//! Sequential multi-agent code pipeline.
//!
//! A natural-language coding request flows through four fixed agent steps
//! (write, review, refactor, execute). Each step writes one named artifact into
//! a per-run session state, which the caller reads back once the run ends.
//!
//! # Architecture Overview
//!
//! - **Agents**: static role definitions and the validated pipeline built from them
//! - **Sessions**: an explicit in-memory store of per-run state bags
//! - **Runner**: drives the steps in order and stamps their events
//! - **Step execution**: a provider-agnostic LLM loop with a code execution tool
//! - **Execution environments**: sandboxed code execution in a child process or Docker
//! - **Configuration**: YAML with defaults, `.env` loading and key resolution

pub mod agent;
pub mod config;
pub mod core_types;
pub mod errors;
pub mod event;
pub mod executors;
pub mod extract;
pub mod factory;
pub mod llm;
pub mod observer;
pub mod prompt;
pub mod runner;
pub mod session;
pub mod step;

pub use agent::{
    AgentSpec, Pipeline, ToolKind, EXECUTION_SUMMARY_KEY, GENERATED_CODE_KEY,
    REFACTORED_CODE_KEY, REVIEW_COMMENTS_KEY,
};
pub use config::*;
pub use errors::{ExecutorError, PipelineError};
pub use event::{Event, EventError, Part, StepEvent};
pub use executors::{CodeExecutor, ExecutionOutcome, ExecutionResult};
pub use extract::{extract_code, extract_fenced_language};
pub use factory::{Capabilities, Capability, CodePipeline, PipelineFactory};
pub use llm::LLM;
pub use observer::{JsonlTraceObserver, RunObserver};
pub use runner::{RunReport, RunStatus, SequentialRunner};
pub use session::{InMemorySessionService, Session, SessionKey, SessionService, SessionState};
pub use step::{LlmStepExecutor, StepExecutor, StepRequest, StepStream};
