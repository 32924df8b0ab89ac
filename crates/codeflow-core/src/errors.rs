//! Error types for pipeline runs, sessions and code execution
//!
//! Errors are grouped by their source so that callers can tell a run-level
//! failure (model unreachable, broken configuration) from a step-level one
//! (refusal, tool protocol problem). Sandbox timeouts are deliberately absent:
//! they are reported as a failed `ExecutionResult`, not as an error.

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum PipelineError {
    #[error("LLM interaction failed: {0}")]
    LLMError(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Session already exists: {0}")]
    SessionAlreadyExists(String),
    #[error("Session {0} already has an active run")]
    SessionBusy(String),
    #[error("Step '{agent}' failed: {message}")]
    StepFailed { agent: String, message: String },
    #[error("Step '{0}' finished without a final response")]
    IncompleteStep(String),
    #[error("Maximum tool rounds ({0}) reached")]
    MaxToolRoundsReached(usize),
    #[error("Capability unavailable: {0}")]
    CapabilityUnavailable(String),
    #[error("Code execution failed: {0}")]
    CodeExecutionError(String),
    #[error("I/O error: {0}")]
    IoError(String),
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::IoError(err.to_string())
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        PipelineError::LLMError(err.to_string())
    }
}

impl From<ExecutorError> for PipelineError {
    fn from(err: ExecutorError) -> Self {
        PipelineError::CodeExecutionError(err.to_string())
    }
}

// Plumbing failures inside an executor, before any user code ran
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Bollard (Docker client) error: {0}")]
    BollardError(#[from] bollard::errors::Error),
    #[error("I/O error during code execution: {0}")]
    IoError(#[from] std::io::Error),
    #[error("UTF-8 decoding error from slice: {0}")]
    StrUtf8Error(#[from] std::str::Utf8Error),
    #[error("Could not create temporary file/directory: {0}")]
    TempFileError(String),
    #[error("Interpreter '{0}' not found")]
    InterpreterNotFound(String),
    #[error("Unsupported language: {0}")]
    UnsupportedLanguage(String),
}
