//! Code execution environments for the interpreter step.
//!
//! Source text runs either in a local child process confined to a scratch
//! directory, or in a throwaway Docker container. Both enforce a wall-clock
//! budget and report user-code failures (non-zero exit, exception, timeout) as
//! a [`ExecutionOutcome::Failure`] result rather than an error.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ExecutorError;

pub mod docker;
pub mod process;

pub use docker::DockerCodeExecutor;
pub use process::ProcessCodeExecutor;

pub const NO_OUTPUT_MARKER: &str = "No output captured.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Success,
    Failure,
}

impl ExecutionOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionOutcome::Success => "Success",
            ExecutionOutcome::Failure => "Failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub outcome: ExecutionOutcome,
    pub output: String,
}

impl ExecutionResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self::with_outcome(ExecutionOutcome::Success, output.into())
    }

    pub fn failure(output: impl Into<String>) -> Self {
        Self::with_outcome(ExecutionOutcome::Failure, output.into())
    }

    fn with_outcome(outcome: ExecutionOutcome, output: String) -> Self {
        let output = if output.trim().is_empty() {
            NO_OUTPUT_MARKER.to_string()
        } else {
            output
        };
        Self { outcome, output }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == ExecutionOutcome::Success
    }

    /// Plain-text report in the interpreter step's output format.
    pub fn summary(&self) -> String {
        format!(
            "Execution Outcome: {}\nOutput:\n{}",
            self.outcome.label(),
            self.output
        )
    }
}

#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute_code(
        &self,
        language: &str,
        code: &str,
    ) -> Result<ExecutionResult, ExecutorError>;
}

pub fn timeout_message(timeout: Duration) -> String {
    format!(
        "Execution timed out after {} seconds and was terminated.",
        timeout.as_secs_f64()
    )
}

/// Stdout first, then stderr, separated by a newline when both are present.
pub(crate) fn combine_output(stdout: &str, stderr: &str) -> String {
    match (stdout.trim_end().is_empty(), stderr.trim_end().is_empty()) {
        (true, true) => String::new(),
        (false, true) => stdout.trim_end().to_string(),
        (true, false) => stderr.trim_end().to_string(),
        (false, false) => format!("{}\n{}", stdout.trim_end(), stderr.trim_end()),
    }
}

pub(crate) fn normalize_language(language: &str) -> String {
    match language.trim().to_lowercase().as_str() {
        "" | "python" | "python3" | "py" => "python".to_string(),
        "javascript" | "js" | "node" | "nodejs" => "javascript".to_string(),
        "sh" | "shell" | "bash" => "sh".to_string(),
        other => other.to_string(),
    }
}
