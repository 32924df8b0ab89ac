//! Agent definitions and the ordered pipeline built from them.
//!
//! An agent is a single pipeline step: a fixed instruction template, the
//! session-state key it writes on completion, the keys it reads, and the tools
//! it is granted. The built-in pipeline wires the four code agents (writer,
//! reviewer, refactorer, interpreter) in that order.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::errors::PipelineError;

pub const GENERATED_CODE_KEY: &str = "generated_code";
pub const REVIEW_COMMENTS_KEY: &str = "review_comments";
pub const REFACTORED_CODE_KEY: &str = "refactored_code";
pub const EXECUTION_SUMMARY_KEY: &str = "execution_summary";

pub const DEFAULT_PIPELINE_NAME: &str = "CodePipelineAgent";

/// Capabilities an agent may be granted for its own step only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    CodeExecution,
}

/// Copy `source` into the agent's output instead of calling the model when
/// the value at `when_empty` carries nothing actionable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PassThrough {
    pub when_empty: String,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub instruction: String,
    pub output_key: String,
    #[serde(default)]
    pub input_keys: Vec<String>,
    #[serde(default)]
    pub tools: Vec<ToolKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass_through: Option<PassThrough>,
}

impl AgentSpec {
    pub fn new(
        name: impl Into<String>,
        instruction: impl Into<String>,
        output_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            instruction: instruction.into(),
            output_key: output_key.into(),
            input_keys: Vec::new(),
            tools: Vec::new(),
            pass_through: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_inputs(mut self, keys: &[&str]) -> Self {
        self.input_keys = keys.iter().map(|k| k.to_string()).collect();
        self
    }

    pub fn with_tool(mut self, tool: ToolKind) -> Self {
        if !self.tools.contains(&tool) {
            self.tools.push(tool);
        }
        self
    }

    pub fn with_pass_through(mut self, when_empty: &str, source: &str) -> Self {
        self.pass_through = Some(PassThrough {
            when_empty: when_empty.to_string(),
            source: source.to_string(),
        });
        self
    }

    pub fn has_tool(&self, tool: ToolKind) -> bool {
        self.tools.contains(&tool)
    }
}

/// Ordered, validated sequence of agents.
#[derive(Debug, Clone)]
pub struct Pipeline {
    name: String,
    agents: Vec<AgentSpec>,
}

impl Pipeline {
    /// Builds a pipeline, rejecting duplicate names or output keys and input
    /// keys that no earlier step writes.
    pub fn new(name: impl Into<String>, agents: Vec<AgentSpec>) -> Result<Self, PipelineError> {
        let name = name.into();
        if agents.is_empty() {
            return Err(PipelineError::InvalidPipeline(format!(
                "pipeline '{}' has no agents",
                name
            )));
        }

        let mut names = HashSet::new();
        let mut written: HashSet<&str> = HashSet::new();
        for agent in &agents {
            if agent.name.trim().is_empty() {
                return Err(PipelineError::InvalidPipeline(
                    "agent name cannot be empty".to_string(),
                ));
            }
            if agent.output_key.trim().is_empty() {
                return Err(PipelineError::InvalidPipeline(format!(
                    "agent '{}' has an empty output_key",
                    agent.name
                )));
            }
            if !names.insert(agent.name.as_str()) {
                return Err(PipelineError::InvalidPipeline(format!(
                    "duplicate agent name '{}'",
                    agent.name
                )));
            }
            for key in &agent.input_keys {
                if !written.contains(key.as_str()) {
                    return Err(PipelineError::InvalidPipeline(format!(
                        "agent '{}' reads '{}' which no earlier step writes",
                        agent.name, key
                    )));
                }
            }
            if let Some(rule) = &agent.pass_through {
                for key in [&rule.when_empty, &rule.source] {
                    if !written.contains(key.as_str()) {
                        return Err(PipelineError::InvalidPipeline(format!(
                            "pass-through of agent '{}' reads '{}' which no earlier step writes",
                            agent.name, key
                        )));
                    }
                }
            }
            if !written.insert(agent.output_key.as_str()) {
                return Err(PipelineError::InvalidPipeline(format!(
                    "duplicate output_key '{}'",
                    agent.output_key
                )));
            }
        }

        Ok(Self { name, agents })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn agents(&self) -> &[AgentSpec] {
        &self.agents
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn output_keys(&self) -> impl Iterator<Item = &str> {
        self.agents.iter().map(|a| a.output_key.as_str())
    }

    /// The write, review, refactor, execute pipeline.
    pub fn code_pipeline() -> Self {
        Self {
            name: DEFAULT_PIPELINE_NAME.to_string(),
            agents: default_agents(),
        }
    }
}

pub fn default_agents() -> Vec<AgentSpec> {
    vec![
        AgentSpec::new("CodeWriterAgent", WRITER_INSTRUCTION, GENERATED_CODE_KEY)
            .with_description("Writes initial code."),
        AgentSpec::new("CodeReviewerAgent", REVIEWER_INSTRUCTION, REVIEW_COMMENTS_KEY)
            .with_description("Reviews code and provides feedback.")
            .with_inputs(&[GENERATED_CODE_KEY]),
        AgentSpec::new(
            "CodeRefactorerAgent",
            REFACTORER_INSTRUCTION,
            REFACTORED_CODE_KEY,
        )
        .with_description("Refactors code based on review comments.")
        .with_inputs(&[GENERATED_CODE_KEY, REVIEW_COMMENTS_KEY])
        .with_pass_through(REVIEW_COMMENTS_KEY, GENERATED_CODE_KEY),
        AgentSpec::new(
            "CodeInterpreterAgent",
            INTERPRETER_INSTRUCTION,
            EXECUTION_SUMMARY_KEY,
        )
        .with_description("Executes the generated/refactored code and reports the outcome.")
        .with_inputs(&[GENERATED_CODE_KEY, REFACTORED_CODE_KEY])
        .with_tool(ToolKind::CodeExecution),
    ]
}

const WRITER_INSTRUCTION: &str =
    "Write Python code based on user request. Output only raw code in ```python ... ```.";

const REVIEWER_INSTRUCTION: &str = "You are a Code Reviewer AI.
Review the Python code provided in the session state under the key 'generated_code'.
Provide constructive feedback as bullet points (*). Focus on:
* Potential bugs or errors.
* Adherence to Python best practices (PEP 8).
* Possible improvements for clarity, efficiency, or robustness.
* Missing error handling or edge cases.
Output only the review comments. Do not include the code itself in your output.";

const REFACTORER_INSTRUCTION: &str = "You are a Code Refactorer AI.
Take the original Python code provided in the session state key 'generated_code'
and the review comments found in the session state key 'review_comments'.
Refactor the original code *strictly* based on the provided review comments to improve its quality, clarity, and correctness.
If the review comments are empty or non-actionable, return the original code.
Output *only* the final, refactored Python code block, enclosed in triple backticks (```python ... ```).";

const INTERPRETER_INSTRUCTION: &str = "You are a Code Execution Assistant.
1. Examine the session state for Python code, prioritizing the key 'refactored_code'. If it's empty or absent, use the code from 'generated_code'.
2. Extract *only* the raw Python code from the relevant state key (remove markdown fences like ```python).
3. If code is found, execute it using the provided `execute_code` tool.
- For code defining functions/classes without direct execution, add simple example usage if feasible (e.g., call a function with sample inputs) to test its execution. Run scripts directly.
4. Your final output *must* be only a plain text summary detailing the execution outcome. Format:
Execution Outcome: [Success/Failure]
Output:
[Captured stdout/stderr or 'No output captured.']";
