//! Events emitted while a pipeline runs.
//!
//! The step executor produces [`StepEvent`]s; the runner stamps them with the
//! run-wide index, an id and the authoring agent to form [`Event`]s. Content is
//! a list of typed [`Part`]s decided once, where the model response is parsed.

use serde::{Deserialize, Serialize};

use crate::executors::{ExecutionOutcome, ExecutionResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Text {
        text: String,
    },
    ExecutableCode {
        language: String,
        code: String,
    },
    CodeExecutionResult {
        outcome: ExecutionOutcome,
        output: String,
    },
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Part::Text { text } => Some(text),
            _ => None,
        }
    }
}

impl From<&ExecutionResult> for Part {
    fn from(result: &ExecutionResult) -> Self {
        Part::CodeExecutionResult {
            outcome: result.outcome,
            output: result.output.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventError {
    pub code: String,
    pub message: String,
}

/// One emission of a step, before the runner stamps it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepEvent {
    pub parts: Vec<Part>,
    pub is_final: bool,
    pub error: Option<EventError>,
}

impl StepEvent {
    pub fn partial(parts: Vec<Part>) -> Self {
        Self {
            parts,
            ..Default::default()
        }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![Part::text(text)],
            is_final: true,
            error: None,
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            parts: Vec::new(),
            is_final: true,
            error: Some(EventError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub index: usize,
    pub author: String,
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<Part>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EventError>,
    #[serde(default)]
    pub interrupted: bool,
}

impl Event {
    pub fn from_step(index: usize, author: &str, step_event: StepEvent) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            index,
            author: author.to_string(),
            is_final: step_event.is_final,
            parts: step_event.parts,
            error: step_event.error,
            interrupted: false,
        }
    }

    pub fn interrupted(index: usize, author: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            index,
            author: author.to_string(),
            is_final: true,
            parts: Vec::new(),
            error: None,
            interrupted: true,
        }
    }

    /// Text of the first text part, if any.
    pub fn first_text(&self) -> Option<&str> {
        self.parts.iter().find_map(Part::as_text)
    }

    /// All text parts joined; this is what a final event writes to state.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(Part::as_text)
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}
