//! Renders an agent's instruction against the current session state.
//!
//! The instruction becomes the system message. `{key}` placeholders naming a
//! declared input key (or a key already in state) are substituted; other
//! braces are left alone so code samples inside instructions survive. The user
//! message carries the initial request (first step only) and a textual view of
//! the declared inputs.

use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::agent::AgentSpec;
use crate::session::SessionState;

/// Stand-in for a declared input that is absent or blank.
pub const EMPTY_SENTINEL: &str = "(empty)";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt {
    pub system: String,
    pub user: String,
}

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)(\?)?\}").expect("placeholder pattern is valid")
    })
}

/// Text view of a state value; blank or missing values become the sentinel.
pub fn state_value_text(state: &SessionState, key: &str) -> String {
    match state.get(key) {
        Some(Value::String(text)) if !text.trim().is_empty() => text.clone(),
        Some(Value::String(_)) | Some(Value::Null) | None => EMPTY_SENTINEL.to_string(),
        Some(other) => other.to_string(),
    }
}

pub fn render_instruction(agent: &AgentSpec, state: &SessionState) -> String {
    placeholder_regex()
        .replace_all(&agent.instruction, |caps: &Captures| {
            let key = &caps[1];
            if agent.input_keys.iter().any(|k| k == key) || state.contains_key(key) {
                state_value_text(state, key)
            } else {
                caps[0].to_string()
            }
        })
        .into_owned()
}

pub fn render_prompt(
    agent: &AgentSpec,
    state: &SessionState,
    user_message: Option<&str>,
) -> RenderedPrompt {
    let system = render_instruction(agent, state);

    let mut sections = Vec::new();
    if let Some(message) = user_message {
        sections.push(format!("User request:\n{}", message.trim()));
    }
    if !agent.input_keys.is_empty() {
        let mut context = String::from("Session state:");
        for key in &agent.input_keys {
            context.push_str(&format!("\n[{}]\n{}\n", key, state_value_text(state, key)));
        }
        sections.push(context.trim_end().to_string());
    }

    let user = if sections.is_empty() {
        "Proceed with your instructions.".to_string()
    } else {
        sections.join("\n\n")
    };

    RenderedPrompt { system, user }
}
