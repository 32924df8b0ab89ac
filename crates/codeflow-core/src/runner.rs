//! Sequential runner: drives the agents of a pipeline in order against one
//! session.
//!
//! Each step's sub-events are forwarded as they arrive, stamped with the
//! authoring agent and a run-wide index. The text of a step's final event is
//! written to the agent's output key before the next step starts. The first
//! error (error event, stream failure, stream ending without a final event)
//! halts the run; outputs of earlier steps stay in the session.

use std::sync::Arc;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentSpec, Pipeline};
use crate::errors::PipelineError;
use crate::event::{Event, StepEvent};
use crate::observer::RunObserver;
use crate::prompt::render_prompt;
use crate::session::{SessionKey, SessionService, SessionState};
use crate::step::{StepExecutor, StepRequest};

pub const DEFAULT_FINAL_MESSAGE: &str = "Pipeline completed.";

/// Review phrases that carry nothing to act on.
const NON_ACTIONABLE_PHRASES: [&str; 8] = [
    "none",
    "n/a",
    "na",
    "no comments",
    "no issues",
    "no issues found",
    "lgtm",
    "looks good to me",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed {
        step_index: usize,
        agent: String,
        error: String,
    },
    Cancelled {
        step_index: usize,
        agent: String,
    },
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub session: SessionKey,
    pub events: Vec<Event>,
    pub final_state: SessionState,
    pub status: RunStatus,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// First text part of the last final event, or the default message.
    pub fn final_message(&self) -> String {
        self.events
            .iter()
            .rev()
            .find(|e| e.is_final)
            .and_then(Event::first_text)
            .filter(|t| !t.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| DEFAULT_FINAL_MESSAGE.to_string())
    }

    pub fn output(&self, key: &str) -> Option<&str> {
        self.final_state.get_text(key)
    }
}

/// True when a review carries nothing the refactorer could act on.
pub fn is_non_actionable(review: Option<&str>) -> bool {
    let Some(review) = review else {
        return true;
    };
    let normalized = review
        .trim()
        .trim_start_matches(['*', '-'])
        .trim()
        .trim_end_matches(['.', '!'])
        .trim()
        .to_ascii_lowercase();
    normalized.is_empty() || NON_ACTIONABLE_PHRASES.contains(&normalized.as_str())
}

// Releases the session hold when the run ends, however it ends.
struct ActiveRunGuard {
    sessions: Arc<dyn SessionService>,
    key: SessionKey,
}

impl Drop for ActiveRunGuard {
    fn drop(&mut self) {
        self.sessions.release(&self.key);
    }
}

enum StepEnd {
    Finished,
    Failed(String),
    Cancelled,
}

pub struct SequentialRunner {
    pipeline: Arc<Pipeline>,
    step_executor: Arc<dyn StepExecutor>,
    sessions: Arc<dyn SessionService>,
    observers: Vec<Arc<dyn RunObserver>>,
}

impl SequentialRunner {
    pub fn new(
        pipeline: Arc<Pipeline>,
        step_executor: Arc<dyn StepExecutor>,
        sessions: Arc<dyn SessionService>,
    ) -> Self {
        Self {
            pipeline,
            step_executor,
            sessions,
            observers: Vec::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn sessions(&self) -> &Arc<dyn SessionService> {
        &self.sessions
    }

    fn acquire(&self, key: &SessionKey) -> Result<ActiveRunGuard, PipelineError> {
        if !self.sessions.try_hold(key) {
            return Err(PipelineError::SessionBusy(key.to_string()));
        }
        Ok(ActiveRunGuard {
            sessions: self.sessions.clone(),
            key: key.clone(),
        })
    }

    /// Runs every agent against an existing session.
    ///
    /// Returns `Err` only when the run cannot start (unknown or busy
    /// session). Step failures and cancellation are reported in the
    /// [`RunReport`] status.
    pub async fn run(
        &self,
        key: &SessionKey,
        user_message: &str,
        cancel: CancellationToken,
    ) -> Result<RunReport, PipelineError> {
        let _guard = self.acquire(key)?;
        let mut state = self.sessions.get(key).await?.state;
        let mut events = Vec::new();
        let mut status = RunStatus::Completed;

        log::info!(
            "Starting pipeline '{}' on session {}",
            self.pipeline.name(),
            key
        );

        for (step_index, agent) in self.pipeline.agents().iter().enumerate() {
            if cancel.is_cancelled() {
                let event = Event::interrupted(events.len(), &agent.name);
                self.emit(&mut events, event);
                status = RunStatus::Cancelled {
                    step_index,
                    agent: agent.name.clone(),
                };
                break;
            }

            log::info!("Step {} ({}) started", step_index + 1, agent.name);
            let end = self
                .run_step(key, step_index, agent, user_message, &mut state, &mut events, &cancel)
                .await;

            match end {
                StepEnd::Finished => {
                    log::info!("Step {} ({}) finished", step_index + 1, agent.name);
                }
                StepEnd::Failed(error) => {
                    log::error!("Step {} ({}) failed: {}", step_index + 1, agent.name, error);
                    status = RunStatus::Failed {
                        step_index,
                        agent: agent.name.clone(),
                        error,
                    };
                    break;
                }
                StepEnd::Cancelled => {
                    log::warn!("Step {} ({}) cancelled", step_index + 1, agent.name);
                    let event = Event::interrupted(events.len(), &agent.name);
                    self.emit(&mut events, event);
                    status = RunStatus::Cancelled {
                        step_index,
                        agent: agent.name.clone(),
                    };
                    break;
                }
            }
        }

        let final_state = match self.sessions.get(key).await {
            Ok(session) => session.state,
            Err(e) => {
                log::warn!("Session {} vanished during the run: {}", key, e);
                state
            }
        };

        let report = RunReport {
            session: key.clone(),
            events,
            final_state,
            status,
        };
        for observer in &self.observers {
            observer.on_run_complete(&report);
        }
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        key: &SessionKey,
        step_index: usize,
        agent: &AgentSpec,
        user_message: &str,
        state: &mut SessionState,
        events: &mut Vec<Event>,
        cancel: &CancellationToken,
    ) -> StepEnd {
        if let Some(rule) = &agent.pass_through {
            if is_non_actionable(state.get_text(&rule.when_empty)) {
                let source = state.get_text(&rule.source).unwrap_or_default().to_string();
                log::info!(
                    "Review for {} is empty or non-actionable, passing '{}' through",
                    agent.name,
                    rule.source
                );
                let event =
                    Event::from_step(events.len(), &agent.name, StepEvent::final_text(source.clone()));
                self.emit(events, event);
                return self.commit(key, agent, state, Value::String(source)).await;
            }
        }

        let message = if step_index == 0 {
            Some(user_message)
        } else {
            None
        };
        let prompt = render_prompt(agent, state, message);
        log::debug!("Prompt for {}: {:?}", agent.name, prompt);

        let request = StepRequest {
            agent: agent.clone(),
            prompt,
            state: state.clone(),
        };

        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return StepEnd::Cancelled,
            stream = self.step_executor.execute_step(request) => match stream {
                Ok(stream) => stream,
                Err(e) => return self.fail(events, agent, &e),
            },
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return StepEnd::Cancelled,
                next = stream.next() => next,
            };

            match next {
                None => {
                    let e = PipelineError::IncompleteStep(agent.name.clone());
                    return self.fail(events, agent, &e);
                }
                Some(Err(e)) => return self.fail(events, agent, &e),
                Some(Ok(step_event)) => {
                    let event = Event::from_step(events.len(), &agent.name, step_event);
                    let error = event.error.clone();
                    let is_final = event.is_final;
                    let text = event.text();
                    self.emit(events, event);

                    if let Some(error) = error {
                        return StepEnd::Failed(
                            PipelineError::StepFailed {
                                agent: agent.name.clone(),
                                message: format!("{}: {}", error.code, error.message),
                            }
                            .to_string(),
                        );
                    }
                    if is_final {
                        return self.commit(key, agent, state, Value::String(text)).await;
                    }
                }
            }
        }
    }

    async fn commit(
        &self,
        key: &SessionKey,
        agent: &AgentSpec,
        state: &mut SessionState,
        value: Value,
    ) -> StepEnd {
        match self
            .sessions
            .update_state(key, &agent.output_key, value.clone())
            .await
        {
            Ok(()) => {
                state.set(agent.output_key.clone(), value);
                StepEnd::Finished
            }
            Err(e) => StepEnd::Failed(e.to_string()),
        }
    }

    // Records a run-level error as an error event authored by the step.
    fn fail(&self, events: &mut Vec<Event>, agent: &AgentSpec, error: &PipelineError) -> StepEnd {
        let event = Event::from_step(
            events.len(),
            &agent.name,
            StepEvent::error(error_code(error), error.to_string()),
        );
        self.emit(events, event);
        StepEnd::Failed(error.to_string())
    }

    fn emit(&self, events: &mut Vec<Event>, event: Event) {
        for observer in &self.observers {
            observer.on_event(&event);
        }
        events.push(event);
    }
}

fn error_code(error: &PipelineError) -> &'static str {
    match error {
        PipelineError::LLMError(_) => "LLM_ERROR",
        PipelineError::ParsingError(_) => "PARSING_ERROR",
        PipelineError::IncompleteStep(_) => "INCOMPLETE_STEP",
        PipelineError::MaxToolRoundsReached(_) => "MAX_TOOL_ROUNDS",
        PipelineError::CapabilityUnavailable(_) => "CAPABILITY_UNAVAILABLE",
        PipelineError::CodeExecutionError(_) => "CODE_EXECUTION_ERROR",
        _ => "STEP_ERROR",
    }
}
