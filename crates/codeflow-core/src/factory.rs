//! Builds a ready-to-run [`CodePipeline`] from a [`CodeflowConfig`].
//!
//! Missing capabilities are checked once here. A missing model credential puts
//! the pipeline in degraded mode: runs are refused with the recorded reason,
//! while direct code execution keeps working. A missing sandbox is not fatal;
//! the interpreter step then reports a failed execution result.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::agent::Pipeline;
use crate::config::{CodeflowConfig, ExecutorKind};
use crate::errors::PipelineError;
use crate::executors::{CodeExecutor, DockerCodeExecutor, ExecutionResult, ProcessCodeExecutor};
use crate::llm::providers::create_llm_client;
use crate::llm::LLM;
use crate::observer::{JsonlTraceObserver, LogObserver, RunObserver};
use crate::runner::{RunReport, SequentialRunner};
use crate::session::{
    InMemorySessionService, Session, SessionIdGenerator, SessionKey, SessionService,
};
use crate::step::{LlmStepExecutor, StepExecutor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    Available,
    Unavailable(String),
}

impl Capability {
    pub fn is_available(&self) -> bool {
        matches!(self, Capability::Available)
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Capability::Available => None,
            Capability::Unavailable(reason) => Some(reason),
        }
    }
}

/// What the process could set up at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub model: Capability,
    pub code_execution: Capability,
}

impl Capabilities {
    /// Runs need a model; without one the pipeline is degraded.
    pub fn is_degraded(&self) -> bool {
        !self.model.is_available()
    }
}

pub struct CodePipeline {
    config: Arc<CodeflowConfig>,
    runner: Option<SequentialRunner>,
    sessions: Arc<dyn SessionService>,
    code_executor: Option<Arc<dyn CodeExecutor>>,
    capabilities: Capabilities,
    session_ids: SessionIdGenerator,
}

impl CodePipeline {
    pub fn config(&self) -> &CodeflowConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn pipeline(&self) -> Option<&Pipeline> {
        self.runner.as_ref().map(SequentialRunner::pipeline)
    }

    /// Next id from the `{prefix}{n}` counter.
    pub fn next_session_id(&self) -> String {
        self.session_ids.next_id()
    }

    pub fn session_key(&self, session_id: &str) -> SessionKey {
        SessionKey::new(&self.config.app.name, &self.config.app.user_id, session_id)
    }

    pub async fn session(&self, session_id: &str) -> Result<Session, PipelineError> {
        self.sessions.get(&self.session_key(session_id)).await
    }

    /// Creates a fresh session and runs every step against it.
    pub async fn run_pipeline(
        &self,
        user_text: &str,
        session_id: &str,
    ) -> Result<RunReport, PipelineError> {
        self.run_pipeline_with_cancel(user_text, session_id, CancellationToken::new())
            .await
    }

    pub async fn run_pipeline_with_cancel(
        &self,
        user_text: &str,
        session_id: &str,
        cancel: CancellationToken,
    ) -> Result<RunReport, PipelineError> {
        let runner = match &self.runner {
            Some(runner) => runner,
            None => {
                let reason = self
                    .capabilities
                    .model
                    .reason()
                    .unwrap_or("model unavailable");
                return Err(PipelineError::CapabilityUnavailable(reason.to_string()));
            }
        };

        let key = self.session_key(session_id);
        self.sessions.create(key.clone()).await?;
        runner.run(&key, user_text, cancel).await
    }

    /// Runs source directly through the configured sandbox.
    pub async fn execute_code(
        &self,
        language: &str,
        code: &str,
    ) -> Result<ExecutionResult, PipelineError> {
        match &self.code_executor {
            Some(executor) => Ok(executor.execute_code(language, code).await?),
            None => Err(PipelineError::CapabilityUnavailable(
                self.capabilities
                    .code_execution
                    .reason()
                    .unwrap_or("no code executor configured")
                    .to_string(),
            )),
        }
    }
}

/// Factory for creating configured pipelines from CodeflowConfig
pub struct PipelineFactory;

impl PipelineFactory {
    pub async fn create_from_config(config: CodeflowConfig) -> Result<CodePipeline, PipelineError> {
        let (code_executor, code_execution) = Self::configure_code_executor(&config).await;

        let (llm, model) = match create_llm_client(&config.llm) {
            Ok(llm) => (Some(llm), Capability::Available),
            Err(PipelineError::CapabilityUnavailable(reason)) => {
                log::warn!("Running in degraded mode: {}", reason);
                (None, Capability::Unavailable(reason))
            }
            Err(e) => return Err(e),
        };

        let step_executor = llm.map(|llm| Self::configure_step_executor(&config, llm, &code_executor));
        Self::assemble(
            config,
            step_executor,
            code_executor,
            Capabilities {
                model,
                code_execution,
            },
        )
    }

    /// Builds a pipeline around a caller-supplied step executor.
    pub fn with_step_executor(
        config: CodeflowConfig,
        step_executor: Arc<dyn StepExecutor>,
        code_executor: Option<Arc<dyn CodeExecutor>>,
    ) -> Result<CodePipeline, PipelineError> {
        let code_execution = match code_executor {
            Some(_) => Capability::Available,
            None => Capability::Unavailable("no code executor configured".to_string()),
        };
        Self::assemble(
            config,
            Some(step_executor),
            code_executor,
            Capabilities {
                model: Capability::Available,
                code_execution,
            },
        )
    }

    fn assemble(
        config: CodeflowConfig,
        step_executor: Option<Arc<dyn StepExecutor>>,
        code_executor: Option<Arc<dyn CodeExecutor>>,
        capabilities: Capabilities,
    ) -> Result<CodePipeline, PipelineError> {
        let pipeline = Arc::new(config.pipeline.build()?);
        let sessions: Arc<dyn SessionService> = match config.app.max_sessions {
            Some(max) => Arc::new(InMemorySessionService::with_capacity_limit(max)),
            None => Arc::new(InMemorySessionService::new()),
        };

        let runner = match step_executor {
            Some(step_executor) => {
                let mut runner =
                    SequentialRunner::new(pipeline, step_executor, sessions.clone())
                        .with_observer(Arc::new(LogObserver));
                if let Some(observer) = Self::configure_tracing(&config)? {
                    runner = runner.with_observer(observer);
                }
                Some(runner)
            }
            None => None,
        };

        let session_ids = SessionIdGenerator::new(config.app.session_prefix.clone());
        Ok(CodePipeline {
            config: Arc::new(config),
            runner,
            sessions,
            code_executor,
            capabilities,
            session_ids,
        })
    }

    fn configure_step_executor(
        config: &CodeflowConfig,
        llm: Arc<dyn LLM>,
        code_executor: &Option<Arc<dyn CodeExecutor>>,
    ) -> Arc<dyn StepExecutor> {
        let mut executor =
            LlmStepExecutor::new(llm).with_max_tool_rounds(config.pipeline.max_tool_rounds);
        if let Some(code_executor) = code_executor {
            executor = executor.with_code_executor(code_executor.clone());
        }
        Arc::new(executor)
    }

    async fn configure_code_executor(
        config: &CodeflowConfig,
    ) -> (Option<Arc<dyn CodeExecutor>>, Capability) {
        let exec_config = &config.executor;
        let timeout = Duration::from_secs(exec_config.timeout_secs);

        match exec_config.kind {
            ExecutorKind::Process => {
                let executor = ProcessCodeExecutor::new(exec_config.interpreter.clone(), timeout)
                    .with_max_output_bytes(exec_config.max_output_bytes);
                if !executor.is_available() {
                    let reason =
                        format!("interpreter '{}' not found on PATH", exec_config.interpreter);
                    log::warn!("Code execution unavailable: {}", reason);
                    return (None, Capability::Unavailable(reason));
                }
                (Some(Arc::new(executor)), Capability::Available)
            }
            ExecutorKind::Docker => {
                let executor = match DockerCodeExecutor::new(timeout) {
                    Ok(executor) => executor,
                    Err(e) => {
                        let reason = format!("failed to connect to Docker: {}", e);
                        log::warn!("Code execution unavailable: {}", reason);
                        return (None, Capability::Unavailable(reason));
                    }
                };
                let executor = match &exec_config.docker_image {
                    Some(image) => executor.with_python_image(image.clone()),
                    None => executor,
                };
                if !executor.is_available().await {
                    let reason = "Docker daemon is not reachable".to_string();
                    log::warn!("Code execution unavailable: {}", reason);
                    return (None, Capability::Unavailable(reason));
                }
                (Some(Arc::new(executor)), Capability::Available)
            }
        }
    }

    fn configure_tracing(
        config: &CodeflowConfig,
    ) -> Result<Option<Arc<dyn RunObserver>>, PipelineError> {
        if !config.tracing.enabled {
            return Ok(None);
        }
        let observer = JsonlTraceObserver::new(&config.tracing.trace_file)?;
        log::info!("Writing run traces to {}", observer.path().display());
        Ok(Some(Arc::new(observer)))
    }
}
