mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use codeflow_core::config::CodeflowConfig;
use codeflow_core::errors::PipelineError;
use codeflow_core::event::{Part, StepEvent};
use codeflow_core::executors::{CodeExecutor, ExecutionOutcome};
use codeflow_core::factory::{CodePipeline, PipelineFactory};
use codeflow_core::runner::{RunStatus, SequentialRunner};
use codeflow_core::session::{InMemorySessionService, SessionKey, SessionService};
use codeflow_core::step::{LlmStepExecutor, StepExecutor, StepRequest, StepStream};
use codeflow_core::{
    Pipeline, EXECUTION_SUMMARY_KEY, GENERATED_CODE_KEY, REFACTORED_CODE_KEY,
    REVIEW_COMMENTS_KEY,
};
use futures_util::stream;
use support::*;
use tokio_util::sync::CancellationToken;

const WRITTEN: &str = "```python\ndef factorial(n):\n    return 1 if n <= 1 else n * factorial(n - 1)\n\nprint(factorial(5))\n```";
const REFACTORED: &str = "```python\ndef factorial(n: int) -> int:\n    if n < 0:\n        raise ValueError(\"n must be >= 0\")\n    return 1 if n <= 1 else n * factorial(n - 1)\n\nprint(factorial(5))\n```";
const SUMMARY: &str = "Execution Outcome: Success\nOutput:\n120";

fn pipeline_with(
    llm: Arc<ScriptedLLM>,
    executor: Arc<RecordingExecutor>,
    config: CodeflowConfig,
) -> CodePipeline {
    let code_executor: Arc<dyn CodeExecutor> = executor;
    let step_executor = LlmStepExecutor::new(llm).with_code_executor(code_executor.clone());
    PipelineFactory::with_step_executor(config, Arc::new(step_executor), Some(code_executor))
        .unwrap()
}

fn happy_llm(review: &str) -> ScriptedLLM {
    ScriptedLLM::new()
        .on(REVIEWER, vec![text(review)])
        .on(REFACTORER, vec![text(REFACTORED)])
        .on(INTERPRETER, vec![execute(REFACTORED), text(SUMMARY)])
        .on(WRITER, vec![text(WRITTEN)])
}

#[tokio::test]
async fn full_run_writes_every_output_key() {
    let llm = shared(happy_llm("* Validate that n is non-negative."));
    let executor = shared(RecordingExecutor::default());
    let pipeline = pipeline_with(llm.clone(), executor.clone(), CodeflowConfig::default());

    let report = pipeline
        .run_pipeline("Write a factorial function", "pipeline_session_0")
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.output(GENERATED_CODE_KEY), Some(WRITTEN));
    assert_eq!(
        report.output(REVIEW_COMMENTS_KEY),
        Some("* Validate that n is non-negative.")
    );
    assert_eq!(report.output(REFACTORED_CODE_KEY), Some(REFACTORED));
    assert_eq!(report.output(EXECUTION_SUMMARY_KEY), Some(SUMMARY));
    assert_eq!(report.final_message(), SUMMARY);

    for agent in Pipeline::code_pipeline().agents() {
        assert!(
            report.events.iter().any(|e| e.author == agent.name),
            "no event from {}",
            agent.name
        );
    }
    let indices: Vec<usize> = report.events.iter().map(|e| e.index).collect();
    assert_eq!(indices, (0..report.events.len()).collect::<Vec<_>>());
    assert_eq!(report.events.iter().filter(|e| e.is_final).count(), 4);

    let interpreter_parts: Vec<&Part> = report
        .events
        .iter()
        .filter(|e| e.author == "CodeInterpreterAgent")
        .flat_map(|e| e.parts.iter())
        .collect();
    assert!(interpreter_parts
        .iter()
        .any(|p| matches!(p, Part::ExecutableCode { code, .. } if code.starts_with("def factorial(n: int)"))));
    assert!(interpreter_parts.iter().any(|p| matches!(
        p,
        Part::CodeExecutionResult { outcome: ExecutionOutcome::Success, output } if output == "120"
    )));

    let runs = executor.runs.lock().unwrap();
    assert_eq!(runs.len(), 1);
    assert!(!runs[0].1.contains("```"));

    let writer_calls = llm.calls_for(WRITER);
    assert!(writer_calls[0][1]
        .content
        .contains("User request:\nWrite a factorial function"));
    let reviewer_calls = llm.calls_for(REVIEWER);
    assert!(reviewer_calls[0][1].content.contains(WRITTEN));
    assert!(!reviewer_calls[0][1].content.contains("User request"));
}

#[tokio::test]
async fn empty_review_passes_generated_code_through() {
    for review in ["", "   \n", "No issues found.", "LGTM"] {
        let llm = shared(happy_llm(review));
        let executor = shared(RecordingExecutor::default());
        let pipeline = pipeline_with(llm.clone(), executor, CodeflowConfig::default());

        let report = pipeline.run_pipeline("factorial", "s").await.unwrap();

        assert_eq!(report.status, RunStatus::Completed);
        assert_eq!(
            report.output(REFACTORED_CODE_KEY).unwrap().as_bytes(),
            WRITTEN.as_bytes()
        );
        assert!(llm.calls_for(REFACTORER).is_empty());
    }
}

#[tokio::test]
async fn error_in_refactor_step_halts_the_run() {
    let llm = shared(
        ScriptedLLM::new()
            .on(WRITER, vec![text(WRITTEN)])
            .on(REVIEWER, vec![text("* Add type hints.")])
            .on(
                REFACTORER,
                vec![Err(PipelineError::LLMError("model unreachable".to_string()))],
            )
            .on(INTERPRETER, vec![text(SUMMARY)]),
    );
    let executor = shared(RecordingExecutor::default());
    let pipeline = pipeline_with(llm.clone(), executor.clone(), CodeflowConfig::default());

    let report = pipeline.run_pipeline("factorial", "s").await.unwrap();

    match &report.status {
        RunStatus::Failed {
            step_index,
            agent,
            error,
        } => {
            assert_eq!(*step_index, 2);
            assert_eq!(agent, "CodeRefactorerAgent");
            assert!(error.contains("model unreachable"));
        }
        other => panic!("unexpected status {:?}", other),
    }
    assert!(report.final_state.contains_key(GENERATED_CODE_KEY));
    assert!(report.final_state.contains_key(REVIEW_COMMENTS_KEY));
    assert!(!report.final_state.contains_key(REFACTORED_CODE_KEY));
    assert!(!report.final_state.contains_key(EXECUTION_SUMMARY_KEY));
    assert!(report
        .events
        .iter()
        .all(|e| e.author != "CodeInterpreterAgent"));
    assert!(report.events.last().unwrap().is_error());
    assert!(llm.calls_for(INTERPRETER).is_empty());
    assert!(executor.runs.lock().unwrap().is_empty());

    let stored = pipeline.session("s").await.unwrap();
    assert_eq!(stored.state.get_text(GENERATED_CODE_KEY), Some(WRITTEN));
}

#[tokio::test]
async fn refusal_is_reported_as_step_failure() {
    let llm = shared(ScriptedLLM::new().on(
        WRITER,
        vec![Ok(codeflow_core::core_types::LLMResponse {
            finish_reason: Some("SAFETY".to_string()),
            ..Default::default()
        })],
    ));
    let pipeline = pipeline_with(
        llm,
        shared(RecordingExecutor::default()),
        CodeflowConfig::default(),
    );

    let report = pipeline.run_pipeline("something", "s").await.unwrap();

    assert!(matches!(
        report.status,
        RunStatus::Failed { step_index: 0, .. }
    ));
    assert_eq!(report.events.len(), 1);
    assert_eq!(report.events[0].error.as_ref().unwrap().code, "SAFETY");
    assert!(report.final_state.is_empty());
}

#[tokio::test]
async fn sequential_runs_do_not_share_state() {
    let llm = shared(
        ScriptedLLM::new()
            .on(WRITER, vec![text("print('first')"), text("print('second')")])
            .on(REVIEWER, vec![text(""), text("")])
            .on(INTERPRETER, vec![text(SUMMARY), text(SUMMARY)]),
    );
    let pipeline = pipeline_with(
        llm.clone(),
        shared(RecordingExecutor::default()),
        CodeflowConfig::default(),
    );

    let first_id = pipeline.next_session_id();
    let second_id = pipeline.next_session_id();
    assert_ne!(first_id, second_id);

    let first = pipeline.run_pipeline("first", &first_id).await.unwrap();
    let second = pipeline.run_pipeline("second", &second_id).await.unwrap();

    assert_eq!(first.output(GENERATED_CODE_KEY), Some("print('first')"));
    assert_eq!(second.output(GENERATED_CODE_KEY), Some("print('second')"));
    assert_eq!(
        pipeline
            .session(&first_id)
            .await
            .unwrap()
            .state
            .get_text(REFACTORED_CODE_KEY),
        Some("print('first')")
    );

    let second_reviewer_prompt = &llm.calls_for(REVIEWER)[1][1].content;
    assert!(!second_reviewer_prompt.contains("first"));
}

#[tokio::test]
async fn reusing_a_session_id_is_rejected() {
    let llm = shared(happy_llm("* ok to improve naming"));
    let pipeline = pipeline_with(
        llm,
        shared(RecordingExecutor::default()),
        CodeflowConfig::default(),
    );
    pipeline.run_pipeline("factorial", "dup").await.unwrap();
    let err = pipeline.run_pipeline("again", "dup").await.unwrap_err();
    assert!(matches!(err, PipelineError::SessionAlreadyExists(_)));
}

struct HangingStep;

#[async_trait]
impl StepExecutor for HangingStep {
    async fn execute_step(&self, _request: StepRequest) -> Result<StepStream, PipelineError> {
        Ok(Box::pin(stream::pending::<Result<StepEvent, PipelineError>>()))
    }
}

struct PartialOnlyStep;

#[async_trait]
impl StepExecutor for PartialOnlyStep {
    async fn execute_step(&self, _request: StepRequest) -> Result<StepStream, PipelineError> {
        let events: Vec<Result<StepEvent, PipelineError>> =
            vec![Ok(StepEvent::partial(vec![Part::text("thinking")]))];
        Ok(Box::pin(stream::iter(events)))
    }
}

async fn runner_with(step: Arc<dyn StepExecutor>) -> (Arc<SequentialRunner>, SessionKey) {
    let sessions: Arc<dyn SessionService> = Arc::new(InMemorySessionService::new());
    let key = SessionKey::new("app", "user", "s0");
    sessions.create(key.clone()).await.unwrap();
    let runner = SequentialRunner::new(Arc::new(Pipeline::code_pipeline()), step, sessions);
    (Arc::new(runner), key)
}

#[tokio::test]
async fn cancellation_interrupts_the_current_step() {
    let (runner, key) = runner_with(Arc::new(HangingStep)).await;
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let report = tokio::time::timeout(Duration::from_secs(5), runner.run(&key, "x", cancel))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(
        report.status,
        RunStatus::Cancelled {
            step_index: 0,
            agent: "CodeWriterAgent".to_string()
        }
    );
    assert!(report.events.last().unwrap().interrupted);
}

#[tokio::test]
async fn second_run_on_busy_session_is_rejected() {
    let (runner, key) = runner_with(Arc::new(HangingStep)).await;
    let cancel = CancellationToken::new();

    let background = {
        let runner = runner.clone();
        let key = key.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { runner.run(&key, "x", cancel).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = runner
        .run(&key, "y", CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::SessionBusy(_)));

    cancel.cancel();
    background.await.unwrap().unwrap();
    // released once the first run ended
    let report = runner.run(&key, "z", cancel.clone()).await.unwrap();
    assert!(matches!(report.status, RunStatus::Cancelled { .. }));
}

/// Opens another session in the shared store before finishing each step.
struct CrowdingStep {
    sessions: Arc<dyn SessionService>,
    opened: AtomicUsize,
}

#[async_trait]
impl StepExecutor for CrowdingStep {
    async fn execute_step(&self, request: StepRequest) -> Result<StepStream, PipelineError> {
        let n = self.opened.fetch_add(1, Ordering::SeqCst);
        self.sessions
            .create(SessionKey::new("app", "user", format!("other_{}", n)))
            .await?;
        let events: Vec<Result<StepEvent, PipelineError>> = vec![Ok(StepEvent::final_text(
            format!("{} output", request.agent.name),
        ))];
        Ok(Box::pin(stream::iter(events)))
    }
}

#[tokio::test]
async fn running_session_survives_capacity_eviction() {
    let sessions: Arc<dyn SessionService> =
        Arc::new(InMemorySessionService::with_capacity_limit(1));
    let key = SessionKey::new("app", "user", "s0");
    sessions.create(key.clone()).await.unwrap();
    let step = Arc::new(CrowdingStep {
        sessions: sessions.clone(),
        opened: AtomicUsize::new(0),
    });
    let runner =
        SequentialRunner::new(Arc::new(Pipeline::code_pipeline()), step, sessions.clone());

    let report = runner
        .run(&key, "x", CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(
        report.output(EXECUTION_SUMMARY_KEY),
        Some("CodeInterpreterAgent output")
    );
    let stored = sessions.get(&key).await.unwrap();
    assert_eq!(stored.state.len(), 4);
    // the hold is gone once the run ends, so the finished session can be evicted
    sessions
        .create(SessionKey::new("app", "user", "after"))
        .await
        .unwrap();
    assert!(sessions.get(&key).await.is_err());
}

#[tokio::test]
async fn stream_without_final_event_fails_the_step() {
    let (runner, key) = runner_with(Arc::new(PartialOnlyStep)).await;
    let report = runner
        .run(&key, "x", CancellationToken::new())
        .await
        .unwrap();

    assert!(matches!(
        &report.status,
        RunStatus::Failed { step_index: 0, error, .. } if error.contains("without a final response")
    ));
    assert_eq!(report.events.len(), 2);
    assert!(!report.events[0].is_final);
    assert_eq!(
        report.events[1].error.as_ref().unwrap().code,
        "INCOMPLETE_STEP"
    );
}

#[tokio::test]
async fn trace_file_records_every_event() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = CodeflowConfig::default();
    config.tracing.enabled = true;
    config.tracing.trace_file = dir.path().join("trace.jsonl");

    let llm = shared(happy_llm("* rename n"));
    let pipeline = pipeline_with(llm, shared(RecordingExecutor::default()), config);
    let report = pipeline.run_pipeline("factorial", "s").await.unwrap();

    let content = std::fs::read_to_string(dir.path().join("trace.jsonl")).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), report.events.len() + 1);
    let last: serde_json::Value = serde_json::from_str(lines.last().unwrap()).unwrap();
    assert_eq!(last["trace_type"], "run");
    assert_eq!(last["status"]["status"], "completed");
}
