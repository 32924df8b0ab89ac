//! Plain-text rendering of a finished run.

use std::fmt::Write;

use codeflow_core::{
    extract_code, RunReport, RunStatus, EXECUTION_SUMMARY_KEY, GENERATED_CODE_KEY,
    REFACTORED_CODE_KEY, REVIEW_COMMENTS_KEY,
};

const STATE_NONE: &str = "None";

fn section(out: &mut String, title: &str, body: &str) {
    let _ = writeln!(out, "== {} ==", title);
    let _ = writeln!(out, "{}", body.trim_end());
    let _ = writeln!(out);
}

fn code_block(code: &str) -> String {
    format!("```python\n{}\n```", code)
}

/// Code to show as the run's result: refactored when present, else generated.
pub fn final_code(report: &RunReport) -> Option<String> {
    [REFACTORED_CODE_KEY, GENERATED_CODE_KEY]
        .iter()
        .map(|key| extract_code(report.output(key)))
        .find(|code| !code.is_empty())
}

pub fn render_report(report: &RunReport) -> String {
    let mut out = String::new();

    let generated = extract_code(report.output(GENERATED_CODE_KEY));
    if generated.is_empty() {
        section(&mut out, "Step 1: Initial Code Generation", "No code generated or retrieved.");
    } else {
        section(&mut out, "Step 1: Initial Code Generation", &code_block(&generated));
    }
    section(
        &mut out,
        "Step 2: Code Review",
        report.output(REVIEW_COMMENTS_KEY).unwrap_or(STATE_NONE),
    );
    let refactored = extract_code(report.output(REFACTORED_CODE_KEY));
    if refactored.is_empty() {
        section(&mut out, "Step 3: Refactored Code", STATE_NONE);
    } else {
        section(&mut out, "Step 3: Refactored Code", &code_block(&refactored));
    }
    section(
        &mut out,
        "Step 4: Code Execution",
        report.output(EXECUTION_SUMMARY_KEY).unwrap_or(STATE_NONE),
    );

    match final_code(report) {
        Some(code) => section(&mut out, "Final Code", &code_block(&code)),
        None => section(
            &mut out,
            "Final Code",
            "Could not retrieve the generated code from session state.",
        ),
    }

    match &report.status {
        RunStatus::Completed => {
            let _ = writeln!(out, "Pipeline finished: {}", report.final_message());
        }
        RunStatus::Failed {
            step_index,
            agent,
            error,
        } => {
            let _ = writeln!(
                out,
                "Pipeline failed at step {} ({}): {}",
                step_index + 1,
                agent,
                error
            );
        }
        RunStatus::Cancelled { step_index, agent } => {
            let _ = writeln!(out, "Pipeline cancelled during step {} ({})", step_index + 1, agent);
        }
    }
    out
}
