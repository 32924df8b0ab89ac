//! Run observers.
//!
//! Observers are notified of every stamped event as the runner produces it
//! and of the finished report, without being able to alter either.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;

use crate::event::{Event, EventError, Part};
use crate::runner::{RunReport, RunStatus};

pub trait RunObserver: Send + Sync {
    fn on_event(&self, event: &Event);

    fn on_run_complete(&self, _report: &RunReport) {}
}

#[derive(Debug, Serialize)]
#[serde(tag = "trace_type", rename_all = "snake_case")]
enum TraceLine<'a> {
    Event {
        timestamp: String,
        index: usize,
        author: &'a str,
        is_final: bool,
        parts: &'a [Part],
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<&'a EventError>,
        interrupted: bool,
    },
    Run {
        timestamp: String,
        session: String,
        status: &'a RunStatus,
        events: usize,
        final_message: String,
    },
}

/// Appends one JSON line per event, plus a summary line per run.
pub struct JsonlTraceObserver {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonlTraceObserver {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_line(&self, line: &TraceLine<'_>) {
        let json = match serde_json::to_string(line) {
            Ok(json) => json,
            Err(e) => {
                log::error!("Failed to serialize trace line: {}", e);
                return;
            }
        };
        match self.file.lock() {
            Ok(mut file) => {
                if writeln!(file, "{}", json).is_err() {
                    log::error!("Failed to write trace to {}", self.path.display());
                }
            }
            Err(_) => log::error!("Trace file lock poisoned"),
        }
    }
}

impl RunObserver for JsonlTraceObserver {
    fn on_event(&self, event: &Event) {
        self.write_line(&TraceLine::Event {
            timestamp: Utc::now().to_rfc3339(),
            index: event.index,
            author: &event.author,
            is_final: event.is_final,
            parts: &event.parts,
            error: event.error.as_ref(),
            interrupted: event.interrupted,
        });
    }

    fn on_run_complete(&self, report: &RunReport) {
        self.write_line(&TraceLine::Run {
            timestamp: Utc::now().to_rfc3339(),
            session: report.session.to_string(),
            status: &report.status,
            events: report.events.len(),
            final_message: report.final_message(),
        });
    }
}

/// Forwards each event to the `log` facade at debug level.
pub struct LogObserver;

impl RunObserver for LogObserver {
    fn on_event(&self, event: &Event) {
        match &event.error {
            Some(error) => log::error!(
                "[{}] #{} error {}: {}",
                event.author,
                event.index,
                error.code,
                error.message
            ),
            None => log::debug!(
                "[{}] #{} final={} parts={}",
                event.author,
                event.index,
                event.is_final,
                event.parts.len()
            ),
        }
    }
}
