// src/executors/process.rs
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::Builder;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use uuid::Uuid;
use which::which;

use super::{combine_output, normalize_language, timeout_message, CodeExecutor, ExecutionResult};
use crate::errors::ExecutorError;

const DEFAULT_MAX_OUTPUT_BYTES: usize = 64 * 1024;
// How long to keep draining pipes after the child exited
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Bytes read from one pipe so far. Shared with the reader task so a drain
/// that never reaches EOF still yields what was read.
#[derive(Debug, Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

type SharedCapture = Arc<Mutex<Captured>>;

/// Kills every process in the group led by `leader`. The child is spawned as
/// its own group leader, so this also reaches anything it forked.
#[cfg(unix)]
fn kill_process_group(leader: Option<u32>) {
    let Some(pid) = leader.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // ESRCH just means the group is already gone
    unsafe {
        libc::killpg(pid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_leader: Option<u32>) {}

/// Runs code in a child process inside a fresh scratch directory with a
/// cleared environment. The child's process group is killed once the child
/// exits or the budget runs out.
#[derive(Debug, Clone)]
pub struct ProcessCodeExecutor {
    python: String,
    timeout: Duration,
    max_output_bytes: usize,
}

impl ProcessCodeExecutor {
    pub fn new(python: impl Into<String>, timeout: Duration) -> Self {
        Self {
            python: python.into(),
            timeout,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn with_max_output_bytes(mut self, max_output_bytes: usize) -> Self {
        self.max_output_bytes = max_output_bytes.max(1);
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether the configured Python interpreter can be found on PATH.
    pub fn is_available(&self) -> bool {
        which(&self.python).is_ok()
    }

    fn get_program_and_args(
        &self,
        language: &str,
        script_path: &Path,
    ) -> Option<(String, Vec<String>)> {
        let script = script_path.to_string_lossy().to_string();
        match language {
            "python" => Some((
                self.python.clone(),
                vec!["-I".to_string(), "-u".to_string(), script],
            )),
            "javascript" => Some(("node".to_string(), vec![script])),
            "sh" => Some(("sh".to_string(), vec![script])),
            _ => None,
        }
    }

    fn script_extension(language: &str) -> &'static str {
        match language {
            "python" => "py",
            "javascript" => "js",
            _ => "sh",
        }
    }

    async fn read_capped<R: AsyncRead + Unpin>(
        reader: Option<R>,
        max: usize,
        sink: SharedCapture,
    ) -> std::io::Result<()> {
        let mut reader = match reader {
            Some(reader) => reader,
            None => return Ok(()),
        };

        let mut chunk = [0u8; 8192];
        loop {
            let n = reader.read(&mut chunk).await?;
            if n == 0 {
                return Ok(());
            }
            {
                let mut captured = sink.lock().unwrap_or_else(PoisonError::into_inner);
                let room = max.saturating_sub(captured.bytes.len());
                if room > 0 {
                    captured.bytes.extend_from_slice(&chunk[..n.min(room)]);
                }
                if n > room {
                    captured.truncated = true;
                }
            }
        }
    }

    /// Waits briefly for a reader to hit EOF, then gives up on it. Whatever it
    /// read stays in its shared buffer either way.
    async fn drain(mut task: JoinHandle<std::io::Result<()>>, pipe: &str) -> std::io::Result<()> {
        match tokio::time::timeout(PIPE_DRAIN_GRACE, &mut task).await {
            Ok(Ok(read)) => read,
            Ok(Err(e)) => {
                log::warn!("{} reader task failed: {}", pipe, e);
                Ok(())
            }
            Err(_) => {
                log::warn!("{} still open after the child exited; keeping partial output", pipe);
                task.abort();
                Ok(())
            }
        }
    }

    fn take_captured(sink: &SharedCapture) -> String {
        let mut captured = sink.lock().unwrap_or_else(PoisonError::into_inner);
        let captured = std::mem::take(&mut *captured);
        Self::decode(captured.bytes, captured.truncated)
    }

    fn decode(bytes: Vec<u8>, truncated: bool) -> String {
        let mut text = String::from_utf8_lossy(&bytes).to_string();
        if truncated {
            text.push_str("\n[output truncated]");
        }
        text
    }
}

#[async_trait]
impl CodeExecutor for ProcessCodeExecutor {
    async fn execute_code(
        &self,
        language: &str,
        code: &str,
    ) -> Result<ExecutionResult, ExecutorError> {
        let language = normalize_language(language);
        let temp_dir = Builder::new().prefix("codeflow-exec-").tempdir()?;
        let script_filename = format!(
            "script_{}.{}",
            Uuid::new_v4().simple(),
            Self::script_extension(&language)
        );
        let script_path: PathBuf = temp_dir.path().join(&script_filename);

        let (program, args) = match self.get_program_and_args(&language, &script_path) {
            Some(command) => command,
            None => {
                return Ok(ExecutionResult::failure(format!(
                    "Unsupported language: {}",
                    language
                )))
            }
        };
        let program_path =
            which(&program).map_err(|_| ExecutorError::InterpreterNotFound(program.clone()))?;

        let mut file = fs::File::create(&script_path).await?;
        file.write_all(code.as_bytes()).await?;
        file.flush().await?;
        drop(file);

        let mut cmd = Command::new(program_path);
        cmd.args(&args)
            .current_dir(temp_dir.path())
            .env_clear()
            .env("HOME", temp_dir.path())
            .env("TMPDIR", temp_dir.path())
            .env("PYTHONIOENCODING", "utf-8")
            .env("PYTHONDONTWRITEBYTECODE", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }

        log::debug!(
            "Executing {} script {} with {} (timeout {:?})",
            language,
            script_filename,
            program,
            self.timeout
        );
        let mut child = cmd.spawn()?;
        let group = child.id();

        let max = self.max_output_bytes;
        let stdout = SharedCapture::default();
        let stderr = SharedCapture::default();
        let stdout_task = tokio::spawn(Self::read_capped(child.stdout.take(), max, stdout.clone()));
        let stderr_task = tokio::spawn(Self::read_capped(child.stderr.take(), max, stderr.clone()));

        let waited = tokio::time::timeout(self.timeout, child.wait()).await;
        // Nothing the script started survives it
        kill_process_group(group);

        let status = match waited {
            Ok(status) => status?,
            Err(_) => {
                log::warn!("Execution of {} timed out after {:?}", script_filename, self.timeout);
                let _ = child.kill().await;
                stdout_task.abort();
                stderr_task.abort();
                return Ok(ExecutionResult::failure(timeout_message(self.timeout)));
            }
        };

        Self::drain(stdout_task, "stdout").await?;
        Self::drain(stderr_task, "stderr").await?;

        let output = combine_output(&Self::take_captured(&stdout), &Self::take_captured(&stderr));

        if status.success() {
            Ok(ExecutionResult::success(output))
        } else {
            let exit = match status.code() {
                Some(code) => format!("Process exited with code {}", code),
                None => "Process terminated by signal".to_string(),
            };
            let output = if output.is_empty() {
                exit
            } else {
                format!("{}\n{}", output, exit)
            };
            Ok(ExecutionResult::failure(output))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executors::ExecutionOutcome;
    use std::time::Instant;

    fn python_available() -> bool {
        which("python3").is_ok()
    }

    /// True once `pid` no longer exists or is only a zombie waiting for its parent.
    async fn process_gone(pid: u32) -> bool {
        for _ in 0..40 {
            match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
                Err(_) => return true,
                Ok(stat) => {
                    let state = stat
                        .rsplit(')')
                        .next()
                        .and_then(|rest| rest.split_whitespace().next());
                    if state == Some("Z") {
                        return true;
                    }
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    fn read_pid(path: &Path) -> u32 {
        std::fs::read_to_string(path).unwrap().trim().parse().unwrap()
    }

    #[tokio::test]
    async fn test_shell_success_captures_both_streams() {
        let executor = ProcessCodeExecutor::new("python3", Duration::from_secs(10));
        let result = executor
            .execute_code("sh", "echo out\necho err 1>&2\n")
            .await
            .unwrap();
        assert_eq!(result.outcome, ExecutionOutcome::Success);
        assert!(result.output.contains("out"));
        assert!(result.output.contains("err"));
    }

    #[tokio::test]
    async fn test_shell_nonzero_exit_is_failure() {
        let executor = ProcessCodeExecutor::new("python3", Duration::from_secs(10));
        let result = executor.execute_code("sh", "echo nope 1>&2\nexit 3\n").await.unwrap();
        assert_eq!(result.outcome, ExecutionOutcome::Failure);
        assert!(result.output.contains("nope"));
        assert!(result.output.contains("exited with code 3"));
    }

    #[tokio::test]
    async fn test_shell_timeout_is_failure_and_bounded() {
        let executor = ProcessCodeExecutor::new("python3", Duration::from_secs(1));
        let started = Instant::now();
        let result = executor.execute_code("sh", "sleep 100\n").await.unwrap();
        assert_eq!(result.outcome, ExecutionOutcome::Failure);
        assert!(result.output.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_background_child_keeps_output_and_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("bg.pid");
        let script = format!(
            "sleep 30 &\necho $! > {}\necho visible_line\n",
            pid_file.display()
        );
        let executor = ProcessCodeExecutor::new("python3", Duration::from_secs(5));
        let started = Instant::now();
        let result = executor.execute_code("sh", &script).await.unwrap();

        assert_eq!(result.outcome, ExecutionOutcome::Success);
        assert!(result.output.contains("visible_line"), "output: {}", result.output);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(process_gone(read_pid(&pid_file)).await);
    }

    #[tokio::test]
    async fn test_timeout_kills_background_children() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("bg.pid");
        let script = format!("sleep 30 &\necho $! > {}\nsleep 100\n", pid_file.display());
        let executor = ProcessCodeExecutor::new("python3", Duration::from_secs(1));
        let result = executor.execute_code("sh", &script).await.unwrap();

        assert_eq!(result.outcome, ExecutionOutcome::Failure);
        assert!(result.output.contains("timed out"));
        assert!(process_gone(read_pid(&pid_file)).await);
    }

    #[tokio::test]
    async fn test_silent_success_reports_marker() {
        let executor = ProcessCodeExecutor::new("python3", Duration::from_secs(10));
        let result = executor.execute_code("sh", "true\n").await.unwrap();
        assert!(result.is_success());
        assert_eq!(result.output, crate::executors::NO_OUTPUT_MARKER);
    }

    #[tokio::test]
    async fn test_output_is_capped() {
        let executor =
            ProcessCodeExecutor::new("python3", Duration::from_secs(10)).with_max_output_bytes(16);
        let result = executor
            .execute_code("sh", "i=0; while [ $i -lt 200 ]; do echo line$i; i=$((i+1)); done\n")
            .await
            .unwrap();
        assert!(result.output.contains("[output truncated]"));
        assert!(result.output.len() < 200);
    }

    #[tokio::test]
    async fn test_unsupported_language_is_failure() {
        let executor = ProcessCodeExecutor::new("python3", Duration::from_secs(10));
        let result = executor.execute_code("cobol", "DISPLAY 'HI'.").await.unwrap();
        assert_eq!(result.outcome, ExecutionOutcome::Failure);
        assert!(result.output.contains("Unsupported language"));
    }

    #[tokio::test]
    async fn test_missing_interpreter_is_error() {
        let executor =
            ProcessCodeExecutor::new("definitely-not-a-python-binary", Duration::from_secs(1));
        assert!(!executor.is_available());
        let err = executor.execute_code("python", "print(1)").await.unwrap_err();
        assert!(matches!(err, ExecutorError::InterpreterNotFound(_)));
    }

    #[tokio::test]
    async fn test_python_sleep_times_out_within_budget() {
        if !python_available() {
            eprintln!("python3 not found; skipping");
            return;
        }
        let executor = ProcessCodeExecutor::new("python3", Duration::from_secs(5));
        let started = Instant::now();
        let result = executor
            .execute_code("python", "import time; time.sleep(100)")
            .await
            .unwrap();
        assert_eq!(result.outcome, ExecutionOutcome::Failure);
        assert!(result.output.contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_python_exception_trace_is_captured() {
        if !python_available() {
            eprintln!("python3 not found; skipping");
            return;
        }
        let executor = ProcessCodeExecutor::new("python3", Duration::from_secs(10));
        let result = executor
            .execute_code("python", "print('before')\nraise ValueError('bad input')\n")
            .await
            .unwrap();
        assert_eq!(result.outcome, ExecutionOutcome::Failure);
        assert!(result.output.contains("before"));
        assert!(result.output.contains("ValueError: bad input"));
    }

    #[tokio::test]
    async fn test_python_runs_in_scratch_dir() {
        if !python_available() {
            eprintln!("python3 not found; skipping");
            return;
        }
        let executor = ProcessCodeExecutor::new("python3", Duration::from_secs(10));
        let result = executor
            .execute_code("python", "import os\nprint(os.getcwd())\n")
            .await
            .unwrap();
        assert!(result.is_success());
        assert!(result.output.contains("codeflow-exec-"));
    }
}
