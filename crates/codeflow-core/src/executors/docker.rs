// src/executors/docker.rs
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::models::ContainerCreateBody;
use bollard::query_parameters::{
    CreateContainerOptions as BollardCreateContainerOptionsQuery,
    LogsOptions as BollardLogsOptionsQuery, RemoveContainerOptions as BollardRemoveContainerOptionsQuery,
    StartContainerOptions as BollardStartContainerOptionsQuery,
    StopContainerOptions as BollardStopContainerOptionsQuery,
    WaitContainerOptions as BollardWaitContainerOptionsQuery,
};
use bollard::Docker;
use futures_util::stream::StreamExt;
use tempfile::Builder;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{combine_output, normalize_language, timeout_message, CodeExecutor, ExecutionResult};
use crate::errors::ExecutorError;

/// Stop without a grace period so a timed-out run ends at its budget.
fn immediate_stop() -> BollardStopContainerOptionsQuery {
    BollardStopContainerOptionsQuery {
        t: Some(0),
        ..Default::default()
    }
}

/// Runs code in a throwaway container with networking disabled.
pub struct DockerCodeExecutor {
    docker: Docker,
    timeout: Duration,
    python_image: String,
}

impl DockerCodeExecutor {
    pub fn new(timeout: Duration) -> Result<Self, ExecutorError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self {
            docker,
            timeout,
            python_image: "python:3.12-slim".to_string(),
        })
    }

    pub fn with_python_image(mut self, image: impl Into<String>) -> Self {
        self.python_image = image.into();
        self
    }

    /// Pings the daemon; used once at startup to decide on degraded mode.
    pub async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    fn get_image_and_command(
        &self,
        language: &str,
        script_path_in_container: &str,
    ) -> Option<(String, Vec<String>, &'static str)> {
        match language {
            "python" => Some((
                self.python_image.clone(),
                vec![
                    "python".to_string(),
                    "-u".to_string(),
                    script_path_in_container.to_string(),
                ],
                "py",
            )),
            "javascript" => Some((
                "node:20-slim".to_string(),
                vec!["node".to_string(), script_path_in_container.to_string()],
                "js",
            )),
            "sh" => Some((
                "alpine:latest".to_string(),
                vec!["sh".to_string(), script_path_in_container.to_string()],
                "sh",
            )),
            _ => None,
        }
    }

    async fn collect_logs(&self, container_id: &str) -> Result<(String, String), ExecutorError> {
        let mut output_stream = self.docker.logs(
            container_id,
            Some(BollardLogsOptionsQuery {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        let mut stdout = String::new();
        let mut stderr = String::new();
        while let Some(log_result) = output_stream.next().await {
            match log_result? {
                LogOutput::StdOut { message } => stdout.push_str(std::str::from_utf8(&message)?),
                LogOutput::StdErr { message } => stderr.push_str(std::str::from_utf8(&message)?),
                _ => {}
            }
        }
        Ok((stdout, stderr))
    }

    async fn remove(&self, container_id: &str) {
        let _ = self
            .docker
            .remove_container(
                container_id,
                Some(BollardRemoveContainerOptionsQuery {
                    force: true,
                    ..Default::default()
                }),
            )
            .await;
    }
}

#[async_trait]
impl CodeExecutor for DockerCodeExecutor {
    async fn execute_code(
        &self,
        language: &str,
        code: &str,
    ) -> Result<ExecutionResult, ExecutorError> {
        let language = normalize_language(language);
        let container_work_dir = "/app";
        let lookup_path = format!("{}/script", container_work_dir);
        let extension = match self.get_image_and_command(&language, &lookup_path) {
            Some((_, _, extension)) => extension,
            None => {
                return Ok(ExecutionResult::failure(format!(
                    "Unsupported language: {}",
                    language
                )))
            }
        };

        let temp_dir = Builder::new().prefix("codeflow-exec-").tempdir()?;
        let host_temp_dir_path = temp_dir
            .path()
            .to_str()
            .ok_or_else(|| ExecutorError::TempFileError("Invalid temp path".to_string()))?
            .to_string();

        let script_filename = format!("script_{}.{}", Uuid::new_v4().simple(), extension);
        let host_script_path = temp_dir.path().join(&script_filename);

        let mut file = fs::File::create(&host_script_path).await?;
        file.write_all(code.as_bytes()).await?;
        file.flush().await?;

        let script_path_in_container = format!("{}/{}", container_work_dir, script_filename);
        let (image_name, cmd_strings, _) = self
            .get_image_and_command(&language, &script_path_in_container)
            .ok_or_else(|| ExecutorError::UnsupportedLanguage(language.clone()))?;

        let options = Some(BollardCreateContainerOptionsQuery {
            name: Some(format!("codeflow-exec-{}", Uuid::new_v4().simple())),
            ..Default::default()
        });

        let config = ContainerCreateBody {
            image: Some(image_name),
            cmd: Some(cmd_strings),
            working_dir: Some(container_work_dir.to_string()),
            network_disabled: Some(true),
            host_config: Some(bollard::models::HostConfig {
                binds: Some(vec![format!(
                    "{}:{}:ro",
                    host_temp_dir_path, container_work_dir
                )]),
                memory: Some(256 * 1024 * 1024),
                ..Default::default()
            }),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let container = self.docker.create_container(options, config).await?;
        self.docker
            .start_container(&container.id, None::<BollardStartContainerOptionsQuery>)
            .await?;

        let mut exec_stream = self
            .docker
            .wait_container(&container.id, None::<BollardWaitContainerOptionsQuery>);

        let wait_outcome = tokio::select! {
            res = exec_stream.next() => res,
            _ = tokio::time::sleep(self.timeout) => {
                log::warn!("Execution timed out for container {}", container.id);
                let _ = self.docker.stop_container(&container.id, Some(immediate_stop())).await;
                self.remove(&container.id).await;
                return Ok(ExecutionResult::failure(timeout_message(self.timeout)));
            }
        };

        // A non-zero exit surfaces as an error item on the wait stream
        let exit_code = match wait_outcome {
            Some(Ok(response)) => response.status_code,
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
            Some(Err(e)) => {
                self.remove(&container.id).await;
                return Err(ExecutorError::BollardError(e));
            }
            None => {
                self.remove(&container.id).await;
                return Ok(ExecutionResult::failure(
                    "Container wait stream ended unexpectedly",
                ));
            }
        };

        let logs = self.collect_logs(&container.id).await;
        self.remove(&container.id).await;
        let (stdout, stderr) = logs?;
        let output = combine_output(&stdout, &stderr);

        if exit_code == 0 {
            Ok(ExecutionResult::success(output))
        } else {
            let report = format!("{}\nContainer exited with code {}", output, exit_code);
            Ok(ExecutionResult::failure(report.trim_start()))
        }
    }
}
