//! Configuration loader for YAML files and environment resolution
//!
//! Env files are loaded before credentials are resolved, so a key placed in
//! `.env` is picked up the same way as one exported in the shell.

use std::env;
use std::path::Path;

use tokio::fs;

use crate::config::types::*;
use crate::errors::PipelineError;

/// Environment variables consulted when no key is configured explicitly
pub const FALLBACK_API_KEY_VARS: [&str; 2] = ["GOOGLE_API_KEY", "GEMINI_API_KEY"];

/// Configuration loader with environment resolution
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from a YAML file
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<CodeflowConfig, PipelineError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).await.map_err(|e| {
            PipelineError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_str(&content, path.parent())
    }

    /// Load from `path` when it exists, otherwise start from the defaults.
    pub async fn from_optional_file<P: AsRef<Path>>(
        path: P,
    ) -> Result<CodeflowConfig, PipelineError> {
        let path = path.as_ref();
        if fs::try_exists(path).await.unwrap_or(false) {
            Self::from_file(path).await
        } else {
            log::info!(
                "Config file {} not found, using built-in defaults",
                path.display()
            );
            Self::from_config(CodeflowConfig::default(), None)
        }
    }

    /// Load configuration from a YAML string. Relative env file paths are
    /// resolved against `base_dir`.
    pub fn from_str(
        content: &str,
        base_dir: Option<&Path>,
    ) -> Result<CodeflowConfig, PipelineError> {
        let config: CodeflowConfig = if content.trim().is_empty() {
            CodeflowConfig::default()
        } else {
            serde_yaml::from_str(content).map_err(|e| {
                PipelineError::ConfigError(format!("Failed to parse YAML config: {}", e))
            })?
        };
        Self::from_config(config, base_dir)
    }

    /// Resolve the environment for an already-built configuration and validate it.
    pub fn from_config(
        mut config: CodeflowConfig,
        base_dir: Option<&Path>,
    ) -> Result<CodeflowConfig, PipelineError> {
        Self::resolve_environment(&mut config, base_dir)?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_environment(
        config: &mut CodeflowConfig,
        base_dir: Option<&Path>,
    ) -> Result<(), PipelineError> {
        let env_files = if config.environment.env_files.is_empty() {
            vec![Path::new(".env").to_path_buf()]
        } else {
            config.environment.env_files.clone()
        };

        for env_file in env_files {
            let env_file = match base_dir {
                Some(dir) if env_file.is_relative() && !dir.as_os_str().is_empty() => {
                    dir.join(env_file)
                }
                _ => env_file,
            };
            if env_file.exists() {
                log::debug!("Loading env file {}", env_file.display());
                Self::load_env_file(&env_file)?;
            }
        }

        Self::resolve_llm_auth(&mut config.llm.auth);
        Ok(())
    }

    /// Load environment variables from a .env file. Variables already set in
    /// the process environment win.
    pub fn load_env_file<P: AsRef<Path>>(path: P) -> Result<(), PipelineError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            PipelineError::ConfigError(format!(
                "Failed to read env file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);

            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim();
                let value = value.trim().trim_matches('"').trim_matches('\'');
                if !key.is_empty() && env::var_os(key).is_none() {
                    env::set_var(key, value);
                }
            }
        }

        Ok(())
    }

    /// Resolve LLM authentication from environment
    fn resolve_llm_auth(auth: &mut LlmAuth) {
        if auth.api_key.as_deref().is_some_and(|k| !k.trim().is_empty()) {
            return;
        }
        auth.api_key = None;

        if let Some(env_var) = &auth.api_key_env {
            if let Ok(api_key) = env::var(env_var) {
                if !api_key.trim().is_empty() {
                    auth.api_key = Some(api_key);
                    return;
                }
            }
        }

        if auth.api_key_env.is_none() {
            auth.api_key = FALLBACK_API_KEY_VARS
                .iter()
                .filter_map(|var| env::var(var).ok())
                .find(|key| !key.trim().is_empty());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_basic_config() {
        let yaml = r#"
app:
  name: "test_app"
llm:
  provider: gemini
  model: "gemini-1.5-pro"
  auth:
    api_key: "inline-key"
executor:
  timeout_secs: 5
"#;
        let config = ConfigLoader::from_str(yaml, None).unwrap();
        assert_eq!(config.app.name, "test_app");
        assert_eq!(config.app.user_id, "cli_user_01");
        assert_eq!(config.llm.model, "gemini-1.5-pro");
        assert_eq!(config.llm.auth.api_key.as_deref(), Some("inline-key"));
        assert_eq!(config.executor.timeout_secs, 5);
        assert_eq!(config.executor.kind, ExecutorKind::Process);
        assert_eq!(config.pipeline.max_tool_rounds, 4);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ConfigLoader::from_str("", None).unwrap();
        assert_eq!(config.app.session_prefix, "pipeline_session_");
        assert_eq!(config.llm.model, "gemini-2.0-flash");
        assert_eq!(config.pipeline.build().unwrap().len(), 4);
    }

    #[test]
    fn test_env_resolution() {
        env::set_var("CODEFLOW_TEST_API_KEY", "secret123");
        let yaml = r#"
llm:
  provider: gemini
  model: "gemini-2.0-flash"
  auth:
    api_key_env: "CODEFLOW_TEST_API_KEY"
"#;
        let config = ConfigLoader::from_str(yaml, None).unwrap();
        assert_eq!(config.llm.auth.api_key.as_deref(), Some("secret123"));
        env::remove_var("CODEFLOW_TEST_API_KEY");
    }

    #[test]
    fn test_named_env_var_missing_leaves_key_unset() {
        let yaml = r#"
llm:
  auth:
    api_key_env: "CODEFLOW_TEST_UNSET_KEY"
"#;
        let config = ConfigLoader::from_str(yaml, None).unwrap();
        assert!(config.llm.auth.api_key.is_none());
    }

    #[test]
    fn test_env_file_is_loaded_relative_to_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("local.env"),
            "# comment\nexport CODEFLOW_TEST_FILE_KEY=\"from-file\"\n",
        )
        .unwrap();
        let yaml = r#"
environment:
  env_files: ["local.env"]
llm:
  auth:
    api_key_env: CODEFLOW_TEST_FILE_KEY
"#;
        let config = ConfigLoader::from_str(yaml, Some(dir.path())).unwrap();
        assert_eq!(config.llm.auth.api_key.as_deref(), Some("from-file"));
        env::remove_var("CODEFLOW_TEST_FILE_KEY");
    }

    #[test]
    fn test_custom_provider_and_agent_overrides() {
        let yaml = r#"
llm:
  provider:
    custom:
      base_url: "http://localhost:8080"
  model: local
pipeline:
  name: Tiny
  agents:
    - name: Writer
      instruction: "Write code."
      output_key: generated_code
    - name: Runner
      instruction: "Run {generated_code}"
      output_key: execution_summary
      input_keys: [generated_code]
      tools: [code_execution]
"#;
        let config = ConfigLoader::from_str(yaml, None).unwrap();
        assert_eq!(
            config.llm.provider,
            LlmProvider::Custom {
                base_url: "http://localhost:8080".to_string()
            }
        );
        let pipeline = config.pipeline.build().unwrap();
        assert_eq!(pipeline.name(), "Tiny");
        assert_eq!(pipeline.len(), 2);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let yaml = "executor:\n  timeout_secs: 0\n";
        assert!(matches!(
            ConfigLoader::from_str(yaml, None),
            Err(PipelineError::ConfigError(_))
        ));

        let yaml = r#"
pipeline:
  agents:
    - { name: A, instruction: a, output_key: out }
    - { name: B, instruction: b, output_key: out }
"#;
        assert!(matches!(
            ConfigLoader::from_str(yaml, None),
            Err(PipelineError::ConfigError(msg)) if msg.contains("Duplicate output_key")
        ));
    }

    #[test]
    fn test_invalid_yaml() {
        assert!(matches!(
            ConfigLoader::from_str("app: [unclosed", None),
            Err(PipelineError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "app:\n  name: from_file\ntracing:\n  enabled: true").unwrap();

        let config = ConfigLoader::from_file(temp_file.path()).await.unwrap();
        assert_eq!(config.app.name, "from_file");
        assert!(config.tracing.enabled);
    }

    #[tokio::test]
    async fn test_missing_optional_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigLoader::from_optional_file(dir.path().join("absent.yaml"))
            .await
            .unwrap();
        assert_eq!(config.app.name, "codeflow_pipeline");
        assert!(ConfigLoader::from_file(dir.path().join("absent.yaml"))
            .await
            .is_err());
    }
}
