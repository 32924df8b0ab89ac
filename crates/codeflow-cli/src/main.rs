use std::fs::OpenOptions;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use codeflow_core::config::ConfigLoader;
use codeflow_core::{extract_fenced_language, CodePipeline, PipelineFactory, RunReport};
use log::LevelFilter;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

mod render;

#[derive(Parser, Debug)]
#[clap(
    name = "codeflow",
    author,
    version = "0.1.0",
    about = "Write, review, refactor and execute code with a sequential agent pipeline"
)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(
        long,
        short,
        default_value = "codeflow.yaml",
        help = "Configuration file; built-in defaults are used when it does not exist"
    )]
    config: PathBuf,

    #[clap(long, short, default_value = "info")]
    log_level: String,

    #[clap(long, help = "Append logs to this file instead of stderr")]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the pipeline once for a single request
    Run {
        /// Description of the code to generate
        request: String,

        #[clap(long, help = "Session id; the next counter value is used when omitted")]
        session_id: Option<String>,

        #[clap(long, help = "Print the event stream as JSON after the results")]
        show_events: bool,
    },
    /// Read requests line by line, one fresh session per request
    Repl,
    /// Run a source file through the configured code executor
    Exec {
        file: PathBuf,

        #[clap(long, help = "Language of the file; guessed from the extension when omitted")]
        language: Option<String>,

        #[clap(long, help = "Override the executor timeout in seconds")]
        timeout: Option<u64>,
    },
}

fn init_logging(cli: &Cli) -> Result<()> {
    let log_level_filter = cli.log_level.parse().unwrap_or(LevelFilter::Info);
    let mut builder = env_logger::Builder::new();
    builder.filter_level(log_level_filter);

    if let Some(path) = &cli.log_file {
        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    }

    builder.init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli)?;

    let mut config = ConfigLoader::from_optional_file(&cli.config)
        .await
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    if let Commands::Exec {
        timeout: Some(secs), ..
    } = &cli.command
    {
        config.executor.timeout_secs = (*secs).max(1);
    }

    let pipeline = PipelineFactory::create_from_config(config).await?;
    log::info!(
        "Pipeline ready (degraded: {})",
        pipeline.capabilities().is_degraded()
    );

    match cli.command {
        Commands::Run {
            request,
            session_id,
            show_events,
        } => {
            ensure_not_degraded(&pipeline)?;
            let session_id = session_id.unwrap_or_else(|| pipeline.next_session_id());
            let report = run_once(&pipeline, &request, &session_id).await?;
            print!("{}", render::render_report(&report));
            if show_events {
                println!("{}", serde_json::to_string_pretty(&report.events)?);
            }
            if !report.is_success() {
                anyhow::bail!("Pipeline run did not complete");
            }
            Ok(())
        }
        Commands::Repl => {
            ensure_not_degraded(&pipeline)?;
            run_repl(&pipeline).await
        }
        Commands::Exec { file, language, .. } => run_exec(&pipeline, &file, language).await,
    }
}

fn ensure_not_degraded(pipeline: &CodePipeline) -> Result<()> {
    if let Some(reason) = pipeline.capabilities().model.reason() {
        anyhow::bail!("Cannot run pipeline: {}", reason);
    }
    Ok(())
}

/// One run; Ctrl-C cancels the step in flight.
async fn run_once(pipeline: &CodePipeline, request: &str, session_id: &str) -> Result<RunReport> {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("Interrupt received, cancelling run");
            trigger.cancel();
        }
    });

    let result = pipeline
        .run_pipeline_with_cancel(request, session_id, cancel)
        .await;
    ctrl_c.abort();
    Ok(result?)
}

async fn run_repl(pipeline: &CodePipeline) -> Result<()> {
    println!("Describe the Python code you want. An empty line or 'exit' quits.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        eprint!("> ");
        let line = match lines.next_line().await? {
            Some(line) => line,
            None => break,
        };
        let request = line.trim();
        if request.is_empty() || request == "exit" || request == "quit" {
            break;
        }

        let session_id = pipeline.next_session_id();
        match run_once(pipeline, request, &session_id).await {
            Ok(report) => print!("{}", render::render_report(&report)),
            Err(e) => eprintln!("An error occurred during pipeline execution: {:?}", e),
        }
    }
    Ok(())
}

fn language_for(file: &std::path::Path, source: &str) -> String {
    match file.extension().and_then(|e| e.to_str()) {
        Some("py") => "python".to_string(),
        Some("js") | Some("mjs") => "javascript".to_string(),
        Some("sh") => "sh".to_string(),
        _ => extract_fenced_language(source).unwrap_or_else(|| "python".to_string()),
    }
}

async fn run_exec(
    pipeline: &CodePipeline,
    file: &std::path::Path,
    language: Option<String>,
) -> Result<()> {
    let source = tokio::fs::read_to_string(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let language = language.unwrap_or_else(|| language_for(file, &source));
    let code = codeflow_core::extract_code(Some(&source));

    log::info!(
        "Executing {} ({}) with a {:?} budget",
        file.display(),
        language,
        Duration::from_secs(pipeline.config().executor.timeout_secs)
    );
    let result = pipeline.execute_code(&language, &code).await?;
    println!("{}", result.summary());
    if !result.is_success() {
        anyhow::bail!("Execution failed");
    }
    Ok(())
}
