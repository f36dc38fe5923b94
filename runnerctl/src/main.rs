use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use config_loader::{ConfigError, ConfigManager};
use script_runner::config::CONFIG_NAME;
use script_runner::{
    CancellationToken, ExecutionRequest, LocalStorage, RunnerConfig, RunnerError, RunnerKind,
    ScriptRunner,
};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "runnerctl", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command list and print the result as JSON
    Run(RunArgs),
    /// Configuration helpers
    Config {
        #[command(subcommand)]
        cmd: ConfigCommands,
    },
    /// Print version and exit
    Version,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
}

#[derive(Args)]
struct RunArgs {
    /// Execution request file (JSON or YAML)
    #[arg(long, short = 'f', value_name = "FILE", conflicts_with = "commands")]
    file: Option<PathBuf>,
    /// Working directory; a fresh temporary directory when omitted
    #[arg(long, value_name = "DIR")]
    workdir: Option<PathBuf>,
    /// Command to run; repeat to build a list
    #[arg(short = 'c', long = "command", value_name = "CMD")]
    commands: Vec<String>,
    /// Container image (implies nothing about the backend)
    #[arg(long)]
    image: Option<String>,
    /// Run inside a container
    #[arg(long, conflicts_with = "local")]
    container: bool,
    /// Run as a local process
    #[arg(long)]
    local: bool,
    /// Environment entry, KEY=VALUE
    #[arg(short = 'e', long = "env", value_name = "KEY=VALUE", value_parser = parse_key_val)]
    env: Vec<(String, String)>,
    /// Output file to upload after a successful run
    #[arg(long = "output-file", value_name = "PATH")]
    output_files: Vec<String>,
    /// Output directory to upload recursively after a successful run
    #[arg(long = "output-dir", value_name = "PATH")]
    output_dirs: Vec<String>,
}

fn init_tracing() {
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Run(args) => {
            let code = run(args).await?;
            if code != 0 {
                std::process::exit(code);
            }
        }
        Commands::Config {
            cmd: ConfigCommands::Show,
        } => {
            let config = load_config()?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
        }
    }
    Ok(())
}

async fn run(args: RunArgs) -> Result<i32> {
    let config = load_config()?;
    let kind = if args.container {
        RunnerKind::Container
    } else if args.local {
        RunnerKind::Local
    } else {
        config.default_runner
    };
    let request = build_request(&args)?;

    let storage = Arc::new(LocalStorage::new(absolute(&config.storage.root)?));
    let runner = ScriptRunner::new(config, storage);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling execution");
            interrupt.cancel();
        }
    });

    match runner.run(&request, kind, cancel).await {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(0)
        }
        Err(err) => {
            println!("{}", serde_json::to_string_pretty(&error_report(&err))?);
            eprintln!("Execution failed: {}", err);
            Ok(process_exit_code(&err))
        }
    }
}

fn build_request(args: &RunArgs) -> Result<ExecutionRequest> {
    let mut request = match &args.file {
        Some(path) => read_request(path)?,
        None => {
            if args.commands.is_empty() {
                bail!("Provide --file or at least one --command");
            }
            let mut request = ExecutionRequest::new(PathBuf::new(), args.commands.clone());
            request.working_dir = match &args.workdir {
                Some(dir) => absolute(dir)?,
                None => std::env::temp_dir().join(format!("script-runner-{}", request.execution_id)),
            };
            request
        }
    };

    if args.file.is_some() {
        if let Some(dir) = &args.workdir {
            request.working_dir = absolute(dir)?;
        }
    }
    if let Some(image) = &args.image {
        request.container.image = Some(image.clone());
    }
    request.env.extend(args.env.iter().cloned());
    request.output_files.extend(args.output_files.iter().cloned());
    request.output_dirs.extend(args.output_dirs.iter().cloned());

    debug!(execution_id = %request.execution_id, working_dir = %request.working_dir.display(), "Built execution request");
    Ok(request)
}

fn read_request(path: &Path) -> Result<ExecutionRequest> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read request file {}", path.display()))?;
    let is_yaml = matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("yaml") | Some("yml")
    );
    let mut request: ExecutionRequest = if is_yaml {
        serde_yaml::from_str(&content)
            .with_context(|| format!("Invalid YAML request {}", path.display()))?
    } else {
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid JSON request {}", path.display()))?
    };
    if request.working_dir.is_relative() {
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        request.working_dir = absolute(&base.join(&request.working_dir))?;
    }
    Ok(request)
}

/// Effective deployment configuration. A missing schema (running outside a
/// checkout) falls back to built-in defaults.
fn load_config() -> Result<RunnerConfig> {
    let manager = ConfigManager::new();
    let config = match manager.load::<RunnerConfig>(CONFIG_NAME) {
        Ok(config) => config,
        Err(ConfigError::SchemaNotFound { .. }) if !manager.config_path(CONFIG_NAME).exists() => {
            debug!("No config schema or file found; using built-in defaults");
            RunnerConfig::default()
        }
        Err(err) => return Err(err).context("Failed to load runner configuration"),
    };
    Ok(config.with_env_overrides())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()
        .context("Failed to resolve current directory")?
        .join(path))
}

fn error_report(err: &RunnerError) -> serde_json::Value {
    let mut report = json!({
        "error": {
            "code": err.code(),
            "message": err.to_string(),
        }
    });
    if let Some(exit_code) = err.exit_code() {
        report["error"]["exitCode"] = json!(exit_code);
    }
    if let Some((stdout_lines, stderr_lines)) = err.line_counts() {
        report["error"]["stdoutLines"] = json!(stdout_lines);
        report["error"]["stderrLines"] = json!(stderr_lines);
    }
    if let Some(captured) = err.captured() {
        report["error"]["outputs"] = json!(captured.outputs);
    }
    report
}

/// The script's own exit code when it has one that a process can return,
/// 1 otherwise.
fn process_exit_code(err: &RunnerError) -> i32 {
    match err.exit_code() {
        Some(code) if (1..=255).contains(&code) => code as i32,
        _ => 1,
    }
}

fn parse_key_val(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}
