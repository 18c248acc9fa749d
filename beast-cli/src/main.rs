use std::path::{Path, PathBuf};
use std::process::ExitCode;

use beast_agent::{AgentConfig, AgentRuntime, perform_healthcheck, shutdown_signal};
use beast_observability::{LogFormat, TracingConfig, init_tracing};
use clap::{Parser, Subcommand};

/// Exit code for unusable configuration
const EXIT_CONFIG: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "beast-agent", version)]
#[command(about = "Beast mailbox agent - answers LLM prompts from a Redis Streams mailbox")]
struct Cli {
    /// Load environment from this file instead of ~/.env and ./.env
    #[arg(long, global = true, value_name = "PATH")]
    env_file: Option<PathBuf>,

    /// Override BEAST_LOG_LEVEL
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Override BEAST_LOG_FORMAT (json, pretty)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Consume the mailbox until SIGINT or SIGTERM
    Run,
    /// Check that Redis is reachable; exit 0 if healthy, 1 otherwise
    Healthcheck,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = load_env_files(cli.env_file.as_deref()) {
        eprintln!("Error: {e}");
        return ExitCode::from(EXIT_CONFIG);
    }

    let config = match AgentConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let tracing_config = TracingConfig::new(
        cli.log_level.clone().unwrap_or_else(|| config.log_level.clone()),
        cli.log_format.unwrap_or(config.log_format),
    );
    if let Err(e) = init_tracing(&tracing_config) {
        eprintln!("Error: {e}");
        return ExitCode::from(EXIT_CONFIG);
    }

    match cli.command {
        Commands::Run => run(config).await,
        Commands::Healthcheck => healthcheck(&config).await,
    }
}

async fn run(config: AgentConfig) -> ExitCode {
    let mut runtime = match AgentRuntime::builder(config).build() {
        Ok(runtime) => runtime,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build agent runtime");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    match runtime.run_until(shutdown_signal()).await {
        Ok(stats) => {
            tracing::info!(
                succeeded = stats.succeeded,
                failed = stats.failed,
                abandoned = stats.abandoned,
                "Agent exited cleanly"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Agent stopped with an error");
            ExitCode::FAILURE
        }
    }
}

async fn healthcheck(config: &AgentConfig) -> ExitCode {
    let health = perform_healthcheck(config).await;
    match serde_json::to_string(&health) {
        Ok(json) => println!("{json}"),
        Err(_) => println!("{}", health.status.as_str()),
    }

    if health.is_healthy() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Load `.env` files without overriding variables already set
///
/// With an explicit path the file must exist. Otherwise `~/.env` and then
/// `./.env` are loaded if present.
fn load_env_files(explicit: Option<&Path>) -> Result<(), dotenvy::Error> {
    if let Some(path) = explicit {
        return dotenvy::from_path(path);
    }

    let home = std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".env"));
    for path in home.into_iter().chain([PathBuf::from(".env")]) {
        match dotenvy::from_path(&path) {
            Ok(()) => {}
            Err(e) if e.not_found() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
