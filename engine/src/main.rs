// Polyquery task orchestrator
// Main entry point for the polyquery binary

use clap::Parser;
use polyquery_engine::cli::{Cli, Command};
use polyquery_engine::config::Config;
use polyquery_engine::handlers::{
    handle_decompose, handle_doctor, handle_execute, handle_run, handle_schema, OutputFormat,
};
use polyquery_engine::telemetry::init_telemetry_with_level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // RUST_LOG > --log > config file
    match &cli.log {
        Some(level) => init_telemetry_with_level(level),
        None => init_telemetry_with_level(&config.core.log_level),
    }

    let version = env!("CARGO_PKG_VERSION");
    let commit = env!("GIT_COMMIT_HASH");
    let timestamp = env!("BUILD_TIMESTAMP");

    tracing::debug!("Polyquery v{} ({} - {})", version, commit, timestamp);

    match cli.command {
        Command::Run { utterance } => {
            tracing::info!("Running request: {}", utterance);
            handle_run(utterance, &config, format).await
        }

        Command::Decompose { utterance } => {
            tracing::info!("Decomposing request: {}", utterance);
            handle_decompose(utterance, &config, format).await
        }

        Command::Execute { input } => {
            tracing::info!("Executing analysis from {}", input);
            handle_execute(input, &config, format).await
        }

        Command::Schema => handle_schema(&config, format).await,

        Command::Doctor => {
            tracing::info!("Running diagnostics...");
            handle_doctor(&config, format).await
        }
    }
}
