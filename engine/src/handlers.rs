//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - run: Decompose and execute a request
//! - decompose: Print the task analysis for a request
//! - execute: Run a stored task analysis
//! - schema: Print the schema context of both stores
//! - doctor: Validate configuration and check providers and stores

use anyhow::{Context, Result};
use serde_json::json;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use crate::conductor::types::{Outcome, Payload};
use crate::conductor::{read_analysis, Conductor, PipelineResponse, TaskAnalysis};
use crate::config::{expand_path, Config};
use crate::llm::router::LLMRouter;
use crate::store::{ConfiguredStores, StoreConnector};

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Decompose and execute a request
pub async fn handle_run(utterance: String, config: &Config, format: OutputFormat) -> Result<()> {
    let conductor = Conductor::from_config(config.clone())?;
    let response = conductor.run(&utterance).await;
    print_response(&response, format)?;

    if response.is_fatal() {
        std::process::exit(1);
    }
    Ok(())
}

/// Print the task analysis for a request without executing it
pub async fn handle_decompose(
    utterance: String,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let conductor = Conductor::from_config(config.clone())?;

    match conductor.decompose(&utterance).await {
        Ok(batch) => {
            let analysis = TaskAnalysis::from(&batch);
            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&analysis)?);
                }
                OutputFormat::Text => {
                    println!("{} task(s):", analysis.analysis.total_tasks);
                    for (i, task) in batch.tasks.iter().enumerate() {
                        println!(
                            "  [{}] {} (priority {}, deps {:?})",
                            i, task.agent, task.priority, task.dependencies
                        );
                        println!("      {}", task.task_definition);
                    }
                }
            }
            Ok(())
        }
        Err(e) => {
            let fatal = crate::conductor::aggregator::fatal(&e);
            print_response(&PipelineResponse::Fatal(fatal), format)?;
            std::process::exit(1);
        }
    }
}

/// Execute an analysis document read from a file or stdin
pub async fn handle_execute(input: String, config: &Config, format: OutputFormat) -> Result<()> {
    let content = if input == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read analysis from stdin")?;
        buf
    } else {
        std::fs::read_to_string(&input)
            .with_context(|| format!("Failed to read analysis from {}", input))?
    };

    let conductor = Conductor::from_config(config.clone())?;
    let response = match read_analysis(&content) {
        Ok(batch) => conductor.execute(batch).await,
        Err(e) => PipelineResponse::Fatal(crate::conductor::aggregator::fatal(&e)),
    };
    print_response(&response, format)?;

    if response.is_fatal() {
        std::process::exit(1);
    }
    Ok(())
}

/// Print the schema context the decomposer would receive
pub async fn handle_schema(config: &Config, format: OutputFormat) -> Result<()> {
    let conductor = Conductor::from_config(config.clone())?;
    let schema = conductor.schema_context().await;

    match format {
        OutputFormat::Json => {
            let output = json!({
                "structured": schema.structured,
                "document": schema.document,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Text => {
            println!("Structured store:");
            println!("{}", schema.structured);
            println!();
            println!("Document store:");
            if schema.document.is_empty() {
                println!("No NoSQL schema available");
            }
            for (collection, shape) in &schema.document {
                println!("  {}", collection);
                for (field, kind) in shape {
                    println!("    {:<24} {}", field, kind);
                }
            }
        }
    }

    Ok(())
}

/// Validate configuration and check dependencies
pub async fn handle_doctor(config: &Config, format: OutputFormat) -> Result<()> {
    let mut issues = Vec::new();
    let mut checks: Vec<(&str, String)> = Vec::new();

    // Config is already validated when loaded
    checks.push(("Configuration", "Valid".to_string()));
    checks.push((
        "Build",
        format!("{} ({})", env!("GIT_COMMIT_HASH"), env!("BUILD_TIMESTAMP")),
    ));

    let data_dir = expand_path(&config.core.data_dir)?;
    if data_dir.exists() {
        checks.push(("Data directory", "Exists".to_string()));
    } else {
        checks.push(("Data directory", "Missing".to_string()));
        issues.push(format!("Data directory does not exist: {:?}", data_dir));
    }

    let router = LLMRouter::from_config(Arc::new(config.llm.clone()));
    let health = router.check_health().await;
    for (name, healthy) in &health {
        let label = match *name {
            "ollama" => "Ollama",
            "openai" => "OpenAI",
            _ => "LLM provider",
        };
        checks.push((
            label,
            if *healthy { "Available" } else { "Not available" }.to_string(),
        ));
    }
    if !health.iter().any(|(_, healthy)| *healthy) {
        issues.push("No LLM providers available. Configure at least one provider.".to_string());
    }

    let stores = ConfiguredStores::new(
        config.stores.clone(),
        Duration::from_secs(config.orchestration.store_timeout_secs),
    );

    match stores.structured().await {
        Ok(store) => match store.schema().await {
            Ok(ddl) => {
                let tables = ddl.lines().filter(|l| !l.trim().is_empty()).count();
                checks.push(("Structured store", format!("OK ({} tables)", tables)));
            }
            Err(e) => {
                checks.push(("Structured store", "Schema unreadable".to_string()));
                issues.push(format!("Cannot read structured schema: {:#}", e));
            }
        },
        Err(e) => {
            checks.push(("Structured store", "Unavailable".to_string()));
            issues.push(format!("Cannot open structured store: {:#}", e));
        }
    }

    match stores.document().await {
        Ok(_) => checks.push(("Document store", "OK".to_string())),
        Err(e) => {
            checks.push(("Document store", "Unavailable".to_string()));
            issues.push(format!("Cannot reach document store: {:#}", e));
        }
    }

    match format {
        OutputFormat::Text => {
            println!("Polyquery Diagnostics");
            println!("============================");
            println!();

            println!("System Checks:");
            for (check, status) in &checks {
                println!("  {:<25} {}", format!("{}:", check), status);
            }

            println!();

            if issues.is_empty() {
                println!("✓ All checks passed!");
            } else {
                println!("⚠ Issues found:");
                println!();
                for (i, issue) in issues.iter().enumerate() {
                    println!("  {}. {}", i + 1, issue);
                }
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "checks": checks.iter().map(|(name, status)| {
                    json!({
                        "name": name,
                        "status": status
                    })
                }).collect::<Vec<_>>(),
                "issues": issues,
                "healthy": issues.is_empty()
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    Ok(())
}

fn print_response(response: &PipelineResponse, format: OutputFormat) -> Result<()> {
    match (format, response) {
        (OutputFormat::Json, _) => {
            println!("{}", serde_json::to_string_pretty(response)?);
        }
        (OutputFormat::Text, PipelineResponse::Fatal(fatal)) => {
            eprintln!("Error: {}", fatal.error);
        }
        (OutputFormat::Text, PipelineResponse::Report(report)) => {
            println!(
                "{} task(s), {} failed",
                report.results.len(),
                report.failure_count()
            );
            for (i, result) in report.results.iter().enumerate() {
                println!();
                println!("[{}] {} {}", i, result.task.agent, result.task.task_definition);
                match &result.outcome {
                    Outcome::Success(payload) => print_payload(payload)?,
                    Outcome::Failure(error) => println!("  failed: {}", error),
                }
            }
        }
    }
    Ok(())
}

fn print_payload(payload: &Payload) -> Result<()> {
    match payload {
        Payload::Rows { query, rows } => {
            println!("  query: {}", query);
            println!("  {} row(s)", rows.len());
            for row in rows {
                println!("  {}", serde_json::to_string(row)?);
            }
        }
        Payload::Mutation {
            query,
            affected_rows,
        } => {
            println!("  query: {}", query);
            println!("  {} row(s) affected", affected_rows);
        }
        Payload::Documents {
            collection,
            documents,
            ..
        } => {
            println!("  {} document(s) from {}", documents.len(), collection);
            for document in documents {
                println!("  {}", serde_json::to_string(document)?);
            }
        }
        Payload::DocumentMutation {
            collection,
            operation,
            affected_count,
            inserted_ids,
            ..
        } => {
            println!(
                "  {} on {}: {} affected",
                operation, collection, affected_count
            );
            if !inserted_ids.is_empty() {
                println!("  inserted: {}", inserted_ids.join(", "));
            }
        }
        Payload::Info { data, .. } => {
            println!("  {}", serde_json::to_string_pretty(data)?);
        }
    }
    Ok(())
}
