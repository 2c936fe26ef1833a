//! CLI interface for Polyquery
//!
//! This module provides the command-line interface using clap's derive API.
//! It defines the pipeline commands and global flags.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Polyquery task orchestrator
///
/// Answers natural-language requests over a structured and a document store
/// by decomposing them into tasks, running each against its store and
/// merging the results.
#[derive(Parser, Debug)]
#[command(name = "polyquery")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Decompose and execute a request
    Run {
        /// The request, in natural language
        utterance: String,
    },

    /// Only decompose a request and print the task analysis
    Decompose {
        /// The request, in natural language
        utterance: String,
    },

    /// Execute a previously produced task analysis
    Execute {
        /// File holding the analysis JSON, or "-" for stdin
        #[arg(default_value = "-")]
        input: String,
    },

    /// Print the schema context handed to the decomposer
    Schema,

    /// Validate configuration and check providers and stores
    Doctor,
}
