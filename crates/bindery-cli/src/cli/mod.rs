//! CLI command definitions for the `bindery` binary.
//!
//! Uses clap derive macros for argument parsing. Each subcommand opens the
//! store, performs one engine operation, and exits.

pub mod run;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run book-production workflows with durable checkpoints.
#[derive(Parser)]
#[command(name = "bindery", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the SQLite database (default: ~/.bindery/bindery.db,
    /// overridable via BINDERY_DATA_DIR).
    #[arg(long, global = true)]
    pub db: Option<String>,

    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a new workflow run for a book.
    Start {
        /// Workflow type to run (e.g. w1_editing).
        #[arg(long = "type")]
        workflow_type: String,

        /// Book slug the run operates on.
        #[arg(long)]
        book: String,
    },

    /// Resume an interrupted or paused run from its checkpoint.
    Resume {
        /// Run UUID.
        #[arg(long)]
        run: String,
    },

    /// Show the full state of a run.
    Status {
        /// Run UUID.
        #[arg(long)]
        run: String,
    },

    /// List workflow runs.
    #[command(alias = "ls")]
    List {
        /// Filter by book slug.
        #[arg(long)]
        book: Option<String>,

        /// Filter by status (pending, running, paused, completed, failed).
        #[arg(long)]
        status: Option<String>,
    },

    /// Record a decision for a run paused at a human gate.
    Gate {
        /// Run UUID.
        #[arg(long)]
        run: String,

        /// The gate option to take (e.g. approve, revise).
        #[arg(long)]
        decision: String,

        /// Optional free-text note attached to the decision.
        #[arg(long)]
        input: Option<String>,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
