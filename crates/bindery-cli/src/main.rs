use anyhow::Result;
use clap::{CommandFactory, Parser};
use console::style;
use std::collections::BTreeMap;
use tracing_subscriber::EnvFilter;

use bindery_core::workflow::engine::WorkflowEngine;
use bindery_core::workflow::store::CheckpointStore;
use bindery_infra::sqlite::{
    DatabasePool, SqliteBookCatalog, SqliteRunRepository, default_data_dir, default_database_url,
};

mod cli;
mod handlers;
mod workflows;

use cli::{Cli, Commands};

#[tokio::main]
async fn main() {
    let args = Cli::parse();

    let filter = match (args.verbose, args.quiet) {
        (0, true) => "error",
        (0, false) => "warn",
        (1, _) => "info,bindery=debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();

    if let Commands::Completions { shell } = args.command {
        let mut cmd = Cli::command();
        let name = cmd.get_name().to_string();
        clap_complete::generate(shell, &mut cmd, name, &mut std::io::stdout());
        return;
    }

    if let Err(e) = run(args).await {
        eprintln!();
        eprintln!("  {} {}", style("Error:").red().bold(), e);
        eprintln!();
        std::process::exit(1);
    }
}

async fn run(args: Cli) -> Result<()> {
    let database_url = match &args.db {
        Some(path) => format!("sqlite://{path}?mode=rwc"),
        None => {
            tokio::fs::create_dir_all(default_data_dir()).await?;
            default_database_url()
        }
    };
    tracing::debug!(%database_url, "opening database");
    let pool = DatabasePool::new(&database_url).await?;

    let repo = SqliteRunRepository::new(pool.clone());
    let catalog = SqliteBookCatalog::new(pool);
    let mut engine = WorkflowEngine::new(CheckpointStore::new(repo));

    // Keep definitions around so inspection commands can render gate prompts.
    let mut definitions = BTreeMap::new();
    for (definition, registry) in workflows::builtin()? {
        definitions.insert(definition.workflow_type().to_string(), definition.clone());
        engine.register_workflow(definition, registry)?;
    }

    match args.command {
        Commands::Start {
            workflow_type,
            book,
        } => cli::run::handle_start(&engine, &catalog, &workflow_type, &book, args.json).await,
        Commands::Resume { run } => cli::run::handle_resume(&engine, &run, args.json).await,
        Commands::Status { run } => {
            cli::run::handle_status(&engine, &definitions, &run, args.json).await
        }
        Commands::List { book, status } => {
            cli::run::handle_list(&engine, book, status, args.json).await
        }
        Commands::Gate {
            run,
            decision,
            input,
        } => cli::run::handle_gate(&engine, &run, &decision, input, args.json).await,
        Commands::Completions { .. } => Ok(()),
    }
}
