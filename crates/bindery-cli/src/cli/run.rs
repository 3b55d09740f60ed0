//! Handlers for the run-facing subcommands.
//!
//! Each handler performs one engine operation and renders the outcome as
//! either styled text or JSON (`--json`).

use anyhow::{Context, Result};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use bindery_core::repository::{RunFilter, RunRepository};
use bindery_core::workflow::definition::{StepKind, WorkflowDefinition};
use bindery_core::workflow::engine::{ExecutionResult, RunState, WorkflowEngine};
use bindery_infra::sqlite::SqliteBookCatalog;
use bindery_types::run::RunStatus;
use bindery_types::value::ContextValue;
use std::collections::BTreeMap;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Start
// ---------------------------------------------------------------------------

pub async fn handle_start<R: RunRepository + 'static>(
    engine: &WorkflowEngine<R>,
    catalog: &SqliteBookCatalog,
    workflow_type: &str,
    book_slug: &str,
    json: bool,
) -> Result<()> {
    let book = catalog
        .get_book(book_slug)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to look up book: {e}"))?
        .ok_or_else(|| anyhow::anyhow!("Book '{book_slug}' not found"))?;

    let result = engine
        .start(workflow_type, &book.slug)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start run: {e}"))?;

    if json {
        print_result_json(&result)?;
        return Ok(());
    }

    println!();
    println!(
        "  {} Started '{}' for '{}'",
        style("*").green().bold(),
        style(workflow_type).cyan(),
        style(&book.title).cyan()
    );
    print_result_text(&result);
    Ok(())
}

// ---------------------------------------------------------------------------
// Resume
// ---------------------------------------------------------------------------

pub async fn handle_resume<R: RunRepository + 'static>(
    engine: &WorkflowEngine<R>,
    run_id_str: &str,
    json: bool,
) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let result = engine
        .resume(run_id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to resume run: {e}"))?;

    if json {
        print_result_json(&result)?;
        return Ok(());
    }

    println!();
    println!(
        "  {} Resumed run '{}'",
        style("*").green().bold(),
        style(short_id(&run_id)).cyan()
    );
    print_result_text(&result);
    Ok(())
}

// ---------------------------------------------------------------------------
// Gate
// ---------------------------------------------------------------------------

pub async fn handle_gate<R: RunRepository + 'static>(
    engine: &WorkflowEngine<R>,
    run_id_str: &str,
    decision: &str,
    input: Option<String>,
    json: bool,
) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let result = engine
        .gate_decision(run_id, decision, input)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to record gate decision: {e}"))?;

    if json {
        print_result_json(&result)?;
        return Ok(());
    }

    println!();
    println!(
        "  {} Recorded '{}' for run '{}'",
        style("*").green().bold(),
        style(decision).cyan(),
        style(short_id(&run_id)).cyan()
    );
    print_result_text(&result);
    Ok(())
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

pub async fn handle_status<R: RunRepository + 'static>(
    engine: &WorkflowEngine<R>,
    definitions: &BTreeMap<String, WorkflowDefinition>,
    run_id_str: &str,
    json: bool,
) -> Result<()> {
    let run_id = parse_run_id(run_id_str)?;
    let state = engine
        .run_state(run_id)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to get run state: {e}"))?;

    if json {
        let completed: Vec<_> = state
            .checkpoint
            .completed_steps
            .iter()
            .map(|c| {
                serde_json::json!({
                    "step": c.step,
                    "completed_at": c.completed_at.to_rfc3339(),
                })
            })
            .collect();
        let out = serde_json::json!({
            "run_id": state.run.id.to_string(),
            "workflow_type": state.run.workflow_type,
            "book": state.run.target_id,
            "status": state.display_status(),
            "current_step": state.checkpoint.current_step,
            "completed_steps": completed,
            "iteration_counts": state.checkpoint.iteration_counts,
            "pending_retry": state.checkpoint.pending_retry.as_ref().map(|p| {
                serde_json::json!({"step": p.step, "attempt": p.attempt, "error": p.error})
            }),
            "error": state.run.error,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    print_state_text(&state, definitions);
    Ok(())
}

fn print_state_text(state: &RunState, definitions: &BTreeMap<String, WorkflowDefinition>) {
    println!();
    println!(
        "  {} {}",
        style("Run").bold(),
        style(short_id(&state.run.id)).cyan()
    );
    println!("  Workflow: {}", style(&state.run.workflow_type).cyan());
    println!("  Book: {}", style(&state.run.target_id).cyan());
    println!("  Status: {}", styled_status(state.display_status()));
    println!("  Current step: {}", state.checkpoint.current_step);
    println!(
        "  Updated: {}",
        state.run.updated_at.format("%Y-%m-%d %H:%M:%S")
    );

    if let Some(retry) = &state.checkpoint.pending_retry {
        println!(
            "  Pending retry: step '{}' attempt {} ({})",
            retry.step,
            retry.attempt,
            style(&retry.error).red()
        );
    }
    if let Some(err) = &state.run.error {
        println!("  Error: {}", style(err).red());
    }

    // gate prompt for a run waiting on a decision
    if state.display_status() == "awaiting_human"
        && let Some(definition) = definitions.get(&state.run.workflow_type)
        && let Some(step) = definition.step(&state.checkpoint.current_step)
        && let StepKind::HumanGate { prompt, options } = step.kind()
    {
        println!();
        println!("  {} {}", style("Gate:").magenta().bold(), prompt);
        println!("  Options: {}", options.join(", "));
        println!(
            "  Decide with: {}",
            style(format!(
                "bindery gate --run {} --decision <option>",
                state.run.id
            ))
            .dim()
        );
    }

    if !state.checkpoint.completed_steps.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Step").fg(Color::Cyan),
                Cell::new("Completed"),
                Cell::new("Result"),
            ]);
        for completion in &state.checkpoint.completed_steps {
            table.add_row(vec![
                Cell::new(&completion.step),
                Cell::new(completion.completed_at.format("%Y-%m-%d %H:%M:%S").to_string()),
                Cell::new(summarize_value(&completion.result)),
            ]);
        }
        println!();
        println!("{table}");
    }
    println!();
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

pub async fn handle_list<R: RunRepository + 'static>(
    engine: &WorkflowEngine<R>,
    book: Option<String>,
    status: Option<String>,
    json: bool,
) -> Result<()> {
    let status = status
        .as_deref()
        .map(|s| {
            s.parse::<RunStatus>().map_err(|_| {
                anyhow::anyhow!(
                    "Invalid status '{s}' (expected one of: pending, running, paused, completed, failed)"
                )
            })
        })
        .transpose()?;

    let filter = RunFilter {
        target_id: book,
        status,
    };
    let runs = engine
        .list_runs(&filter)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to list runs: {e}"))?;

    if json {
        let out: Vec<_> = runs
            .iter()
            .map(|r| {
                serde_json::json!({
                    "run_id": r.id.to_string(),
                    "workflow_type": r.workflow_type,
                    "book": r.target_id,
                    "status": r.status.as_str(),
                    "current_step": r.current_step,
                    "created_at": r.created_at.to_rfc3339(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No runs found.");
        println!(
            "  Start one with: {}",
            style("bindery start --type w1_editing --book <slug>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Workflow"),
            Cell::new("Book"),
            Cell::new("Step"),
            Cell::new("Created"),
        ]);

    for run in &runs {
        table.add_row(vec![
            Cell::new(short_id(&run.id)),
            status_cell(run.status),
            Cell::new(&run.workflow_type),
            Cell::new(&run.target_id),
            Cell::new(&run.current_step),
            Cell::new(run.created_at.format("%Y-%m-%d %H:%M").to_string()),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Shared rendering
// ---------------------------------------------------------------------------

fn print_result_text(result: &ExecutionResult) {
    println!("  Run ID: {}", result.run_id);
    println!("  Status: {}", styled_status(display_label(result)));
    println!("  Step: {}", result.current_step);
    if let Some(gate) = &result.gate {
        println!();
        println!("  {} {}", style("Gate:").magenta().bold(), gate.prompt);
        println!("  Options: {}", gate.options.join(", "));
        println!(
            "  Decide with: {}",
            style(format!(
                "bindery gate --run {} --decision <option>",
                result.run_id
            ))
            .dim()
        );
    }
    println!();
}

fn print_result_json(result: &ExecutionResult) -> Result<()> {
    let out = serde_json::json!({
        "run_id": result.run_id.to_string(),
        "status": display_label(result),
        "current_step": result.current_step,
        "gate": result.gate.as_ref().map(|g| {
            serde_json::json!({"gate": g.gate, "prompt": g.prompt, "options": g.options})
        }),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

/// A freshly paused run is always waiting on a human.
fn display_label(result: &ExecutionResult) -> &'static str {
    if result.status == RunStatus::Paused {
        "awaiting_human"
    } else {
        result.status.as_str()
    }
}

fn styled_status(label: &str) -> String {
    let styled = match label {
        "pending" => style(label).yellow(),
        "running" => style(label).blue(),
        "awaiting_human" | "paused" => style(label).magenta(),
        "completed" => style(label).green(),
        "failed" => style(label).red(),
        _ => style(label),
    };
    styled.to_string()
}

fn status_cell(status: RunStatus) -> Cell {
    match status {
        RunStatus::Pending => Cell::new("pending").fg(Color::Yellow),
        RunStatus::Running => Cell::new("running").fg(Color::Blue),
        RunStatus::Paused => Cell::new("awaiting_human").fg(Color::Magenta),
        RunStatus::Completed => Cell::new("completed").fg(Color::Green),
        RunStatus::Failed => Cell::new("failed").fg(Color::Red),
    }
}

fn summarize_value(value: &ContextValue) -> String {
    let rendered = match value {
        ContextValue::Text(s) => s.clone(),
        other => serde_json::to_string(other).unwrap_or_else(|_| "<unrenderable>".to_string()),
    };
    if rendered.chars().count() > 60 {
        let truncated: String = rendered.chars().take(57).collect();
        format!("{truncated}...")
    } else {
        rendered
    }
}

fn parse_run_id(s: &str) -> Result<Uuid> {
    s.parse::<Uuid>()
        .with_context(|| format!("Invalid run ID: '{s}'"))
}

fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}
