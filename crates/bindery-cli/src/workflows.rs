//! Built-in book-production workflow definitions.
//!
//! Each entry pairs a validated [`WorkflowDefinition`] with the handler
//! registry for its steps. The CLI registers all of them on the engine at
//! startup and keeps the definitions around for display (gate prompts in
//! `status` output).

use std::sync::Arc;

use bindery_core::workflow::definition::{
    CompletionPolicy, StepDescriptor, Transition, TransitionTable, WorkflowDefinition,
    WorkflowError,
};
use bindery_core::workflow::handler::HandlerRegistry;

use crate::handlers;

/// All built-in workflow types, definitions paired with handlers.
pub fn builtin() -> Result<Vec<(WorkflowDefinition, HandlerRegistry)>, WorkflowError> {
    Ok(vec![editing()?, proofread()?])
}

/// `w1_editing`: plan, edit chapters in parallel, pause for editorial
/// approval (revise loops back to planning), compile the report.
fn editing() -> Result<(WorkflowDefinition, HandlerRegistry), WorkflowError> {
    let definition = WorkflowDefinition::builder("w1_editing", "plan_edits")
        .step(
            StepDescriptor::sequential("plan_edits")
                .with_max_retries(2)
                .with_max_iterations(3)
                .with_transitions(
                    TransitionTable::new().default_to(Transition::To("chapter_edits".to_string())),
                ),
        )
        .step(
            StepDescriptor::parallel_fanout(
                "chapter_edits",
                vec![
                    "ch01".to_string(),
                    "ch02".to_string(),
                    "ch03".to_string(),
                    "ch04".to_string(),
                ],
                CompletionPolicy::AllSucceed,
                1,
            )
            .with_max_iterations(3)
            .with_transitions(
                TransitionTable::new().default_to(Transition::To("editorial_gate".to_string())),
            ),
        )
        .step(
            StepDescriptor::human_gate(
                "editorial_gate",
                "Approve the edited chapters?",
                vec!["approve".to_string(), "revise".to_string()],
            )
            .with_max_iterations(3)
            .with_transitions(
                TransitionTable::new()
                    .on("revise", Transition::To("plan_edits".to_string()))
                    .on("approve", Transition::To("compile_report".to_string())),
            ),
        )
        .step(
            StepDescriptor::sequential("compile_report")
                .with_transitions(TransitionTable::new().default_to(Transition::Terminate)),
        )
        .build()?;

    let handlers = HandlerRegistry::new()
        .register("plan_edits", Arc::new(handlers::PlanEdits))
        .register("chapter_edits", Arc::new(handlers::EditChapter))
        .register("compile_report", Arc::new(handlers::CompileReport));

    Ok((definition, handlers))
}

/// `w2_proofread`: collate proofreading queries, then apply corrections.
fn proofread() -> Result<(WorkflowDefinition, HandlerRegistry), WorkflowError> {
    let definition = WorkflowDefinition::builder("w2_proofread", "collate_queries")
        .step(
            StepDescriptor::sequential("collate_queries")
                .with_max_retries(1)
                .with_transitions(
                    TransitionTable::new()
                        .default_to(Transition::To("apply_corrections".to_string())),
                ),
        )
        .step(
            StepDescriptor::sequential("apply_corrections")
                .with_max_retries(1)
                .with_transitions(TransitionTable::new().default_to(Transition::Terminate)),
        )
        .build()?;

    let handlers = HandlerRegistry::new()
        .register("collate_queries", Arc::new(handlers::CollateQueries))
        .register("apply_corrections", Arc::new(handlers::ApplyCorrections));

    Ok((definition, handlers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bindery_core::repository::MemoryRunRepository;
    use bindery_core::workflow::engine::WorkflowEngine;
    use bindery_core::workflow::store::CheckpointStore;

    #[test]
    fn builtin_definitions_are_valid() {
        let workflows = builtin().unwrap();
        assert_eq!(workflows.len(), 2);
        let types: Vec<&str> = workflows
            .iter()
            .map(|(d, _)| d.workflow_type())
            .collect();
        assert!(types.contains(&"w1_editing"));
        assert!(types.contains(&"w2_proofread"));
    }

    #[test]
    fn every_non_gate_step_has_a_handler() {
        // engine registration enforces handler coverage
        let mut engine = WorkflowEngine::new(CheckpointStore::new(MemoryRunRepository::new()));
        for (definition, handlers) in builtin().unwrap() {
            engine.register_workflow(definition, handlers).unwrap();
        }
    }

    #[tokio::test]
    async fn editing_workflow_pauses_at_the_gate() {
        let mut engine = WorkflowEngine::new(CheckpointStore::new(MemoryRunRepository::new()));
        for (definition, handlers) in builtin().unwrap() {
            engine.register_workflow(definition, handlers).unwrap();
        }

        let result = engine.start("w1_editing", "book_core").await.unwrap();
        assert_eq!(result.current_step, "editorial_gate");
        let gate = result.gate.unwrap();
        assert_eq!(gate.options, vec!["approve", "revise"]);

        let finished = engine
            .gate_decision(result.run_id, "approve", None)
            .await
            .unwrap();
        assert_eq!(finished.status, bindery_types::run::RunStatus::Completed);
    }

    #[tokio::test]
    async fn proofread_workflow_runs_straight_through() {
        let mut engine = WorkflowEngine::new(CheckpointStore::new(MemoryRunRepository::new()));
        for (definition, handlers) in builtin().unwrap() {
            engine.register_workflow(definition, handlers).unwrap();
        }

        let result = engine.start("w2_proofread", "book_atlas").await.unwrap();
        assert_eq!(result.status, bindery_types::run::RunStatus::Completed);

        let state = engine.run_state(result.run_id).await.unwrap();
        assert_eq!(state.checkpoint.completed_steps.len(), 2);
    }
}
