//! Step handlers for the built-in book-production workflows.
//!
//! These are the plumbing collaborators the engine invokes: they produce
//! deterministic results from the step context so runs are inspectable
//! end to end. All of them tolerate re-invocation; a crash between a
//! handler's effect and the checkpoint save replays the step on resume.

use std::collections::BTreeMap;

use bindery_core::workflow::handler::{HandlerFuture, StepContext, StepHandler, StepOutcome};
use bindery_types::value::ContextValue;

/// Draft an edit plan for the target book.
///
/// Writes the plan into the shared data map so the chapter editors and
/// the report step can read it.
pub struct PlanEdits;

impl StepHandler for PlanEdits {
    fn execute(&self, ctx: StepContext) -> HandlerFuture<'_> {
        Box::pin(async move {
            let revision = ctx
                .data
                .get("revision")
                .and_then(ContextValue::as_number)
                .unwrap_or(0.0) as u32
                + 1;
            let plan = format!(
                "edit plan for {} (revision {revision}): tighten prose, normalize headings",
                ctx.target_id
            );
            Ok(StepOutcome::new(ContextValue::text(plan.clone()))
                .with_data("edit_plan", ContextValue::text(plan))
                .with_data("revision", ContextValue::Number(f64::from(revision))))
        })
    }
}

/// Edit one chapter. Runs once per fan-out item.
pub struct EditChapter;

impl StepHandler for EditChapter {
    fn execute(&self, ctx: StepContext) -> HandlerFuture<'_> {
        Box::pin(async move {
            let chapter = ctx.item.as_deref().unwrap_or("whole-book");
            let plan = ctx
                .data
                .get("edit_plan")
                .and_then(ContextValue::as_text)
                .unwrap_or("no plan on file");
            let mut result = BTreeMap::new();
            result.insert("chapter".to_string(), ContextValue::text(chapter));
            result.insert(
                "summary".to_string(),
                ContextValue::text(format!("{chapter} edited per \"{plan}\"")),
            );
            Ok(StepOutcome::new(ContextValue::Map(result)))
        })
    }
}

/// Compile the final editing report from the shared data map and the
/// recorded step results.
pub struct CompileReport;

impl StepHandler for CompileReport {
    fn execute(&self, ctx: StepContext) -> HandlerFuture<'_> {
        Box::pin(async move {
            let revision = ctx
                .data
                .get("revision")
                .and_then(ContextValue::as_number)
                .unwrap_or(1.0) as u32;
            let report = format!(
                "editing report for {}: approved after {revision} revision(s)",
                ctx.target_id
            );
            Ok(StepOutcome::new(ContextValue::text(report)))
        })
    }
}

/// Gather proofreading queries for the whole book.
pub struct CollateQueries;

impl StepHandler for CollateQueries {
    fn execute(&self, ctx: StepContext) -> HandlerFuture<'_> {
        Box::pin(async move {
            let queries = vec![
                ContextValue::text("p.12: inconsistent capitalization"),
                ContextValue::text("p.48: dangling cross-reference"),
            ];
            Ok(
                StepOutcome::new(ContextValue::text(format!(
                    "collated {} queries for {}",
                    queries.len(),
                    ctx.target_id
                )))
                .with_data("queries", ContextValue::List(queries)),
            )
        })
    }
}

/// Apply the collated corrections.
pub struct ApplyCorrections;

impl StepHandler for ApplyCorrections {
    fn execute(&self, ctx: StepContext) -> HandlerFuture<'_> {
        Box::pin(async move {
            let applied = ctx
                .data
                .get("queries")
                .and_then(ContextValue::as_list)
                .map_or(0, <[ContextValue]>::len);
            Ok(StepOutcome::new(ContextValue::text(format!(
                "applied {applied} corrections to {}",
                ctx.target_id
            ))))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ctx(step: &str, item: Option<&str>, data: BTreeMap<String, ContextValue>) -> StepContext {
        StepContext {
            run_id: Uuid::now_v7(),
            workflow_type: "w1_editing".to_string(),
            target_id: "book_core".to_string(),
            step: step.to_string(),
            item: item.map(String::from),
            data,
        }
    }

    #[tokio::test]
    async fn plan_edits_bumps_revision() {
        let first = PlanEdits
            .execute(ctx("plan_edits", None, BTreeMap::new()))
            .await
            .unwrap();
        assert_eq!(
            first.data.get("revision").and_then(ContextValue::as_number),
            Some(1.0)
        );

        let second = PlanEdits
            .execute(ctx("plan_edits", None, first.data))
            .await
            .unwrap();
        assert_eq!(
            second.data.get("revision").and_then(ContextValue::as_number),
            Some(2.0)
        );
    }

    #[tokio::test]
    async fn edit_chapter_reads_the_plan() {
        let mut data = BTreeMap::new();
        data.insert("edit_plan".to_string(), ContextValue::text("trim adverbs"));
        let outcome = EditChapter
            .execute(ctx("chapter_edits", Some("ch02"), data))
            .await
            .unwrap();
        let summary = outcome
            .result
            .get("summary")
            .and_then(ContextValue::as_text)
            .unwrap();
        assert!(summary.contains("ch02"));
        assert!(summary.contains("trim adverbs"));
    }

    #[tokio::test]
    async fn apply_corrections_counts_queries() {
        let collated = CollateQueries
            .execute(ctx("collate_queries", None, BTreeMap::new()))
            .await
            .unwrap();
        let outcome = ApplyCorrections
            .execute(ctx("apply_corrections", None, collated.data))
            .await
            .unwrap();
        assert_eq!(
            outcome.result.as_text(),
            Some("applied 2 corrections to book_core")
        );
    }
}
