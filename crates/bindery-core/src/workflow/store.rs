//! Checkpoint store: durable run progress on top of a [`RunRepository`].
//!
//! The store pairs each pure [`Checkpoint`] mutation with an immediate
//! save, so every recorded fact is on disk before the engine moves on.
//! A crash therefore loses at most the step that was in flight; resume
//! picks up from the last saved document.

use bindery_types::checkpoint::{Checkpoint, PendingRetry};
use bindery_types::error::{PreconditionError, RepositoryError};
use bindery_types::run::{RunStatus, WorkflowRun};
use bindery_types::value::ContextValue;
use thiserror::Error;
use uuid::Uuid;

use crate::repository::RunRepository;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    /// The underlying repository failed. Carries which store operation it
    /// was serving so logs stay actionable.
    #[error("checkpoint {operation} failed for run {run_id}: {message}")]
    DataAccess {
        operation: &'static str,
        run_id: Uuid,
        message: String,
    },

    /// A stored checkpoint document could not be decoded.
    #[error("checkpoint for run {run_id} is corrupt: {message}")]
    Corrupt { run_id: Uuid, message: String },

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error(transparent)]
    Precondition(#[from] PreconditionError),
}

impl StoreError {
    fn data_access(operation: &'static str, run_id: Uuid, err: RepositoryError) -> Self {
        Self::DataAccess {
            operation,
            run_id,
            message: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Persists [`Checkpoint`] documents through a [`RunRepository`].
///
/// The `record_*` / `set_*` / `clear_*` methods apply the matching pure
/// mutation and then save the whole document.
#[derive(Debug)]
pub struct CheckpointStore<R: RunRepository> {
    repo: R,
}

impl<R: RunRepository> CheckpointStore<R> {
    pub fn new(repo: R) -> Self {
        Self { repo }
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    /// Create and persist a fresh checkpoint for an existing run.
    pub async fn create(
        &self,
        run_id: Uuid,
        workflow_type: &str,
        initial_step: &str,
    ) -> Result<Checkpoint, StoreError> {
        self.repo
            .get_run(&run_id)
            .await
            .map_err(|e| StoreError::data_access("create", run_id, e))?
            .ok_or(StoreError::RunNotFound(run_id))?;

        let checkpoint = Checkpoint::new(run_id, workflow_type, initial_step);
        self.save(&checkpoint).await?;
        tracing::debug!(run_id = %run_id, workflow_type, initial_step, "checkpoint created");
        Ok(checkpoint)
    }

    /// Load a run's checkpoint. `None` when the run has never been saved.
    pub async fn load(&self, run_id: Uuid) -> Result<Option<Checkpoint>, StoreError> {
        let Some(json) = self
            .repo
            .load_checkpoint(&run_id)
            .await
            .map_err(|e| StoreError::data_access("load", run_id, e))?
        else {
            return Ok(None);
        };

        let checkpoint = serde_json::from_str(&json).map_err(|e| StoreError::Corrupt {
            run_id,
            message: e.to_string(),
        })?;
        Ok(Some(checkpoint))
    }

    /// Persist the full document, plus the denormalized step pointer and
    /// iteration counts the run listing queries read.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let run_id = checkpoint.run_id;
        let json = serde_json::to_string(checkpoint).map_err(|e| StoreError::Corrupt {
            run_id,
            message: e.to_string(),
        })?;
        let iterations =
            serde_json::to_string(&checkpoint.iteration_counts).map_err(|e| StoreError::Corrupt {
                run_id,
                message: e.to_string(),
            })?;

        self.repo
            .save_checkpoint(&run_id, &json, &checkpoint.current_step, &iterations)
            .await
            .map_err(|e| StoreError::data_access("save", run_id, e))
    }

    // -----------------------------------------------------------------------
    // Persisting mutators
    // -----------------------------------------------------------------------

    pub async fn set_current_step(
        &self,
        checkpoint: &mut Checkpoint,
        step: &str,
    ) -> Result<(), StoreError> {
        checkpoint.set_current_step(step);
        self.save(checkpoint).await
    }

    pub async fn increment_iteration(
        &self,
        checkpoint: &mut Checkpoint,
        step: &str,
    ) -> Result<(), StoreError> {
        checkpoint.increment_iteration(step);
        self.save(checkpoint).await?;
        tracing::debug!(
            run_id = %checkpoint.run_id,
            step,
            count = checkpoint.iteration_count(step),
            "iteration recorded"
        );
        Ok(())
    }

    pub async fn record_step_completion(
        &self,
        checkpoint: &mut Checkpoint,
        step: &str,
        result: ContextValue,
    ) -> Result<(), StoreError> {
        checkpoint.record_step_completion(step, result);
        self.save(checkpoint).await?;
        tracing::debug!(run_id = %checkpoint.run_id, step, "step completion recorded");
        Ok(())
    }

    pub async fn record_pending_retry(
        &self,
        checkpoint: &mut Checkpoint,
        step: &str,
        error: &str,
        attempt: u32,
    ) -> Result<(), StoreError> {
        checkpoint.record_pending_retry(step, error, attempt);
        self.save(checkpoint).await?;
        tracing::debug!(run_id = %checkpoint.run_id, step, attempt, "pending retry recorded");
        Ok(())
    }

    pub async fn clear_pending_retry(
        &self,
        checkpoint: &mut Checkpoint,
    ) -> Result<(), StoreError> {
        checkpoint.clear_pending_retry();
        self.save(checkpoint).await
    }

    pub async fn initialize_parallel_results(
        &self,
        checkpoint: &mut Checkpoint,
        item_keys: Vec<String>,
    ) -> Result<(), StoreError> {
        checkpoint.initialize_parallel_results(item_keys);
        self.save(checkpoint).await
    }

    pub async fn record_parallel_item_completion(
        &self,
        checkpoint: &mut Checkpoint,
        key: &str,
        result: ContextValue,
    ) -> Result<(), StoreError> {
        checkpoint.record_parallel_item_completion(key, result)?;
        self.save(checkpoint).await
    }

    pub async fn record_parallel_item_failure(
        &self,
        checkpoint: &mut Checkpoint,
        key: &str,
        error: &str,
    ) -> Result<(), StoreError> {
        checkpoint.record_parallel_item_failure(key, error)?;
        self.save(checkpoint).await
    }

    pub async fn clear_parallel_results(
        &self,
        checkpoint: &mut Checkpoint,
    ) -> Result<(), StoreError> {
        checkpoint.clear_parallel_results();
        self.save(checkpoint).await
    }

    pub async fn record_gate_decision(
        &self,
        checkpoint: &mut Checkpoint,
        gate: &str,
        option: &str,
        input: Option<String>,
    ) -> Result<(), StoreError> {
        checkpoint.record_gate_decision(gate, option, input);
        self.save(checkpoint).await?;
        tracing::info!(run_id = %checkpoint.run_id, gate, option, "gate decision recorded");
        Ok(())
    }

    pub async fn clear_gate_decision(
        &self,
        checkpoint: &mut Checkpoint,
    ) -> Result<(), StoreError> {
        checkpoint.clear_gate_decision();
        self.save(checkpoint).await
    }

    pub async fn set_data(
        &self,
        checkpoint: &mut Checkpoint,
        key: &str,
        value: ContextValue,
    ) -> Result<(), StoreError> {
        checkpoint.set_data(key, value);
        self.save(checkpoint).await
    }

    // -----------------------------------------------------------------------
    // Scans
    // -----------------------------------------------------------------------

    /// Runs in `running` status whose checkpoints carry a pending retry,
    /// paired with the retry record. Feeds the interrupted-work listing.
    pub async fn runs_with_pending_retries(
        &self,
    ) -> Result<Vec<(WorkflowRun, PendingRetry)>, StoreError> {
        let runs = self
            .repo
            .list_resumable_runs()
            .await
            .map_err(|e| StoreError::data_access("scan", Uuid::nil(), e))?;

        let mut found = Vec::new();
        for run in runs {
            if run.status != RunStatus::Running {
                continue;
            }
            if let Some(checkpoint) = self.load(run.id).await?
                && let Some(retry) = checkpoint.pending_retry
            {
                found.push((run, retry));
            }
        }
        Ok(found)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::MemoryRunRepository;
    use bindery_types::run::RunStatus;
    use chrono::Utc;

    async fn store_with_run(target: &str) -> (CheckpointStore<MemoryRunRepository>, Uuid) {
        let repo = MemoryRunRepository::new();
        let now = Utc::now();
        let run = WorkflowRun {
            id: Uuid::now_v7(),
            workflow_type: "w1_editing".to_string(),
            target_id: target.to_string(),
            status: RunStatus::Running,
            current_step: "plan_edits".to_string(),
            error: None,
            created_at: now,
            updated_at: now,
        };
        repo.create_run(&run).await.unwrap();
        (CheckpointStore::new(repo), run.id)
    }

    #[tokio::test]
    async fn create_requires_existing_run() {
        let store = CheckpointStore::new(MemoryRunRepository::new());
        let err = store
            .create(Uuid::now_v7(), "w1_editing", "plan_edits")
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn create_load_roundtrip() {
        let (store, run_id) = store_with_run("book_core").await;
        let created = store.create(run_id, "w1_editing", "plan_edits").await.unwrap();
        let loaded = store.load(run_id).await.unwrap().unwrap();
        assert_eq!(loaded, created);
    }

    #[tokio::test]
    async fn load_missing_checkpoint_is_none() {
        let (store, run_id) = store_with_run("book_core").await;
        assert!(store.load(run_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn mutators_persist_immediately() {
        let (store, run_id) = store_with_run("book_core").await;
        let mut cp = store.create(run_id, "w1_editing", "plan_edits").await.unwrap();

        store.increment_iteration(&mut cp, "plan_edits").await.unwrap();
        store
            .record_step_completion(&mut cp, "plan_edits", ContextValue::text("planned"))
            .await
            .unwrap();
        store.set_current_step(&mut cp, "chapter_edits").await.unwrap();

        let loaded = store.load(run_id).await.unwrap().unwrap();
        assert_eq!(loaded, cp);
        assert_eq!(loaded.current_step, "chapter_edits");
        assert!(loaded.is_step_completed("plan_edits"));
        assert_eq!(loaded.iteration_count("plan_edits"), 1);
    }

    #[tokio::test]
    async fn corrupt_document_surfaces_as_corrupt() {
        let (store, run_id) = store_with_run("book_core").await;
        store
            .repository()
            .save_checkpoint(&run_id, "not json", "plan_edits", "{}")
            .await
            .unwrap();

        let err = store.load(run_id).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn pending_retry_scan_finds_interrupted_runs() {
        let (store, run_id) = store_with_run("book_core").await;
        let mut cp = store.create(run_id, "w1_editing", "plan_edits").await.unwrap();
        store
            .record_pending_retry(&mut cp, "plan_edits", "timeout", 2)
            .await
            .unwrap();

        let found = store.runs_with_pending_retries().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0.id, run_id);
        assert_eq!(found[0].1.attempt, 2);

        store.record_step_completion(&mut cp, "plan_edits", ContextValue::Bool(true))
            .await
            .unwrap();
        assert!(store.runs_with_pending_retries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn pending_retry_scan_skips_runs_not_running() {
        let (store, run_id) = store_with_run("book_core").await;
        let mut cp = store.create(run_id, "w1_editing", "plan_edits").await.unwrap();
        store
            .record_pending_retry(&mut cp, "plan_edits", "timeout", 1)
            .await
            .unwrap();

        store
            .repository()
            .update_run_status(&run_id, RunStatus::Paused, None)
            .await
            .unwrap();
        assert!(store.runs_with_pending_retries().await.unwrap().is_empty());

        store
            .repository()
            .update_run_status(&run_id, RunStatus::Running, None)
            .await
            .unwrap();
        assert_eq!(store.runs_with_pending_retries().await.unwrap().len(), 1);
    }
}
