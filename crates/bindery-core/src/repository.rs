//! Run repository trait definition.
//!
//! Defines the storage interface for workflow runs and their embedded
//! checkpoint documents. The infrastructure layer (bindery-infra)
//! implements this trait with SQLite persistence; [`MemoryRunRepository`]
//! provides an in-process implementation for engine tests and embedding.

use std::collections::BTreeMap;
use std::sync::Arc;

use bindery_types::error::RepositoryError;
use bindery_types::run::{RunStatus, WorkflowRun};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Filter for run listings. Empty filter matches everything.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    /// Restrict to runs targeting this entity (book slug).
    pub target_id: Option<String>,
    /// Restrict to runs in this status.
    pub status: Option<RunStatus>,
}

impl RunFilter {
    pub fn matches(&self, run: &WorkflowRun) -> bool {
        if let Some(target) = &self.target_id
            && run.target_id != *target
        {
            return false;
        }
        if let Some(status) = self.status
            && run.status != status
        {
            return false;
        }
        true
    }
}

/// Repository trait for workflow run persistence.
///
/// A run and its checkpoint live in a single row: the checkpoint is an
/// opaque JSON document from the repository's point of view, saved and
/// loaded whole. There is no per-step log table.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait RunRepository: Send + Sync {
    /// Create a new workflow run record.
    fn create_run(
        &self,
        run: &WorkflowRun,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Get a workflow run by its UUID.
    fn get_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<WorkflowRun>, RepositoryError>> + Send;

    /// List runs matching the filter, ordered by created_at DESC.
    fn list_runs(
        &self,
        filter: &RunFilter,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;

    /// Update a run's status and optionally its error message.
    fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Persist the serialized checkpoint document for a run, together with
    /// the denormalized current step and iteration counts columns.
    fn save_checkpoint(
        &self,
        run_id: &Uuid,
        checkpoint_json: &str,
        current_step: &str,
        iteration_counts_json: &str,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Load the serialized checkpoint document for a run.
    fn load_checkpoint(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<Option<String>, RepositoryError>> + Send;

    /// List runs left in non-terminal statuses (interrupted-work scan).
    fn list_resumable_runs(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<WorkflowRun>, RepositoryError>> + Send;
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct StoredRun {
    run: WorkflowRun,
    checkpoint: Option<String>,
}

/// In-memory [`RunRepository`] backed by a `tokio::sync::RwLock` map.
///
/// Used by engine tests and by callers that want a workflow engine without
/// durable storage.
#[derive(Debug, Clone, Default)]
pub struct MemoryRunRepository {
    runs: Arc<RwLock<BTreeMap<Uuid, StoredRun>>>,
}

impl MemoryRunRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RunRepository for MemoryRunRepository {
    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&run.id) {
            return Err(RepositoryError::Conflict(format!(
                "run {} already exists",
                run.id
            )));
        }
        runs.insert(
            run.id,
            StoredRun {
                run: run.clone(),
                checkpoint: None,
            },
        );
        Ok(())
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        Ok(self.runs.read().await.get(run_id).map(|s| s.run.clone()))
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let runs = self.runs.read().await;
        let mut matched: Vec<WorkflowRun> = runs
            .values()
            .filter(|s| filter.matches(&s.run))
            .map(|s| s.run.clone())
            .collect();
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matched)
    }

    async fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut runs = self.runs.write().await;
        let stored = runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        stored.run.status = status;
        stored.run.error = error.map(String::from);
        stored.run.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn save_checkpoint(
        &self,
        run_id: &Uuid,
        checkpoint_json: &str,
        current_step: &str,
        _iteration_counts_json: &str,
    ) -> Result<(), RepositoryError> {
        let mut runs = self.runs.write().await;
        let stored = runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        stored.checkpoint = Some(checkpoint_json.to_string());
        stored.run.current_step = current_step.to_string();
        stored.run.updated_at = chrono::Utc::now();
        Ok(())
    }

    async fn load_checkpoint(&self, run_id: &Uuid) -> Result<Option<String>, RepositoryError> {
        Ok(self
            .runs
            .read()
            .await
            .get(run_id)
            .and_then(|s| s.checkpoint.clone()))
    }

    async fn list_resumable_runs(&self) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let runs = self.runs.read().await;
        Ok(runs
            .values()
            .filter(|s| !s.run.status.is_terminal())
            .map(|s| s.run.clone())
            .collect())
    }
}
