//! SQLite run repository implementation.
//!
//! Implements `RunRepository` from `bindery-core` using sqlx with split
//! read/write pools. The checkpoint travels as an opaque JSON blob on the
//! run row; this layer never parses it.

use bindery_core::repository::{RunFilter, RunRepository};
use bindery_types::error::RepositoryError;
use bindery_types::run::{RunStatus, WorkflowRun};
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::pool::DatabasePool;

/// SQLite-backed implementation of `RunRepository`.
pub struct SqliteRunRepository {
    pool: DatabasePool,
}

impl SqliteRunRepository {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Internal row type
// ---------------------------------------------------------------------------

struct RunRow {
    id: String,
    workflow_type: String,
    target_id: String,
    status: String,
    current_step: String,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            workflow_type: row.try_get("workflow_type")?,
            target_id: row.try_get("target_id")?,
            status: row.try_get("status")?,
            current_step: row.try_get("current_step")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn into_run(self) -> Result<WorkflowRun, RepositoryError> {
        let id = parse_uuid(&self.id)?;
        let status: RunStatus = self
            .status
            .parse()
            .map_err(|_| RepositoryError::Query(format!("invalid run status: {}", self.status)))?;
        let created_at = parse_datetime(&self.created_at)?;
        let updated_at = parse_datetime(&self.updated_at)?;

        Ok(WorkflowRun {
            id,
            workflow_type: self.workflow_type,
            target_id: self.target_id,
            status,
            current_step: self.current_step,
            error: self.error,
            created_at,
            updated_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const RUN_COLUMNS: &str =
    "id, workflow_type, target_id, status, current_step, error, created_at, updated_at";

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    RepositoryError::Query(e.to_string())
}

// ---------------------------------------------------------------------------
// RunRepository impl
// ---------------------------------------------------------------------------

impl RunRepository for SqliteRunRepository {
    async fn create_run(&self, run: &WorkflowRun) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"INSERT INTO workflow_runs
               (id, workflow_type, target_id, status, current_step, checkpoint,
                iteration_counts, error, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, NULL, '{}', ?, ?, ?)"#,
        )
        .bind(run.id.to_string())
        .bind(&run.workflow_type)
        .bind(&run.target_id)
        .bind(run.status.as_str())
        .bind(&run.current_step)
        .bind(&run.error)
        .bind(format_datetime(&run.created_at))
        .bind(format_datetime(&run.updated_at))
        .execute(&self.pool.writer)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e
                .as_database_error()
                .is_some_and(|d| d.is_unique_violation()) =>
            {
                Err(RepositoryError::Conflict(format!(
                    "run {} already exists",
                    run.id
                )))
            }
            Err(e) => Err(query_error(e)),
        }
    }

    async fn get_run(&self, run_id: &Uuid) -> Result<Option<WorkflowRun>, RepositoryError> {
        let row = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE id = ?"
        ))
        .bind(run_id.to_string())
        .fetch_optional(&self.pool.reader)
        .await
        .map_err(query_error)?;

        match row {
            Some(row) => {
                let r = RunRow::from_row(&row).map_err(query_error)?;
                Ok(Some(r.into_run()?))
            }
            None => Ok(None),
        }
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let mut sql = format!("SELECT {RUN_COLUMNS} FROM workflow_runs WHERE 1=1");
        if filter.target_id.is_some() {
            sql.push_str(" AND target_id = ?");
        }
        if filter.status.is_some() {
            sql.push_str(" AND status = ?");
        }
        sql.push_str(" ORDER BY created_at DESC");

        let mut query = sqlx::query(&sql);
        if let Some(target) = &filter.target_id {
            query = query.bind(target);
        }
        if let Some(status) = filter.status {
            query = query.bind(status.as_str());
        }

        let rows = query
            .fetch_all(&self.pool.reader)
            .await
            .map_err(query_error)?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = RunRow::from_row(row).map_err(query_error)?;
            runs.push(r.into_run()?);
        }
        Ok(runs)
    }

    async fn update_run_status(
        &self,
        run_id: &Uuid,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE workflow_runs SET status = ?, error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(error)
        .bind(format_datetime(&Utc::now()))
        .bind(run_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn save_checkpoint(
        &self,
        run_id: &Uuid,
        checkpoint_json: &str,
        current_step: &str,
        iteration_counts_json: &str,
    ) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            r#"UPDATE workflow_runs
               SET checkpoint = ?, current_step = ?, iteration_counts = ?, updated_at = ?
               WHERE id = ?"#,
        )
        .bind(checkpoint_json)
        .bind(current_step)
        .bind(iteration_counts_json)
        .bind(format_datetime(&Utc::now()))
        .bind(run_id.to_string())
        .execute(&self.pool.writer)
        .await
        .map_err(query_error)?;

        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn load_checkpoint(&self, run_id: &Uuid) -> Result<Option<String>, RepositoryError> {
        let row = sqlx::query("SELECT checkpoint FROM workflow_runs WHERE id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(query_error)?;

        match row {
            Some(row) => {
                let checkpoint: Option<String> = row.try_get("checkpoint").map_err(query_error)?;
                Ok(checkpoint)
            }
            None => Ok(None),
        }
    }

    async fn list_resumable_runs(&self) -> Result<Vec<WorkflowRun>, RepositoryError> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs
             WHERE status NOT IN ('completed', 'failed')
             ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(query_error)?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = RunRow::from_row(row).map_err(query_error)?;
            runs.push(r.into_run()?);
        }
        Ok(runs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_repo() -> SqliteRunRepository {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("runs.db");
        let url = format!("sqlite://{}?mode=rwc", db_path.display());
        let pool = DatabasePool::new(&url).await.unwrap();
        // keep the directory alive for the rest of the test
        std::mem::forget(dir);
        SqliteRunRepository::new(pool)
    }

    fn sample_run(target: &str, status: RunStatus) -> WorkflowRun {
        let now = Utc::now();
        WorkflowRun {
            id: Uuid::now_v7(),
            workflow_type: "w1_editing".to_string(),
            target_id: target.to_string(),
            status,
            current_step: "plan_edits".to_string(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn create_and_get_roundtrip() {
        let repo = test_repo().await;
        let run = sample_run("book_core", RunStatus::Pending);
        repo.create_run(&run).await.unwrap();

        let fetched = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(fetched.id, run.id);
        assert_eq!(fetched.workflow_type, "w1_editing");
        assert_eq!(fetched.status, RunStatus::Pending);
        assert_eq!(fetched.current_step, "plan_edits");
    }

    #[tokio::test]
    async fn duplicate_run_id_conflicts() {
        let repo = test_repo().await;
        let run = sample_run("book_core", RunStatus::Pending);
        repo.create_run(&run).await.unwrap();
        let err = repo.create_run(&run).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Conflict(_)));
    }

    #[tokio::test]
    async fn get_missing_run_is_none() {
        let repo = test_repo().await;
        assert!(repo.get_run(&Uuid::now_v7()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn status_update_persists_error() {
        let repo = test_repo().await;
        let run = sample_run("book_core", RunStatus::Running);
        repo.create_run(&run).await.unwrap();

        repo.update_run_status(&run.id, RunStatus::Failed, Some("step broke"))
            .await
            .unwrap();
        let fetched = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, RunStatus::Failed);
        assert_eq!(fetched.error.as_deref(), Some("step broke"));
    }

    #[tokio::test]
    async fn status_update_missing_run_not_found() {
        let repo = test_repo().await;
        let err = repo
            .update_run_status(&Uuid::now_v7(), RunStatus::Failed, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RepositoryError::NotFound));
    }

    #[tokio::test]
    async fn checkpoint_blob_roundtrip() {
        let repo = test_repo().await;
        let run = sample_run("book_core", RunStatus::Running);
        repo.create_run(&run).await.unwrap();

        assert!(repo.load_checkpoint(&run.id).await.unwrap().is_none());

        repo.save_checkpoint(&run.id, r#"{"current_step":"chapter_edits"}"#, "chapter_edits", r#"{"plan_edits":1}"#)
            .await
            .unwrap();

        let blob = repo.load_checkpoint(&run.id).await.unwrap().unwrap();
        assert!(blob.contains("chapter_edits"));
        let fetched = repo.get_run(&run.id).await.unwrap().unwrap();
        assert_eq!(fetched.current_step, "chapter_edits");
    }

    #[tokio::test]
    async fn list_filters_by_target_and_status() {
        let repo = test_repo().await;
        repo.create_run(&sample_run("book_a", RunStatus::Running))
            .await
            .unwrap();
        repo.create_run(&sample_run("book_a", RunStatus::Completed))
            .await
            .unwrap();
        repo.create_run(&sample_run("book_b", RunStatus::Paused))
            .await
            .unwrap();

        let all = repo.list_runs(&RunFilter::default()).await.unwrap();
        assert_eq!(all.len(), 3);

        let filter = RunFilter {
            target_id: Some("book_a".to_string()),
            status: None,
        };
        assert_eq!(repo.list_runs(&filter).await.unwrap().len(), 2);

        let filter = RunFilter {
            target_id: Some("book_a".to_string()),
            status: Some(RunStatus::Completed),
        };
        let runs = repo.list_runs(&filter).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn resumable_excludes_terminal_runs() {
        let repo = test_repo().await;
        repo.create_run(&sample_run("book_a", RunStatus::Paused))
            .await
            .unwrap();
        repo.create_run(&sample_run("book_b", RunStatus::Failed))
            .await
            .unwrap();
        repo.create_run(&sample_run("book_c", RunStatus::Running))
            .await
            .unwrap();

        let resumable = repo.list_resumable_runs().await.unwrap();
        assert_eq!(resumable.len(), 2);
        assert!(resumable.iter().all(|r| !r.status.is_terminal()));
    }
}
