//! The durable checkpoint document for one workflow run.
//!
//! A `Checkpoint` is the full execution state of a run, serialized as a
//! single JSON document on the run row. The mutators here are pure
//! bookkeeping: they change the in-memory document and nothing else.
//! Durability is the checkpoint store's job -- it applies a mutation and
//! then saves, so a crash loses at most one in-flight step.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PreconditionError;
use crate::value::ContextValue;

// ---------------------------------------------------------------------------
// Component records
// ---------------------------------------------------------------------------

/// One successfully finished step. Append-only: a step retried after failure
/// produces exactly one completion entry, not one per attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCompletion {
    pub step: String,
    pub completed_at: DateTime<Utc>,
    pub result: ContextValue,
}

/// Transient-failure bookkeeping for the step currently being retried.
///
/// Present only while a step has failed and is awaiting another attempt or
/// escalation; cleared on the step's next success. `attempt` is the 1-based
/// number of the attempt that failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRetry {
    pub step: String,
    pub error: String,
    pub attempt: u32,
}

/// Status of one item inside a parallel fan-out step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParallelItemStatus {
    Pending,
    Completed,
    Failed,
}

/// Per-item record inside a fan-out step. Each item writes to its own key,
/// so concurrent handlers never share mutable state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelItem {
    pub status: ParallelItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ContextValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub retry_count: u32,
}

/// Summary of a fan-out step's progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParallelStatus {
    pub total: usize,
    pub completed: usize,
    pub failed: Vec<String>,
    pub pending: Vec<String>,
}

/// The human's most recent choice at a gate step. Cleared once consumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateDecision {
    pub gate: String,
    pub option: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// The full execution state of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// The run this checkpoint belongs to.
    pub run_id: Uuid,
    /// Name of the workflow definition being executed.
    pub workflow_type: String,
    /// Name of the step to execute next.
    pub current_step: String,
    /// Ordered record of finished steps, in completion order.
    #[serde(default)]
    pub completed_steps: Vec<StepCompletion>,
    /// Loop guard: number of times each step has been entered.
    #[serde(default)]
    pub iteration_counts: BTreeMap<String, u32>,
    /// Present only while a step awaits another attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending_retry: Option<PendingRetry>,
    /// Present only while a fan-out step is executing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_results: Option<BTreeMap<String, ParallelItem>>,
    /// Present between a human decision being recorded and consumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate_decision: Option<GateDecision>,
    /// Cross-step context, last-write-wins per key.
    #[serde(default)]
    pub data: BTreeMap<String, ContextValue>,
}

impl Checkpoint {
    /// A fresh checkpoint positioned at the workflow's entry step.
    pub fn new(run_id: Uuid, workflow_type: impl Into<String>, initial_step: impl Into<String>) -> Self {
        Self {
            run_id,
            workflow_type: workflow_type.into(),
            current_step: initial_step.into(),
            completed_steps: Vec::new(),
            iteration_counts: BTreeMap::new(),
            pending_retry: None,
            parallel_results: None,
            gate_decision: None,
            data: BTreeMap::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Step pointer and loop guard
    // -----------------------------------------------------------------------

    /// Move the step pointer to `step`.
    pub fn set_current_step(&mut self, step: impl Into<String>) {
        self.current_step = step.into();
    }

    /// Count one more entry into `step`. Monotone per key.
    pub fn increment_iteration(&mut self, step: &str) {
        *self.iteration_counts.entry(step.to_string()).or_insert(0) += 1;
    }

    /// How many times `step` has been entered. Zero for unseen steps.
    pub fn iteration_count(&self, step: &str) -> u32 {
        self.iteration_counts.get(step).copied().unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Completions and retries
    // -----------------------------------------------------------------------

    /// Append a completion entry with a wall-clock timestamp and clear any
    /// pending retry for the run.
    pub fn record_step_completion(&mut self, step: &str, result: ContextValue) {
        self.completed_steps.push(StepCompletion {
            step: step.to_string(),
            completed_at: Utc::now(),
            result,
        });
        self.pending_retry = None;
    }

    /// Record that `step` failed on `attempt` and is awaiting another try.
    pub fn record_pending_retry(&mut self, step: &str, error: &str, attempt: u32) {
        self.pending_retry = Some(PendingRetry {
            step: step.to_string(),
            error: error.to_string(),
            attempt,
        });
    }

    pub fn clear_pending_retry(&mut self) {
        self.pending_retry = None;
    }

    /// Latest result recorded for `step`, if it ever completed. When a step
    /// was entered more than once (cycles), the most recent completion wins.
    pub fn step_result(&self, step: &str) -> Option<&ContextValue> {
        self.completed_steps
            .iter()
            .rev()
            .find(|c| c.step == step)
            .map(|c| &c.result)
    }

    pub fn is_step_completed(&self, step: &str) -> bool {
        self.completed_steps.iter().any(|c| c.step == step)
    }

    // -----------------------------------------------------------------------
    // Parallel fan-out bookkeeping
    // -----------------------------------------------------------------------

    /// Seed every item key to pending with a zero retry count.
    pub fn initialize_parallel_results<I, K>(&mut self, item_keys: I)
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        self.parallel_results = Some(
            item_keys
                .into_iter()
                .map(|key| {
                    (
                        key.into(),
                        ParallelItem {
                            status: ParallelItemStatus::Pending,
                            result: None,
                            error: None,
                            retry_count: 0,
                        },
                    )
                })
                .collect(),
        );
    }

    fn parallel_item_mut(&mut self, key: &str) -> Result<&mut ParallelItem, PreconditionError> {
        let results = self.parallel_results.as_mut().ok_or_else(|| {
            PreconditionError("parallel results not initialized".to_string())
        })?;
        results
            .get_mut(key)
            .ok_or_else(|| PreconditionError(format!("unknown parallel item '{key}'")))
    }

    /// Mark one item completed with its result.
    pub fn record_parallel_item_completion(
        &mut self,
        key: &str,
        result: ContextValue,
    ) -> Result<(), PreconditionError> {
        let item = self.parallel_item_mut(key)?;
        item.status = ParallelItemStatus::Completed;
        item.result = Some(result);
        item.error = None;
        Ok(())
    }

    /// Mark one item failed and count the attempt against its retry budget.
    pub fn record_parallel_item_failure(
        &mut self,
        key: &str,
        error: &str,
    ) -> Result<(), PreconditionError> {
        let item = self.parallel_item_mut(key)?;
        item.status = ParallelItemStatus::Failed;
        item.error = Some(error.to_string());
        item.retry_count += 1;
        Ok(())
    }

    /// Totals / completed / failed / pending summary for the active fan-out.
    pub fn parallel_status(&self) -> Result<ParallelStatus, PreconditionError> {
        let results = self.parallel_results.as_ref().ok_or_else(|| {
            PreconditionError("parallel results not initialized".to_string())
        })?;

        let mut status = ParallelStatus {
            total: results.len(),
            completed: 0,
            failed: Vec::new(),
            pending: Vec::new(),
        };
        for (key, item) in results {
            match item.status {
                ParallelItemStatus::Completed => status.completed += 1,
                ParallelItemStatus::Failed => status.failed.push(key.clone()),
                ParallelItemStatus::Pending => status.pending.push(key.clone()),
            }
        }
        Ok(status)
    }

    /// Drop the fan-out map once the step is fully resolved. Callers must
    /// read per-item results before clearing; a later step cannot get them
    /// back.
    pub fn clear_parallel_results(&mut self) {
        self.parallel_results = None;
    }

    // -----------------------------------------------------------------------
    // Gate decisions and cross-step data
    // -----------------------------------------------------------------------

    pub fn record_gate_decision(&mut self, gate: &str, option: &str, input: Option<String>) {
        self.gate_decision = Some(GateDecision {
            gate: gate.to_string(),
            option: option.to_string(),
            input,
        });
    }

    pub fn clear_gate_decision(&mut self) {
        self.gate_decision = None;
    }

    /// Store a cross-step value. Last write wins per key.
    pub fn set_data(&mut self, key: impl Into<String>, value: ContextValue) {
        self.data.insert(key.into(), value);
    }

    pub fn get_data(&self, key: &str) -> Option<&ContextValue> {
        self.data.get(key)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
