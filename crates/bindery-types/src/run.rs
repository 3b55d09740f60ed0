//! Run status state machine and the workflow run record.
//!
//! Every status mutation in the engine goes through [`RunStatus::transition`],
//! so an illegal change (e.g. resuming a completed run) is rejected at the
//! boundary instead of surfacing as a corrupt row deep in business logic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
///
/// `Completed` and `Failed` are terminal. Legal transitions:
/// pending -> running; running -> paused/completed/failed;
/// paused -> running/completed/failed; any state to itself (no-op).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

/// An illegal run-status transition was attempted.
///
/// Always a caller bug, never retried: the engine only produces legal
/// transitions, so seeing this means an operation was invoked against a run
/// in the wrong state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid run status transition: {from} -> {to}")]
pub struct InvalidTransition {
    pub from: RunStatus,
    pub to: RunStatus,
}

impl RunStatus {
    /// All five statuses, in lifecycle order.
    pub const ALL: [RunStatus; 5] = [
        RunStatus::Pending,
        RunStatus::Running,
        RunStatus::Paused,
        RunStatus::Completed,
        RunStatus::Failed,
    ];

    /// Whether this status admits no further non-self transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    /// Whether a transition to `target` is legal, without mutating anything.
    ///
    /// A self-transition is always legal (no-op).
    pub fn can_transition_to(self, target: RunStatus) -> bool {
        if self == target {
            return true;
        }
        matches!(
            (self, target),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Paused)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
                | (RunStatus::Paused, RunStatus::Running)
                | (RunStatus::Paused, RunStatus::Completed)
                | (RunStatus::Paused, RunStatus::Failed)
        )
    }

    /// Perform the transition, returning the new status or an
    /// [`InvalidTransition`] carrying both state names.
    pub fn transition(self, target: RunStatus) -> Result<RunStatus, InvalidTransition> {
        if self.can_transition_to(target) {
            Ok(target)
        } else {
            Err(InvalidTransition {
                from: self,
                to: target,
            })
        }
    }

    /// The distinct set of statuses reachable in one legal non-self
    /// transition. Empty exactly for terminal statuses.
    pub fn valid_transitions(self) -> Vec<RunStatus> {
        Self::ALL
            .into_iter()
            .filter(|&t| t != self && self.can_transition_to(t))
            .collect()
    }

    /// Stable lowercase name, matching the serde representation and the
    /// value stored in the `status` column.
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "paused" => Ok(RunStatus::Paused),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// WorkflowRun (run row / audit record)
// ---------------------------------------------------------------------------

/// One execution instance of a workflow type against a book.
///
/// The row is a cache of checkpoint-derived state for cheap querying; the
/// serialized checkpoint attached to it is the source of truth. Runs are
/// created by `start` and never deleted by the engine (retained for audit
/// and resume).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// UUIDv7 run ID.
    pub id: Uuid,
    /// Name of the workflow definition being executed (e.g. "w1_editing").
    pub workflow_type: String,
    /// Slug of the book this run targets.
    pub target_id: String,
    /// Current run status.
    pub status: RunStatus,
    /// Denormalized copy of the checkpoint's current step.
    pub current_step: String,
    /// Error message if the run failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the run row was last written.
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminality_matches_completed_and_failed() {
        for status in RunStatus::ALL {
            let expected = status == RunStatus::Completed || status == RunStatus::Failed;
            assert_eq!(status.is_terminal(), expected, "{status}");
        }
    }

    #[test]
    fn valid_transitions_empty_iff_terminal() {
        for status in RunStatus::ALL {
            assert_eq!(
                status.valid_transitions().is_empty(),
                status.is_terminal(),
                "{status}"
            );
        }
    }

    #[test]
    fn legal_transition_table() {
        use RunStatus::*;
        let legal = [
            (Pending, Running),
            (Running, Paused),
            (Running, Completed),
            (Running, Failed),
            (Paused, Running),
            (Paused, Completed),
            (Paused, Failed),
        ];

        for from in RunStatus::ALL {
            for to in RunStatus::ALL {
                let expected = from == to || legal.contains(&(from, to));
                assert_eq!(from.can_transition_to(to), expected, "{from} -> {to}");
                match from.transition(to) {
                    Ok(next) => {
                        assert!(expected);
                        assert_eq!(next, to);
                    }
                    Err(err) => {
                        assert!(!expected, "{from} -> {to} should be legal");
                        assert_eq!(err.from, from);
                        assert_eq!(err.to, to);
                    }
                }
            }
        }
    }

    #[test]
    fn self_transition_is_noop_even_for_terminal() {
        assert_eq!(
            RunStatus::Completed.transition(RunStatus::Completed),
            Ok(RunStatus::Completed)
        );
        assert!(RunStatus::Failed.can_transition_to(RunStatus::Failed));
    }

    #[test]
    fn terminal_states_reject_everything_else() {
        for from in [RunStatus::Completed, RunStatus::Failed] {
            for to in RunStatus::ALL {
                if to != from {
                    let err = from.transition(to).unwrap_err();
                    assert!(err.to_string().contains(from.as_str()));
                    assert!(err.to_string().contains(to.as_str()));
                }
            }
        }
    }

    #[test]
    fn status_serde_and_parse_roundtrip() {
        for status in RunStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            let parsed: RunStatus = serde_json::from_str(&json).unwrap();
            assert_eq!(parsed, status);
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("cancelled".parse::<RunStatus>().is_err());
    }

    #[test]
    fn workflow_run_json_roundtrip() {
        let run = WorkflowRun {
            id: Uuid::now_v7(),
            workflow_type: "w1_editing".to_string(),
            target_id: "book_core".to_string(),
            status: RunStatus::Running,
            current_step: "plan_edits".to_string(),
            error: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string(&run).unwrap();
        let parsed: WorkflowRun = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.workflow_type, "w1_editing");
        assert_eq!(parsed.status, RunStatus::Running);
        assert_eq!(parsed.current_step, "plan_edits");
    }
}
