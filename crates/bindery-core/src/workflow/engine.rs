//! Resumable workflow execution engine.
//!
//! The engine drives a run step by step from its checkpoint, persisting
//! progress through the [`CheckpointStore`] after every state change. A
//! run can stop at any point (crash, gate pause, process exit) and
//! `resume` continues from the last saved document.
//!
//! Three step shapes are supported:
//! - sequential steps, retried in place within a per-step budget;
//! - human gates, which persist the checkpoint and suspend the run until
//!   an operator records a decision;
//! - parallel fan-outs, which run one handler invocation per item on a
//!   `JoinSet` and track per-item status in the checkpoint.
//!
//! Per-run exclusive locks serialize engine entry points that touch the
//! same run, so two concurrent resumes cannot interleave checkpoint
//! writes.

use std::collections::BTreeMap;
use std::sync::Arc;

use bindery_types::checkpoint::{Checkpoint, ParallelItemStatus};
use bindery_types::error::RepositoryError;
use bindery_types::run::{InvalidTransition, RunStatus, WorkflowRun};
use bindery_types::value::ContextValue;
use chrono::Utc;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::repository::{RunFilter, RunRepository};
use crate::workflow::definition::{
    CompletionPolicy, StepDescriptor, StepKind, Transition, WorkflowDefinition, WorkflowError,
};
use crate::workflow::handler::{HandlerRegistry, StepContext};
use crate::workflow::store::{CheckpointStore, StoreError};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown workflow type '{0}'")]
    UnknownWorkflowType(String),

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("run {run_id} is already {status} and cannot be resumed")]
    RunAlreadyTerminal { run_id: Uuid, status: RunStatus },

    #[error("run {0} has no checkpoint")]
    CheckpointMissing(Uuid),

    #[error("run {run_id} is {status}, not paused at a gate")]
    NotAwaitingGate { run_id: Uuid, status: RunStatus },

    #[error("gate '{gate}' does not accept option '{option}'")]
    UnknownGateOption { gate: String, option: String },

    #[error("no handler registered for step '{0}'")]
    MissingHandler(String),

    #[error("step '{step}' failed after {attempts} attempts: {error}")]
    StepExhausted {
        step: String,
        attempts: u32,
        error: String,
    },

    #[error("step '{step}' exceeded its iteration limit ({limit})")]
    IterationLimitExceeded { step: String, limit: u32 },

    #[error("fan-out '{step}' failed for items: {}", .failed.join(", "))]
    FanoutFailed { step: String, failed: Vec<String> },

    #[error("fan-out task aborted: {0}")]
    TaskJoin(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Prompt details surfaced when a run pauses at a human gate.
#[derive(Debug, Clone)]
pub struct GatePrompt {
    pub gate: String,
    pub prompt: String,
    pub options: Vec<String>,
}

/// Where a run ended up after an engine entry point returned.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub current_step: String,
    /// Present when the run is paused at a gate.
    pub gate: Option<GatePrompt>,
}

/// A run row paired with its checkpoint, for inspection commands.
#[derive(Debug, Clone)]
pub struct RunState {
    pub run: WorkflowRun,
    pub checkpoint: Checkpoint,
}

impl RunState {
    /// Display label for the run. A paused run with no recorded decision
    /// is shown as `awaiting_human`; everything else is the stored status.
    pub fn display_status(&self) -> &'static str {
        if self.run.status == RunStatus::Paused && self.checkpoint.gate_decision.is_none() {
            "awaiting_human"
        } else {
            self.run.status.as_str()
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct RegisteredWorkflow {
    definition: WorkflowDefinition,
    handlers: HandlerRegistry,
}

enum Advance {
    Continue,
    Completed(ExecutionResult),
}

/// Executes registered workflows against a [`CheckpointStore`].
pub struct WorkflowEngine<R: RunRepository + 'static> {
    store: Arc<CheckpointStore<R>>,
    workflows: BTreeMap<String, RegisteredWorkflow>,
    run_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl<R: RunRepository + 'static> WorkflowEngine<R> {
    pub fn new(store: CheckpointStore<R>) -> Self {
        Self {
            store: Arc::new(store),
            workflows: BTreeMap::new(),
            run_locks: DashMap::new(),
        }
    }

    pub fn store(&self) -> &CheckpointStore<R> {
        &self.store
    }

    /// Register a workflow type. Every non-gate step must have a handler.
    pub fn register_workflow(
        &mut self,
        definition: WorkflowDefinition,
        handlers: HandlerRegistry,
    ) -> Result<(), EngineError> {
        for name in definition.step_names() {
            let step = definition
                .step(name)
                .ok_or_else(|| WorkflowError::UnknownStep(name.to_string()))?;
            if !matches!(step.kind(), StepKind::HumanGate { .. }) && handlers.get(name).is_none() {
                return Err(EngineError::MissingHandler(name.to_string()));
            }
        }
        self.workflows.insert(
            definition.workflow_type().to_string(),
            RegisteredWorkflow {
                definition,
                handlers,
            },
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Create a run at the workflow's entry step and drive it until it
    /// completes, pauses at a gate, or fails.
    pub async fn start(
        &self,
        workflow_type: &str,
        target_id: &str,
    ) -> Result<ExecutionResult, EngineError> {
        let workflow = self
            .workflows
            .get(workflow_type)
            .ok_or_else(|| EngineError::UnknownWorkflowType(workflow_type.to_string()))?;

        let now = Utc::now();
        let mut run = WorkflowRun {
            id: Uuid::now_v7(),
            workflow_type: workflow_type.to_string(),
            target_id: target_id.to_string(),
            status: RunStatus::Pending,
            current_step: workflow.definition.entry().to_string(),
            error: None,
            created_at: now,
            updated_at: now,
        };
        self.store.repository().create_run(&run).await?;
        let checkpoint = self
            .store
            .create(run.id, workflow_type, workflow.definition.entry())
            .await?;

        let lock = self.lock_for(run.id);
        let _guard = lock.lock().await;

        run.status = self
            .set_status(run.id, RunStatus::Pending, RunStatus::Running)
            .await?;
        tracing::info!(run_id = %run.id, workflow_type, target_id, "run started");

        self.drive(run, checkpoint).await
    }

    /// Pick up a non-terminal run from its last saved checkpoint.
    pub async fn resume(&self, run_id: Uuid) -> Result<ExecutionResult, EngineError> {
        let lock = self.lock_for(run_id);
        let _guard = lock.lock().await;

        let mut run = self.load_run(run_id).await?;
        if run.status.is_terminal() {
            return Err(EngineError::RunAlreadyTerminal {
                run_id,
                status: run.status,
            });
        }
        let checkpoint = self
            .store
            .load(run_id)
            .await?
            .ok_or(EngineError::CheckpointMissing(run_id))?;

        run.status = self.set_status(run_id, run.status, RunStatus::Running).await?;
        tracing::info!(run_id = %run_id, step = %checkpoint.current_step, "run resumed");

        self.drive(run, checkpoint).await
    }

    /// Record a human decision for the gate a run is paused at, then
    /// resume execution. The decision routes through the gate's labeled
    /// transitions.
    pub async fn gate_decision(
        &self,
        run_id: Uuid,
        option: &str,
        input: Option<String>,
    ) -> Result<ExecutionResult, EngineError> {
        let lock = self.lock_for(run_id);
        let _guard = lock.lock().await;

        let mut run = self.load_run(run_id).await?;
        if run.status != RunStatus::Paused {
            return Err(EngineError::NotAwaitingGate {
                run_id,
                status: run.status,
            });
        }
        let mut checkpoint = self
            .store
            .load(run_id)
            .await?
            .ok_or(EngineError::CheckpointMissing(run_id))?;

        let workflow = self
            .workflows
            .get(&run.workflow_type)
            .ok_or_else(|| EngineError::UnknownWorkflowType(run.workflow_type.clone()))?;
        let gate = checkpoint.current_step.clone();
        let step = workflow
            .definition
            .step(&gate)
            .ok_or_else(|| WorkflowError::UnknownStep(gate.clone()))?;
        let StepKind::HumanGate { options, .. } = step.kind() else {
            return Err(EngineError::NotAwaitingGate {
                run_id,
                status: run.status,
            });
        };
        if !options.iter().any(|o| o == option) {
            return Err(EngineError::UnknownGateOption {
                gate,
                option: option.to_string(),
            });
        }

        self.store
            .record_gate_decision(&mut checkpoint, &gate, option, input)
            .await?;
        run.status = self.set_status(run_id, RunStatus::Paused, RunStatus::Running).await?;

        self.drive(run, checkpoint).await
    }

    /// Run row plus checkpoint, for status displays.
    pub async fn run_state(&self, run_id: Uuid) -> Result<RunState, EngineError> {
        let run = self.load_run(run_id).await?;
        let checkpoint = self
            .store
            .load(run_id)
            .await?
            .ok_or(EngineError::CheckpointMissing(run_id))?;
        Ok(RunState { run, checkpoint })
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<WorkflowRun>, EngineError> {
        Ok(self.store.repository().list_runs(filter).await?)
    }

    /// Administratively fail a run. Legal from any non-terminal status.
    pub async fn force_fail(&self, run_id: Uuid, reason: &str) -> Result<(), EngineError> {
        let lock = self.lock_for(run_id);
        let _guard = lock.lock().await;

        let run = self.load_run(run_id).await?;
        let next = run.status.transition(RunStatus::Failed)?;
        self.store
            .repository()
            .update_run_status(&run_id, next, Some(reason))
            .await?;
        tracing::warn!(run_id = %run_id, reason, "run force-failed");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Step loop
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        run: WorkflowRun,
        mut checkpoint: Checkpoint,
    ) -> Result<ExecutionResult, EngineError> {
        let workflow = self
            .workflows
            .get(&run.workflow_type)
            .ok_or_else(|| EngineError::UnknownWorkflowType(run.workflow_type.clone()))?;

        loop {
            let step_name = checkpoint.current_step.clone();
            let Some(step) = workflow.definition.step(&step_name) else {
                self.fail_run(run.id, &format!("unknown step '{step_name}'"))
                    .await?;
                return Err(WorkflowError::UnknownStep(step_name).into());
            };

            let advance = match step.kind() {
                StepKind::Sequential => {
                    self.run_sequential(workflow, &run, &mut checkpoint, step)
                        .await?
                }
                StepKind::HumanGate { prompt, options } => {
                    match self.run_gate(&run, &mut checkpoint, step, options).await? {
                        Some(advance) => advance,
                        // no decision yet: suspend
                        None => {
                            let status = self
                                .set_status(run.id, RunStatus::Running, RunStatus::Paused)
                                .await?;
                            tracing::info!(
                                run_id = %run.id,
                                gate = %step_name,
                                "run paused awaiting human decision"
                            );
                            return Ok(ExecutionResult {
                                run_id: run.id,
                                status,
                                current_step: step_name.clone(),
                                gate: Some(GatePrompt {
                                    gate: step_name,
                                    prompt: prompt.clone(),
                                    options: options.clone(),
                                }),
                            });
                        }
                    }
                }
                StepKind::ParallelFanout {
                    items,
                    policy,
                    max_item_retries,
                } => {
                    self.run_fanout(
                        workflow,
                        &run,
                        &mut checkpoint,
                        step,
                        items,
                        *policy,
                        *max_item_retries,
                    )
                    .await?
                }
            };

            match advance {
                Advance::Continue => {}
                Advance::Completed(result) => return Ok(result),
            }
        }
    }

    async fn run_sequential(
        &self,
        workflow: &RegisteredWorkflow,
        run: &WorkflowRun,
        checkpoint: &mut Checkpoint,
        step: &StepDescriptor,
    ) -> Result<Advance, EngineError> {
        let step_name = step.name().to_string();
        // a resume mid-retry is the same entry, not a new one
        let mid_retry = checkpoint
            .pending_retry
            .as_ref()
            .is_some_and(|p| p.step == step_name);
        if !mid_retry {
            self.enter_step(run.id, checkpoint, step).await?;
        }

        let handler = workflow
            .handlers
            .get(&step_name)
            .ok_or_else(|| EngineError::MissingHandler(step_name.clone()))?;

        loop {
            let attempt = checkpoint
                .pending_retry
                .as_ref()
                .filter(|p| p.step == step_name)
                .map_or(1, |p| p.attempt + 1);

            let ctx = self.context(run, checkpoint, &step_name, None);
            tracing::debug!(run_id = %run.id, step = %step_name, attempt, "executing step");

            match handler.execute(ctx).await {
                Ok(outcome) => {
                    for (key, value) in outcome.data {
                        checkpoint.set_data(key, value);
                    }
                    self.store
                        .record_step_completion(checkpoint, &step_name, outcome.result)
                        .await?;
                    return self
                        .advance(run, checkpoint, step, outcome.label.as_deref())
                        .await;
                }
                Err(failure) => {
                    self.store
                        .record_pending_retry(checkpoint, &step_name, failure.message(), attempt)
                        .await?;
                    if attempt <= step.max_retries() {
                        tracing::warn!(
                            run_id = %run.id,
                            step = %step_name,
                            attempt,
                            error = %failure,
                            "step failed, retrying"
                        );
                    } else {
                        let error = failure.message().to_string();
                        self.fail_run(
                            run.id,
                            &format!("step '{step_name}' failed after {attempt} attempts: {error}"),
                        )
                        .await?;
                        return Err(EngineError::StepExhausted {
                            step: step_name,
                            attempts: attempt,
                            error,
                        });
                    }
                }
            }
        }
    }

    /// Consume a recorded gate decision, or return `None` to suspend.
    async fn run_gate(
        &self,
        run: &WorkflowRun,
        checkpoint: &mut Checkpoint,
        step: &StepDescriptor,
        options: &[String],
    ) -> Result<Option<Advance>, EngineError> {
        let step_name = step.name().to_string();
        let Some(decision) = checkpoint.gate_decision.clone() else {
            self.store.save(checkpoint).await?;
            return Ok(None);
        };
        // a decision left over from a different gate cannot route here
        if decision.gate != step_name || !options.iter().any(|o| o == &decision.option) {
            tracing::warn!(
                run_id = %run.id,
                gate = %step_name,
                recorded_for = %decision.gate,
                "discarding stale gate decision"
            );
            self.store.clear_gate_decision(checkpoint).await?;
            return Ok(None);
        }

        self.enter_step(run.id, checkpoint, step).await?;

        let mut result = BTreeMap::new();
        result.insert(
            "option".to_string(),
            ContextValue::text(decision.option.clone()),
        );
        if let Some(input) = &decision.input {
            result.insert("input".to_string(), ContextValue::text(input.clone()));
        }
        checkpoint.clear_gate_decision();
        self.store
            .record_step_completion(checkpoint, &step_name, ContextValue::Map(result))
            .await?;
        tracing::info!(
            run_id = %run.id,
            gate = %step_name,
            option = %decision.option,
            "gate decision consumed"
        );

        self.advance(run, checkpoint, step, Some(&decision.option))
            .await
            .map(Some)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_fanout(
        &self,
        workflow: &RegisteredWorkflow,
        run: &WorkflowRun,
        checkpoint: &mut Checkpoint,
        step: &StepDescriptor,
        items: &[String],
        policy: CompletionPolicy,
        max_item_retries: u32,
    ) -> Result<Advance, EngineError> {
        let step_name = step.name().to_string();
        if checkpoint.parallel_results.is_none() {
            self.enter_step(run.id, checkpoint, step).await?;
            self.store
                .initialize_parallel_results(checkpoint, items.to_vec())
                .await?;
        }

        let handler = workflow
            .handlers
            .get(&step_name)
            .ok_or_else(|| EngineError::MissingHandler(step_name.clone()))?;

        // waves: dispatch every runnable item, join, repeat until each item
        // is either completed or out of retries
        loop {
            let runnable: Vec<String> = checkpoint
                .parallel_results
                .as_ref()
                .map(|results| {
                    results
                        .iter()
                        .filter(|(_, item)| match item.status {
                            ParallelItemStatus::Pending => true,
                            ParallelItemStatus::Failed => item.retry_count <= max_item_retries,
                            ParallelItemStatus::Completed => false,
                        })
                        .map(|(key, _)| key.clone())
                        .collect()
                })
                .unwrap_or_default();
            if runnable.is_empty() {
                break;
            }

            tracing::debug!(
                run_id = %run.id,
                step = %step_name,
                items = runnable.len(),
                "dispatching fan-out wave"
            );

            let data_snapshot = checkpoint.data.clone();
            let shared = Arc::new(Mutex::new(std::mem::replace(
                checkpoint,
                Checkpoint::new(run.id, &run.workflow_type, &step_name),
            )));

            let mut join_set: JoinSet<Result<(), StoreError>> = JoinSet::new();
            for key in runnable {
                let handler = Arc::clone(&handler);
                let store = Arc::clone(&self.store);
                let shared = Arc::clone(&shared);
                let ctx = StepContext {
                    run_id: run.id,
                    workflow_type: run.workflow_type.clone(),
                    target_id: run.target_id.clone(),
                    step: step_name.clone(),
                    item: Some(key.clone()),
                    data: data_snapshot.clone(),
                };
                join_set.spawn(async move {
                    let outcome = handler.execute(ctx).await;
                    let mut checkpoint = shared.lock().await;
                    match outcome {
                        Ok(outcome) => {
                            for (k, v) in outcome.data {
                                checkpoint.set_data(k, v);
                            }
                            store
                                .record_parallel_item_completion(
                                    &mut checkpoint,
                                    &key,
                                    outcome.result,
                                )
                                .await
                        }
                        Err(failure) => {
                            tracing::warn!(item = %key, error = %failure, "fan-out item failed");
                            store
                                .record_parallel_item_failure(
                                    &mut checkpoint,
                                    &key,
                                    failure.message(),
                                )
                                .await
                        }
                    }
                });
            }

            let mut wave_error: Option<EngineError> = None;
            while let Some(joined) = join_set.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(store_err)) => {
                        wave_error.get_or_insert(store_err.into());
                    }
                    Err(join_err) => {
                        wave_error.get_or_insert(EngineError::TaskJoin(join_err.to_string()));
                    }
                }
            }

            *checkpoint = shared.lock().await.clone();
            if let Some(err) = wave_error {
                self.fail_run(run.id, &err.to_string()).await?;
                return Err(err);
            }
        }

        let status = checkpoint
            .parallel_status()
            .map_err(StoreError::Precondition)?;
        let failed = status.failed.clone();
        if !policy.allows(failed.len()) {
            let message = format!("fan-out '{step_name}' failed for items: {}", failed.join(", "));
            self.fail_run(run.id, &message).await?;
            return Err(EngineError::FanoutFailed {
                step: step_name,
                failed,
            });
        }

        let item_results: BTreeMap<String, ContextValue> = checkpoint
            .parallel_results
            .as_ref()
            .map(|results| {
                results
                    .iter()
                    .filter(|(_, item)| item.status == ParallelItemStatus::Completed)
                    .map(|(key, item)| {
                        (
                            key.clone(),
                            item.result.clone().unwrap_or(ContextValue::Bool(true)),
                        )
                    })
                    .collect()
            })
            .unwrap_or_default();

        let mut summary = BTreeMap::new();
        summary.insert("items".to_string(), ContextValue::Map(item_results));
        if !failed.is_empty() {
            summary.insert(
                "failed".to_string(),
                ContextValue::List(failed.into_iter().map(ContextValue::text).collect()),
            );
        }

        checkpoint.clear_parallel_results();
        self.store
            .record_step_completion(checkpoint, &step_name, ContextValue::Map(summary))
            .await?;
        tracing::info!(
            run_id = %run.id,
            step = %step_name,
            completed = status.completed,
            total = status.total,
            "fan-out resolved"
        );

        self.advance(run, checkpoint, step, None).await
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// Resolve the step's outgoing edge and either move the step pointer
    /// or complete the run.
    async fn advance(
        &self,
        run: &WorkflowRun,
        checkpoint: &mut Checkpoint,
        step: &StepDescriptor,
        label: Option<&str>,
    ) -> Result<Advance, EngineError> {
        match step.transitions().resolve(label) {
            Some(Transition::To(next)) => {
                let next = next.clone();
                self.store.set_current_step(checkpoint, &next).await?;
                Ok(Advance::Continue)
            }
            Some(Transition::Terminate) => {
                let status = self
                    .set_status(run.id, RunStatus::Running, RunStatus::Completed)
                    .await?;
                tracing::info!(run_id = %run.id, "run completed");
                Ok(Advance::Completed(ExecutionResult {
                    run_id: run.id,
                    status,
                    current_step: checkpoint.current_step.clone(),
                    gate: None,
                }))
            }
            None => {
                let label = label.unwrap_or("<none>").to_string();
                self.fail_run(
                    run.id,
                    &format!("step '{}' has no transition for label '{label}'", step.name()),
                )
                .await?;
                Err(WorkflowError::UnroutableLabel {
                    step: step.name().to_string(),
                    label,
                }
                .into())
            }
        }
    }

    /// Loop guard plus iteration bump for one entry into a step.
    async fn enter_step(
        &self,
        run_id: Uuid,
        checkpoint: &mut Checkpoint,
        step: &StepDescriptor,
    ) -> Result<(), EngineError> {
        let name = step.name();
        let limit = step.max_iterations();
        if checkpoint.iteration_count(name) >= limit {
            self.fail_run(
                run_id,
                &format!("step '{name}' exceeded its iteration limit ({limit})"),
            )
            .await?;
            return Err(EngineError::IterationLimitExceeded {
                step: name.to_string(),
                limit,
            });
        }
        self.store.increment_iteration(checkpoint, name).await
            .map_err(Into::into)
    }

    fn context(
        &self,
        run: &WorkflowRun,
        checkpoint: &Checkpoint,
        step: &str,
        item: Option<String>,
    ) -> StepContext {
        StepContext {
            run_id: run.id,
            workflow_type: run.workflow_type.clone(),
            target_id: run.target_id.clone(),
            step: step.to_string(),
            item,
            data: checkpoint.data.clone(),
        }
    }

    async fn load_run(&self, run_id: Uuid) -> Result<WorkflowRun, EngineError> {
        self.store
            .repository()
            .get_run(&run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))
    }

    async fn set_status(
        &self,
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<RunStatus, EngineError> {
        let next = from.transition(to)?;
        self.store
            .repository()
            .update_run_status(&run_id, next, None)
            .await?;
        Ok(next)
    }

    async fn fail_run(&self, run_id: Uuid, error: &str) -> Result<(), EngineError> {
        self.store
            .repository()
            .update_run_status(&run_id, RunStatus::Failed, Some(error))
            .await?;
        tracing::error!(run_id = %run_id, error, "run failed");
        Ok(())
    }

    fn lock_for(&self, run_id: Uuid) -> Arc<Mutex<()>> {
        self.run_locks
            .entry(run_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
