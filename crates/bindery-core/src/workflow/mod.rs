//! Workflow execution machinery.
//!
//! - [`definition`]: the explicit step graph a workflow runs over,
//!   validated at construction.
//! - [`handler`]: the narrow trait step logic plugs into.
//! - [`store`]: the checkpoint store that persists run progress.
//! - [`engine`]: the resumable execution engine itself.

pub mod definition;
pub mod engine;
pub mod handler;
pub mod store;

pub use definition::{
    CompletionPolicy, StepDescriptor, StepKind, Transition, TransitionTable, WorkflowDefinition,
    WorkflowError,
};
pub use engine::{EngineError, ExecutionResult, GatePrompt, RunState, WorkflowEngine};
pub use handler::{HandlerRegistry, StepContext, StepFailure, StepHandler, StepOutcome};
pub use store::{CheckpointStore, StoreError};
