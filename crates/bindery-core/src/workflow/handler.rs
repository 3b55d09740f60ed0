//! Step handler trait and registry.
//!
//! [`StepHandler`] is the narrow seam between the engine and domain logic:
//! a handler receives an owned [`StepContext`] snapshot and returns a
//! boxed future, which keeps the trait object-safe so registries can hold
//! `Arc<dyn StepHandler>`. Handlers must tolerate re-invocation: a crash
//! after a step ran but before its completion was recorded means the step
//! runs again on resume.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bindery_types::value::ContextValue;
use thiserror::Error;
use uuid::Uuid;

/// Boxed future returned by [`StepHandler::execute`].
pub type HandlerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<StepOutcome, StepFailure>> + Send + 'a>>;

/// A handler failed. The engine treats every failure as transient and
/// retries within the step's budget.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct StepFailure {
    message: String,
}

impl StepFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Everything a handler sees about the step it is running.
///
/// Owned (not borrowed) because fan-out items execute on spawned tasks.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub run_id: Uuid,
    pub workflow_type: String,
    /// The entity the run operates on (book slug).
    pub target_id: String,
    pub step: String,
    /// Set when this invocation is one item of a parallel fan-out.
    pub item: Option<String>,
    /// Snapshot of the checkpoint's shared data map.
    pub data: BTreeMap<String, ContextValue>,
}

/// What a successful handler invocation produced.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Recorded in the checkpoint as the step's result.
    pub result: ContextValue,
    /// Optional routing label, resolved against the step's transitions.
    pub label: Option<String>,
    /// Entries merged into the checkpoint's shared data map.
    pub data: BTreeMap<String, ContextValue>,
}

impl StepOutcome {
    pub fn new(result: ContextValue) -> Self {
        Self {
            result,
            label: None,
            data: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_data(mut self, key: impl Into<String>, value: ContextValue) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

/// Step execution logic. One handler per step name; fan-out items share
/// the step's handler and are distinguished by [`StepContext::item`].
pub trait StepHandler: Send + Sync {
    fn execute(&self, ctx: StepContext) -> HandlerFuture<'_>;
}

/// Adapter for building a handler from an async closure. Mostly useful in
/// tests and small plumbing steps.
pub struct FnHandler<F>(F);

impl<F, Fut> FnHandler<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutcome, StepFailure>> + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F, Fut> StepHandler for FnHandler<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<StepOutcome, StepFailure>> + Send + 'static,
{
    fn execute(&self, ctx: StepContext) -> HandlerFuture<'_> {
        Box::pin((self.0)(ctx))
    }
}

/// Step name to handler mapping for one workflow type.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, step: impl Into<String>, handler: Arc<dyn StepHandler>) -> Self {
        self.handlers.insert(step.into(), handler);
        self
    }

    pub fn get(&self, step: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(step).cloned()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("steps", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fn_handler_executes() {
        let handler = FnHandler::new(|ctx: StepContext| async move {
            Ok(StepOutcome::new(ContextValue::text(ctx.step)).with_label("ok"))
        });
        let ctx = StepContext {
            run_id: Uuid::now_v7(),
            workflow_type: "w".to_string(),
            target_id: "book_core".to_string(),
            step: "plan".to_string(),
            item: None,
            data: BTreeMap::new(),
        };
        let outcome = handler.execute(ctx).await.unwrap();
        assert_eq!(outcome.result.as_text(), Some("plan"));
        assert_eq!(outcome.label.as_deref(), Some("ok"));
    }

    #[test]
    fn registry_lookup() {
        let registry = HandlerRegistry::new().register(
            "plan",
            Arc::new(FnHandler::new(|_ctx: StepContext| async move {
                Ok(StepOutcome::new(ContextValue::Bool(true)))
            })),
        );
        assert!(registry.get("plan").is_some());
        assert!(registry.get("ghost").is_none());
    }
}
