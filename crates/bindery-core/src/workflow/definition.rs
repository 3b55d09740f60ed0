//! Workflow definitions: an explicit, validated step graph.
//!
//! A [`WorkflowDefinition`] names its steps up front and wires them with
//! labeled transitions. Construction goes through [`WorkflowBuilder::build`],
//! which rejects dangling transition targets, gates without routable
//! options, and fan-outs without items, so the engine never discovers a
//! malformed graph mid-run.

use std::collections::BTreeMap;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("duplicate step '{0}' in workflow definition")]
    DuplicateStep(String),

    #[error("unknown step '{0}'")]
    UnknownStep(String),

    #[error("step '{step}' transitions to unknown step '{target}'")]
    DanglingTransition { step: String, target: String },

    #[error("step '{step}' has no transition for label '{label}'")]
    UnroutableLabel { step: String, label: String },

    #[error("invalid workflow definition: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// Transitions
// ---------------------------------------------------------------------------

/// Where control flows after a step completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Continue at the named step.
    To(String),
    /// The run is complete.
    Terminate,
}

/// Labeled edges out of a step, with an optional default edge.
///
/// A step outcome may carry a label; the table resolves it to an edge,
/// falling back to the default when no labeled edge matches (or when the
/// outcome carries no label at all).
#[derive(Debug, Clone, Default)]
pub struct TransitionTable {
    edges: BTreeMap<String, Transition>,
    default: Option<Transition>,
}

impl TransitionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route the given label to a transition.
    pub fn on(mut self, label: impl Into<String>, transition: Transition) -> Self {
        self.edges.insert(label.into(), transition);
        self
    }

    /// Set the fallback edge taken when no labeled edge matches.
    pub fn default_to(mut self, transition: Transition) -> Self {
        self.default = Some(transition);
        self
    }

    /// Resolve an outcome label to an edge.
    pub fn resolve(&self, label: Option<&str>) -> Option<&Transition> {
        match label {
            Some(label) => self.edges.get(label).or(self.default.as_ref()),
            None => self.default.as_ref(),
        }
    }

    /// All step names this table can route to.
    fn targets(&self) -> impl Iterator<Item = &str> {
        self.edges
            .values()
            .chain(self.default.iter())
            .filter_map(|t| match t {
                Transition::To(step) => Some(step.as_str()),
                Transition::Terminate => None,
            })
    }

    fn has_default(&self) -> bool {
        self.default.is_some()
    }
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

/// How many per-item failures a parallel fan-out step tolerates before the
/// run as a whole fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPolicy {
    /// Every item must complete.
    AllSucceed,
    /// Up to this many items may exhaust their retries and fail.
    TolerateFailures(u32),
}

impl CompletionPolicy {
    pub fn allows(&self, failed: usize) -> bool {
        match self {
            Self::AllSucceed => failed == 0,
            Self::TolerateFailures(max) => failed <= *max as usize,
        }
    }
}

/// The execution shape of a step.
#[derive(Debug, Clone)]
pub enum StepKind {
    /// One handler invocation, retried in place on failure.
    Sequential,
    /// Suspend the run and wait for a human decision.
    HumanGate {
        /// Shown to the operator when the run pauses.
        prompt: String,
        /// The decisions the gate accepts.
        options: Vec<String>,
    },
    /// Run the handler once per item concurrently.
    ParallelFanout {
        items: Vec<String>,
        policy: CompletionPolicy,
        /// Per-item retry budget on top of the initial attempt.
        max_item_retries: u32,
    },
}

/// A named step in the graph.
#[derive(Debug, Clone)]
pub struct StepDescriptor {
    name: String,
    kind: StepKind,
    max_retries: u32,
    max_iterations: u32,
    transitions: TransitionTable,
}

impl StepDescriptor {
    pub fn sequential(name: impl Into<String>) -> Self {
        Self::new(name, StepKind::Sequential)
    }

    pub fn human_gate(
        name: impl Into<String>,
        prompt: impl Into<String>,
        options: Vec<String>,
    ) -> Self {
        Self::new(
            name,
            StepKind::HumanGate {
                prompt: prompt.into(),
                options,
            },
        )
    }

    pub fn parallel_fanout(
        name: impl Into<String>,
        items: Vec<String>,
        policy: CompletionPolicy,
        max_item_retries: u32,
    ) -> Self {
        Self::new(
            name,
            StepKind::ParallelFanout {
                items,
                policy,
                max_item_retries,
            },
        )
    }

    fn new(name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            name: name.into(),
            kind,
            max_retries: 0,
            max_iterations: 10,
            transitions: TransitionTable::new(),
        }
    }

    /// Retry budget on top of the initial attempt (sequential steps).
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// How many times a run may enter this step (loop guard). Default 10.
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_transitions(mut self, transitions: TransitionTable) -> Self {
        self.transitions = transitions;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &StepKind {
        &self.kind
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn max_iterations(&self) -> u32 {
        self.max_iterations
    }

    pub fn transitions(&self) -> &TransitionTable {
        &self.transitions
    }
}

// ---------------------------------------------------------------------------
// Definition
// ---------------------------------------------------------------------------

/// A validated workflow graph.
#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    workflow_type: String,
    entry: String,
    steps: BTreeMap<String, StepDescriptor>,
}

impl WorkflowDefinition {
    pub fn builder(workflow_type: impl Into<String>, entry: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder {
            workflow_type: workflow_type.into(),
            entry: entry.into(),
            steps: Vec::new(),
        }
    }

    pub fn workflow_type(&self) -> &str {
        &self.workflow_type
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn step(&self, name: &str) -> Option<&StepDescriptor> {
        self.steps.get(name)
    }

    pub fn step_names(&self) -> impl Iterator<Item = &str> {
        self.steps.keys().map(String::as_str)
    }
}

/// Builder for [`WorkflowDefinition`]. Validation happens in [`Self::build`].
pub struct WorkflowBuilder {
    workflow_type: String,
    entry: String,
    steps: Vec<StepDescriptor>,
}

impl WorkflowBuilder {
    pub fn step(mut self, step: StepDescriptor) -> Self {
        self.steps.push(step);
        self
    }

    /// Validate the graph and produce the definition.
    ///
    /// Rejects: duplicate step names, a missing entry step, transitions to
    /// unknown steps, gates with no options or with an unroutable option,
    /// fan-outs with no items, non-gate steps without a default edge, and
    /// zero iteration limits.
    pub fn build(self) -> Result<WorkflowDefinition, WorkflowError> {
        let mut steps = BTreeMap::new();
        for step in self.steps {
            if steps.insert(step.name.clone(), step.clone()).is_some() {
                return Err(WorkflowError::DuplicateStep(step.name));
            }
        }

        if !steps.contains_key(&self.entry) {
            return Err(WorkflowError::UnknownStep(self.entry));
        }

        for step in steps.values() {
            if step.max_iterations == 0 {
                return Err(WorkflowError::Invalid(format!(
                    "step '{}' has a zero iteration limit",
                    step.name
                )));
            }

            for target in step.transitions.targets() {
                if !steps.contains_key(target) {
                    return Err(WorkflowError::DanglingTransition {
                        step: step.name.clone(),
                        target: target.to_string(),
                    });
                }
            }

            match &step.kind {
                StepKind::HumanGate { options, .. } => {
                    if options.is_empty() {
                        return Err(WorkflowError::Invalid(format!(
                            "gate '{}' has no options",
                            step.name
                        )));
                    }
                    for option in options {
                        if step.transitions.resolve(Some(option)).is_none() {
                            return Err(WorkflowError::UnroutableLabel {
                                step: step.name.clone(),
                                label: option.clone(),
                            });
                        }
                    }
                }
                StepKind::ParallelFanout { items, .. } => {
                    if items.is_empty() {
                        return Err(WorkflowError::Invalid(format!(
                            "fan-out '{}' has no items",
                            step.name
                        )));
                    }
                    if !step.transitions.has_default() {
                        return Err(WorkflowError::Invalid(format!(
                            "fan-out '{}' has no default transition",
                            step.name
                        )));
                    }
                }
                StepKind::Sequential => {
                    if !step.transitions.has_default() {
                        return Err(WorkflowError::Invalid(format!(
                            "step '{}' has no default transition",
                            step.name
                        )));
                    }
                }
            }
        }

        Ok(WorkflowDefinition {
            workflow_type: self.workflow_type,
            entry: self.entry,
            steps,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn terminal_step(name: &str) -> StepDescriptor {
        StepDescriptor::sequential(name)
            .with_transitions(TransitionTable::new().default_to(Transition::Terminate))
    }

    #[test]
    fn linear_workflow_builds() {
        let def = WorkflowDefinition::builder("w1_editing", "plan")
            .step(StepDescriptor::sequential("plan").with_transitions(
                TransitionTable::new().default_to(Transition::To("report".to_string())),
            ))
            .step(terminal_step("report"))
            .build()
            .unwrap();

        assert_eq!(def.entry(), "plan");
        assert_eq!(def.step_names().count(), 2);
        assert!(matches!(
            def.step("plan").unwrap().transitions().resolve(None),
            Some(Transition::To(s)) if s == "report"
        ));
    }

    #[test]
    fn missing_entry_rejected() {
        let err = WorkflowDefinition::builder("w", "nope")
            .step(terminal_step("plan"))
            .build()
            .unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownStep(s) if s == "nope"));
    }

    #[test]
    fn duplicate_step_rejected() {
        let err = WorkflowDefinition::builder("w", "plan")
            .step(terminal_step("plan"))
            .step(terminal_step("plan"))
            .build()
            .unwrap_err();
        assert!(matches!(err, WorkflowError::DuplicateStep(s) if s == "plan"));
    }

    #[test]
    fn dangling_transition_rejected() {
        let err = WorkflowDefinition::builder("w", "plan")
            .step(StepDescriptor::sequential("plan").with_transitions(
                TransitionTable::new().default_to(Transition::To("ghost".to_string())),
            ))
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::DanglingTransition { target, .. } if target == "ghost"
        ));
    }

    #[test]
    fn gate_option_without_edge_rejected() {
        let err = WorkflowDefinition::builder("w", "gate")
            .step(
                StepDescriptor::human_gate(
                    "gate",
                    "Approve?",
                    vec!["approve".to_string(), "revise".to_string()],
                )
                .with_transitions(TransitionTable::new().on("approve", Transition::Terminate)),
            )
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::UnroutableLabel { label, .. } if label == "revise"
        ));
    }

    #[test]
    fn gate_options_covered_by_default_edge_accepted() {
        let def = WorkflowDefinition::builder("w", "gate")
            .step(
                StepDescriptor::human_gate(
                    "gate",
                    "Approve?",
                    vec!["approve".to_string(), "revise".to_string()],
                )
                .with_transitions(
                    TransitionTable::new()
                        .on("revise", Transition::To("gate".to_string()))
                        .default_to(Transition::Terminate),
                ),
            )
            .build()
            .unwrap();
        assert!(matches!(
            def.step("gate").unwrap().transitions().resolve(Some("approve")),
            Some(Transition::Terminate)
        ));
    }

    #[test]
    fn empty_fanout_rejected() {
        let err = WorkflowDefinition::builder("w", "fan")
            .step(
                StepDescriptor::parallel_fanout("fan", vec![], CompletionPolicy::AllSucceed, 0)
                    .with_transitions(TransitionTable::new().default_to(Transition::Terminate)),
            )
            .build()
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Invalid(_)));
    }

    #[test]
    fn sequential_without_default_edge_rejected() {
        let err = WorkflowDefinition::builder("w", "plan")
            .step(StepDescriptor::sequential("plan"))
            .build()
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Invalid(_)));
    }

    #[test]
    fn completion_policy_thresholds() {
        assert!(CompletionPolicy::AllSucceed.allows(0));
        assert!(!CompletionPolicy::AllSucceed.allows(1));
        assert!(CompletionPolicy::TolerateFailures(2).allows(2));
        assert!(!CompletionPolicy::TolerateFailures(2).allows(3));
    }
}
