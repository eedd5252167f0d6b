//! Step graph engine.
//!
//! A [`Workflow`] is a directed graph of named steps over a shared state `S`.
//! Each step reads the state and returns a patch that is merged into it; an
//! edge (direct or conditional) picks the next step. Execution is exposed as a
//! stream of [`StepEvent`]s so callers can observe every completed step.
//!
//! ```text
//! entry ─► step ─► apply(patch) ─► route ─┬─► next step
//!                                         ├─► error step (state carries an error)
//!                                         └─► END
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};

use crate::error::WorkflowError;
use crate::workflow::retry::{RetryBudget, RetryPolicy};

/// Pseudo step name that terminates the workflow.
pub const END: &str = "__end__";

/// State threaded through a workflow.
pub trait WorkflowState: Clone + Send + Sync + 'static {
    /// Partial update produced by a step.
    type Patch: Send + 'static;

    /// Merge a patch. Fields are added or overwritten, never removed.
    fn apply(&mut self, patch: Self::Patch);

    /// Error marker, if a step recorded one.
    fn error(&self) -> Option<&str>;

    /// Record an error marker.
    fn set_error(&mut self, message: String);
}

/// A single unit of work in a workflow.
#[async_trait]
pub trait Step<S: WorkflowState>: Send + Sync {
    async fn run(&self, state: &S) -> Result<S::Patch, WorkflowError>;
}

/// Picks the next step from the current state.
pub type Router<S> = Arc<dyn Fn(&S) -> &'static str + Send + Sync>;

enum Edge<S> {
    Direct(&'static str),
    Conditional(Router<S>),
}

/// Emitted after each completed step.
#[derive(Debug, Clone)]
pub struct StepEvent<S> {
    /// Name of the step that just completed.
    pub step: &'static str,
    /// State after the step's patch was applied.
    pub state: S,
}

/// A compiled, validated step graph.
pub struct Workflow<S: WorkflowState> {
    name: String,
    entry: &'static str,
    steps: HashMap<&'static str, Arc<dyn Step<S>>>,
    edges: HashMap<&'static str, Edge<S>>,
    retry: HashMap<&'static str, RetryPolicy>,
    error_step: Option<&'static str>,
}

impl<S: WorkflowState> Workflow<S> {
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder<S> {
        WorkflowBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the workflow step by step.
    ///
    /// The stream ends after the last step, or right after yielding the first
    /// error; a step error is never retried.
    pub fn stream(self: &Arc<Self>, initial: S) -> BoxStream<'static, Result<StepEvent<S>, WorkflowError>> {
        let cursor = Cursor {
            workflow: Arc::clone(self),
            state: initial,
            next: Some(self.entry),
            budgets: HashMap::new(),
        };

        stream::unfold(Some(cursor), |cursor| async move {
            let Some(mut cursor) = cursor else {
                return None;
            };
            let Some(step) = cursor.next else {
                return None;
            };
            match cursor.advance(step).await {
                Ok(event) => Some((Ok(event), Some(cursor))),
                Err(e) => Some((Err(e), None)),
            }
        })
        .boxed()
    }

    /// Drive the workflow to completion and return the final state.
    pub async fn run(self: &Arc<Self>, initial: S) -> Result<S, WorkflowError> {
        let mut last = initial.clone();
        let mut steps = self.stream(initial);
        while let Some(event) = steps.next().await {
            last = event?.state;
        }
        Ok(last)
    }
}

struct Cursor<S: WorkflowState> {
    workflow: Arc<Workflow<S>>,
    state: S,
    next: Option<&'static str>,
    budgets: HashMap<&'static str, RetryBudget>,
}

impl<S: WorkflowState> Cursor<S> {
    async fn advance(&mut self, step: &'static str) -> Result<StepEvent<S>, WorkflowError> {
        let workflow = Arc::clone(&self.workflow);
        let node = workflow
            .steps
            .get(step)
            .ok_or_else(|| WorkflowError::UnknownStep {
                step: step.to_string(),
            })?;

        if let Some(policy) = workflow.retry.get(step) {
            let attempt = self.budgets.entry(step).or_insert_with(RetryBudget::new).enter();
            let delay = policy.delay_for(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        let patch = node.run(&self.state).await?;
        self.state.apply(patch);
        self.next = self.route(&workflow, step)?;

        tracing::debug!(
            workflow = %workflow.name,
            step,
            next = self.next.unwrap_or(END),
            "Workflow step completed"
        );

        Ok(StepEvent {
            step,
            state: self.state.clone(),
        })
    }

    fn route(
        &mut self,
        workflow: &Workflow<S>,
        step: &'static str,
    ) -> Result<Option<&'static str>, WorkflowError> {
        if self.state.error().is_some() && workflow.error_step != Some(step) {
            return Ok(workflow.error_step);
        }

        let target = match workflow.edges.get(step) {
            Some(Edge::Direct(target)) => *target,
            Some(Edge::Conditional(router)) => router(&self.state),
            None => {
                return Err(WorkflowError::MissingEdge {
                    step: step.to_string(),
                });
            }
        };

        if target == END {
            return Ok(None);
        }
        if !workflow.steps.contains_key(target) {
            return Err(WorkflowError::BadRoute {
                step: step.to_string(),
                target: target.to_string(),
            });
        }

        if let (Some(policy), Some(budget)) = (workflow.retry.get(target), self.budgets.get(target))
            && !budget.allows_another(policy)
        {
            let attempts = budget.attempts();
            tracing::warn!(
                workflow = %workflow.name,
                step = target,
                attempts,
                "Retry budget exhausted"
            );
            self.state.set_error(format!(
                "{target} exhausted its retry budget after {attempts} attempts"
            ));
            return Ok(workflow.error_step.filter(|e| *e != step));
        }

        Ok(Some(target))
    }
}

/// Builder for [`Workflow`].
pub struct WorkflowBuilder<S: WorkflowState> {
    name: String,
    entry: Option<&'static str>,
    steps: Vec<(&'static str, Arc<dyn Step<S>>)>,
    edges: HashMap<&'static str, Edge<S>>,
    retry: HashMap<&'static str, RetryPolicy>,
    error_step: Option<&'static str>,
}

impl<S: WorkflowState> WorkflowBuilder<S> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entry: None,
            steps: Vec::new(),
            edges: HashMap::new(),
            retry: HashMap::new(),
            error_step: None,
        }
    }

    pub fn add_step(mut self, name: &'static str, step: impl Step<S> + 'static) -> Self {
        self.steps.push((name, Arc::new(step)));
        self
    }

    pub fn set_entry(mut self, name: &'static str) -> Self {
        self.entry = Some(name);
        self
    }

    /// Unconditional edge; `to` may be [`END`].
    pub fn add_edge(mut self, from: &'static str, to: &'static str) -> Self {
        self.edges.insert(from, Edge::Direct(to));
        self
    }

    /// Edge whose target is computed from the state after `from` runs.
    pub fn add_conditional_edge<F>(mut self, from: &'static str, router: F) -> Self
    where
        F: Fn(&S) -> &'static str + Send + Sync + 'static,
    {
        self.edges.insert(from, Edge::Conditional(Arc::new(router)));
        self
    }

    /// Bound how often `step` may be entered, and pace its entries.
    pub fn retry_loop(mut self, step: &'static str, policy: RetryPolicy) -> Self {
        self.retry.insert(step, policy);
        self
    }

    /// Step that receives control when another step leaves an error marker.
    pub fn set_error_step(mut self, step: &'static str) -> Self {
        self.error_step = Some(step);
        self
    }

    pub fn build(self) -> Result<Workflow<S>, WorkflowError> {
        let mut steps = HashMap::new();
        for (name, step) in self.steps {
            if steps.insert(name, step).is_some() {
                return Err(WorkflowError::DuplicateStep {
                    step: name.to_string(),
                });
            }
        }

        let entry = self.entry.ok_or_else(|| WorkflowError::MissingEntry {
            workflow: self.name.clone(),
        })?;

        let known = |name: &'static str| -> Result<(), WorkflowError> {
            if steps.contains_key(name) {
                Ok(())
            } else {
                Err(WorkflowError::UnknownStep {
                    step: name.to_string(),
                })
            }
        };

        known(entry)?;
        for (from, edge) in &self.edges {
            known(*from)?;
            if let Edge::Direct(to) = edge
                && *to != END
            {
                known(*to)?;
            }
        }
        for name in steps.keys() {
            if !self.edges.contains_key(name) {
                return Err(WorkflowError::MissingEdge {
                    step: name.to_string(),
                });
            }
        }
        for step in self.retry.keys() {
            known(*step)?;
        }
        if let Some(step) = self.error_step {
            known(step)?;
        }

        Ok(Workflow {
            name: self.name,
            entry,
            steps,
            edges: self.edges,
            retry: self.retry,
            error_step: self.error_step,
        })
    }
}
