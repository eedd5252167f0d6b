//! Workflows: step graphs executed in the background.
//!
//! - `graph`: generic step graph, builder and step stream
//! - `retry`: retry budget and pacing for looping steps
//! - `thematic`: the thematic analysis workflow

pub mod graph;
pub mod retry;
pub mod thematic;

pub use graph::{END, Step, StepEvent, Workflow, WorkflowBuilder, WorkflowState};
pub use retry::RetryPolicy;
pub use thematic::{ExposureSchema, ThematicPatch, ThematicState, build_workflow};
