//! Background execution of workflows.

pub mod executor;

pub use executor::{CancelFlag, TaskExecutor};
