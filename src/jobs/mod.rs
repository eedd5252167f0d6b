//! Job tracking: state model and the bounded registry.
//!
//! - `state`: JobStatus state machine, JobState snapshot, typed JobUpdate
//! - `registry`: JobRegistry with recency-based eviction

pub mod registry;
pub mod state;

pub use registry::{JOB_ID_PREFIX, JobRegistry, new_job_id};
pub use state::{JobState, JobStatus, JobUpdate, TaskType};
