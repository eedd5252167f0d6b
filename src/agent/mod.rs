//! Agent module: conversation routing and specialist handlers.
//!
//! - `conversation`: per-thread message history
//! - `classifier`: intent classification seam and the keyword classifier
//! - `handlers`: analysis, status and cancel handlers
//! - `supervisor`: the routing loop tying them together

pub mod classifier;
pub mod conversation;
pub mod handlers;
pub mod supervisor;

pub use classifier::{Decision, DelegationRequest, IntentClassifier, KeywordClassifier};
pub use conversation::{ChatMessage, Conversation, Role};
pub use handlers::{
    HandlerReply, JobCancelHandler, JobStatusHandler, SpecialistHandler, ThematicAnalysisHandler,
};
pub use supervisor::Supervisor;
