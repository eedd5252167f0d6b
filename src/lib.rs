//! Portfolio Assist: thematic analysis job desk.
//!
//! Free-text requests are routed by a supervisor to specialist handlers that
//! start background analysis jobs or report on them.

pub mod agent;
pub mod artifacts;
pub mod config;
pub mod desk;
pub mod error;
pub mod jobs;
pub mod services;
pub mod worker;
pub mod workflow;

pub use desk::{Desk, DeskDeps};
pub use error::{Error, Result};
