//! Domain services consumed by the workflow and the handlers.
//!
//! The desk only orchestrates: analysis and optimization happen behind these
//! traits. `mock` holds in-memory implementations used by the binary and tests.

pub mod mock;

use async_trait::async_trait;

use crate::artifacts::{ExposureFrameRef, OptimizationResultRef};
use crate::error::ServiceError;
use crate::jobs::JobStatus;
use crate::workflow::thematic::ExposureSchema;

pub use mock::{MockBatchService, MockPortfolioService};

/// Portfolio-level operations.
#[async_trait]
pub trait PortfolioService: Send + Sync {
    /// Whether `account_id` may be analyzed. Case-insensitive.
    async fn validate_account(&self, account_id: &str) -> Result<bool, ServiceError>;

    /// Optimize the account against an exposure frame.
    async fn optimize(
        &self,
        exposures: &ExposureFrameRef,
        account_id: &str,
    ) -> Result<OptimizationResultRef, ServiceError>;
}

/// External batch prediction service.
#[async_trait]
pub trait BatchService: Send + Sync {
    /// Start a batch job; returns the batch service's job id.
    async fn start_batch_job(
        &self,
        stocks: &[String],
        schema: &ExposureSchema,
    ) -> Result<String, ServiceError>;

    /// Current status of a batch job.
    async fn check_batch_status(&self, batch_job_id: &str) -> Result<JobStatus, ServiceError>;

    /// Reference to the results of a finished batch job.
    async fn fetch_batch_results(&self, batch_job_id: &str)
    -> Result<ExposureFrameRef, ServiceError>;
}
