//! In-memory domain services.
//!
//! Each instance keeps its own state, so tests can run side by side without
//! sharing counters.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::artifacts::{ArtifactRef, ExposureFrameRef, OptimizationResultRef};
use crate::error::ServiceError;
use crate::jobs::JobStatus;
use crate::services::{BatchService, PortfolioService};
use crate::workflow::thematic::ExposureSchema;

/// Accounts accepted by [`MockPortfolioService::new`].
pub const DEFAULT_VALID_ACCOUNTS: &[&str] = &["ACC12345", "TEST_ACCOUNT", "DEMO_001"];

fn short_hex(len: usize) -> String {
    Uuid::new_v4().simple().to_string()[..len].to_string()
}

/// Portfolio service with a fixed account allow-list and equal-weight optimizer.
pub struct MockPortfolioService {
    valid_accounts: HashSet<String>,
    latency: Duration,
}

impl MockPortfolioService {
    pub fn new() -> Self {
        Self::with_accounts(DEFAULT_VALID_ACCOUNTS.iter().copied())
    }

    pub fn with_accounts<I, A>(accounts: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: AsRef<str>,
    {
        Self {
            valid_accounts: accounts
                .into_iter()
                .map(|a| a.as_ref().to_uppercase())
                .collect(),
            latency: Duration::from_secs(1),
        }
    }

    /// Simulated optimization time.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

impl Default for MockPortfolioService {
    fn default() -> Self {
        Self::new()
    }
}

/// Equal weights rounded to 4 dp; the last ticker absorbs the rounding remainder.
fn equal_weights(tickers: &BTreeSet<String>) -> BTreeMap<String, Decimal> {
    let mut weights = BTreeMap::new();
    let n = tickers.len();
    if n == 0 {
        return weights;
    }
    let share = (Decimal::ONE / Decimal::from(n)).round_dp(4);
    let mut allocated = Decimal::ZERO;
    for (i, ticker) in tickers.iter().enumerate() {
        let weight = if i + 1 == n {
            Decimal::ONE - allocated
        } else {
            share
        };
        allocated += weight;
        weights.insert(ticker.clone(), weight);
    }
    weights
}

#[async_trait]
impl PortfolioService for MockPortfolioService {
    async fn validate_account(&self, account_id: &str) -> Result<bool, ServiceError> {
        tracing::debug!(account = account_id, "Validating account");
        Ok(self.valid_accounts.contains(&account_id.trim().to_uppercase()))
    }

    async fn optimize(
        &self,
        exposures: &ExposureFrameRef,
        account_id: &str,
    ) -> Result<OptimizationResultRef, ServiceError> {
        tracing::info!(
            account = account_id,
            exposures = exposures.artifact().uri(),
            "Running optimization"
        );
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let tickers: BTreeSet<String> = exposures.tickers().into_iter().collect();
        if tickers.is_empty() {
            return Err(ServiceError::RequestFailed {
                service: "portfolio".to_string(),
                reason: format!(
                    "exposure frame {} lists no tickers",
                    exposures.artifact().uri()
                ),
            });
        }

        let artifact = ArtifactRef::new(
            format!("s3://results/opt_{}.parquet", short_hex(8)),
            Uuid::new_v4().simple().to_string(),
        )?
        .with_metadata("account", account_id);

        Ok(OptimizationResultRef::new(artifact, equal_weights(&tickers)))
    }
}

/// How a mocked batch job ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Succeed,
    Fail,
    NeverFinish,
}

struct BatchRecord {
    stocks: Vec<String>,
    polls: u32,
}

/// Batch service that finishes after a fixed number of status checks.
pub struct MockBatchService {
    jobs: Mutex<HashMap<String, BatchRecord>>,
    polls_until_done: u32,
    outcome: BatchOutcome,
}

impl MockBatchService {
    /// Reports RUNNING twice, then SUCCEEDED on the third check.
    pub fn new() -> Self {
        Self::with_outcome(BatchOutcome::Succeed, 3)
    }

    pub fn with_outcome(outcome: BatchOutcome, polls_until_done: u32) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            polls_until_done: polls_until_done.max(1),
            outcome,
        }
    }

    /// Status checks received so far for a batch job.
    pub async fn poll_count(&self, batch_job_id: &str) -> Option<u32> {
        self.jobs.lock().await.get(batch_job_id).map(|r| r.polls)
    }

    /// Number of batch jobs started on this instance.
    pub async fn started(&self) -> usize {
        self.jobs.lock().await.len()
    }
}

impl Default for MockBatchService {
    fn default() -> Self {
        Self::new()
    }
}

fn unknown(batch_job_id: &str) -> ServiceError {
    ServiceError::UnknownBatchJob {
        id: batch_job_id.to_string(),
    }
}

#[async_trait]
impl BatchService for MockBatchService {
    async fn start_batch_job(
        &self,
        stocks: &[String],
        schema: &ExposureSchema,
    ) -> Result<String, ServiceError> {
        let batch_job_id = format!("batch_{}", short_hex(8));
        self.jobs.lock().await.insert(
            batch_job_id.clone(),
            BatchRecord {
                stocks: stocks.to_vec(),
                polls: 0,
            },
        );
        tracing::info!(
            batch_job_id = %batch_job_id,
            stocks = stocks.len(),
            theme = %schema.theme,
            "Started batch prediction job"
        );
        Ok(batch_job_id)
    }

    async fn check_batch_status(&self, batch_job_id: &str) -> Result<JobStatus, ServiceError> {
        let mut jobs = self.jobs.lock().await;
        let record = jobs.get_mut(batch_job_id).ok_or_else(|| unknown(batch_job_id))?;
        record.polls += 1;

        let done = record.polls >= self.polls_until_done;
        let status = match self.outcome {
            BatchOutcome::Succeed if done => JobStatus::Succeeded,
            BatchOutcome::Fail if done => JobStatus::Failed,
            _ => JobStatus::Running,
        };
        tracing::debug!(batch_job_id, polls = record.polls, status = %status, "Batch status");
        Ok(status)
    }

    async fn fetch_batch_results(
        &self,
        batch_job_id: &str,
    ) -> Result<ExposureFrameRef, ServiceError> {
        let jobs = self.jobs.lock().await;
        let record = jobs.get(batch_job_id).ok_or_else(|| unknown(batch_job_id))?;
        let tickers: Vec<Value> = record.stocks.iter().cloned().map(Value::from).collect();

        let artifact = ArtifactRef::new(
            format!("s3://exposures/exp_{}.parquet", short_hex(8)),
            Uuid::new_v4().simple().to_string(),
        )?
        .with_metadata("source_job", batch_job_id)
        .with_metadata("tickers", Value::Array(tickers));

        Ok(ExposureFrameRef::new(artifact))
    }
}
