//! Thematic analysis workflow.
//!
//! ```text
//! generate_schema ─► start_batch ─► monitor_batch ─┬─► get_results ─► optimize ─► END
//!                                      ▲           │  (SUCCEEDED)
//!                                      └───────────┤  (still running, within retry budget)
//!                                                  └─► handle_error ─► END
//!                                                     (FAILED / CANCELLED / budget exhausted)
//! ```

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::artifacts::{ExposureFrameRef, OptimizationResultRef};
use crate::error::{ServiceError, WorkflowError};
use crate::jobs::JobStatus;
use crate::services::{BatchService, PortfolioService};
use crate::workflow::graph::{END, Step, Workflow, WorkflowState};
use crate::workflow::retry::RetryPolicy;

pub const WORKFLOW_NAME: &str = "thematic_analysis";

pub const GENERATE_SCHEMA: &str = "generate_schema";
pub const START_BATCH: &str = "start_batch";
pub const MONITOR_BATCH: &str = "monitor_batch";
pub const GET_RESULTS: &str = "get_results";
pub const OPTIMIZE: &str = "optimize";
pub const HANDLE_ERROR: &str = "handle_error";

static THEME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:on|about)\s+(.+?)(?:\s+for\b|[.?!]|$)").expect("valid theme regex")
});

/// Exposure schema handed to the batch service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExposureSchema {
    pub theme: String,
    pub metrics: Vec<String>,
}

impl ExposureSchema {
    /// Derive a schema from a free-text query.
    ///
    /// The theme is the phrase after "on"/"about", upper-cased and joined with
    /// underscores: "analysis on AI innovation for ACC1" gives `AI_INNOVATION`.
    pub fn for_query(query: &str) -> Self {
        let theme = THEME_RE
            .captures(query)
            .and_then(|caps| caps.get(1))
            .map(|m| {
                m.as_str()
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|w| !w.is_empty())
                    .map(str::to_uppercase)
                    .collect::<Vec<_>>()
                    .join("_")
            })
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "GENERAL".to_string());

        Self {
            theme,
            metrics: vec!["patent_filings".to_string(), "r&d_spend".to_string()],
        }
    }
}

/// State threaded through the thematic analysis workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThematicState {
    pub portfolio_account: String,
    pub thematic_query: String,
    pub stocks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exposure_schema: Option<ExposureSchema>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_status: Option<JobStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_exposure_ref: Option<ExposureFrameRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimized_weights_ref: Option<OptimizationResultRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ThematicState {
    pub fn new(
        portfolio_account: impl Into<String>,
        thematic_query: impl Into<String>,
        stocks: Vec<String>,
    ) -> Self {
        Self {
            portfolio_account: portfolio_account.into(),
            thematic_query: thematic_query.into(),
            stocks,
            ..Self::default()
        }
    }
}

/// Fields a step may set. `None` leaves the current value untouched.
#[derive(Debug, Clone, Default)]
pub struct ThematicPatch {
    pub exposure_schema: Option<ExposureSchema>,
    pub batch_job_id: Option<String>,
    pub job_status: Option<JobStatus>,
    pub raw_exposure_ref: Option<ExposureFrameRef>,
    pub optimized_weights_ref: Option<OptimizationResultRef>,
    pub error: Option<String>,
}

impl WorkflowState for ThematicState {
    type Patch = ThematicPatch;

    fn apply(&mut self, patch: ThematicPatch) {
        if patch.exposure_schema.is_some() {
            self.exposure_schema = patch.exposure_schema;
        }
        if patch.batch_job_id.is_some() {
            self.batch_job_id = patch.batch_job_id;
        }
        if patch.job_status.is_some() {
            self.job_status = patch.job_status;
        }
        if patch.raw_exposure_ref.is_some() {
            self.raw_exposure_ref = patch.raw_exposure_ref;
        }
        if patch.optimized_weights_ref.is_some() {
            self.optimized_weights_ref = patch.optimized_weights_ref;
        }
        if patch.error.is_some() {
            self.error = patch.error;
        }
    }

    fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn set_error(&mut self, message: String) {
        self.error = Some(message);
    }
}

fn missing(step: &str, field: &str) -> WorkflowError {
    WorkflowError::MissingField {
        step: step.to_string(),
        field: field.to_string(),
    }
}

fn service_failed(step: &'static str) -> impl FnOnce(ServiceError) -> WorkflowError {
    move |source| WorkflowError::Service {
        step: step.to_string(),
        source,
    }
}

struct GenerateSchema;

#[async_trait]
impl Step<ThematicState> for GenerateSchema {
    async fn run(&self, state: &ThematicState) -> Result<ThematicPatch, WorkflowError> {
        Ok(ThematicPatch {
            exposure_schema: Some(ExposureSchema::for_query(&state.thematic_query)),
            ..Default::default()
        })
    }
}

struct StartBatch {
    batch: Arc<dyn BatchService>,
}

#[async_trait]
impl Step<ThematicState> for StartBatch {
    async fn run(&self, state: &ThematicState) -> Result<ThematicPatch, WorkflowError> {
        let schema = state
            .exposure_schema
            .as_ref()
            .ok_or_else(|| missing(START_BATCH, "exposure_schema"))?;
        if state.stocks.is_empty() {
            return Err(missing(START_BATCH, "stocks"));
        }
        let batch_job_id = self
            .batch
            .start_batch_job(&state.stocks, schema)
            .await
            .map_err(service_failed(START_BATCH))?;

        Ok(ThematicPatch {
            batch_job_id: Some(batch_job_id),
            job_status: Some(JobStatus::Pending),
            ..Default::default()
        })
    }
}

/// Single status check; pacing and the retry budget live on the graph edge.
struct MonitorBatch {
    batch: Arc<dyn BatchService>,
}

#[async_trait]
impl Step<ThematicState> for MonitorBatch {
    async fn run(&self, state: &ThematicState) -> Result<ThematicPatch, WorkflowError> {
        let batch_job_id = state
            .batch_job_id
            .as_deref()
            .ok_or_else(|| missing(MONITOR_BATCH, "batch_job_id"))?;
        let status = self
            .batch
            .check_batch_status(batch_job_id)
            .await
            .map_err(service_failed(MONITOR_BATCH))?;

        Ok(ThematicPatch {
            job_status: Some(status),
            ..Default::default()
        })
    }
}

struct GetResults {
    batch: Arc<dyn BatchService>,
}

#[async_trait]
impl Step<ThematicState> for GetResults {
    async fn run(&self, state: &ThematicState) -> Result<ThematicPatch, WorkflowError> {
        let batch_job_id = state
            .batch_job_id
            .as_deref()
            .ok_or_else(|| missing(GET_RESULTS, "batch_job_id"))?;
        let exposures = self
            .batch
            .fetch_batch_results(batch_job_id)
            .await
            .map_err(service_failed(GET_RESULTS))?;

        Ok(ThematicPatch {
            raw_exposure_ref: Some(exposures),
            ..Default::default()
        })
    }
}

struct Optimize {
    portfolio: Arc<dyn PortfolioService>,
}

#[async_trait]
impl Step<ThematicState> for Optimize {
    async fn run(&self, state: &ThematicState) -> Result<ThematicPatch, WorkflowError> {
        let exposures = state
            .raw_exposure_ref
            .as_ref()
            .ok_or_else(|| missing(OPTIMIZE, "raw_exposure_ref"))?;
        let optimized = self
            .portfolio
            .optimize(exposures, &state.portfolio_account)
            .await
            .map_err(service_failed(OPTIMIZE))?;

        Ok(ThematicPatch {
            optimized_weights_ref: Some(optimized),
            ..Default::default()
        })
    }
}

struct HandleError;

#[async_trait]
impl Step<ThematicState> for HandleError {
    async fn run(&self, state: &ThematicState) -> Result<ThematicPatch, WorkflowError> {
        if state.error.is_some() {
            return Ok(ThematicPatch::default());
        }
        let batch = state.batch_job_id.as_deref().unwrap_or("<none>");
        let status = state
            .job_status
            .map(|s| s.to_string())
            .unwrap_or_else(|| "UNKNOWN".to_string());
        Ok(ThematicPatch {
            error: Some(format!("batch job {batch} finished with status {status}")),
            ..Default::default()
        })
    }
}

/// Route after a status check.
fn after_monitor(state: &ThematicState) -> &'static str {
    match state.job_status {
        Some(JobStatus::Succeeded) => GET_RESULTS,
        Some(JobStatus::Failed) | Some(JobStatus::Cancelled) => HANDLE_ERROR,
        _ => MONITOR_BATCH,
    }
}

/// Assemble the thematic analysis graph.
pub fn build_workflow(
    batch: Arc<dyn BatchService>,
    portfolio: Arc<dyn PortfolioService>,
    polling: RetryPolicy,
) -> Result<Workflow<ThematicState>, WorkflowError> {
    Workflow::builder(WORKFLOW_NAME)
        .add_step(GENERATE_SCHEMA, GenerateSchema)
        .add_step(
            START_BATCH,
            StartBatch {
                batch: Arc::clone(&batch),
            },
        )
        .add_step(
            MONITOR_BATCH,
            MonitorBatch {
                batch: Arc::clone(&batch),
            },
        )
        .add_step(GET_RESULTS, GetResults { batch })
        .add_step(OPTIMIZE, Optimize { portfolio })
        .add_step(HANDLE_ERROR, HandleError)
        .set_entry(GENERATE_SCHEMA)
        .add_edge(GENERATE_SCHEMA, START_BATCH)
        .add_edge(START_BATCH, MONITOR_BATCH)
        .add_conditional_edge(MONITOR_BATCH, after_monitor)
        .add_edge(GET_RESULTS, OPTIMIZE)
        .add_edge(OPTIMIZE, END)
        .add_edge(HANDLE_ERROR, END)
        .retry_loop(MONITOR_BATCH, polling)
        .set_error_step(HANDLE_ERROR)
        .build()
}
