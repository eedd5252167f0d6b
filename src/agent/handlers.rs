//! Specialist handlers.
//!
//! A handler fulfils one kind of delegated request and always answers with
//! text: validation problems, unknown jobs and service failures become part of
//! the reply instead of errors.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Map, Value};

use crate::artifacts::OptimizationResultRef;
use crate::config::AnalysisConfig;
use crate::error::{Error, JobError};
use crate::jobs::{JOB_ID_PREFIX, JobRegistry, JobState, TaskType};
use crate::services::PortfolioService;
use crate::worker::TaskExecutor;
use crate::workflow::graph::Workflow;
use crate::workflow::thematic::ThematicState;

pub const ANALYSIS_HANDLER: &str = "thematic_analysis";
pub const STATUS_HANDLER: &str = "job_status";
pub const CANCEL_HANDLER: &str = "job_cancel";

const PROGRESS_CELLS: usize = 10;

// Keyword, a separator, optional filler words, then the candidate token.
static ACCOUNT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\b(?:account|acct)\b(?:\s*[:#]\s*|\s+)(?:(?:is|number|no|id)\b[.:#]?\s*)*([A-Za-z0-9_]+)",
    )
    .expect("valid account regex")
});

/// Text reply of a handler, plus the job it created, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerReply {
    pub content: String,
    pub job_id: Option<String>,
}

impl HandlerReply {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            job_id: None,
        }
    }
}

#[async_trait]
pub trait SpecialistHandler: Send + Sync {
    /// Name the classifier delegates to.
    fn name(&self) -> &'static str;

    async fn handle(&self, task: &str) -> HandlerReply;
}

/// First whitespace-delimited token that looks like a job id.
///
/// Surrounding punctuation is ignored, so "`job_ab12`?" yields `job_ab12`.
pub fn extract_job_id(text: &str) -> Option<String> {
    text.split_whitespace()
        .map(|token| {
            token.trim_matches(|c: char| {
                matches!(
                    c,
                    '`' | '?' | '.' | ',' | '!' | ';' | ':' | '"' | '\'' | '(' | ')' | '[' | ']'
                )
            })
        })
        .find(|token| token.starts_with(JOB_ID_PREFIX) && token.len() > JOB_ID_PREFIX.len())
        .map(str::to_string)
}

/// Account named in the text as `account <ID>` or `acct <ID>`.
///
/// Only tokens containing a digit or `_` count as ids, so ordinary words
/// after the keyword are skipped.
pub fn extract_account(text: &str) -> Option<String> {
    ACCOUNT_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| m.as_str())
        .find(|token| token.chars().any(|c| c.is_ascii_digit() || c == '_'))
        .map(str::to_string)
}

fn not_found(job_id: &str) -> String {
    format!("❌ Job `{job_id}` not found. It may never have existed or may have expired.")
}

const NO_JOB_ID: &str = "❌ Job not found: the request does not mention a job id (e.g. `job_1a2b3c4d5e6f`).";

/// Starts thematic analysis jobs.
pub struct ThematicAnalysisHandler {
    registry: Arc<JobRegistry>,
    executor: Arc<TaskExecutor>,
    workflow: Arc<Workflow<ThematicState>>,
    portfolio: Arc<dyn PortfolioService>,
    config: AnalysisConfig,
}

impl ThematicAnalysisHandler {
    pub fn new(
        registry: Arc<JobRegistry>,
        executor: Arc<TaskExecutor>,
        workflow: Arc<Workflow<ThematicState>>,
        portfolio: Arc<dyn PortfolioService>,
        config: AnalysisConfig,
    ) -> Self {
        Self {
            registry,
            executor,
            workflow,
            portfolio,
            config,
        }
    }

    /// Validate the account, create a job and submit the workflow.
    ///
    /// Returns the job id as soon as the job is queued.
    pub async fn launch(
        &self,
        account: &str,
        query: &str,
        stocks: Vec<String>,
    ) -> Result<String, Error> {
        let account = account.trim().to_uppercase();
        if stocks.is_empty() {
            return Err(JobError::EmptyUniverse { account }.into());
        }
        if !self.portfolio.validate_account(&account).await? {
            return Err(JobError::InvalidAccount { account }.into());
        }

        let mut metadata = Map::new();
        metadata.insert("account".to_string(), Value::from(account.as_str()));
        metadata.insert("query".to_string(), Value::from(query));
        metadata.insert("stocks".to_string(), Value::from(stocks.clone()));
        let job_id = self
            .registry
            .create(TaskType::ThematicAnalysis, metadata)
            .await;

        let initial = ThematicState::new(account.as_str(), query, stocks);
        self.executor
            .submit(Arc::clone(&self.workflow), job_id.as_str(), initial)
            .await;

        tracing::info!(job_id = %job_id, account = %account, "Thematic analysis started");
        Ok(job_id)
    }
}

#[async_trait]
impl SpecialistHandler for ThematicAnalysisHandler {
    fn name(&self) -> &'static str {
        ANALYSIS_HANDLER
    }

    async fn handle(&self, task: &str) -> HandlerReply {
        let account = extract_account(task).unwrap_or_else(|| self.config.default_account.clone());
        match self
            .launch(&account, task, self.config.default_stocks.clone())
            .await
        {
            Ok(job_id) => HandlerReply {
                content: format!(
                    "✅ **Thematic Analysis Started**\n**Job ID:** `{job_id}`\nUse 'status of {job_id}' to check progress."
                ),
                job_id: Some(job_id),
            },
            Err(Error::Job(JobError::InvalidAccount { account })) => {
                HandlerReply::text(format!("❌ Invalid account: {account}"))
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not start thematic analysis");
                HandlerReply::text(format!("❌ Could not start the analysis: {e}"))
            }
        }
    }
}

/// Reports job status.
pub struct JobStatusHandler {
    registry: Arc<JobRegistry>,
}

impl JobStatusHandler {
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl SpecialistHandler for JobStatusHandler {
    fn name(&self) -> &'static str {
        STATUS_HANDLER
    }

    async fn handle(&self, task: &str) -> HandlerReply {
        let Some(job_id) = extract_job_id(task) else {
            return HandlerReply::text(NO_JOB_ID);
        };
        match self.registry.get(&job_id).await {
            Some(job) => HandlerReply::text(render_status(&job)),
            None => HandlerReply::text(not_found(&job_id)),
        }
    }
}

/// `[████░░░░░░] 40%`
fn progress_bar(progress: f64) -> String {
    let progress = progress.clamp(0.0, 1.0);
    let filled = ((progress * PROGRESS_CELLS as f64).floor() as usize).min(PROGRESS_CELLS);
    format!(
        "[{}{}] {:.0}%",
        "█".repeat(filled),
        "░".repeat(PROGRESS_CELLS - filled),
        progress * 100.0
    )
}

/// `TICKER: weight` pairs from the optimization preview in a job result.
fn results_preview(result: &Value) -> Option<String> {
    let optimized = result.get("optimized_weights_ref")?;
    let optimized: OptimizationResultRef = serde_json::from_value(optimized.clone()).ok()?;
    if optimized.preview().is_empty() {
        return None;
    }
    Some(optimized.preview_line())
}

/// Human-readable status report.
pub fn render_status(job: &JobState) -> String {
    let mut lines = vec![
        format!("{} **Job `{}`**", job.status.emoji(), job.job_id),
        format!("**Status:** {}", job.status),
        format!("**Progress:** {}", progress_bar(job.progress)),
    ];
    if let Some(error) = &job.error {
        lines.push(format!("**Error:** {error}"));
    }
    if let Some(preview) = job.result.as_ref().and_then(results_preview) {
        lines.push(format!("**Results:** {preview}"));
    }
    lines.join("\n")
}

/// Cancels running jobs.
pub struct JobCancelHandler {
    executor: Arc<TaskExecutor>,
}

impl JobCancelHandler {
    pub fn new(executor: Arc<TaskExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl SpecialistHandler for JobCancelHandler {
    fn name(&self) -> &'static str {
        CANCEL_HANDLER
    }

    async fn handle(&self, task: &str) -> HandlerReply {
        let Some(job_id) = extract_job_id(task) else {
            return HandlerReply::text(NO_JOB_ID);
        };
        if self.executor.cancel(&job_id).await {
            return HandlerReply::text(format!("⛔ Cancellation requested for job `{job_id}`."));
        }
        match self.executor.registry().get(&job_id).await {
            Some(job) => HandlerReply::text(format!(
                "Job `{job_id}` is not running (status {}).",
                job.status
            )),
            None => HandlerReply::text(not_found(&job_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use rust_decimal_macros::dec;
    use serde_json::json;

    use super::*;
    use crate::artifacts::ArtifactRef;
    use crate::config::ExecutorConfig;
    use crate::jobs::{JobStatus, JobUpdate};
    use crate::services::{MockBatchService, MockPortfolioService};
    use crate::error::WorkflowError;
    use crate::workflow::graph::{END, Step, WorkflowState};
    use crate::workflow::retry::RetryPolicy;
    use crate::workflow::thematic::build_workflow;

    #[derive(Debug, Clone, Default, serde::Serialize)]
    struct Idle {
        error: Option<String>,
    }

    impl WorkflowState for Idle {
        type Patch = ();

        fn apply(&mut self, _patch: ()) {}

        fn error(&self) -> Option<&str> {
            self.error.as_deref()
        }

        fn set_error(&mut self, message: String) {
            self.error = Some(message);
        }
    }

    /// Never finishes on its own.
    struct Stall;

    #[async_trait]
    impl Step<Idle> for Stall {
        async fn run(&self, _state: &Idle) -> Result<(), WorkflowError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
    }

    fn analysis_handler() -> (ThematicAnalysisHandler, Arc<JobRegistry>) {
        let registry = Arc::new(JobRegistry::with_capacity(100));
        let executor = Arc::new(TaskExecutor::new(
            Arc::clone(&registry),
            ExecutorConfig::default(),
        ));
        let portfolio: Arc<dyn PortfolioService> =
            Arc::new(MockPortfolioService::new().with_latency(Duration::ZERO));
        let workflow = build_workflow(
            Arc::new(MockBatchService::new()),
            Arc::clone(&portfolio),
            RetryPolicy::fixed(Duration::from_millis(1), 10),
        )
        .unwrap();
        let handler = ThematicAnalysisHandler::new(
            Arc::clone(&registry),
            executor,
            Arc::new(workflow),
            portfolio,
            AnalysisConfig::default(),
        );
        (handler, registry)
    }

    #[test]
    fn job_id_extraction_trims_punctuation() {
        assert_eq!(
            extract_job_id("status of `job_1a2b3c4d5e6f`?").as_deref(),
            Some("job_1a2b3c4d5e6f")
        );
        assert_eq!(extract_job_id("check job_abc123").as_deref(), Some("job_abc123"));
        assert_eq!(extract_job_id("how is my job going"), None);
        assert_eq!(extract_job_id("job_ alone"), None);
    }

    #[test]
    fn account_extraction() {
        assert_eq!(
            extract_account("analysis on AI for account demo_001").as_deref(),
            Some("demo_001")
        );
        assert_eq!(extract_account("acct: ACC12345 please").as_deref(), Some("ACC12345"));
        assert_eq!(extract_account("thematic analysis on AI"), None);
    }

    #[test]
    fn account_extraction_ignores_words_around_the_keyword() {
        assert_eq!(
            extract_account("my account is ACC12345").as_deref(),
            Some("ACC12345")
        );
        assert_eq!(
            extract_account("account number 77 for AI").as_deref(),
            Some("77")
        );
        assert_eq!(extract_account("thematic analysis on accounting standards"), None);
        assert_eq!(extract_account("analyze AI for all accounts"), None);
        assert_eq!(extract_account("account holder analysis"), None);
    }

    #[tokio::test]
    async fn accounting_theme_uses_default_account() {
        let (handler, registry) = analysis_handler();
        let reply = handler
            .handle("thematic analysis on accounting standards")
            .await;
        let job_id = reply.job_id.expect("job created");
        let job = registry.get(&job_id).await.unwrap();
        assert_eq!(
            job.metadata["account"],
            AnalysisConfig::default().default_account.to_uppercase()
        );
    }

    #[tokio::test]
    async fn cancel_of_settled_job_reports_status() {
        let registry = Arc::new(JobRegistry::with_capacity(10));
        let executor = Arc::new(TaskExecutor::new(
            Arc::clone(&registry),
            ExecutorConfig::default(),
        ));
        let job_id = registry.create(TaskType::ThematicAnalysis, Map::new()).await;
        let workflow = Arc::new(
            Workflow::builder("stall")
                .add_step("stall", Stall)
                .set_entry("stall")
                .add_edge("stall", END)
                .build()
                .unwrap(),
        );
        executor.submit(workflow, job_id.as_str(), Idle::default()).await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.get(&job_id).await.unwrap().status != JobStatus::Running {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        registry
            .update(&job_id, JobUpdate::new().status(JobStatus::Failed).error("upstream"))
            .await;

        let handler = JobCancelHandler::new(executor);
        let reply = handler.handle(&format!("cancel {job_id}")).await;
        assert_eq!(
            reply.content,
            format!("Job `{job_id}` is not running (status FAILED).")
        );
    }

    #[test]
    fn progress_bar_rounds_down_cells() {
        assert_eq!(progress_bar(0.0), "[░░░░░░░░░░] 0%");
        assert_eq!(progress_bar(0.45), "[████░░░░░░] 45%");
        assert_eq!(progress_bar(1.0), "[██████████] 100%");
    }

    #[test]
    fn report_includes_error_and_preview() {
        let mut job = JobState::new("job_1".to_string(), TaskType::ThematicAnalysis, Map::new());
        job.apply(
            JobUpdate::new()
                .status(JobStatus::Running)
                .progress(0.4),
        );
        let artifact = ArtifactRef::new("s3://results/opt.parquet", "hash").unwrap();
        let optimized = OptimizationResultRef::new(
            artifact,
            BTreeMap::from([("AAPL".to_string(), dec!(0.5)), ("GOOG".to_string(), dec!(0.5))]),
        );
        job.apply(
            JobUpdate::new()
                .status(JobStatus::Succeeded)
                .progress(1.0)
                .result(json!({ "optimized_weights_ref": optimized })),
        );
        let report = render_status(&job);
        assert!(report.starts_with("✅ **Job `job_1`**"));
        assert!(report.contains("**Status:** SUCCEEDED"));
        assert!(report.contains("[██████████] 100%"));
        assert!(report.contains("**Results:** AAPL: 0.5, GOOG: 0.5"), "{report}");

        let mut failed = JobState::new("job_2".to_string(), TaskType::ThematicAnalysis, Map::new());
        failed.apply(JobUpdate::new().status(JobStatus::Failed).error("boom"));
        let report = render_status(&failed);
        assert!(report.starts_with("❌"));
        assert!(report.contains("**Error:** boom"));
        assert!(!report.contains("Results"));
    }

    #[tokio::test]
    async fn status_of_unknown_job_is_not_found() {
        let handler = JobStatusHandler::new(Arc::new(JobRegistry::with_capacity(10)));
        let reply = handler.handle("check job_abc123").await;
        assert!(reply.content.contains("not found"));
        assert!(reply.content.contains("job_abc123"));

        let reply = handler.handle("check my job").await;
        assert!(reply.content.contains("not found"));
    }

    #[tokio::test]
    async fn invalid_account_creates_no_job() {
        let (handler, registry) = analysis_handler();
        let reply = handler
            .handle("thematic analysis on AI for account ACC99999")
            .await;
        assert_eq!(reply.content, "❌ Invalid account: ACC99999");
        assert!(reply.job_id.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn valid_request_returns_job_id() {
        let (handler, registry) = analysis_handler();
        let reply = handler
            .handle("thematic analysis on AI innovation for account acc12345")
            .await;
        let job_id = reply.job_id.expect("job created");
        assert!(reply.content.contains("Thematic Analysis Started"));
        assert!(reply.content.contains(&format!("status of {job_id}")));

        let job = registry.get(&job_id).await.unwrap();
        assert_eq!(job.metadata["account"], "ACC12345");
    }

    #[tokio::test]
    async fn empty_universe_is_rejected() {
        let (handler, registry) = analysis_handler();
        let result = handler.launch("ACC12345", "analysis", Vec::new()).await;
        assert!(matches!(
            result,
            Err(Error::Job(JobError::EmptyUniverse { .. }))
        ));
        assert!(registry.is_empty().await);
    }
}
