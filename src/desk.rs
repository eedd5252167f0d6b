//! The desk: the surface exposed to a transport layer.
//!
//! Owns one registry, one executor and one supervisor, wired together from an
//! [`AppConfig`] and the external collaborators in [`DeskDeps`].

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::agent::{
    IntentClassifier, JobCancelHandler, JobStatusHandler, KeywordClassifier, Supervisor,
    ThematicAnalysisHandler,
};
use crate::agent::conversation::Conversation;
use crate::config::AppConfig;
use crate::error::Result;
use crate::jobs::{JobRegistry, JobState, TaskType};
use crate::services::{BatchService, MockBatchService, MockPortfolioService, PortfolioService};
use crate::worker::TaskExecutor;
use crate::workflow::thematic::build_workflow;

/// External collaborators of the desk.
pub struct DeskDeps {
    pub portfolio: Arc<dyn PortfolioService>,
    pub batch: Arc<dyn BatchService>,
    pub classifier: Arc<dyn IntentClassifier>,
}

impl DeskDeps {
    /// In-memory services and the keyword classifier.
    pub fn mocks() -> Self {
        Self {
            portfolio: Arc::new(MockPortfolioService::new()),
            batch: Arc::new(MockBatchService::new()),
            classifier: Arc::new(KeywordClassifier::new()),
        }
    }
}

pub struct Desk {
    registry: Arc<JobRegistry>,
    executor: Arc<TaskExecutor>,
    supervisor: Supervisor,
    analysis: Arc<ThematicAnalysisHandler>,
}

impl Desk {
    pub fn new(config: AppConfig, deps: DeskDeps) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(JobRegistry::new(&config.registry));
        let executor = Arc::new(TaskExecutor::new(
            Arc::clone(&registry),
            config.executor.clone(),
        ));
        let workflow = Arc::new(build_workflow(
            deps.batch,
            Arc::clone(&deps.portfolio),
            config.polling.clone(),
        )?);

        let analysis = Arc::new(ThematicAnalysisHandler::new(
            Arc::clone(&registry),
            Arc::clone(&executor),
            workflow,
            deps.portfolio,
            config.analysis.clone(),
        ));
        let supervisor = Supervisor::new(deps.classifier, config.supervisor.clone())
            .with_handler(analysis.clone())
            .with_handler(Arc::new(JobStatusHandler::new(Arc::clone(&registry))))
            .with_handler(Arc::new(JobCancelHandler::new(Arc::clone(&executor))));

        tracing::info!(
            capacity = registry.capacity(),
            handlers = ?supervisor.handler_names(),
            "Desk ready"
        );

        Ok(Self {
            registry,
            executor,
            supervisor,
            analysis,
        })
    }

    /// Desk backed by [`DeskDeps::mocks`].
    pub fn with_mocks(config: AppConfig) -> Result<Self> {
        Self::new(config, DeskDeps::mocks())
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Register a job without running anything for it.
    pub async fn create_job(&self, task_type: TaskType, metadata: Map<String, Value>) -> String {
        self.registry.create(task_type, metadata).await
    }

    /// `None` for unknown or evicted ids.
    pub async fn get_job_status(&self, job_id: &str) -> Option<JobState> {
        self.registry.get(job_id).await
    }

    /// Process one utterance on a thread and return the reply.
    pub async fn submit_conversation_turn(&self, thread_id: &str, utterance: &str) -> String {
        self.supervisor.submit_turn(thread_id, utterance).await
    }

    /// Start a thematic analysis for an explicit stock universe.
    pub async fn start_analysis(
        &self,
        account: &str,
        query: &str,
        stocks: Vec<String>,
    ) -> Result<String> {
        self.analysis.launch(account, query, stocks).await
    }

    /// Request cancellation; `false` if the job is not running.
    pub async fn cancel_job(&self, job_id: &str) -> bool {
        self.executor.cancel(job_id).await
    }

    pub async fn conversation(&self, thread_id: &str) -> Option<Conversation> {
        self.supervisor.conversation(thread_id).await
    }

    /// Jobs that have been submitted and have not finished yet.
    pub async fn active_jobs(&self) -> usize {
        self.executor.running_count().await
    }

    /// Cancel outstanding jobs and stop the executor.
    pub async fn shutdown(&self) {
        self.executor.shutdown().await;
    }
}
