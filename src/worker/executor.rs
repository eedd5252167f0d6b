//! Task executor: runs workflows in the background and reports progress.
//!
//! `submit` returns as soon as the job is tracked. A spawned task waits for a
//! concurrency permit, marks the job RUNNING and drives the workflow's step
//! stream, writing a progress estimate into the registry after every step.
//! Completion, failure, panics and cancellation all end up as a terminal
//! status in the [`JobRegistry`]; nothing is reported back to the submitter.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use serde::Serialize;
use tokio::sync::{Notify, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{ExecutorConfig, ProgressConfig};
use crate::error::JobError;
use crate::jobs::{JobRegistry, JobStatus, JobUpdate};
use crate::workflow::graph::{Workflow, WorkflowState};

/// Cooperative cancellation signal shared between the executor and one job.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once [`cancel`](Self::cancel) has been called.
    pub async fn cancelled(&self) {
        let notified = self.inner.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

struct TrackedJob {
    handle: JoinHandle<()>,
    cancel: CancelFlag,
}

type Tracked = Arc<RwLock<HashMap<String, TrackedJob>>>;

/// Runs submitted workflows off the caller's task.
pub struct TaskExecutor {
    registry: Arc<JobRegistry>,
    config: ExecutorConfig,
    permits: Arc<Semaphore>,
    jobs: Tracked,
}

impl TaskExecutor {
    pub fn new(registry: Arc<JobRegistry>, config: ExecutorConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));
        Self {
            registry,
            config,
            permits,
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Schedule `workflow` for `job_id` and return immediately.
    ///
    /// The job stays PENDING until a concurrency permit is free. Its final
    /// state is serialized into the job's `result` on success.
    pub async fn submit<S>(&self, workflow: Arc<Workflow<S>>, job_id: impl Into<String>, initial: S)
    where
        S: WorkflowState + Serialize,
    {
        let job_id = job_id.into();
        let cancel = CancelFlag::new();
        let run = JobRun {
            registry: Arc::clone(&self.registry),
            progress: self.config.progress,
            cancel: cancel.clone(),
            job_id: job_id.clone(),
        };
        let permits = Arc::clone(&self.permits);
        let tracked = Arc::clone(&self.jobs);
        let workflow_name = workflow.name().to_string();

        // Hold the write lock across the spawn so the task cannot deregister
        // itself before it has been registered.
        let mut jobs = self.jobs.write().await;
        let handle = tokio::spawn(async move {
            // A queued job must react to cancellation without waiting for a permit.
            let permit = tokio::select! {
                biased;
                _ = run.cancel.cancelled() => None,
                permit = permits.acquire_owned() => Some(permit),
            };
            match permit {
                None => run.mark_cancelled(0).await,
                Some(Ok(_permit)) => {
                    let outcome = AssertUnwindSafe(run.execute(workflow, initial))
                        .catch_unwind()
                        .await;
                    if let Err(panic) = outcome {
                        run.fail(panic_message(panic.as_ref())).await;
                    }
                }
                Some(Err(_)) => {
                    let reason = JobError::ExecutorClosed {
                        id: run.job_id.clone(),
                    };
                    tracing::warn!(job_id = %run.job_id, "Executor closed before job started");
                    run.record(
                        JobUpdate::new()
                            .status(JobStatus::Cancelled)
                            .error(reason.to_string()),
                    )
                    .await;
                }
            }
            tracked.write().await.remove(&run.job_id);
        });
        jobs.insert(job_id.clone(), TrackedJob { handle, cancel });
        drop(jobs);

        tracing::info!(job_id = %job_id, workflow = %workflow_name, "Job submitted");
    }

    /// Request cancellation of a tracked job.
    ///
    /// Returns `false` if the job is unknown or has already reached a
    /// terminal status, even if its task has not been untracked yet.
    pub async fn cancel(&self, job_id: &str) -> bool {
        let flag = match self.jobs.read().await.get(job_id) {
            Some(tracked) if !tracked.handle.is_finished() => tracked.cancel.clone(),
            _ => return false,
        };
        let settled = self
            .registry
            .get(job_id)
            .await
            .is_none_or(|job| job.status.is_terminal());
        if settled {
            tracing::debug!(job_id = %job_id, "Cancel ignored, job already settled");
            return false;
        }
        flag.cancel();
        tracing::info!(job_id = %job_id, "Cancellation requested");
        true
    }

    /// Number of jobs submitted but not yet finished, queued ones included.
    pub async fn running_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Cancel every job, stop accepting work and wait for jobs to wind down.
    ///
    /// Jobs still running after the grace period are aborted and marked
    /// CANCELLED.
    pub async fn shutdown(&self) {
        let flags: Vec<CancelFlag> = self
            .jobs
            .read()
            .await
            .values()
            .map(|t| t.cancel.clone())
            .collect();
        for flag in &flags {
            flag.cancel();
        }
        self.permits.close();

        let deadline = Instant::now() + self.config.shutdown_grace;
        while !self.jobs.read().await.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let leftover: Vec<(String, TrackedJob)> = self.jobs.write().await.drain().collect();
        for (job_id, tracked) in leftover {
            tracked.handle.abort();
            self.registry
                .update(
                    &job_id,
                    JobUpdate::new()
                        .status(JobStatus::Cancelled)
                        .error("Executor shut down before the job finished"),
                )
                .await;
            tracing::warn!(job_id = %job_id, "Aborted job at shutdown");
        }
        tracing::info!(cancelled = flags.len(), "Executor shut down");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic".to_string()
    }
}

/// Everything a background run needs to report on its job.
struct JobRun {
    registry: Arc<JobRegistry>,
    progress: ProgressConfig,
    cancel: CancelFlag,
    job_id: String,
}

impl JobRun {
    async fn record(&self, update: JobUpdate) {
        if !self.registry.update(&self.job_id, update).await {
            tracing::debug!(job_id = %self.job_id, "Job update dropped");
        }
    }

    async fn fail(&self, reason: impl std::fmt::Display) {
        let message = format!("Critical failure in job {}: {reason}", self.job_id);
        tracing::error!(job_id = %self.job_id, error = %message, "Job failed");
        self.record(
            JobUpdate::new()
                .status(JobStatus::Failed)
                .progress(1.0)
                .error(message),
        )
        .await;
    }

    async fn mark_cancelled(&self, steps_completed: usize) {
        tracing::info!(job_id = %self.job_id, steps_completed, "Job cancelled");
        self.record(JobUpdate::new().status(JobStatus::Cancelled)).await;
    }

    async fn execute<S>(&self, workflow: Arc<Workflow<S>>, initial: S)
    where
        S: WorkflowState + Serialize,
    {
        if self.cancel.is_cancelled() {
            self.mark_cancelled(0).await;
            return;
        }

        self.record(
            JobUpdate::new()
                .status(JobStatus::Running)
                .progress(self.progress.baseline),
        )
        .await;
        tracing::info!(job_id = %self.job_id, workflow = %workflow.name(), "Job running");

        let mut steps = workflow.stream(initial.clone());
        let mut last = initial;
        let mut completed = 0usize;

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    self.mark_cancelled(completed).await;
                    return;
                }
                event = steps.next() => event,
            };
            let Some(event) = event else {
                break;
            };
            match event {
                Ok(event) => {
                    completed += 1;
                    last = event.state;
                    let progress = self.progress.after(completed);
                    self.record(JobUpdate::new().progress(progress)).await;
                    tracing::debug!(
                        job_id = %self.job_id,
                        step = event.step,
                        progress,
                        "Job progress"
                    );
                }
                Err(e) => {
                    self.fail(e).await;
                    return;
                }
            }
        }

        if let Some(error) = last.error() {
            tracing::warn!(job_id = %self.job_id, error, "Workflow finished with error");
            let error = error.to_string();
            self.record(
                JobUpdate::new()
                    .status(JobStatus::Failed)
                    .progress(1.0)
                    .error(error),
            )
            .await;
            return;
        }

        match serde_json::to_value(&last) {
            Ok(result) => {
                self.record(
                    JobUpdate::new()
                        .status(JobStatus::Succeeded)
                        .progress(1.0)
                        .result(result),
                )
                .await;
                tracing::info!(job_id = %self.job_id, steps = completed, "Job succeeded");
            }
            Err(e) => self.fail(format!("result could not be serialized: {e}")).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde::Serialize;
    use serde_json::Map;

    use super::*;
    use crate::error::WorkflowError;
    use crate::jobs::TaskType;
    use crate::workflow::graph::{END, Step};

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Debug, Clone, Default, Serialize)]
    struct Tally {
        count: u32,
        error: Option<String>,
    }

    impl WorkflowState for Tally {
        type Patch = (u32, Option<String>);

        fn apply(&mut self, (add, error): (u32, Option<String>)) {
            self.count += add;
            if error.is_some() {
                self.error = error;
            }
        }

        fn error(&self) -> Option<&str> {
            self.error.as_deref()
        }

        fn set_error(&mut self, message: String) {
            self.error = Some(message);
        }
    }

    struct Bump;

    #[async_trait]
    impl Step<Tally> for Bump {
        async fn run(&self, _state: &Tally) -> Result<(u32, Option<String>), WorkflowError> {
            Ok((1, None))
        }
    }

    struct Slow(Duration);

    #[async_trait]
    impl Step<Tally> for Slow {
        async fn run(&self, _state: &Tally) -> Result<(u32, Option<String>), WorkflowError> {
            tokio::time::sleep(self.0).await;
            Ok((1, None))
        }
    }

    struct Mark;

    #[async_trait]
    impl Step<Tally> for Mark {
        async fn run(&self, _state: &Tally) -> Result<(u32, Option<String>), WorkflowError> {
            Ok((0, Some("external failure".into())))
        }
    }

    struct Boom;

    #[async_trait]
    impl Step<Tally> for Boom {
        async fn run(&self, _state: &Tally) -> Result<(u32, Option<String>), WorkflowError> {
            panic!("step exploded");
        }
    }

    struct Broken;

    #[async_trait]
    impl Step<Tally> for Broken {
        async fn run(&self, _state: &Tally) -> Result<(u32, Option<String>), WorkflowError> {
            Err(WorkflowError::MissingField {
                step: "broken".into(),
                field: "input".into(),
            })
        }
    }

    fn two_steps<A, B>(a: A, b: B) -> Arc<Workflow<Tally>>
    where
        A: Step<Tally> + 'static,
        B: Step<Tally> + 'static,
    {
        Arc::new(
            Workflow::builder("test")
                .add_step("a", a)
                .add_step("b", b)
                .set_entry("a")
                .add_edge("a", "b")
                .add_edge("b", END)
                .build()
                .unwrap(),
        )
    }

    fn executor(max_concurrent_jobs: usize) -> TaskExecutor {
        let config = ExecutorConfig {
            max_concurrent_jobs,
            shutdown_grace: Duration::from_millis(200),
            ..ExecutorConfig::default()
        };
        TaskExecutor::new(Arc::new(JobRegistry::with_capacity(100)), config)
    }

    async fn wait_terminal(registry: &JobRegistry, job_id: &str) -> crate::jobs::JobState {
        tokio::time::timeout(WAIT, async {
            loop {
                if let Some(job) = registry.get(job_id).await
                    && job.status.is_terminal()
                {
                    return job;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job did not finish in time")
    }

    async fn wait_running(executor: &TaskExecutor, job_id: &str) {
        tokio::time::timeout(WAIT, async {
            while executor.registry().get(job_id).await.unwrap().status != JobStatus::Running {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("job was not picked up in time");
    }

    async fn new_job(executor: &TaskExecutor) -> String {
        executor
            .registry()
            .create(TaskType::ThematicAnalysis, Map::new())
            .await
    }

    #[tokio::test]
    async fn successful_run_stores_final_state() {
        let executor = executor(4);
        let job_id = new_job(&executor).await;
        executor.submit(two_steps(Bump, Bump), &job_id, Tally::default()).await;

        let job = wait_terminal(executor.registry(), &job_id).await;
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.progress, 1.0);
        assert_eq!(job.result.unwrap()["count"], 2);
    }

    #[tokio::test]
    async fn error_marker_fails_the_job() {
        let executor = executor(4);
        let job_id = new_job(&executor).await;
        executor.submit(two_steps(Bump, Mark), &job_id, Tally::default()).await;

        let job = wait_terminal(executor.registry(), &job_id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.progress, 1.0);
        assert_eq!(job.error.as_deref(), Some("external failure"));
    }

    #[tokio::test]
    async fn step_error_is_reported_with_job_id() {
        let executor = executor(4);
        let job_id = new_job(&executor).await;
        executor.submit(two_steps(Bump, Broken), &job_id, Tally::default()).await;

        let job = wait_terminal(executor.registry(), &job_id).await;
        assert_eq!(job.status, JobStatus::Failed);
        let error = job.error.unwrap();
        assert!(error.starts_with(&format!("Critical failure in job {job_id}")), "{error}");
    }

    #[tokio::test]
    async fn panic_is_caught() {
        let executor = executor(4);
        let job_id = new_job(&executor).await;
        executor.submit(two_steps(Bump, Boom), &job_id, Tally::default()).await;

        let job = wait_terminal(executor.registry(), &job_id).await;
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().contains("step exploded"));
    }

    #[tokio::test]
    async fn cancel_interrupts_a_running_job() {
        let executor = executor(4);
        let job_id = new_job(&executor).await;
        executor
            .submit(
                two_steps(Bump, Slow(Duration::from_secs(30))),
                &job_id,
                Tally::default(),
            )
            .await;

        wait_running(&executor, &job_id).await;

        assert!(executor.cancel(&job_id).await);
        let job = wait_terminal(executor.registry(), &job_id).await;
        assert_eq!(job.status, JobStatus::Cancelled);
        assert!(job.progress < 1.0);
    }

    #[tokio::test]
    async fn queued_job_waits_for_a_permit() {
        let executor = executor(1);
        let first = new_job(&executor).await;
        let second = new_job(&executor).await;
        executor
            .submit(two_steps(Bump, Slow(Duration::from_secs(30))), &first, Tally::default())
            .await;
        executor.submit(two_steps(Bump, Bump), &second, Tally::default()).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(
            executor.registry().get(&second).await.unwrap().status,
            JobStatus::Pending
        );

        // The queued job is cancelled while the first one still holds the only permit.
        assert!(executor.cancel(&second).await);
        let job = wait_terminal(executor.registry(), &second).await;
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.progress, 0.0);
        assert_eq!(
            executor.registry().get(&first).await.unwrap().status,
            JobStatus::Running
        );
    }

    #[tokio::test]
    async fn settled_job_is_not_cancellable() {
        let executor = executor(1);
        let job_id = new_job(&executor).await;
        executor
            .submit(two_steps(Slow(Duration::from_secs(30)), Bump), &job_id, Tally::default())
            .await;
        wait_running(&executor, &job_id).await;

        // Terminal status written while the task is still tracked.
        executor
            .registry()
            .update(&job_id, JobUpdate::new().status(JobStatus::Succeeded))
            .await;
        assert!(!executor.cancel(&job_id).await);
        assert_eq!(
            executor.registry().get(&job_id).await.unwrap().status,
            JobStatus::Succeeded
        );
    }

    #[tokio::test]
    async fn cancel_unknown_job_is_false() {
        let executor = executor(1);
        assert!(!executor.cancel("job_000000000000").await);
    }

    #[tokio::test]
    async fn finished_jobs_are_untracked() {
        let executor = executor(2);
        let job_id = new_job(&executor).await;
        executor.submit(two_steps(Bump, Bump), &job_id, Tally::default()).await;
        wait_terminal(executor.registry(), &job_id).await;

        tokio::time::timeout(WAIT, async {
            while executor.running_count().await > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!executor.cancel(&job_id).await);
    }

    #[tokio::test]
    async fn shutdown_cancels_outstanding_jobs() {
        let executor = executor(2);
        let job_id = new_job(&executor).await;
        executor
            .submit(two_steps(Slow(Duration::from_secs(30)), Bump), &job_id, Tally::default())
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        executor.shutdown().await;
        assert_eq!(executor.running_count().await, 0);
        let job = executor.registry().get(&job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
    }
}
