//! Job registry: bounded, thread-safe store of job state.

use std::collections::HashMap;

use serde_json::{Map, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::config::RegistryConfig;
use crate::jobs::state::{JobState, JobUpdate, TaskType};

/// Prefix carried by every job id.
pub const JOB_ID_PREFIX: &str = "job_";

/// Generate a job id: `job_` followed by 12 lowercase hex characters.
pub fn new_job_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{JOB_ID_PREFIX}{}", &hex[..12])
}

struct Tracked {
    state: JobState,
    /// Registry-local mutation stamp; higher is more recent.
    revision: u64,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, Tracked>,
    clock: u64,
}

impl Inner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Keep the `capacity` most recently updated jobs.
    fn evict(&mut self, capacity: usize) -> usize {
        if self.jobs.len() <= capacity {
            return 0;
        }
        let mut by_recency: Vec<(u64, String)> = self
            .jobs
            .iter()
            .map(|(id, tracked)| (tracked.revision, id.clone()))
            .collect();
        by_recency.sort_unstable_by(|a, b| b.0.cmp(&a.0));

        let stale: Vec<String> = by_recency
            .into_iter()
            .skip(capacity)
            .map(|(_, id)| id)
            .collect();
        for id in &stale {
            self.jobs.remove(id);
        }
        stale.len()
    }
}

/// In-memory job store bounded by a recency-based eviction policy.
///
/// One writer at a time; readers share the lock. Looking up an evicted id
/// returns `None`, which callers treat like any other unknown job.
pub struct JobRegistry {
    inner: RwLock<Inner>,
    capacity: usize,
}

impl JobRegistry {
    /// Create a registry with the given configuration.
    pub fn new(config: &RegistryConfig) -> Self {
        Self::with_capacity(config.capacity)
    }

    /// Create a registry retaining at most `capacity` jobs.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Create a PENDING job and return its id.
    pub async fn create(&self, task_type: TaskType, metadata: Map<String, Value>) -> String {
        let job_id = new_job_id();
        let state = JobState::new(job_id.clone(), task_type, metadata);

        let mut inner = self.inner.write().await;
        let revision = inner.tick();
        inner.jobs.insert(job_id.clone(), Tracked { state, revision });
        let evicted = inner.evict(self.capacity);
        drop(inner);

        tracing::debug!(job_id = %job_id, task_type = %task_type, "Created job");
        if evicted > 0 {
            tracing::info!(evicted, capacity = self.capacity, "Evicted stale jobs");
        }
        job_id
    }

    /// Merge `update` into a job.
    ///
    /// Returns `false` without changing anything when the id is unknown or the
    /// job has already reached a terminal status.
    pub async fn update(&self, job_id: &str, update: JobUpdate) -> bool {
        let mut inner = self.inner.write().await;
        let revision = inner.tick();
        let Some(tracked) = inner.jobs.get_mut(job_id) else {
            return false;
        };
        if tracked.state.status.is_terminal() {
            tracing::debug!(
                job_id = %job_id,
                status = %tracked.state.status,
                "Ignoring update to finished job"
            );
            return false;
        }
        tracked.state.apply(update);
        tracked.revision = revision;
        true
    }

    /// Snapshot of a job, or `None` if unknown or evicted.
    pub async fn get(&self, job_id: &str) -> Option<JobState> {
        self.inner
            .read()
            .await
            .jobs
            .get(job_id)
            .map(|tracked| tracked.state.clone())
    }

    /// Number of retained jobs.
    pub async fn len(&self) -> usize {
        self.inner.read().await.jobs.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.jobs.is_empty()
    }

    /// Snapshots of all retained jobs, most recently updated first.
    pub async fn list(&self) -> Vec<JobState> {
        let inner = self.inner.read().await;
        let mut tracked: Vec<&Tracked> = inner.jobs.values().collect();
        tracked.sort_unstable_by(|a, b| b.revision.cmp(&a.revision));
        tracked.into_iter().map(|t| t.state.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::jobs::state::JobStatus;

    #[test]
    fn job_id_format() {
        let id = new_job_id();
        assert!(id.starts_with(JOB_ID_PREFIX));
        assert_eq!(id.len(), JOB_ID_PREFIX.len() + 12);
        assert!(id[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn create_then_get() {
        let registry = JobRegistry::with_capacity(10);
        let mut meta = Map::new();
        meta.insert("account".into(), Value::from("ACC12345"));
        let id = registry.create(TaskType::ThematicAnalysis, meta).await;

        let job = registry.get(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0.0);
        assert_eq!(job.metadata["account"], "ACC12345");
    }

    #[tokio::test]
    async fn update_unknown_id_returns_false() {
        let registry = JobRegistry::with_capacity(10);
        let id = registry.create(TaskType::ThematicAnalysis, Map::new()).await;
        let before = registry.get(&id).await.unwrap();

        assert!(!registry.update("job_missing", JobUpdate::new().progress(0.5)).await);
        assert_eq!(registry.len().await, 1);
        assert_eq!(registry.get(&id).await.unwrap(), before);
    }

    #[tokio::test]
    async fn update_refreshes_updated_at() {
        let registry = JobRegistry::with_capacity(10);
        let id = registry.create(TaskType::ThematicAnalysis, Map::new()).await;
        let before = registry.get(&id).await.unwrap();

        assert!(
            registry
                .update(&id, JobUpdate::new().status(JobStatus::Running).progress(0.1))
                .await
        );
        let after = registry.get(&id).await.unwrap();
        assert_eq!(after.status, JobStatus::Running);
        assert!(after.updated_at >= before.updated_at);
    }

    #[tokio::test]
    async fn terminal_jobs_are_frozen() {
        let registry = JobRegistry::with_capacity(10);
        let id = registry.create(TaskType::ThematicAnalysis, Map::new()).await;
        registry
            .update(&id, JobUpdate::new().status(JobStatus::Running))
            .await;
        registry
            .update(&id, JobUpdate::new().status(JobStatus::Cancelled))
            .await;

        assert!(
            !registry
                .update(&id, JobUpdate::new().status(JobStatus::Succeeded).progress(1.0))
                .await
        );
        let job = registry.get(&id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.progress, 0.0);
    }

    #[tokio::test]
    async fn eviction_keeps_most_recent_creates() {
        let registry = JobRegistry::with_capacity(100);
        let mut ids = Vec::new();
        for _ in 0..150 {
            ids.push(registry.create(TaskType::ThematicAnalysis, Map::new()).await);
        }

        assert_eq!(registry.len().await, 100);
        for id in &ids[..50] {
            assert!(registry.get(id).await.is_none());
        }
        for id in &ids[50..] {
            assert!(registry.get(id).await.is_some());
        }
    }

    #[tokio::test]
    async fn eviction_respects_updates() {
        let registry = JobRegistry::with_capacity(2);
        let first = registry.create(TaskType::ThematicAnalysis, Map::new()).await;
        let second = registry.create(TaskType::ThematicAnalysis, Map::new()).await;

        // Touch the oldest job so the second one becomes least recent.
        registry.update(&first, JobUpdate::new().progress(0.2)).await;
        let third = registry.create(TaskType::ThematicAnalysis, Map::new()).await;

        assert!(registry.get(&first).await.is_some());
        assert!(registry.get(&second).await.is_none());
        assert!(registry.get(&third).await.is_some());

        let listed: Vec<String> = registry.list().await.into_iter().map(|j| j.job_id).collect();
        assert_eq!(listed, vec![third, first]);
    }

    #[tokio::test]
    async fn concurrent_creates_are_unique_and_bounded() {
        let registry = Arc::new(JobRegistry::with_capacity(64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for _ in 0..20 {
                    ids.push(registry.create(TaskType::ThematicAnalysis, Map::new()).await);
                }
                ids
            }));
        }

        let mut all = std::collections::HashSet::new();
        for handle in handles {
            for id in handle.await.unwrap() {
                assert!(all.insert(id));
            }
        }
        assert_eq!(all.len(), 160);
        assert_eq!(registry.len().await, 64);
    }
}
