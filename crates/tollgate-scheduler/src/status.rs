//! Shared per-instance status table.
//!
//! The only mutable state shared between the orchestrator and its workers.
//! One lock covers the whole run; readers take a [`StatusSnapshot`] and never
//! hold the lock while deciding anything.

use std::collections::HashMap;
use tokio::sync::RwLock;
use tollgate_core::ids::InstanceId;
use tollgate_core::run::{JobInstance, JobStatus, PipelineRun};

/// Immutable copy of every instance's status.
#[derive(Debug, Clone, Default)]
pub struct StatusSnapshot {
    by_instance: HashMap<InstanceId, JobStatus>,
    by_job: HashMap<String, Vec<JobStatus>>,
}

impl StatusSnapshot {
    pub fn from_run(run: &PipelineRun) -> Self {
        let mut snapshot = Self::default();
        for instance in &run.jobs {
            snapshot.insert(instance);
        }
        snapshot
    }

    fn insert(&mut self, instance: &JobInstance) {
        self.by_instance.insert(instance.id.clone(), instance.status);
        self.by_job
            .entry(instance.job.clone())
            .or_default()
            .push(instance.status);
    }

    pub fn status(&self, id: &InstanceId) -> Option<JobStatus> {
        self.by_instance.get(id).copied()
    }

    /// Statuses of every instance expanded from `job`.
    pub fn job_statuses(&self, job: &str) -> &[JobStatus] {
        self.by_job.get(job).map(Vec::as_slice).unwrap_or_default()
    }

    /// Instances of `job` currently running.
    pub fn running_in(&self, job: &str) -> usize {
        self.job_statuses(job)
            .iter()
            .filter(|s| **s == JobStatus::Running)
            .count()
    }

    pub fn running(&self) -> usize {
        self.by_instance
            .values()
            .filter(|s| **s == JobStatus::Running)
            .count()
    }

    pub fn all_terminal(&self) -> bool {
        self.by_instance.values().all(JobStatus::is_terminal)
    }
}

/// Run state guarded by a single lock.
pub struct StatusTable {
    run: RwLock<PipelineRun>,
}

impl StatusTable {
    pub fn new(run: PipelineRun) -> Self {
        Self {
            run: RwLock::new(run),
        }
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot::from_run(&*self.run.read().await)
    }

    /// Clone of the full run, e.g. for persistence.
    pub async fn run(&self) -> PipelineRun {
        self.run.read().await.clone()
    }

    /// Apply `f` under the write lock and return the updated run.
    pub async fn update<F>(&self, f: F) -> PipelineRun
    where
        F: FnOnce(&mut PipelineRun),
    {
        let mut run = self.run.write().await;
        f(&mut run);
        run.clone()
    }

    /// Apply `f` to one instance; `None` if the instance does not exist.
    pub async fn update_instance<F>(&self, id: &InstanceId, f: F) -> Option<PipelineRun>
    where
        F: FnOnce(&mut JobInstance),
    {
        let mut run = self.run.write().await;
        let instance = run.instance_mut(id)?;
        f(instance);
        Some(run.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tollgate_core::ids::RunId;
    use tollgate_core::pipeline::{PipelineDefinition, TriggerType};
    use tollgate_core::run::{RunStatus, TriggerInfo};

    fn run() -> PipelineRun {
        PipelineRun {
            id: RunId::new(),
            pipeline_name: "package".to_string(),
            status: RunStatus::Pending,
            trigger: TriggerInfo {
                trigger_type: TriggerType::Manual,
                git_ref: None,
                release_action: None,
                triggered_by: None,
            },
            definition: PipelineDefinition::from_yaml(
                "name: package\njobs:\n  - name: test\n    steps:\n      - name: run\n        run: pytest\n",
            )
            .unwrap(),
            jobs: vec![
                JobInstance::new(InstanceId::new("test (a)"), "test", BTreeMap::new()),
                JobInstance::new(InstanceId::new("test (b)"), "test", BTreeMap::new()),
            ],
            fail_fast: BTreeMap::new(),
            cancel_requested: false,
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_snapshot_is_detached_from_table() {
        let table = StatusTable::new(run());
        let before = table.snapshot().await;

        table
            .update_instance(&InstanceId::new("test (a)"), |i| i.status = JobStatus::Running)
            .await
            .unwrap();

        assert_eq!(before.running_in("test"), 0);
        let after = table.snapshot().await;
        assert_eq!(after.running_in("test"), 1);
        assert_eq!(after.status(&InstanceId::new("test (b)")), Some(JobStatus::Pending));
        assert_eq!(after.job_statuses("test").len(), 2);
        assert!(after.job_statuses("missing").is_empty());
        assert!(!after.all_terminal());
    }

    #[tokio::test]
    async fn test_update_unknown_instance() {
        let table = StatusTable::new(run());
        assert!(
            table
                .update_instance(&InstanceId::new("nope"), |i| i.status = JobStatus::Failed)
                .await
                .is_none()
        );
    }
}
