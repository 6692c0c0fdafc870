//! Run repositories.
//!
//! [`MemoryRunStore`] keeps runs for the lifetime of the process;
//! [`JsonRunStore`] writes one JSON document per run so a run can be resumed
//! after the host restarts.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tollgate_core::ids::RunId;
use tollgate_core::ports::RunRepository;
use tollgate_core::run::PipelineRun;
use tollgate_core::{Error, Result};
use tracing::{debug, warn};

/// In-memory run repository.
#[derive(Default)]
pub struct MemoryRunStore {
    runs: RwLock<HashMap<RunId, PipelineRun>>,
}

impl MemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunRepository for MemoryRunStore {
    async fn save(&self, run: &PipelineRun) -> Result<()> {
        self.runs.write().await.insert(run.id, run.clone());
        Ok(())
    }

    async fn get(&self, id: RunId) -> Result<Option<PipelineRun>> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn list(&self, limit: usize) -> Result<Vec<PipelineRun>> {
        let mut runs: Vec<PipelineRun> = self.runs.read().await.values().cloned().collect();
        runs.sort_by(|a, b| b.queued_at.cmp(&a.queued_at));
        runs.truncate(limit);
        Ok(runs)
    }
}

/// Directory of `<run-id>.json` files.
pub struct JsonRunStore {
    root_dir: PathBuf,
}

impl JsonRunStore {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn run_path(&self, id: RunId) -> PathBuf {
        self.root_dir.join(format!("{}.json", id))
    }
}

#[async_trait]
impl RunRepository for JsonRunStore {
    async fn save(&self, run: &PipelineRun) -> Result<()> {
        tokio::fs::create_dir_all(&self.root_dir)
            .await
            .map_err(|e| Error::Internal(format!("Failed to create state dir: {}", e)))?;

        let json = serde_json::to_vec_pretty(run)?;
        let path = self.run_path(run.id);
        // Write then rename so a crash never leaves a truncated document.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| Error::Internal(format!("Failed to write run: {}", e)))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::Internal(format!("Failed to write run: {}", e)))?;

        debug!(run_id = %run.id, path = %path.display(), "Run saved");
        Ok(())
    }

    async fn get(&self, id: RunId) -> Result<Option<PipelineRun>> {
        let path = self.run_path(id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn list(&self, limit: usize) -> Result<Vec<PipelineRun>> {
        if !self.root_dir.exists() {
            return Ok(vec![]);
        }

        let mut runs = vec![];
        let mut read_dir = tokio::fs::read_dir(&self.root_dir)
            .await
            .map_err(|e| Error::Internal(format!("Failed to read state dir: {}", e)))?;

        while let Some(entry) = read_dir
            .next_entry()
            .await
            .map_err(|e| Error::Internal(format!("Failed to read entry: {}", e)))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<PipelineRun>(&bytes) {
                Ok(run) => runs.push(run),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable run"),
            }
        }

        runs.sort_by(|a, b| b.queued_at.cmp(&a.queued_at));
        runs.truncate(limit);
        Ok(runs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use tollgate_core::ids::InstanceId;
    use tollgate_core::pipeline::{PipelineDefinition, TriggerType};
    use tollgate_core::run::{JobInstance, JobStatus, RunStatus, TriggerInfo};

    fn run() -> PipelineRun {
        let mut instance = JobInstance::new(
            InstanceId::for_matrix("test", ["3.9", "latest"]),
            "test",
            BTreeMap::from([
                ("python-version".to_string(), "3.9".to_string()),
                ("deps".to_string(), "latest".to_string()),
            ]),
        );
        instance.status = JobStatus::Running;
        instance.step_cursor = Some(1);

        PipelineRun {
            id: RunId::new(),
            pipeline_name: "package".to_string(),
            status: RunStatus::Running,
            trigger: TriggerInfo {
                trigger_type: TriggerType::Push,
                git_ref: Some("master".to_string()),
                release_action: None,
                triggered_by: None,
            },
            definition: PipelineDefinition::from_yaml(
                "name: package\njobs:\n  - name: test\n    steps:\n      - name: run\n        run: pytest\n",
            )
            .unwrap(),
            jobs: vec![instance],
            fail_fast: BTreeMap::from([("test".to_string(), false)]),
            cancel_requested: false,
            queued_at: Utc::now(),
            started_at: Some(Utc::now()),
            completed_at: None,
        }
    }

    #[tokio::test]
    async fn test_json_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let run = run();

        JsonRunStore::new(dir.path()).save(&run).await.unwrap();

        let reopened = JsonRunStore::new(dir.path());
        let loaded = reopened.get(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.jobs[0].id.as_str(), "test (3.9, latest)");
        assert_eq!(loaded.jobs[0].status, JobStatus::Running);
        assert_eq!(loaded.jobs[0].step_cursor, Some(1));
        assert_eq!(loaded.fail_fast.get("test"), Some(&false));
        assert_eq!(loaded.definition.name, "package");

        assert_eq!(reopened.list(10).await.unwrap().len(), 1);
        assert!(reopened.get(RunId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonRunStore::new(dir.path().join("runs"));
        let mut run = run();

        store.save(&run).await.unwrap();
        run.status = RunStatus::Succeeded;
        store.save(&run).await.unwrap();

        let loaded = store.get(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Succeeded);
        assert_eq!(store.list(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_store_lists_newest_first() {
        let store = MemoryRunStore::new();
        let first = run();
        let mut second = run();
        second.queued_at = first.queued_at + chrono::Duration::seconds(5);

        store.save(&first).await.unwrap();
        store.save(&second).await.unwrap();

        let runs = store.list(1).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].id, second.id);
    }
}
