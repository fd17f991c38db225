//! Persistence boundary for node statuses, jobs and runs.
//!
//! The dispatcher and the liveness monitor write through a [`StateStore`]
//! after every change. [`MemoryStore`] keeps everything in memory and can be
//! snapshotted to a JSON file so a restarted server picks up where it left
//! off.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::dispatch::job::Job;
use crate::dispatch::run::JobNodeRun;
use crate::error::{Result, ShoveyError};
use crate::liveness::NodeRecord;

/// A job together with its per-node runs, keyed by node name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredJob {
    pub job: Job,
    pub runs: BTreeMap<String, JobNodeRun>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load_node(&self, name: &str) -> Result<Option<NodeRecord>>;
    async fn save_node(&self, record: &NodeRecord) -> Result<()>;
    async fn load_nodes(&self) -> Result<Vec<NodeRecord>>;

    async fn load_job(&self, id: Uuid) -> Result<Option<StoredJob>>;
    /// Insert or replace a job. Existing runs are kept.
    async fn save_job(&self, job: &Job) -> Result<()>;
    /// Insert or replace one run. The job must already be saved.
    async fn save_run(&self, run: &JobNodeRun) -> Result<()>;
    /// Remove a job and all of its runs. Unknown ids are ignored.
    async fn delete_job(&self, id: Uuid) -> Result<()>;
    async fn load_jobs(&self) -> Result<Vec<StoredJob>>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    nodes: HashMap<String, NodeRecord>,
    jobs: HashMap<Uuid, StoredJob>,
}

/// In-memory [`StateStore`] with optional JSON snapshots.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<Snapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a snapshot written by [`MemoryStore::save_to_file`]. A missing
    /// file yields an empty store.
    pub async fn load_from_file(path: &Path) -> Result<Self> {
        let raw = match tokio::fs::read(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "No state file, starting empty");
                return Ok(Self::new());
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot: Snapshot = serde_json::from_slice(&raw)?;
        tracing::info!(
            path = %path.display(),
            nodes = snapshot.nodes.len(),
            jobs = snapshot.jobs.len(),
            "Loaded state file"
        );
        Ok(Self {
            state: RwLock::new(snapshot),
        })
    }

    /// Write the whole store to `path`, replacing it atomically.
    pub async fn save_to_file(&self, path: &Path) -> Result<()> {
        let raw = {
            let state = self.state.read().await;
            serde_json::to_vec_pretty(&*state)?
        };
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, raw).await?;
        tokio::fs::rename(&tmp, path).await?;
        tracing::debug!(path = %path.display(), "Saved state file");
        Ok(())
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load_node(&self, name: &str) -> Result<Option<NodeRecord>> {
        Ok(self.state.read().await.nodes.get(name).cloned())
    }

    async fn save_node(&self, record: &NodeRecord) -> Result<()> {
        self.state
            .write()
            .await
            .nodes
            .insert(record.name.clone(), record.clone());
        Ok(())
    }

    async fn load_nodes(&self) -> Result<Vec<NodeRecord>> {
        Ok(self.state.read().await.nodes.values().cloned().collect())
    }

    async fn load_job(&self, id: Uuid) -> Result<Option<StoredJob>> {
        Ok(self.state.read().await.jobs.get(&id).cloned())
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        let mut state = self.state.write().await;
        match state.jobs.get_mut(&job.id) {
            Some(stored) => stored.job = job.clone(),
            None => {
                state.jobs.insert(
                    job.id,
                    StoredJob {
                        job: job.clone(),
                        runs: BTreeMap::new(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn save_run(&self, run: &JobNodeRun) -> Result<()> {
        let mut state = self.state.write().await;
        let stored = state.jobs.get_mut(&run.job_id).ok_or_else(|| {
            ShoveyError::Store(format!("run saved for unknown job {}", run.job_id))
        })?;
        stored.runs.insert(run.node.clone(), run.clone());
        Ok(())
    }

    async fn delete_job(&self, id: Uuid) -> Result<()> {
        self.state.write().await.jobs.remove(&id);
        Ok(())
    }

    async fn load_jobs(&self) -> Result<Vec<StoredJob>> {
        Ok(self.state.read().await.jobs.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::quorum::Quorum;
    use crate::dispatch::run::RunState;
    use crate::liveness::LivenessMonitor;
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;

    fn job() -> Job {
        Job::new(
            "uptime".into(),
            vec!["web1".into(), "web2".into()],
            Quorum::default(),
            Duration::from_secs(30),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn run_requires_saved_job() {
        let store = MemoryStore::new();
        let run = JobNodeRun::new(Uuid::new_v4(), "web1", Utc::now());
        assert!(matches!(
            store.save_run(&run).await,
            Err(ShoveyError::Store(_))
        ));
    }

    #[tokio::test]
    async fn resaving_job_keeps_runs() {
        let store = MemoryStore::new();
        let mut job = job();
        store.save_job(&job).await.unwrap();
        store
            .save_run(&JobNodeRun::new(job.id, "web1", Utc::now()))
            .await
            .unwrap();

        job.cancelled = true;
        store.save_job(&job).await.unwrap();

        let stored = store.load_job(job.id).await.unwrap().unwrap();
        assert!(stored.job.cancelled);
        assert_eq!(stored.runs.len(), 1);
        assert_eq!(stored.runs["web1"].state, RunState::Created);
    }

    #[tokio::test]
    async fn deleted_job_takes_its_runs() {
        let store = MemoryStore::new();
        let job = job();
        store.save_job(&job).await.unwrap();
        store
            .save_run(&JobNodeRun::new(job.id, "web1", Utc::now()))
            .await
            .unwrap();

        store.delete_job(job.id).await.unwrap();
        assert!(store.load_job(job.id).await.unwrap().is_none());
        assert!(store.load_jobs().await.unwrap().is_empty());
        store.delete_job(job.id).await.unwrap();
    }

    #[tokio::test]
    async fn snapshot_survives_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = Arc::new(MemoryStore::new());
        let monitor = LivenessMonitor::restore(store.clone()).await.unwrap();
        monitor.record_heartbeat("web1", Utc::now()).await;
        let job = job();
        store.save_job(&job).await.unwrap();
        store.save_to_file(&path).await.unwrap();

        let reloaded = MemoryStore::load_from_file(&path).await.unwrap();
        assert!(reloaded.load_node("web1").await.unwrap().is_some());
        assert_eq!(reloaded.load_job(job.id).await.unwrap().unwrap().job, job);
    }

    #[tokio::test]
    async fn missing_state_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::load_from_file(&dir.path().join("absent.json"))
            .await
            .unwrap();
        assert!(store.load_nodes().await.unwrap().is_empty());
        assert!(store.load_jobs().await.unwrap().is_empty());
    }
}
