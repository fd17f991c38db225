use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use shovey::config::LivenessConfig;
use shovey::dispatch::{Job, JobNodeRun};
use shovey::error::Result;
use shovey::liveness::{run_sweeper, LivenessMonitor, NodeFilter, NodeRecord, NodeStatus};
use shovey::store::{MemoryStore, StateStore, StoredJob};

const STALE: Duration = Duration::from_secs(600);

/// Store whose first node write stalls, so a later write could overtake it
struct SlowFirstWrite {
    inner: MemoryStore,
    stalled: AtomicBool,
}

impl SlowFirstWrite {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            stalled: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl StateStore for SlowFirstWrite {
    async fn load_node(&self, name: &str) -> Result<Option<NodeRecord>> {
        self.inner.load_node(name).await
    }

    async fn save_node(&self, record: &NodeRecord) -> Result<()> {
        if !self.stalled.swap(true, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.inner.save_node(record).await
    }

    async fn load_nodes(&self) -> Result<Vec<NodeRecord>> {
        self.inner.load_nodes().await
    }

    async fn load_job(&self, id: Uuid) -> Result<Option<StoredJob>> {
        self.inner.load_job(id).await
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        self.inner.save_job(job).await
    }

    async fn save_run(&self, run: &JobNodeRun) -> Result<()> {
        self.inner.save_run(run).await
    }

    async fn delete_job(&self, id: Uuid) -> Result<()> {
        self.inner.delete_job(id).await
    }

    async fn load_jobs(&self) -> Result<Vec<StoredJob>> {
        self.inner.load_jobs().await
    }
}

fn t(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

#[tokio::test]
async fn test_last_seen_never_moves_backward() {
    let monitor = LivenessMonitor::new();
    let arrivals = [10, 50, 20, 50, 5, 70, 60];

    let mut newest = i64::MIN;
    for secs in arrivals {
        monitor.record_heartbeat("web1", t(secs)).await;
        newest = newest.max(secs);
        let record = monitor.status("web1").await.unwrap();
        assert_eq!(record.last_seen, t(newest));
    }

    // One registration, no transitions from reordered heartbeats
    let record = monitor.status("web1").await.unwrap();
    assert_eq!(record.history.len(), 1);
    assert_eq!(record.status, NodeStatus::Up);
}

#[tokio::test]
async fn test_sweep_marks_stale_nodes_down_once() {
    let monitor = LivenessMonitor::new();
    monitor.record_heartbeat("web1", t(0)).await;
    monitor.record_heartbeat("web2", t(300)).await;

    // Not yet past the threshold
    assert!(monitor.sweep(t(600), STALE).await.is_empty());
    assert!(monitor.is_up("web1").await);

    let downed = monitor.sweep(t(601), STALE).await;
    assert_eq!(downed, vec!["web1"]);
    assert!(!monitor.is_up("web1").await);
    assert!(monitor.is_up("web2").await);

    // Sweeping again without heartbeats changes nothing
    assert!(monitor.sweep(t(650), STALE).await.is_empty());
    let record = monitor.status("web1").await.unwrap();
    assert_eq!(record.history.len(), 2);
    assert_eq!(record.history[1].status, NodeStatus::Down);
    assert_eq!(record.history[1].at, t(601));
}

#[tokio::test]
async fn test_fresh_heartbeat_revives_down_node() {
    let monitor = LivenessMonitor::new();
    monitor.record_heartbeat("web1", t(0)).await;
    monitor.sweep(t(1000), STALE).await;
    assert!(!monitor.is_up("web1").await);

    // A replayed old heartbeat is not enough
    assert!(!monitor.record_heartbeat("web1", t(0)).await);
    assert!(!monitor.is_up("web1").await);

    assert!(monitor.record_heartbeat("web1", t(1010)).await);
    let record = monitor.status("web1").await.unwrap();
    let statuses: Vec<NodeStatus> = record.history.iter().map(|c| c.status).collect();
    assert_eq!(
        statuses,
        vec![NodeStatus::Up, NodeStatus::Down, NodeStatus::Up]
    );
}

#[tokio::test]
async fn test_unknown_nodes_are_not_up() {
    let monitor = LivenessMonitor::new();
    monitor.record_heartbeat("web1", Utc::now()).await;

    assert!(!monitor.is_up("ghost").await);
    assert!(monitor.status("ghost").await.is_none());
    assert_eq!(
        monitor
            .count_up(&["web1".to_string(), "ghost".to_string()])
            .await,
        1
    );
}

#[tokio::test]
async fn test_list_filters_by_status() {
    let monitor = LivenessMonitor::new();
    monitor.record_heartbeat("web2", t(500)).await;
    monitor.record_heartbeat("web1", t(0)).await;
    monitor.record_heartbeat("db1", t(500)).await;
    monitor.sweep(t(700), STALE).await;

    let all: Vec<String> = monitor
        .list(&NodeFilter::default())
        .await
        .into_iter()
        .map(|r| r.name)
        .collect();
    assert_eq!(all, vec!["db1", "web1", "web2"]);

    let down = monitor
        .list(&NodeFilter {
            status: Some(NodeStatus::Down),
        })
        .await;
    assert_eq!(down.len(), 1);
    assert_eq!(down[0].name, "web1");
}

#[tokio::test]
async fn test_sweeper_task_marks_nodes_down() {
    let monitor = Arc::new(LivenessMonitor::new());
    monitor
        .record_heartbeat("web1", Utc::now() - chrono::Duration::seconds(10))
        .await;
    monitor.record_heartbeat("web2", Utc::now()).await;

    let shutdown = CancellationToken::new();
    let config = LivenessConfig {
        sweep_interval: Duration::from_millis(10),
        stale_after: Duration::from_secs(5),
    };
    let handle = tokio::spawn(run_sweeper(monitor.clone(), config, shutdown.clone()));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while monitor.is_up("web1").await {
        assert!(tokio::time::Instant::now() < deadline, "web1 never went down");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(monitor.is_up("web2").await);

    shutdown.cancel();
    handle.await.unwrap();
}

#[tokio::test]
async fn test_saved_status_keeps_heartbeat_order() {
    let store = Arc::new(SlowFirstWrite::new());
    let monitor = Arc::new(LivenessMonitor::restore(store.clone()).await.unwrap());

    let first = {
        let monitor = monitor.clone();
        tokio::spawn(async move { monitor.record_heartbeat("web1", t(100)).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    monitor.record_heartbeat("web1", t(200)).await;
    monitor.sweep(t(1000), STALE).await;
    first.await.unwrap();

    let saved = store.load_node("web1").await.unwrap().unwrap();
    assert_eq!(saved, monitor.status("web1").await.unwrap());

    let restored = LivenessMonitor::restore(store).await.unwrap();
    let record = restored.status("web1").await.unwrap();
    assert_eq!(record.last_seen, t(200));
    assert_eq!(record.status, NodeStatus::Down);
    let statuses: Vec<NodeStatus> = record.history.iter().map(|c| c.status).collect();
    assert_eq!(statuses, vec![NodeStatus::Up, NodeStatus::Down]);
}
