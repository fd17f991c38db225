use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::to_chrono;
use crate::dispatch::quorum::Quorum;

/// How the caller names the nodes a job should run on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetSpec {
    /// Explicit node names
    Nodes(Vec<String>),
    /// Search expression resolved at submission time
    Search(String),
}

#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub command: String,
    pub targets: TargetSpec,
    pub quorum: Quorum,
    /// Falls back to the dispatcher's default when `None`
    pub run_timeout: Option<Duration>,
}

impl SubmitRequest {
    pub fn new(command: impl Into<String>, nodes: Vec<String>) -> Self {
        Self {
            command: command.into(),
            targets: TargetSpec::Nodes(nodes),
            quorum: Quorum::default(),
            run_timeout: None,
        }
    }

    pub fn with_quorum(mut self, quorum: Quorum) -> Self {
        self.quorum = quorum;
        self
    }

    pub fn with_run_timeout(mut self, timeout: Duration) -> Self {
        self.run_timeout = Some(timeout);
        self
    }
}

/// A submitted job. Immutable after submission apart from `cancelled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub command: String,
    pub targets: Vec<String>,
    pub quorum: Quorum,
    pub submitted_at: DateTime<Utc>,
    pub run_timeout_ms: u64,
    /// Set at submission when too few targets were up
    pub quorum_failed: bool,
    /// Targets that were up when quorum was checked
    pub up_at_submission: usize,
    #[serde(default)]
    pub cancelled: bool,
}

impl Job {
    pub fn new(
        command: String,
        targets: Vec<String>,
        quorum: Quorum,
        run_timeout: Duration,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            command,
            targets,
            quorum,
            submitted_at,
            run_timeout_ms: u64::try_from(run_timeout.as_millis()).unwrap_or(u64::MAX),
            quorum_failed: false,
            up_at_submission: 0,
            cancelled: false,
        }
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_millis(self.run_timeout_ms)
    }

    /// Wall-clock time after which unfinished runs are timed out.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.submitted_at
            .checked_add_signed(to_chrono(self.run_timeout()))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_creation() {
        let now = Utc::now();
        let job = Job::new(
            "uptime".to_string(),
            vec!["web1".to_string()],
            Quorum::Count(1),
            Duration::from_secs(90),
            now,
        );
        assert_eq!(job.command, "uptime");
        assert!(!job.quorum_failed);
        assert!(!job.cancelled);
        assert_eq!(job.run_timeout(), Duration::from_secs(90));
        assert_eq!(job.deadline(), now + chrono::Duration::seconds(90));
    }

    #[test]
    fn target_spec_wire_format() {
        let nodes: TargetSpec = serde_json::from_str(r#"{"nodes":["a","b"]}"#).unwrap();
        assert_eq!(nodes, TargetSpec::Nodes(vec!["a".into(), "b".into()]));
        let search: TargetSpec = serde_json::from_str(r#"{"search":"name:web*"}"#).unwrap();
        assert_eq!(search, TargetSpec::Search("name:web*".into()));
    }

    #[test]
    fn submit_request_builder() {
        let req = SubmitRequest::new("ls", vec!["a".into()])
            .with_quorum(Quorum::Percent(50))
            .with_run_timeout(Duration::from_secs(10));
        assert_eq!(req.quorum, Quorum::Percent(50));
        assert_eq!(req.run_timeout, Some(Duration::from_secs(10)));
    }
}
