use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which of the command's output streams a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Final report an agent sends once a run has finished on its node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    /// Agent reported status, `"ok"` on success
    pub status: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RunReport {
    pub fn ok(exit_code: i32) -> Self {
        Self {
            status: "ok".to_string(),
            exit_code: Some(exit_code),
            error: None,
        }
    }

    pub fn failed(exit_code: Option<i32>, error: impl Into<String>) -> Self {
        Self {
            status: "failed".to_string(),
            exit_code,
            error: Some(error.into()),
        }
    }

    /// Exit code 0 or an explicit "ok" counts as success.
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0) || self.status == "ok"
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Heartbeat,
    RunReport(RunReport),
    Output { stream: OutputStream, data: String },
}

/// Event sent by an agent to the server over one of the inbound topics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundEvent {
    pub node: String,
    #[serde(default)]
    pub job_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    /// Per (job, node) output sequence number, assigned by the agent
    #[serde(default)]
    pub sequence: Option<u64>,
    pub payload: EventPayload,
}

impl InboundEvent {
    pub fn heartbeat(node: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            node: node.into(),
            job_id: None,
            timestamp,
            sequence: None,
            payload: EventPayload::Heartbeat,
        }
    }

    pub fn report(node: impl Into<String>, job_id: Uuid, report: RunReport) -> Self {
        Self {
            node: node.into(),
            job_id: Some(job_id),
            timestamp: Utc::now(),
            sequence: None,
            payload: EventPayload::RunReport(report),
        }
    }

    pub fn output(
        node: impl Into<String>,
        job_id: Uuid,
        sequence: u64,
        stream: OutputStream,
        data: impl Into<String>,
    ) -> Self {
        Self {
            node: node.into(),
            job_id: Some(job_id),
            timestamp: Utc::now(),
            sequence: Some(sequence),
            payload: EventPayload::Output {
                stream,
                data: data.into(),
            },
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(raw: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(raw)
    }
}

/// Instruction the server sends to agents inside a signed envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum NodeCommand {
    Start {
        job_id: Uuid,
        command: String,
        run_timeout_ms: u64,
    },
    Cancel {
        job_id: Uuid,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command: NodeCommand,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}
