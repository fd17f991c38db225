use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::bus::{OutputStream, RunReport};

/// State of one node's run of a job.
///
/// ```text
/// created ──ack──▶ running ──report──▶ success | failure
///    │                │
///    │ nack           ├── deadline ──▶ timed_out
///    ▼                └── cancel ────▶ cancelled
///  nacked
/// ```
///
/// `created` and `running` are the only non-terminal states. A cancel or the
/// deadline also ends a run that is still `created`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    Running,
    Success,
    Failure,
    TimedOut,
    Cancelled,
    Nacked,
}

impl RunState {
    pub const ALL: [RunState; 7] = [
        RunState::Created,
        RunState::Running,
        RunState::Success,
        RunState::Failure,
        RunState::TimedOut,
        RunState::Cancelled,
        RunState::Nacked,
    ];

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunState::Created | RunState::Running)
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Created => write!(f, "created"),
            RunState::Running => write!(f, "running"),
            RunState::Success => write!(f, "success"),
            RunState::Failure => write!(f, "failure"),
            RunState::TimedOut => write!(f, "timed_out"),
            RunState::Cancelled => write!(f, "cancelled"),
            RunState::Nacked => write!(f, "nacked"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub sequence: u64,
    pub stream: OutputStream,
    pub data: String,
    /// Agent timestamp
    pub timestamp: DateTime<Utc>,
    /// Set when the chunk arrived after the run had already ended
    #[serde(default)]
    pub late: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTransition {
    pub state: RunState,
    pub at: DateTime<Utc>,
}

/// A run report that arrived after the run had already ended locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LateReport {
    pub received_at: DateTime<Utc>,
    pub report: RunReport,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobNodeRun {
    pub job_id: Uuid,
    pub node: String,
    pub state: RunState,
    /// Output keyed by agent sequence number
    pub chunks: BTreeMap<u64, OutputChunk>,
    /// Retransmitted chunks whose sequence number was already stored
    #[serde(default)]
    pub duplicate_chunks: u64,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub history: Vec<RunTransition>,
    #[serde(default)]
    pub late_reports: Vec<LateReport>,
}

impl JobNodeRun {
    pub fn new(job_id: Uuid, node: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            job_id,
            node: node.into(),
            state: RunState::Created,
            chunks: BTreeMap::new(),
            duplicate_chunks: 0,
            exit_code: None,
            error: None,
            created_at: at,
            started_at: None,
            ended_at: None,
            history: vec![RunTransition {
                state: RunState::Created,
                at,
            }],
            late_reports: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    fn transition(&mut self, to: RunState, at: DateTime<Utc>) {
        self.state = to;
        if to == RunState::Running {
            self.started_at = Some(at);
        }
        if to.is_terminal() {
            self.ended_at = Some(at);
        }
        self.history.push(RunTransition { state: to, at });
    }

    /// The node accepted the job.
    pub fn acknowledge(&mut self, at: DateTime<Utc>) -> bool {
        if self.state != RunState::Created {
            return false;
        }
        self.transition(RunState::Running, at);
        true
    }

    /// The node refused the job or could not be reached.
    pub fn reject(&mut self, reason: impl Into<String>, at: DateTime<Utc>) -> bool {
        if self.state != RunState::Created {
            return false;
        }
        self.error = Some(reason.into());
        self.transition(RunState::Nacked, at);
        true
    }

    /// Apply the node's final report. A report for a run that has already
    /// ended is kept as a [`LateReport`] and does not reopen it.
    pub fn complete(&mut self, report: &RunReport, at: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            self.late_reports.push(LateReport {
                received_at: at,
                report: report.clone(),
            });
            return false;
        }
        if self.started_at.is_none() {
            self.started_at = Some(at);
        }
        self.exit_code = report.exit_code;
        self.error = report.error.clone();
        let outcome = if report.succeeded() {
            RunState::Success
        } else {
            RunState::Failure
        };
        self.transition(outcome, at);
        true
    }

    pub fn cancel(&mut self, at: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.transition(RunState::Cancelled, at);
        true
    }

    pub fn time_out(&mut self, at: DateTime<Utc>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.transition(RunState::TimedOut, at);
        true
    }

    /// Store an output chunk under its sequence number. Returns false for a
    /// retransmission of a sequence number that is already stored.
    pub fn append_output(
        &mut self,
        sequence: u64,
        stream: OutputStream,
        data: String,
        timestamp: DateTime<Utc>,
    ) -> bool {
        if self.chunks.contains_key(&sequence) {
            self.duplicate_chunks += 1;
            return false;
        }
        let late = self.is_terminal();
        self.chunks.insert(
            sequence,
            OutputChunk {
                sequence,
                stream,
                data,
                timestamp,
                late,
            },
        );
        true
    }

    /// Reassembled output of one stream, in sequence order.
    pub fn output(&self, stream: OutputStream) -> String {
        self.chunks
            .values()
            .filter(|chunk| chunk.stream == stream)
            .map(|chunk| chunk.data.as_str())
            .collect()
    }

    pub fn last_sequence(&self) -> Option<u64> {
        self.chunks.keys().next_back().copied()
    }

    pub fn chunks_after(&self, after: Option<u64>) -> Vec<OutputChunk> {
        match after {
            Some(seq) => self
                .chunks
                .range(seq.saturating_add(1)..)
                .map(|(_, chunk)| chunk.clone())
                .collect(),
            None => self.chunks.values().cloned().collect(),
        }
    }
}
