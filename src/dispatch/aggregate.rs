use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::dispatch::run::RunState;

/// Overall status of a job, derived from its runs every time it is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Not enough target nodes were up; nothing was sent
    QuorumFailed,
    /// At least one run has not been acknowledged yet
    Dispatching,
    /// Every run was acknowledged and at least one is still going
    Running,
    /// Every run reached a terminal state
    Complete,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::QuorumFailed => write!(f, "quorum_failed"),
            JobStatus::Dispatching => write!(f, "dispatching"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Complete => write!(f, "complete"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quorum_failed" => Ok(JobStatus::QuorumFailed),
            "dispatching" => Ok(JobStatus::Dispatching),
            "running" => Ok(JobStatus::Running),
            "complete" => Ok(JobStatus::Complete),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Per-state run counts for one job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunBreakdown {
    pub counts: BTreeMap<RunState, usize>,
    pub terminal: usize,
    pub non_terminal: usize,
}

impl RunBreakdown {
    pub fn count(&self, state: RunState) -> usize {
        self.counts.get(&state).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.terminal + self.non_terminal
    }
}

/// Derive a job's status from the states of its runs.
pub fn aggregate<I>(quorum_failed: bool, states: I) -> (JobStatus, RunBreakdown)
where
    I: IntoIterator<Item = RunState>,
{
    let mut breakdown = RunBreakdown::default();
    for state in states {
        *breakdown.counts.entry(state).or_insert(0) += 1;
        if state.is_terminal() {
            breakdown.terminal += 1;
        } else {
            breakdown.non_terminal += 1;
        }
    }

    let status = if quorum_failed {
        JobStatus::QuorumFailed
    } else if breakdown.count(RunState::Created) > 0 {
        JobStatus::Dispatching
    } else if breakdown.count(RunState::Running) > 0 {
        JobStatus::Running
    } else {
        JobStatus::Complete
    };

    (status, breakdown)
}
