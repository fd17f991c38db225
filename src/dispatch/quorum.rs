use serde::{Deserialize, Serialize};

use crate::error::{Result, ShoveyError};
use crate::liveness::LivenessMonitor;

/// Minimum number of target nodes that must be up before a job is sent.
///
/// Written as an absolute count (`"3"`) or a percentage of the targets
/// (`"60%"`). Percentages round up to the next whole node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Quorum {
    Count(usize),
    Percent(u32),
}

impl Default for Quorum {
    fn default() -> Self {
        Quorum::Percent(100)
    }
}

impl Quorum {
    /// Number of up nodes needed out of `total` targets.
    pub fn required(&self, total: usize) -> Result<usize> {
        match *self {
            Quorum::Count(0) => Err(ShoveyError::InvalidQuorum(
                "quorum must be at least 1".to_string(),
            )),
            Quorum::Count(n) if n > total => Err(ShoveyError::InvalidQuorum(format!(
                "quorum of {} exceeds the {} target nodes",
                n, total
            ))),
            Quorum::Count(n) => Ok(n),
            Quorum::Percent(p) if p == 0 || p > 100 => Err(ShoveyError::InvalidQuorum(format!(
                "percentage must be between 1 and 100, got {}",
                p
            ))),
            Quorum::Percent(p) => Ok((p as usize * total).div_ceil(100)),
        }
    }
}

impl std::fmt::Display for Quorum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Quorum::Count(n) => write!(f, "{}", n),
            Quorum::Percent(p) => write!(f, "{}%", p),
        }
    }
}

impl std::str::FromStr for Quorum {
    type Err = ShoveyError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || ShoveyError::InvalidQuorum(format!("cannot parse '{}'", s));
        match s.strip_suffix('%') {
            Some(pct) => pct.trim().parse().map(Quorum::Percent).map_err(|_| invalid()),
            None => s.parse().map(Quorum::Count).map_err(|_| invalid()),
        }
    }
}

impl TryFrom<String> for Quorum {
    type Error = ShoveyError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Quorum> for String {
    fn from(q: Quorum) -> Self {
        q.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuorumCheck {
    pub satisfied: bool,
    pub up_count: usize,
    pub required: usize,
    pub total: usize,
}

/// Decide whether enough of `targets` are up to satisfy `quorum`. The up
/// count is taken from a single snapshot of the liveness table.
pub async fn check_quorum(
    monitor: &LivenessMonitor,
    targets: &[String],
    quorum: Quorum,
) -> Result<QuorumCheck> {
    let total = targets.len();
    let required = quorum.required(total)?;
    let up_count = monitor.count_up(targets).await;

    Ok(QuorumCheck {
        satisfied: up_count >= required,
        up_count,
        required,
        total,
    })
}
