use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::dispatch::job::TargetSpec;
use crate::error::{Result, ShoveyError};
use crate::liveness::LivenessMonitor;

/// Turns a [`TargetSpec`] into concrete node names.
#[async_trait]
pub trait TargetResolver: Send + Sync {
    async fn resolve(&self, spec: &TargetSpec) -> Result<Vec<String>>;
}

/// Resolves explicit lists as given and search expressions as name globs
/// over the nodes the liveness monitor has heard from.
///
/// Supported expressions are `*`, `<glob>` and `name:<glob>`, where `*`
/// matches any run of characters.
pub struct KnownNodeResolver {
    monitor: Arc<LivenessMonitor>,
}

impl KnownNodeResolver {
    pub fn new(monitor: Arc<LivenessMonitor>) -> Self {
        Self { monitor }
    }
}

#[async_trait]
impl TargetResolver for KnownNodeResolver {
    async fn resolve(&self, spec: &TargetSpec) -> Result<Vec<String>> {
        match spec {
            TargetSpec::Nodes(names) => Ok(dedup(names.iter().map(|n| n.trim().to_string()))),
            TargetSpec::Search(expr) => {
                let pattern = parse_search(expr)?;
                let known = self.monitor.known_nodes().await;
                Ok(known
                    .into_iter()
                    .filter(|name| glob_match(pattern, name))
                    .collect())
            }
        }
    }
}

fn dedup(names: impl Iterator<Item = String>) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .filter(|name| !name.is_empty())
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

fn parse_search(expr: &str) -> Result<&str> {
    let expr = expr.trim();
    let pattern = match expr.split_once(':') {
        Some(("name", pattern)) => pattern.trim(),
        Some((field, _)) => {
            return Err(ShoveyError::Resolve(format!(
                "unsupported search field '{}'",
                field
            )))
        }
        None => expr,
    };
    if pattern.is_empty() {
        return Err(ShoveyError::Resolve("empty search expression".to_string()));
    }
    Ok(pattern)
}

fn glob_match(pattern: &str, name: &str) -> bool {
    let mut parts = pattern.split('*');
    // split always yields at least one item
    let first = parts.next().unwrap_or_default();
    let Some(mut rest) = name.strip_prefix(first) else {
        return false;
    };

    let parts: Vec<&str> = parts.collect();
    let Some((last, middle)) = parts.split_last() else {
        // no wildcard
        return rest.is_empty();
    };

    for part in middle {
        match rest.find(part) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    rest.len() >= last.len() && rest.ends_with(last)
}
