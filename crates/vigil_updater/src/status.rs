//! Per-source status snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
    #[default]
    Pending,
    Running,
    Success,
    Failed,
    Backoff,
}

impl SourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceState::Pending => "pending",
            SourceState::Running => "running",
            SourceState::Success => "success",
            SourceState::Failed => "failed",
            SourceState::Backoff => "backoff",
        }
    }
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot of one source as reported by the supervisor.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SourceStatus {
    pub name: String,
    pub state: SourceState,
    pub last_update: Option<DateTime<Utc>>,
    pub next_update: Option<DateTime<Utc>>,
    /// Version/sequence of the last successfully installed data.
    pub version: Option<String>,
    pub last_error: Option<String>,
    /// Ready = non-empty version AND state in {success, backoff}. Backoff
    /// still means valid data from a previous run is installed.
    pub ready: bool,
}

impl SourceStatus {
    pub fn compute_ready(version: &Option<String>, state: SourceState) -> bool {
        version.as_deref().map(|v| !v.is_empty()).unwrap_or(false)
            && matches!(state, SourceState::Success | SourceState::Backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_rule() {
        let version = Some("20260801".to_string());
        assert!(SourceStatus::compute_ready(&version, SourceState::Success));
        assert!(SourceStatus::compute_ready(&version, SourceState::Backoff));
        assert!(!SourceStatus::compute_ready(&version, SourceState::Failed));
        assert!(!SourceStatus::compute_ready(&version, SourceState::Pending));
        assert!(!SourceStatus::compute_ready(&None, SourceState::Success));
        assert!(!SourceStatus::compute_ready(
            &Some(String::new()),
            SourceState::Success
        ));
    }
}
