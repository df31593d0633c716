//! Wire payload types (task stream in, completion stream out)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Canonical Enums (used across all crates)
// ============================================================================

/// Recognized scanner families. Task messages naming anything else fail
/// validation at parse time, before any processing starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ScannerKind {
    /// Dependency / vulnerability scanner (manifests, lockfiles)
    Dependency,
    /// Antivirus / malware scanner (file contents)
    Antivirus,
}

impl ScannerKind {
    pub const ALL: &'static [ScannerKind] = &[ScannerKind::Dependency, ScannerKind::Antivirus];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScannerKind::Dependency => "dependency",
            ScannerKind::Antivirus => "antivirus",
        }
    }
}

impl fmt::Display for ScannerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ScannerKind {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dependency" => Ok(ScannerKind::Dependency),
            "antivirus" => Ok(ScannerKind::Antivirus),
            _ => Err(TaskError::UnknownScanner(s.to_string())),
        }
    }
}

/// Per-scanner status within one job. Terminal states (`Completed`,
/// `Failed`, `Cancelled`) are latched: a scanner never re-enters a
/// non-terminal state under the same job id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Pending => "pending",
            ScanStatus::Running => "running",
            ScanStatus::Completed => "completed",
            ScanStatus::Failed => "failed",
            ScanStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ScanStatus::Completed | ScanStatus::Failed | ScanStatus::Cancelled
        )
    }

    /// Monotonicity rank used by completion consumers to dedupe redelivered
    /// signals: pending < running < terminal.
    pub fn rank(&self) -> u8 {
        match self {
            ScanStatus::Pending => 0,
            ScanStatus::Running => 1,
            ScanStatus::Completed | ScanStatus::Failed | ScanStatus::Cancelled => 2,
        }
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ScanStatus {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ScanStatus::Pending),
            "running" => Ok(ScanStatus::Running),
            "completed" => Ok(ScanStatus::Completed),
            "failed" => Ok(ScanStatus::Failed),
            "cancelled" => Ok(ScanStatus::Cancelled),
            _ => Err(TaskError::UnknownStatus(s.to_string())),
        }
    }
}

/// Overall outcome of one processing run, carried in the completion signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    /// Every requested scanner succeeded
    Completed,
    /// At least one scanner failed, at least one succeeded
    Partial,
    /// Setup (validation, fetch, extract) failed before scanners ran
    Failed,
    /// Cancellation was observed during the run
    Cancelled,
}

impl OverallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallStatus::Completed => "completed",
            OverallStatus::Partial => "partial",
            OverallStatus::Failed => "failed",
            OverallStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Signature severity tiers.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Severity {
    type Err = TaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            _ => Err(TaskError::UnknownSeverity(s.to_string())),
        }
    }
}

// ============================================================================
// Task stream payload
// ============================================================================

/// One scan task, read off the task stream as the single `data` field of a
/// stream entry (UTF-8 JSON).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskMessage {
    pub job_id: String,
    pub tenant_id: String,
    pub artifact_uri: String,
    pub scanners: Vec<ScannerKind>,
    /// Per-task processing deadline; worker default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
    /// State retention override; worker default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<u64>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl TaskMessage {
    /// Parse a raw stream payload and validate it in one step.
    ///
    /// Unknown scanner names already fail inside serde (`ScannerKind` is a
    /// closed enum); the explicit checks cover the remaining invariants.
    pub fn from_json(raw: &str) -> Result<Self, TaskError> {
        let task: TaskMessage = serde_json::from_str(raw)?;
        task.validate()?;
        Ok(task)
    }

    pub fn validate(&self) -> Result<(), TaskError> {
        if self.job_id.trim().is_empty() {
            return Err(TaskError::MissingField("job_id"));
        }
        if self.tenant_id.trim().is_empty() {
            return Err(TaskError::MissingField("tenant_id"));
        }
        if self.artifact_uri.trim().is_empty() {
            return Err(TaskError::MissingField("artifact_uri"));
        }
        if self.scanners.is_empty() {
            return Err(TaskError::NoScanners);
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, TaskError> {
        Ok(serde_json::to_string(self)?)
    }
}

// ============================================================================
// Completion stream payload
// ============================================================================

/// The externally observable "done" marker, appended once per processing run
/// to `{completion_prefix}:{job_id}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletionPayload {
    pub job_id: String,
    pub status: OverallStatus,
    pub completed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<HashMap<ScannerKind, serde_json::Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<HashMap<ScannerKind, String>>,
}

impl CompletionPayload {
    pub fn new(job_id: impl Into<String>, status: OverallStatus) -> Self {
        Self {
            job_id: job_id.into(),
            status,
            completed_at: Utc::now(),
            results: None,
            errors: None,
        }
    }

    pub fn with_results(mut self, results: HashMap<ScannerKind, serde_json::Value>) -> Self {
        if !results.is_empty() {
            self.results = Some(results);
        }
        self
    }

    pub fn with_errors(mut self, errors: HashMap<ScannerKind, String>) -> Self {
        if !errors.is_empty() {
            self.errors = Some(errors);
        }
        self
    }
}

// ============================================================================
// Dependency scanning shapes (shared by cache and scanner)
// ============================================================================

/// Identity of one package occurrence: the cache key triple.
/// Comparison is case-sensitive on all three parts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageRef {
    pub ecosystem: String,
    pub name: String,
    pub version: String,
}

impl PackageRef {
    pub fn new(
        ecosystem: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            ecosystem: ecosystem.into(),
            name: name.into(),
            version: version.into(),
        }
    }

    /// Deterministic cache key: `ecosystem:name:version`.
    pub fn cache_key(&self) -> String {
        format!("{}:{}:{}", self.ecosystem, self.name, self.version)
    }
}

impl fmt::Display for PackageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({})", self.name, self.version, self.ecosystem)
    }
}

/// One known vulnerability affecting a package version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vulnerability {
    pub id: String,
    pub package: String,
    pub version: String,
    pub ecosystem: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fixed_version: Option<String>,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("malformed task payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("task field must not be empty: {0}")]
    MissingField(&'static str),
    #[error("task requests no scanners")]
    NoScanners,
    #[error("unknown scanner: '{0}'. Expected: dependency or antivirus")]
    UnknownScanner(String),
    #[error("unknown scan status: '{0}'")]
    UnknownStatus(String),
    #[error("unknown severity: '{0}'. Expected: low, medium, high, or critical")]
    UnknownSeverity(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_message_roundtrip() {
        let task = TaskMessage {
            job_id: "j1".to_string(),
            tenant_id: "org-A".to_string(),
            artifact_uri: "gs://bkt/org-A/clean.zip".to_string(),
            scanners: vec![ScannerKind::Dependency, ScannerKind::Antivirus],
            timeout_seconds: Some(300),
            ttl_seconds: None,
            retry_count: 0,
            created_at: None,
        };

        let json = task.to_json().unwrap();
        let parsed = TaskMessage::from_json(&json).unwrap();
        assert_eq!(parsed, task);
    }

    #[test]
    fn unknown_scanner_fails_at_parse_time() {
        let raw = r#"{
            "job_id": "j1",
            "tenant_id": "org-A",
            "artifact_uri": "gs://bkt/org-A/x.zip",
            "scanners": ["antivirus", "quantum"]
        }"#;
        let err = TaskMessage::from_json(raw).unwrap_err();
        assert!(matches!(err, TaskError::Malformed(_)));
    }

    #[test]
    fn empty_fields_rejected() {
        let raw = r#"{
            "job_id": "",
            "tenant_id": "org-A",
            "artifact_uri": "gs://bkt/org-A/x.zip",
            "scanners": ["antivirus"]
        }"#;
        assert!(matches!(
            TaskMessage::from_json(raw),
            Err(TaskError::MissingField("job_id"))
        ));

        let raw = r#"{
            "job_id": "j1",
            "tenant_id": "org-A",
            "artifact_uri": "gs://bkt/org-A/x.zip",
            "scanners": []
        }"#;
        assert!(matches!(
            TaskMessage::from_json(raw),
            Err(TaskError::NoScanners)
        ));
    }

    #[test]
    fn status_terminality_and_rank() {
        assert!(!ScanStatus::Pending.is_terminal());
        assert!(!ScanStatus::Running.is_terminal());
        assert!(ScanStatus::Completed.is_terminal());
        assert!(ScanStatus::Failed.is_terminal());
        assert!(ScanStatus::Cancelled.is_terminal());

        assert!(ScanStatus::Pending.rank() < ScanStatus::Running.rank());
        assert!(ScanStatus::Running.rank() < ScanStatus::Failed.rank());
        assert_eq!(ScanStatus::Completed.rank(), ScanStatus::Cancelled.rank());
    }

    #[test]
    fn completion_payload_omits_empty_maps() {
        let payload = CompletionPayload::new("j1", OverallStatus::Completed)
            .with_results(HashMap::new())
            .with_errors(HashMap::new());
        let json = serde_json::to_string(&payload).unwrap();
        assert!(!json.contains("results"));
        assert!(!json.contains("errors"));
        assert!(json.contains(r#""status":"completed""#));
    }

    #[test]
    fn scanner_kind_string_roundtrip() {
        for kind in ScannerKind::ALL {
            assert_eq!(*kind, kind.as_str().parse::<ScannerKind>().unwrap());
        }
        assert!("clamav".parse::<ScannerKind>().is_err());
    }

    #[test]
    fn package_ref_cache_key_is_case_sensitive() {
        let a = PackageRef::new("pip", "requests", "2.31.0");
        let b = PackageRef::new("pip", "Requests", "2.31.0");
        assert_eq!(a.cache_key(), "pip:requests:2.31.0");
        assert_ne!(a.cache_key(), b.cache_key());
    }
}
