//! The update supervisor: one ticker per source.
//!
//! Ticks for one source are serialized (each source runs inside its own
//! task); different sources update concurrently. A scan-sensitive source
//! waits for the scan gate to drain before touching files a scanner might be
//! reading. Failures schedule a backoff retry until the retry budget is
//! spent, then the source parks as `failed` until the next regular interval.

use crate::backoff::Backoff;
use crate::gate::{ReadinessProvider, ScanGate};
use crate::sources::{UpdateError, UpdateSource};
use crate::status::{SourceState, SourceStatus};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Registration of one source with the supervisor.
pub struct SourceSpec {
    pub source: Arc<dyn UpdateSource>,
    /// Regular refresh interval.
    pub interval: Duration,
    /// Defer updates while scans are in flight (database files are swapped
    /// on disk while a scanner may be reading them).
    pub scan_sensitive: bool,
    /// Retry policy on failure.
    pub backoff: Backoff,
}

impl SourceSpec {
    pub fn new(source: Arc<dyn UpdateSource>, interval: Duration) -> Self {
        Self {
            source,
            interval,
            scan_sensitive: false,
            backoff: Backoff::default(),
        }
    }

    pub fn scan_sensitive(mut self) -> Self {
        self.scan_sensitive = true;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

struct SourceEntry {
    spec: SourceSpec,
    backoff: Mutex<Backoff>,
}

pub struct UpdateSupervisor {
    entries: Vec<Arc<SourceEntry>>,
    gate: Arc<ScanGate>,
    statuses: Arc<RwLock<HashMap<String, SourceStatus>>>,
}

impl UpdateSupervisor {
    pub fn new(gate: Arc<ScanGate>) -> Self {
        Self {
            entries: Vec::new(),
            gate,
            statuses: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn register(&mut self, spec: SourceSpec) {
        let name = spec.source.name().to_string();
        let version = spec.source.current_version();
        write_lock(&self.statuses).insert(
            name.clone(),
            SourceStatus {
                name,
                state: SourceState::Pending,
                version,
                ..Default::default()
            },
        );
        let backoff = spec.backoff.clone();
        self.entries.push(Arc::new(SourceEntry {
            spec,
            backoff: Mutex::new(backoff),
        }));
    }

    /// Spawn one ticker task per registered source. Each runs a bootstrap
    /// pass immediately, then follows the interval / backoff schedule until
    /// `stop` fires.
    pub fn run(&self, stop: CancellationToken) -> Vec<JoinHandle<()>> {
        self.entries
            .iter()
            .map(|entry| {
                let entry = Arc::clone(entry);
                let gate = Arc::clone(&self.gate);
                let statuses = Arc::clone(&self.statuses);
                let stop = stop.clone();
                tokio::spawn(async move {
                    ticker_loop(entry, gate, statuses, stop).await;
                })
            })
            .collect()
    }

    /// One-shot update of a single source (CLI `update` command). Returns
    /// the installed version.
    pub async fn force_update(&self, name: &str) -> Result<String, UpdateError> {
        let entry = self
            .entries
            .iter()
            .find(|entry| entry.spec.source.name() == name)
            .ok_or_else(|| UpdateError::Process(format!("unknown source '{}'", name)))?;
        let cancel = CancellationToken::new();
        let result = attempt_update(entry, &self.statuses, &cancel).await;
        if let Err(err) = &result {
            record_failure(entry, &self.statuses, SourceState::Failed, err, None);
        }
        result
    }

    /// Snapshot of all source statuses.
    pub fn status(&self) -> Vec<SourceStatus> {
        let mut statuses: Vec<SourceStatus> =
            read_lock(&self.statuses).values().cloned().collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Handle implementing `ReadinessProvider` for the orchestrator side.
    pub fn readiness(&self) -> Arc<dyn ReadinessProvider> {
        Arc::new(SupervisorReadiness {
            statuses: Arc::clone(&self.statuses),
        })
    }
}

struct SupervisorReadiness {
    statuses: Arc<RwLock<HashMap<String, SourceStatus>>>,
}

impl ReadinessProvider for SupervisorReadiness {
    fn is_ready(&self, source: &str) -> bool {
        read_lock(&self.statuses)
            .get(source)
            .map(|status| status.ready)
            .unwrap_or(false)
    }
}

async fn ticker_loop(
    entry: Arc<SourceEntry>,
    gate: Arc<ScanGate>,
    statuses: Arc<RwLock<HashMap<String, SourceStatus>>>,
    stop: CancellationToken,
) {
    let name = entry.spec.source.name().to_string();
    info!(
        "Update ticker for '{}' started (interval {:?})",
        name, entry.spec.interval
    );

    // Bootstrap pass first, then the regular schedule
    let mut delay = Duration::ZERO;
    loop {
        if delay > Duration::ZERO {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.cancelled() => break,
            }
        }
        if stop.is_cancelled() {
            break;
        }

        if entry.spec.scan_sensitive {
            tokio::select! {
                _ = gate.wait_idle() => {}
                _ = stop.cancelled() => break,
            }
        }

        match attempt_update(&entry, &statuses, &stop.child_token()).await {
            Ok(_) => {
                delay = entry.spec.interval;
            }
            Err(UpdateError::Cancelled) => break,
            Err(err) => {
                let retry = lock_backoff(&entry.backoff).next_delay();
                match retry {
                    Some(retry_delay) => {
                        warn!(
                            "Source '{}' update failed, retrying in {:?}: {}",
                            name, retry_delay, err
                        );
                        record_failure(
                            &entry,
                            &statuses,
                            SourceState::Backoff,
                            &err,
                            Some(retry_delay),
                        );
                        delay = retry_delay;
                    }
                    None => {
                        error!(
                            "Source '{}' update failed, retries exhausted: {}",
                            name, err
                        );
                        record_failure(
                            &entry,
                            &statuses,
                            SourceState::Failed,
                            &err,
                            Some(entry.spec.interval),
                        );
                        // Next regular cycle starts with a fresh retry budget
                        lock_backoff(&entry.backoff).reset();
                        delay = entry.spec.interval;
                    }
                }
            }
        }
    }
    info!("Update ticker for '{}' stopped", name);
}

/// One update attempt. On success the status map records the new version
/// and the backoff resets; on failure the caller decides between backoff
/// and parked-failed.
async fn attempt_update(
    entry: &SourceEntry,
    statuses: &RwLock<HashMap<String, SourceStatus>>,
    cancel: &CancellationToken,
) -> Result<String, UpdateError> {
    let source = &entry.spec.source;
    let name = source.name().to_string();

    update_status(statuses, &name, |status| {
        status.state = SourceState::Running;
        // Previously installed data stays usable while the refresh runs
    });

    let version = source.update(cancel).await?;

    lock_backoff(&entry.backoff).reset();
    let now = Utc::now();
    update_status(statuses, &name, |status| {
        status.state = SourceState::Success;
        status.version = Some(version.clone());
        status.last_update = Some(now);
        status.next_update = Some(now + chrono_interval(entry.spec.interval));
        status.last_error = None;
        status.ready = SourceStatus::compute_ready(&status.version, SourceState::Success);
    });
    info!("Source '{}' updated to version {}", name, version);
    Ok(version)
}

fn record_failure(
    entry: &SourceEntry,
    statuses: &RwLock<HashMap<String, SourceStatus>>,
    state: SourceState,
    err: &UpdateError,
    next_in: Option<Duration>,
) {
    let name = entry.spec.source.name();
    let now = Utc::now();
    update_status(statuses, name, |status| {
        status.state = state;
        status.last_error = Some(err.to_string());
        status.next_update = next_in.map(|delay| now + chrono_interval(delay));
        status.ready = SourceStatus::compute_ready(&status.version, state);
    });
}

fn chrono_interval(interval: Duration) -> chrono::Duration {
    chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::hours(1))
}

fn update_status(
    statuses: &RwLock<HashMap<String, SourceStatus>>,
    name: &str,
    apply: impl FnOnce(&mut SourceStatus),
) {
    let mut map = write_lock(statuses);
    let status = map.entry(name.to_string()).or_insert_with(|| SourceStatus {
        name: name.to_string(),
        ..Default::default()
    });
    apply(status);
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poison| poison.into_inner())
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poison| poison.into_inner())
}

fn lock_backoff(backoff: &Mutex<Backoff>) -> std::sync::MutexGuard<'_, Backoff> {
    backoff.lock().unwrap_or_else(|poison| poison.into_inner())
}
