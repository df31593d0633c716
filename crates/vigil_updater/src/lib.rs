//! Background database-update supervisor.
//!
//! Scanner inputs (virus signatures, the vulnerability snapshot, hash feeds)
//! refresh on independent schedules. Each source gets its own ticker; ticks
//! for one source are serialized while different sources update
//! concurrently. Failures retry under jittered exponential backoff; once
//! retries are exhausted the source parks as `failed` until its normal
//! interval comes around again.
//!
//! The orchestrator and the supervisor collaborate through two one-way
//! interfaces: `ReadinessProvider` (supervisor answers "is this source
//! usable?") and `ScanCounter` (orchestrator reports scans in flight, which
//! scan-sensitive sources defer to).

pub mod backoff;
pub mod gate;
pub mod sources;
pub mod status;
pub mod supervisor;

pub use backoff::Backoff;
pub use gate::{NoopReadiness, ReadinessProvider, ScanCounter, ScanGate};
pub use sources::{
    required_sources, SignatureFeedSource, UpdateError, UpdateSource, VirusDatabaseSource,
    VulnDatabaseSource, SOURCE_SIGNATURE_FEED, SOURCE_VIRUS_DB, SOURCE_VULN_DB,
};
pub use status::{SourceState, SourceStatus};
pub use supervisor::{SourceSpec, UpdateSupervisor};
