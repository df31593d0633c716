//! Two-tier signature lookup engine.
//!
//! Tier one is an in-memory bloom filter: the common "never seen this hash"
//! case answers without touching disk. Tier two is the authoritative sqlite
//! store. The bloom layer is an optimization only - every verdict that
//! matters comes from the store, and a store read error is surfaced, never
//! silently treated as clean.

pub mod bloom;
pub mod engine;
pub mod error;
pub mod model;
pub mod store;

pub use bloom::BloomSnapshot;
pub use engine::{EngineConfig, EngineStats, Lookup, SignatureEngine, Verdict};
pub use error::SignatureError;
pub use model::{ContentHash, Signature};
pub use store::SignatureStore;
