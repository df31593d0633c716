//! Vigil state store (shared control-plane persistence).
//!
//! One trait, two backends. `StateBackend` captures everything the pipeline
//! needs from its shared store: hash fields with TTL for job state, pub/sub
//! channels for cancellation, and ordered streams with consumer groups for
//! task intake and completion signals.
//!
//! `RedisBackend` is the store of record; `MemoryBackend` is a faithful
//! in-process implementation used by tests and standalone mode. Everything
//! above the trait (state manager, stream consumer, completion publisher) is
//! backend-agnostic.

pub mod backend;
pub mod completion;
pub mod consumer;
pub mod error;
pub mod memory;
pub mod redis_backend;
pub mod state;

pub use backend::{connect, StateBackend, StreamEntry, Subscription};
pub use completion::CompletionPublisher;
pub use consumer::{ConsumerConfig, StreamConsumer};
pub use error::StoreError;
pub use memory::MemoryBackend;
pub use redis_backend::RedisBackend;
pub use state::StateManager;
