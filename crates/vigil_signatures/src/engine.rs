//! The signature engine: bloom fast path composed over the sqlite store.
//!
//! The bloom filter is shared read-mostly. Rebuilds construct the new filter
//! entirely outside the lock (the expensive part) and swap it in under a
//! short write lock; a lookup racing the swap sees either generation, and
//! both are supersets of nothing-removed, so no false negatives either way.

use crate::bloom::BloomSnapshot;
use crate::error::SignatureError;
use crate::model::{ContentHash, Signature};
use crate::store::SignatureStore;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Expected signature population, for bloom sizing.
    pub expected_items: usize,
    /// Target bloom false-positive rate.
    pub fp_rate: f64,
    /// Rebuild the bloom from the store during `open`.
    pub rebuild_on_open: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            expected_items: vigil_protocol::defaults::DEFAULT_BLOOM_EXPECTED_ITEMS,
            fp_rate: vigil_protocol::defaults::DEFAULT_BLOOM_FP_RATE,
            rebuild_on_open: true,
        }
    }
}

/// Verdict of a lookup. A store read error is the `Err` branch of the
/// lookup result, never a verdict - the caller decides how to surface it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Clean,
    Malware,
}

/// Outcome of one lookup.
#[derive(Debug)]
pub struct Lookup {
    pub verdict: Verdict,
    pub signature: Option<Signature>,
    /// Whether the bloom layer reported a possible hit (and the store was
    /// therefore consulted).
    pub bloom_hit: bool,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct EngineStats {
    pub signature_count: u64,
    pub bloom_items: usize,
    pub bloom_size_bytes: usize,
    /// Bloom positives that the store then rejected. Observational only.
    pub bloom_false_positives: u64,
}

pub struct SignatureEngine {
    store: SignatureStore,
    bloom: RwLock<BloomSnapshot>,
    config: EngineConfig,
    fp_count: AtomicU64,
}

impl SignatureEngine {
    /// Open the engine over the store at `path`. Store open errors are fatal
    /// here; there is no degraded mode without the authoritative tier.
    pub async fn open(path: &Path, config: EngineConfig) -> Result<Self, SignatureError> {
        let store = SignatureStore::open(path).await?;
        let engine = Self {
            store,
            bloom: RwLock::new(BloomSnapshot::new(config.expected_items, config.fp_rate)),
            config,
            fp_count: AtomicU64::new(0),
        };
        if engine.config.rebuild_on_open {
            let count = engine.rebuild_bloom().await?;
            info!("Bloom filter warmed with {} hashes", count);
        }
        Ok(engine)
    }

    /// Two-tier lookup: bloom first, store only on a possible hit.
    pub async fn lookup(&self, hash: &ContentHash) -> Result<Lookup, SignatureError> {
        let start = Instant::now();

        let bloom_hit = self.read_bloom(|bloom| bloom.contains(hash.as_bytes()));
        if !bloom_hit {
            return Ok(Lookup {
                verdict: Verdict::Clean,
                signature: None,
                bloom_hit: false,
                elapsed: start.elapsed(),
            });
        }

        // Possible hit: the store is authoritative. Errors propagate; a read
        // failure must not read as clean.
        match self.store.get(hash).await? {
            Some(signature) => Ok(Lookup {
                verdict: Verdict::Malware,
                signature: Some(signature),
                bloom_hit: true,
                elapsed: start.elapsed(),
            }),
            None => {
                self.fp_count.fetch_add(1, Ordering::Relaxed);
                debug!("Bloom false positive for {}", hash);
                Ok(Lookup {
                    verdict: Verdict::Clean,
                    signature: None,
                    bloom_hit: true,
                    elapsed: start.elapsed(),
                })
            }
        }
    }

    /// Idempotent single add: store write plus incremental bloom update.
    pub async fn add_signature(&self, sig: &Signature) -> Result<(), SignatureError> {
        self.store.upsert(sig).await?;
        self.with_bloom_mut(|bloom| {
            for hash in sig.all_hashes() {
                bloom.insert(&hash);
            }
        });
        Ok(())
    }

    /// Bulk-optimized path. Safe to call concurrently with `lookup`; bloom
    /// integration happens under one short write lock after the store
    /// transaction commits.
    pub async fn add_signatures(&self, sigs: &[Signature]) -> Result<(), SignatureError> {
        if sigs.is_empty() {
            return Ok(());
        }
        self.store.upsert_batch(sigs).await?;
        self.with_bloom_mut(|bloom| {
            for sig in sigs {
                for hash in sig.all_hashes() {
                    bloom.insert(&hash);
                }
            }
        });
        Ok(())
    }

    /// Rebuild the bloom from the store and atomically swap it in. The
    /// expensive construction happens off-lock; the swap itself is a move.
    pub async fn rebuild_bloom(&self) -> Result<usize, SignatureError> {
        let hashes = self.store.all_hashes().await?;
        let expected = hashes.len().max(self.config.expected_items);
        let mut fresh = BloomSnapshot::new(expected, self.config.fp_rate);
        for hash in &hashes {
            fresh.insert(hash);
        }
        let count = hashes.len();

        self.with_bloom_mut(|bloom| *bloom = fresh);

        debug!("Bloom rebuild complete: {} hashes", count);
        Ok(count)
    }

    pub async fn stats(&self) -> Result<EngineStats, SignatureError> {
        let (bloom_items, bloom_size_bytes) =
            self.read_bloom(|bloom| (bloom.len(), bloom.size_bytes()));
        Ok(EngineStats {
            signature_count: self.store.count().await?,
            bloom_items,
            bloom_size_bytes,
            bloom_false_positives: self.fp_count.load(Ordering::Relaxed),
        })
    }

    pub fn store(&self) -> &SignatureStore {
        &self.store
    }

    fn read_bloom<T>(&self, f: impl FnOnce(&BloomSnapshot) -> T) -> T {
        let guard = self
            .bloom
            .read()
            .unwrap_or_else(|poison| poison.into_inner());
        f(&guard)
    }

    fn with_bloom_mut(&self, f: impl FnOnce(&mut BloomSnapshot)) {
        let mut guard = self
            .bloom
            .write()
            .unwrap_or_else(|poison| poison.into_inner());
        f(&mut guard);
    }
}
