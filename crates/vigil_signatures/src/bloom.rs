//! Bloom pre-filter over the signature store.
//!
//! A snapshot is immutable from a reader's point of view: lookups race with
//! rebuilds by holding an `Arc` to whichever snapshot was live when they
//! started. No false negatives: every hash in the store is inserted into the
//! snapshot that replaces it, so a stale snapshot is always a subset of the
//! store.

use bloomfilter::Bloom;

/// One generation of the bloom filter, sized for an expected population and
/// target false-positive rate.
pub struct BloomSnapshot {
    bloom: Bloom<Vec<u8>>,
    items: usize,
    capacity: usize,
    fp_rate: f64,
}

impl BloomSnapshot {
    pub fn new(expected_items: usize, fp_rate: f64) -> Self {
        let capacity = expected_items.max(1);
        let fp_rate = if fp_rate > 0.0 && fp_rate < 1.0 {
            fp_rate
        } else {
            0.001
        };
        Self {
            bloom: Bloom::new_for_fp_rate(capacity, fp_rate),
            items: 0,
            capacity,
            fp_rate,
        }
    }

    pub fn insert(&mut self, hash: &[u8]) {
        self.bloom.set(&hash.to_vec());
        self.items += 1;
    }

    pub fn contains(&self, hash: &[u8]) -> bool {
        self.bloom.check(&hash.to_vec())
    }

    /// Inserted item count (not deduplicated).
    pub fn len(&self) -> usize {
        self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn fp_rate(&self) -> f64 {
        self.fp_rate
    }

    /// Bit-array size in bytes for the configured (capacity, fp_rate).
    pub fn size_bytes(&self) -> usize {
        let n = self.capacity as f64;
        let bits = (n * (1.0 / self.fp_rate).ln() / (2f64.ln() * 2f64.ln())).ceil();
        (bits / 8.0).ceil() as usize
    }
}
