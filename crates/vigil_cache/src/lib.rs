//! Per-package vulnerability cache.
//!
//! Dependency scanners send the same package lists on every run of the same
//! project; caching by the `(ecosystem, name, version)` triple saves the
//! repeated remote queries. An empty vulnerability list is a legitimate
//! cached value ("scanned and clean") and is stored distinctly from absence.
//!
//! Expiry is enforced twice: the store applies a TTL to the key, and the
//! envelope carries its own `expires_at` that `get` checks - a physically
//! present entry past its expiry is a miss.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};
use vigil_protocol::{keys, PackageRef, Vulnerability};
use vigil_store::{StateBackend, StoreError};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache store error: {0}")]
    Store(#[from] StoreError),
    #[error("cache entry serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// The stored envelope for one package triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEnvelope {
    vulnerabilities: Vec<Vulnerability>,
    scanned_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct VulnCache {
    backend: Arc<dyn StateBackend>,
    prefix: String,
    ttl: Duration,
}

impl VulnCache {
    pub fn new(backend: Arc<dyn StateBackend>, prefix: impl Into<String>, ttl: Duration) -> Self {
        Self {
            backend,
            prefix: prefix.into(),
            ttl,
        }
    }

    fn key(&self, package: &PackageRef) -> String {
        keys::cache_key(&self.prefix, package)
    }

    /// Cached vulnerabilities for one package, or `None` on a miss. An entry
    /// past its embedded expiry is a miss even if the store still holds it.
    pub async fn get(&self, package: &PackageRef) -> Result<Option<Vec<Vulnerability>>, CacheError> {
        let Some(raw) = self.backend.string_get(&self.key(package)).await? else {
            return Ok(None);
        };
        let envelope: CacheEnvelope = serde_json::from_str(&raw)?;
        if Utc::now() > envelope.expires_at {
            debug!("Cache entry for {} expired in place", package);
            return Ok(None);
        }
        Ok(Some(envelope.vulnerabilities))
    }

    /// Store the scan outcome for a package. An empty list means "scanned
    /// and clean" and is cached like any other value.
    pub async fn set(
        &self,
        package: &PackageRef,
        vulnerabilities: &[Vulnerability],
    ) -> Result<(), CacheError> {
        let now = Utc::now();
        let envelope = CacheEnvelope {
            vulnerabilities: vulnerabilities.to_vec(),
            scanned_at: now,
            expires_at: now
                + ChronoDuration::from_std(self.ttl).unwrap_or(ChronoDuration::hours(24)),
        };
        let raw = serde_json::to_string(&envelope)?;
        self.backend
            .string_set(&self.key(package), &raw, Some(self.ttl))
            .await?;
        Ok(())
    }

    /// Partition a package list into cache hits and misses. The partitions
    /// are disjoint; a per-key store or decode error demotes that key to a
    /// miss rather than failing the batch.
    pub async fn get_multiple(
        &self,
        packages: &[PackageRef],
    ) -> (HashMap<PackageRef, Vec<Vulnerability>>, Vec<PackageRef>) {
        let mut hits = HashMap::new();
        let mut misses = Vec::new();
        for package in packages {
            match self.get(package).await {
                Ok(Some(vulnerabilities)) => {
                    hits.insert(package.clone(), vulnerabilities);
                }
                Ok(None) => misses.push(package.clone()),
                Err(err) => {
                    warn!("Cache read for {} failed, treating as miss: {}", package, err);
                    misses.push(package.clone());
                }
            }
        }
        (hits, misses)
    }

    /// Sweep entries whose embedded expiry has passed. Returns the number
    /// removed. The store's own TTL usually gets there first; this catches
    /// entries written with a longer key TTL than envelope expiry.
    pub async fn cleanup(&self) -> Result<usize, CacheError> {
        let keys = self.backend.scan_keys(&format!("{}:", self.prefix)).await?;
        let now = Utc::now();
        let mut removed = 0;
        for key in keys {
            let Some(raw) = self.backend.string_get(&key).await? else {
                continue;
            };
            let expired = match serde_json::from_str::<CacheEnvelope>(&raw) {
                Ok(envelope) => now > envelope.expires_at,
                // Undecodable entries are dead weight; sweep them too.
                Err(_) => true,
            };
            if expired && self.backend.delete(&key).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
