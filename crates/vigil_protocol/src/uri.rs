//! Artifact URI parsing and tenant path enforcement.
//!
//! Artifacts live in object storage addressed as `scheme://bucket/object-path`.
//! The object path is validated against the owning tenant before any fetch is
//! attempted: after normalization it must begin with `{tenant_id}/`, and
//! traversal sequences reject outright.

use std::fmt;
use thiserror::Error;

/// Parsed object-storage location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactUri {
    pub scheme: String,
    pub bucket: String,
    pub object: String,
}

impl ArtifactUri {
    /// Parse `scheme://bucket/object-path`.
    pub fn parse(raw: &str) -> Result<Self, UriError> {
        let raw = raw.trim();
        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| UriError::MissingScheme(raw.to_string()))?;
        if scheme.is_empty() {
            return Err(UriError::MissingScheme(raw.to_string()));
        }

        let (bucket, object) = rest
            .split_once('/')
            .ok_or_else(|| UriError::MissingObject(raw.to_string()))?;
        if bucket.is_empty() {
            return Err(UriError::MissingBucket(raw.to_string()));
        }
        if object.is_empty() {
            return Err(UriError::MissingObject(raw.to_string()));
        }

        Ok(Self {
            scheme: scheme.to_string(),
            bucket: bucket.to_string(),
            object: object.to_string(),
        })
    }

    /// Normalize the object path: forward slashes only, no empty or `.`
    /// segments, and any `..` segment is an error rather than resolved.
    pub fn normalized_object(&self) -> Result<String, UriError> {
        if self.object.contains('\\') {
            return Err(UriError::PathTraversal(self.object.clone()));
        }
        let mut parts = Vec::new();
        for segment in self.object.split('/') {
            match segment {
                "" | "." => continue,
                ".." => return Err(UriError::PathTraversal(self.object.clone())),
                other => parts.push(other),
            }
        }
        if parts.is_empty() {
            return Err(UriError::MissingObject(self.to_string()));
        }
        Ok(parts.join("/"))
    }

    /// Enforce tenant ownership: the normalized object path must begin with
    /// `{tenant_id}/`. Returns the normalized path on success so the fetch
    /// uses exactly what was validated.
    pub fn enforce_tenant(&self, tenant_id: &str) -> Result<String, UriError> {
        let normalized = self.normalized_object()?;
        let prefix = format!("{}/", tenant_id);
        if tenant_id.is_empty() || !normalized.starts_with(&prefix) {
            return Err(UriError::TenantMismatch {
                tenant: tenant_id.to_string(),
                object: normalized,
            });
        }
        Ok(normalized)
    }

    /// Last path segment, used for the local download name.
    pub fn file_name(&self) -> &str {
        self.object.rsplit('/').next().unwrap_or(&self.object)
    }
}

impl fmt::Display for ArtifactUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}/{}", self.scheme, self.bucket, self.object)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UriError {
    #[error("artifact URI has no scheme: '{0}'")]
    MissingScheme(String),
    #[error("artifact URI has no bucket: '{0}'")]
    MissingBucket(String),
    #[error("artifact URI has no object path: '{0}'")]
    MissingObject(String),
    #[error("object path contains traversal sequences: '{0}'")]
    PathTraversal(String),
    #[error("invalid path for tenant '{tenant}': '{object}'")]
    TenantMismatch { tenant: String, object: String },
}
