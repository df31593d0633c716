//! Authoritative signature store (sqlite via sqlx).
//!
//! Hashes are stored as lowercase hex. The primary SHA-256 is the row key;
//! unique indexes on the secondary tiers keep the "secondary resolves to at
//! most one primary" invariant at the schema level (sqlite treats NULLs as
//! distinct in unique indexes, so absent secondaries don't collide).

use crate::error::SignatureError;
use crate::model::{ContentHash, Signature};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use tracing::info;
use vigil_protocol::Severity;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS signatures (
        sha256         TEXT PRIMARY KEY,
        sha1           TEXT,
        md5            TEXT,
        detection_name TEXT NOT NULL,
        family         TEXT NOT NULL,
        severity       TEXT NOT NULL,
        source         TEXT NOT NULL,
        first_seen     TEXT NOT NULL
    )
    "#,
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_signatures_sha1 ON signatures(sha1)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_signatures_md5 ON signatures(md5)",
];

pub struct SignatureStore {
    pool: SqlitePool,
}

impl SignatureStore {
    /// Open (creating if missing) the store at `path`. Failure here is fatal
    /// to engine construction.
    pub async fn open(path: &Path) -> Result<Self, SignatureError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(SignatureError::Open)?;

        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(SignatureError::Open)?;
        }

        info!("Opened signature store at {}", path.display());
        Ok(Self { pool })
    }

    /// Insert or replace a record. Replace semantics: a re-ingested primary
    /// hash takes the new attributes wholesale.
    pub async fn upsert(&self, sig: &Signature) -> Result<(), SignatureError> {
        upsert_query(sig).execute(&self.pool).await?;
        Ok(())
    }

    /// Bulk upsert in one transaction.
    pub async fn upsert_batch(&self, sigs: &[Signature]) -> Result<(), SignatureError> {
        let mut tx = self.pool.begin().await?;
        for sig in sigs {
            upsert_query(sig).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Look a record up by any hash tier.
    pub async fn get(&self, hash: &ContentHash) -> Result<Option<Signature>, SignatureError> {
        let column = match hash {
            ContentHash::Sha256(_) => "sha256",
            ContentHash::Sha1(_) => "sha1",
            ContentHash::Md5(_) => "md5",
        };
        let query = format!(
            "SELECT sha256, sha1, md5, detection_name, family, severity, source, first_seen \
             FROM signatures WHERE {} = ?",
            column
        );
        let row = sqlx::query(&query)
            .bind(hash.to_hex())
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| decode_row(&row)).transpose()
    }

    pub async fn count(&self) -> Result<u64, SignatureError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM signatures")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    /// Every hash of every tier, as raw bytes. Drives bloom rebuilds.
    pub async fn all_hashes(&self) -> Result<Vec<Vec<u8>>, SignatureError> {
        let rows = sqlx::query("SELECT sha256, sha1, md5 FROM signatures")
            .fetch_all(&self.pool)
            .await?;

        let mut hashes = Vec::with_capacity(rows.len());
        for row in &rows {
            hashes.push(decode_hex_column(row, "sha256")?);
            for column in ["sha1", "md5"] {
                if let Some(secondary) = decode_optional_hex_column(row, column)? {
                    hashes.push(secondary);
                }
            }
        }
        Ok(hashes)
    }
}

fn upsert_query(sig: &Signature) -> sqlx::query::Query<'_, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'_>> {
    sqlx::query(
        r#"
        INSERT INTO signatures
            (sha256, sha1, md5, detection_name, family, severity, source, first_seen)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(sha256) DO UPDATE SET
            sha1 = excluded.sha1,
            md5 = excluded.md5,
            detection_name = excluded.detection_name,
            family = excluded.family,
            severity = excluded.severity,
            source = excluded.source,
            first_seen = excluded.first_seen
        "#,
    )
    .bind(hex::encode(sig.sha256))
    .bind(sig.sha1.map(hex::encode))
    .bind(sig.md5.map(hex::encode))
    .bind(&sig.detection_name)
    .bind(&sig.family)
    .bind(sig.severity.as_str())
    .bind(&sig.source)
    .bind(sig.first_seen.to_rfc3339())
}

fn decode_row(row: &SqliteRow) -> Result<Signature, SignatureError> {
    let sha256_hex: String = row.try_get("sha256")?;
    let sha256: [u8; 32] = hex::decode(&sha256_hex)
        .ok()
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(SignatureError::Corrupt {
            field: "sha256",
            value: sha256_hex.clone(),
        })?;

    let sha1 = match row.try_get::<Option<String>, _>("sha1")? {
        Some(raw) => Some(
            hex::decode(&raw)
                .ok()
                .and_then(|bytes| <[u8; 20]>::try_from(bytes).ok())
                .ok_or(SignatureError::Corrupt {
                    field: "sha1",
                    value: raw,
                })?,
        ),
        None => None,
    };
    let md5 = match row.try_get::<Option<String>, _>("md5")? {
        Some(raw) => Some(
            hex::decode(&raw)
                .ok()
                .and_then(|bytes| <[u8; 16]>::try_from(bytes).ok())
                .ok_or(SignatureError::Corrupt {
                    field: "md5",
                    value: raw,
                })?,
        ),
        None => None,
    };

    let severity_raw: String = row.try_get("severity")?;
    let severity: Severity = severity_raw
        .parse()
        .map_err(|_| SignatureError::Corrupt {
            field: "severity",
            value: severity_raw,
        })?;

    let first_seen_raw: String = row.try_get("first_seen")?;
    let first_seen: DateTime<Utc> = DateTime::parse_from_rfc3339(&first_seen_raw)
        .map_err(|_| SignatureError::Corrupt {
            field: "first_seen",
            value: first_seen_raw,
        })?
        .with_timezone(&Utc);

    Ok(Signature {
        sha256,
        sha1,
        md5,
        detection_name: row.try_get("detection_name")?,
        family: row.try_get("family")?,
        severity,
        source: row.try_get("source")?,
        first_seen,
    })
}

fn decode_hex_column(row: &SqliteRow, column: &'static str) -> Result<Vec<u8>, SignatureError> {
    let raw: String = row.try_get(column)?;
    hex::decode(&raw).map_err(|_| SignatureError::Corrupt {
        field: column,
        value: raw,
    })
}

fn decode_optional_hex_column(
    row: &SqliteRow,
    column: &'static str,
) -> Result<Option<Vec<u8>>, SignatureError> {
    match row.try_get::<Option<String>, _>(column)? {
        Some(raw) => hex::decode(&raw)
            .map(Some)
            .map_err(|_| SignatureError::Corrupt {
                field: column,
                value: raw,
            }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> (tempfile::TempDir, SignatureStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SignatureStore::open(&dir.path().join("sigs.db")).await.unwrap();
        (dir, store)
    }

    fn sample(n: u8) -> Signature {
        Signature::new([n; 32], format!("Test.Sig.{}", n), "test", Severity::High, "unit")
    }

    #[tokio::test]
    async fn upsert_and_get_by_primary() {
        let (_dir, store) = store().await;
        let sig = sample(1);
        store.upsert(&sig).await.unwrap();

        let read = store
            .get(&ContentHash::Sha256([1; 32]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.detection_name, "Test.Sig.1");
        assert_eq!(read.severity, Severity::High);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn secondary_hashes_alias_to_primary() {
        let (_dir, store) = store().await;
        let sig = sample(2).with_sha1([9; 20]).with_md5([8; 16]);
        store.upsert(&sig).await.unwrap();

        let by_sha1 = store.get(&ContentHash::Sha1([9; 20])).await.unwrap().unwrap();
        assert_eq!(by_sha1.sha256, [2; 32]);

        let by_md5 = store.get(&ContentHash::Md5([8; 16])).await.unwrap().unwrap();
        assert_eq!(by_md5.sha256, [2; 32]);
    }

    #[tokio::test]
    async fn reingestion_replaces() {
        let (_dir, store) = store().await;
        store.upsert(&sample(3)).await.unwrap();

        let mut updated = sample(3);
        updated.detection_name = "Test.Sig.Renamed".to_string();
        updated.severity = Severity::Critical;
        store.upsert(&updated).await.unwrap();

        let read = store
            .get(&ContentHash::Sha256([3; 32]))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(read.detection_name, "Test.Sig.Renamed");
        assert_eq!(read.severity, Severity::Critical);
        assert_eq!(store.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn all_hashes_covers_every_tier() {
        let (_dir, store) = store().await;
        store
            .upsert_batch(&[sample(4), sample(5).with_sha1([7; 20])])
            .await
            .unwrap();

        let hashes = store.all_hashes().await.unwrap();
        assert_eq!(hashes.len(), 3);
        assert!(hashes.contains(&vec![4u8; 32]));
        assert!(hashes.contains(&vec![7u8; 20]));
    }

    #[tokio::test]
    async fn missing_hash_is_none() {
        let (_dir, store) = store().await;
        assert!(store
            .get(&ContentHash::Sha256([0xFF; 32]))
            .await
            .unwrap()
            .is_none());
    }
}
