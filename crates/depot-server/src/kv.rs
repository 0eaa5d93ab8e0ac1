//! Versioned key/value metadata store.
//!
//! Keys are path-segmented with a single leading slash, e.g.
//! `/npm/%40types%2Fnode/1.0.0`. Every successful put increments the
//! stored version, which the access log and download counter exploit as
//! a cheap event tally.

use std::sync::Arc;

use async_trait::async_trait;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

mod postgres;
mod rqlite;
mod sqlite;

pub use postgres::PostgresKv;
pub use rqlite::RqliteKv;
pub use sqlite::SqliteKv;

/// Upsert sentinel for [`KvStore::put`].
pub const ANY_VERSION: i64 = -1;

/// No-limit sentinel for prefix operations.
pub const UNBOUNDED: i64 = -1;

#[derive(Debug, Error)]
pub enum KvError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("rqlite error: {0}")]
    Rqlite(String),

    #[error("version mismatch for {key}: expected {expected}, found {found}")]
    VersionMismatch { key: String, expected: i64, found: i64 },

    #[error("decode error for {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("encode error: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("unsupported database type: {0}")]
    UnsupportedDriver(String),
}

/// A row returned from a prefix scan.
#[derive(Debug, Clone)]
pub struct Record {
    pub key: String,
    pub value: serde_json::Value,
    pub version: i64,
}

/// Storage-agnostic key/value contract. Drivers serialize values as
/// JSON text and must guarantee monotonic version increments under
/// concurrent puts to the same key.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Idempotent schema creation.
    async fn init(&self) -> Result<(), KvError>;

    /// Insert or update a key. `expected_version` of [`ANY_VERSION`]
    /// means unconditional upsert; any other value is compare-and-set
    /// against the current version (0 for a missing key). Returns the
    /// new version.
    async fn put(&self, key: &str, expected_version: i64, value: &serde_json::Value) -> Result<i64, KvError>;

    /// Fetch a key. `Ok(None)` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<(serde_json::Value, i64)>, KvError>;

    /// Rows whose key starts with `prefix`, ordered by key.
    /// `limit` of [`UNBOUNDED`] returns everything past `offset`.
    async fn get_prefix(&self, prefix: &str, offset: i64, limit: i64) -> Result<Vec<Record>, KvError>;

    /// Remove a key, reporting whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, KvError>;

    /// Remove rows under a prefix, returning the number deleted.
    async fn delete_prefix(&self, prefix: &str, offset: i64, limit: i64) -> Result<u64, KvError>;
}

/// Shared handle over a driver with typed JSON helpers. Adapters hold
/// clones of this and never care which driver is underneath.
#[derive(Clone)]
pub struct Kv {
    inner: Arc<dyn KvStore>,
}

impl Kv {
    pub fn new(inner: Arc<dyn KvStore>) -> Self {
        Self { inner }
    }

    /// Open a driver by type name: `sqlite`, `rqlite` or `postgres`.
    /// The schema is initialized before the handle is returned.
    pub async fn connect(db_type: &str, url: &str) -> Result<Self, KvError> {
        let inner: Arc<dyn KvStore> = match db_type {
            "sqlite" => Arc::new(SqliteKv::open(url)?),
            "rqlite" => Arc::new(RqliteKv::open(url)?),
            "postgres" => Arc::new(PostgresKv::connect(url).await?),
            other => return Err(KvError::UnsupportedDriver(other.to_string())),
        };
        inner.init().await?;
        Ok(Self { inner })
    }

    pub async fn put<T: Serialize>(&self, key: &str, expected_version: i64, value: &T) -> Result<i64, KvError> {
        let value = serde_json::to_value(value).map_err(KvError::Encode)?;
        self.inner.put(key, expected_version, &value).await
    }

    /// Record an event by upserting an empty value: the returned
    /// version is the cumulative event count for the key.
    pub async fn bump(&self, key: &str) -> Result<i64, KvError> {
        self.inner.put(key, ANY_VERSION, &serde_json::Value::String(String::new())).await
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<(T, i64)>, KvError> {
        match self.inner.get(key).await? {
            Some((value, version)) => {
                let decoded = serde_json::from_value(value).map_err(|source| KvError::Decode {
                    key: key.to_string(),
                    source,
                })?;
                Ok(Some((decoded, version)))
            }
            None => Ok(None),
        }
    }

    pub async fn get_prefix(&self, prefix: &str, offset: i64, limit: i64) -> Result<Vec<Record>, KvError> {
        self.inner.get_prefix(prefix, offset, limit).await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, KvError> {
        self.inner.delete(key).await
    }

    pub async fn delete_prefix(&self, prefix: &str, offset: i64, limit: i64) -> Result<u64, KvError> {
        self.inner.delete_prefix(prefix, offset, limit).await
    }
}

/// Characters kept verbatim in a key segment. Everything else,
/// including `/`, is percent-encoded so that escaped names can never
/// introduce extra path segments.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'.').remove(b'~');

/// Escape one path segment of a KV key.
pub fn escape_segment(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT).to_string()
}

/// Decode the typed values out of a prefix scan, in key order.
pub fn values_of<T: DeserializeOwned>(records: &[Record]) -> Result<Vec<T>, KvError> {
    records
        .iter()
        .map(|r| {
            serde_json::from_value(r.value.clone()).map_err(|source| KvError::Decode {
                key: r.key.clone(),
                source,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_escape_slashes_and_at_signs() {
        assert_eq!(escape_segment("@types/node"), "%40types%2Fnode");
        assert_eq!(escape_segment("flask"), "flask");
        assert_eq!(escape_segment("zope.interface"), "zope.interface");
    }

    #[tokio::test]
    async fn put_increments_version_per_key() {
        let kv = Kv::new(Arc::new(SqliteKv::open_in_memory().unwrap()));
        for expected in 1..=5 {
            let version = kv.bump("/downloadcounter/npm/left-pad/2026-08-02").await.unwrap();
            assert_eq!(version, expected);
        }
        let version = kv.bump("/downloadcounter/npm/right-pad/2026-08-02").await.unwrap();
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn get_prefix_is_ordered_and_bounded() {
        let kv = Kv::new(Arc::new(SqliteKv::open_in_memory().unwrap()));
        for key in ["/npm/b/2.0.0", "/npm/a/1.0.0", "/npm/a/1.1.0", "/npm/ab/1.0.0"] {
            kv.put(key, ANY_VERSION, &serde_json::json!({"key": key})).await.unwrap();
        }

        // A terminating slash excludes the false prefix match on /npm/ab/.
        let rows = kv.get_prefix("/npm/a/", 0, UNBOUNDED).await.unwrap();
        let keys: Vec<_> = rows.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, ["/npm/a/1.0.0", "/npm/a/1.1.0"]);

        let rows = kv.get_prefix("/npm/", 1, 2).await.unwrap();
        let keys: Vec<_> = rows.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(keys, ["/npm/a/1.1.0", "/npm/ab/1.0.0"]);
    }

    #[tokio::test]
    async fn compare_and_set_rejects_stale_versions() {
        let kv = Kv::new(Arc::new(SqliteKv::open_in_memory().unwrap()));
        let v1 = kv.put("/k", ANY_VERSION, &"a").await.unwrap();
        assert_eq!(v1, 1);
        let v2 = kv.put("/k", 1, &"b").await.unwrap();
        assert_eq!(v2, 2);
        let err = kv.put("/k", 1, &"c").await.unwrap_err();
        assert!(matches!(err, KvError::VersionMismatch { .. }));
    }

    #[tokio::test]
    async fn delete_prefix_reports_removed_rows() {
        let kv = Kv::new(Arc::new(SqliteKv::open_in_memory().unwrap()));
        for key in ["/python/flask/2.3.0", "/python/flask/2.3.1", "/python/django/5.0"] {
            kv.put(key, ANY_VERSION, &"{}").await.unwrap();
        }
        let removed = kv.delete_prefix("/python/flask/", 0, UNBOUNDED).await.unwrap();
        assert_eq!(removed, 2);
        assert!(kv.get::<String>("/python/flask/2.3.0").await.unwrap().is_none());
        assert!(kv.get::<String>("/python/django/5.0").await.unwrap().is_some());
    }
}
