//! SQLite driver for the KV store.
//!
//! A single connection behind a tokio mutex: SQLite permits limited
//! write concurrency anyway, and the short-held lock keeps puts to the
//! same key serialized, which the version-as-counter contract requires.

use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Mutex;

use super::{KvError, KvStore, Record, UNBOUNDED};

pub struct SqliteKv {
    conn: Mutex<Connection>,
}

impl SqliteKv {
    /// Open or create the database at `path`.
    pub fn open(path: &str) -> Result<Self, KvError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub fn open_in_memory() -> Result<Self, KvError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn: Mutex::new(conn) })
    }
}

#[async_trait::async_trait]
impl KvStore for SqliteKv {
    async fn init(&self) -> Result<(), KvError> {
        let conn = self.conn.lock().await;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                version INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    async fn put(&self, key: &str, expected_version: i64, value: &serde_json::Value) -> Result<i64, KvError> {
        let text = value.to_string();
        let conn = self.conn.lock().await;
        if expected_version < 0 {
            let version: i64 = conn.query_row(
                "INSERT INTO kv (key, value, version) VALUES (?1, ?2, 1)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value, version = kv.version + 1
                 RETURNING version",
                params![key, text],
                |row| row.get(0),
            )?;
            return Ok(version);
        }

        let found: i64 = conn
            .query_row("SELECT version FROM kv WHERE key = ?1", params![key], |row| row.get(0))
            .optional()?
            .unwrap_or(0);
        if found != expected_version {
            return Err(KvError::VersionMismatch {
                key: key.to_string(),
                expected: expected_version,
                found,
            });
        }
        let version: i64 = conn.query_row(
            "INSERT INTO kv (key, value, version) VALUES (?1, ?2, 1)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value, version = kv.version + 1
             RETURNING version",
            params![key, text],
            |row| row.get(0),
        )?;
        Ok(version)
    }

    async fn get(&self, key: &str) -> Result<Option<(serde_json::Value, i64)>, KvError> {
        let conn = self.conn.lock().await;
        let row: Option<(String, i64)> = conn
            .query_row("SELECT value, version FROM kv WHERE key = ?1", params![key], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;
        match row {
            Some((text, version)) => {
                let value = serde_json::from_str(&text).map_err(|source| KvError::Decode {
                    key: key.to_string(),
                    source,
                })?;
                Ok(Some((value, version)))
            }
            None => Ok(None),
        }
    }

    async fn get_prefix(&self, prefix: &str, offset: i64, limit: i64) -> Result<Vec<Record>, KvError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT key, value, version FROM kv
             WHERE substr(key, 1, length(?1)) = ?1
             ORDER BY key LIMIT ?2 OFFSET ?3",
        )?;
        // SQLite treats LIMIT -1 as unbounded, matching the sentinel.
        let limit = if limit < 0 { UNBOUNDED } else { limit };
        let rows = stmt.query_map(params![prefix, limit, offset.max(0)], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (key, text, version) = row?;
            let value = serde_json::from_str(&text).map_err(|source| KvError::Decode {
                key: key.clone(),
                source,
            })?;
            records.push(Record { key, value, version });
        }
        Ok(records)
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
        Ok(deleted > 0)
    }

    async fn delete_prefix(&self, prefix: &str, offset: i64, limit: i64) -> Result<u64, KvError> {
        let conn = self.conn.lock().await;
        let limit = if limit < 0 { UNBOUNDED } else { limit };
        let deleted = conn.execute(
            "DELETE FROM kv WHERE key IN (
                 SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1
                 ORDER BY key LIMIT ?2 OFFSET ?3
             )",
            params![prefix, limit, offset.max(0)],
        )?;
        Ok(deleted as u64)
    }
}
