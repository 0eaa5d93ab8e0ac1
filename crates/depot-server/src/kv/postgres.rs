//! PostgreSQL driver for the KV store.

use tokio_postgres::{Client, NoTls};

use super::{KvError, KvStore, Record};

pub struct PostgresKv {
    client: Client,
}

impl PostgresKv {
    /// Connect using a standard `postgres://` connection string. The
    /// connection task is spawned onto the runtime and logs on exit.
    pub async fn connect(url: &str) -> Result<Self, KvError> {
        let (client, connection) = tokio_postgres::connect(url, NoTls).await?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "postgres connection closed");
            }
        });
        Ok(Self { client })
    }
}

fn limit_param(limit: i64) -> Option<i64> {
    // NULL limit means no limit in Postgres.
    if limit < 0 { None } else { Some(limit) }
}

#[async_trait::async_trait]
impl KvStore for PostgresKv {
    async fn init(&self) -> Result<(), KvError> {
        self.client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS kv (
                     key TEXT PRIMARY KEY,
                     value TEXT NOT NULL,
                     version BIGINT NOT NULL
                 )",
            )
            .await?;
        Ok(())
    }

    async fn put(&self, key: &str, expected_version: i64, value: &serde_json::Value) -> Result<i64, KvError> {
        let text = value.to_string();
        if expected_version < 0 {
            let row = self
                .client
                .query_one(
                    "INSERT INTO kv (key, value, version) VALUES ($1, $2, 1)
                     ON CONFLICT (key) DO UPDATE SET value = excluded.value, version = kv.version + 1
                     RETURNING version",
                    &[&key, &text],
                )
                .await?;
            return Ok(row.get(0));
        }

        let found: i64 = self
            .client
            .query_opt("SELECT version FROM kv WHERE key = $1", &[&key])
            .await?
            .map(|row| row.get(0))
            .unwrap_or(0);
        if found != expected_version {
            return Err(KvError::VersionMismatch {
                key: key.to_string(),
                expected: expected_version,
                found,
            });
        }
        let row = self
            .client
            .query_one(
                "INSERT INTO kv (key, value, version) VALUES ($1, $2, 1)
                 ON CONFLICT (key) DO UPDATE SET value = excluded.value, version = kv.version + 1
                 RETURNING version",
                &[&key, &text],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn get(&self, key: &str) -> Result<Option<(serde_json::Value, i64)>, KvError> {
        let row = self
            .client
            .query_opt("SELECT value, version FROM kv WHERE key = $1", &[&key])
            .await?;
        match row {
            Some(row) => {
                let text: String = row.get(0);
                let version: i64 = row.get(1);
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
        let rows = self
            .client
            .query(
                "SELECT key, value, version FROM kv
                 WHERE starts_with(key, $1)
                 ORDER BY key LIMIT $2 OFFSET $3",
                &[&prefix, &limit_param(limit), &offset.max(0)],
            )
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let key: String = row.get(0);
            let text: String = row.get(1);
            let version: i64 = row.get(2);
            let value = serde_json::from_str(&text).map_err(|source| KvError::Decode {
                key: key.clone(),
                source,
            })?;
            records.push(Record { key, value, version });
        }
        Ok(records)
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let deleted = self.client.execute("DELETE FROM kv WHERE key = $1", &[&key]).await?;
        Ok(deleted > 0)
    }

    async fn delete_prefix(&self, prefix: &str, offset: i64, limit: i64) -> Result<u64, KvError> {
        let deleted = self
            .client
            .execute(
                "DELETE FROM kv WHERE key IN (
                     SELECT key FROM kv WHERE starts_with(key, $1)
                     ORDER BY key LIMIT $2 OFFSET $3
                 )",
                &[&prefix, &limit_param(limit), &offset.max(0)],
            )
            .await?;
        Ok(deleted)
    }
}
