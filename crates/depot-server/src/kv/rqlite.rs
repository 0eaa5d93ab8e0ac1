//! rqlite driver for the KV store, speaking the rqlite HTTP API.
//!
//! Statements are posted to `/db/execute` and `/db/query` as
//! parameterized arrays. Credentials embedded in the URL become basic
//! auth on every request.

use serde::Deserialize;
use serde_json::json;

use super::{KvError, KvStore, Record};

pub struct RqliteKv {
    client: reqwest::Client,
    base: String,
    user: Option<(String, String)>,
}

impl RqliteKv {
    pub fn open(url: &str) -> Result<Self, KvError> {
        let parsed = reqwest::Url::parse(url).map_err(|e| KvError::Rqlite(format!("invalid rqlite URL: {e}")))?;
        let user = if parsed.username().is_empty() {
            None
        } else {
            Some((
                parsed.username().to_string(),
                parsed.password().unwrap_or_default().to_string(),
            ))
        };
        let mut base = parsed.clone();
        let _ = base.set_username("");
        let _ = base.set_password(None);
        Ok(Self {
            client: reqwest::Client::new(),
            base: base.to_string().trim_end_matches('/').to_string(),
            user,
        })
    }

    async fn post(&self, endpoint: &str, statements: serde_json::Value) -> Result<Vec<StatementResult>, KvError> {
        let mut req = self.client.post(format!("{}{}", self.base, endpoint)).json(&statements);
        if let Some((user, password)) = &self.user {
            req = req.basic_auth(user, Some(password));
        }
        let response = req
            .send()
            .await
            .map_err(|e| KvError::Rqlite(e.to_string()))?
            .error_for_status()
            .map_err(|e| KvError::Rqlite(e.to_string()))?;
        let body: ResultEnvelope = response.json().await.map_err(|e| KvError::Rqlite(e.to_string()))?;
        for result in &body.results {
            if let Some(error) = &result.error {
                return Err(KvError::Rqlite(error.clone()));
            }
        }
        Ok(body.results)
    }

    async fn execute(&self, statement: serde_json::Value) -> Result<u64, KvError> {
        let results = self.post("/db/execute", json!([statement])).await?;
        Ok(results.first().and_then(|r| r.rows_affected).unwrap_or(0))
    }

    async fn query(&self, statement: serde_json::Value) -> Result<Vec<Vec<serde_json::Value>>, KvError> {
        let mut results = self.post("/db/query", json!([statement])).await?;
        Ok(results.drain(..).next().and_then(|r| r.values).unwrap_or_default())
    }
}

#[derive(Debug, Deserialize)]
struct ResultEnvelope {
    #[serde(default)]
    results: Vec<StatementResult>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    rows_affected: Option<u64>,
    #[serde(default)]
    values: Option<Vec<Vec<serde_json::Value>>>,
}

fn as_i64(value: &serde_json::Value) -> i64 {
    value.as_i64().unwrap_or_default()
}

fn as_str(value: &serde_json::Value) -> &str {
    value.as_str().unwrap_or_default()
}

#[async_trait::async_trait]
impl KvStore for RqliteKv {
    async fn init(&self) -> Result<(), KvError> {
        self.execute(json!([
            "CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY, value TEXT NOT NULL, version INTEGER NOT NULL)"
        ]))
        .await?;
        Ok(())
    }

    async fn put(&self, key: &str, expected_version: i64, value: &serde_json::Value) -> Result<i64, KvError> {
        let text = value.to_string();
        if expected_version >= 0 {
            let rows = self.query(json!(["SELECT version FROM kv WHERE key = ?", key])).await?;
            let found = rows.first().and_then(|row| row.first()).map(as_i64).unwrap_or(0);
            if found != expected_version {
                return Err(KvError::VersionMismatch {
                    key: key.to_string(),
                    expected: expected_version,
                    found,
                });
            }
        }
        self.execute(json!([
            "INSERT INTO kv (key, value, version) VALUES (?, ?, 1)
             ON CONFLICT (key) DO UPDATE SET value = excluded.value, version = kv.version + 1",
            key,
            text
        ]))
        .await?;
        // The write is serialized through the raft log, so the stored
        // version is monotonic even though this readback may observe a
        // later concurrent put.
        let rows = self.query(json!(["SELECT version FROM kv WHERE key = ?", key])).await?;
        Ok(rows.first().and_then(|row| row.first()).map(as_i64).unwrap_or(1))
    }

    async fn get(&self, key: &str) -> Result<Option<(serde_json::Value, i64)>, KvError> {
        let rows = self
            .query(json!(["SELECT value, version FROM kv WHERE key = ?", key]))
            .await?;
        match rows.first() {
            Some(row) => {
                let text = row.first().map(as_str).unwrap_or_default();
                let value = serde_json::from_str(text).map_err(|source| KvError::Decode {
                    key: key.to_string(),
                    source,
                })?;
                Ok(Some((value, row.get(1).map(as_i64).unwrap_or_default())))
            }
            None => Ok(None),
        }
    }

    async fn get_prefix(&self, prefix: &str, offset: i64, limit: i64) -> Result<Vec<Record>, KvError> {
        let limit = if limit < 0 { -1 } else { limit };
        let rows = self
            .query(json!([
                "SELECT key, value, version FROM kv
                 WHERE substr(key, 1, length(?)) = ?
                 ORDER BY key LIMIT ? OFFSET ?",
                prefix,
                prefix,
                limit,
                offset.max(0)
            ]))
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let key = row.first().map(as_str).unwrap_or_default().to_string();
            let text = row.get(1).map(as_str).unwrap_or_default();
            let value = serde_json::from_str(text).map_err(|source| KvError::Decode {
                key: key.clone(),
                source,
            })?;
            records.push(Record {
                key,
                value,
                version: row.get(2).map(as_i64).unwrap_or_default(),
            });
        }
        Ok(records)
    }

    async fn delete(&self, key: &str) -> Result<bool, KvError> {
        let deleted = self.execute(json!(["DELETE FROM kv WHERE key = ?", key])).await?;
        Ok(deleted > 0)
    }

    async fn delete_prefix(&self, prefix: &str, offset: i64, limit: i64) -> Result<u64, KvError> {
        let limit = if limit < 0 { -1 } else { limit };
        self.execute(json!([
            "DELETE FROM kv WHERE key IN (
                 SELECT key FROM kv WHERE substr(key, 1, length(?)) = ?
                 ORDER BY key LIMIT ? OFFSET ?
             )",
            prefix,
            prefix,
            limit,
            offset.max(0)
        ]))
        .await
    }
}
