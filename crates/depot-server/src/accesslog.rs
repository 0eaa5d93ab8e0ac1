//! Per-file access log, day-bucketed.
//!
//! One empty-value KV put per event at
//! `/accesslog/{escaped filename}/{yyyy-mm-dd}/{r|w|d}`: the row's
//! version IS the cumulative count for that day, so recording an event
//! costs a single upsert and no read-modify-write cycle.

use jiff::Timestamp;
use jiff::civil::Date;
use jiff::tz::TimeZone;

use crate::kv::{Kv, KvError, UNBOUNDED, escape_segment};

type NowFn = Box<dyn Fn() -> Timestamp + Send + Sync>;

pub struct AccessLog {
    kv: Kv,
    now: NowFn,
}

impl AccessLog {
    pub fn new(kv: Kv) -> Self {
        Self {
            kv,
            now: Box::new(Timestamp::now),
        }
    }

    /// Replace the clock, for tests that need a fixed day.
    pub fn with_now(kv: Kv, now: impl Fn() -> Timestamp + Send + Sync + 'static) -> Self {
        Self { kv, now: Box::new(now) }
    }

    fn key(&self, filename: &str, op: &str) -> String {
        let day = (self.now)().to_zoned(TimeZone::UTC).date();
        format!("/accesslog/{}/{}/{}", escape_segment(filename), day, op)
    }

    pub async fn read(&self, filename: &str) -> Result<(), KvError> {
        self.kv.bump(&self.key(filename, "r")).await.map(|_| ())
    }

    pub async fn write(&self, filename: &str) -> Result<(), KvError> {
        self.kv.bump(&self.key(filename, "w")).await.map(|_| ())
    }

    pub async fn delete(&self, filename: &str) -> Result<(), KvError> {
        self.kv.bump(&self.key(filename, "d")).await.map(|_| ())
    }

    /// All recorded counts for a file. The second return value is
    /// false when the file has never been seen.
    pub async fn get(&self, filename: &str) -> Result<(Stats, bool), KvError> {
        let mut stats = Stats {
            filename: filename.to_string(),
            ..Stats::default()
        };
        let prefix = format!("/accesslog/{}/", escape_segment(filename));
        let rows = self.kv.get_prefix(&prefix, 0, UNBOUNDED).await?;

        let mut found = false;
        for row in rows {
            let parts: Vec<&str> = row.key.trim_start_matches('/').split('/').collect();
            let [_, _, day, op] = parts.as_slice() else {
                tracing::warn!(key = %row.key, "skipping malformed access log key");
                continue;
            };
            let Ok(date) = day.parse::<Date>() else {
                tracing::warn!(key = %row.key, "skipping access log key with bad date");
                continue;
            };
            let count = Count {
                date,
                count: row.version,
            };
            match *op {
                "r" => stats.reads.push(count),
                "w" => stats.writes.push(count),
                "d" => stats.deletes.push(count),
                _ => {
                    tracing::warn!(key = %row.key, "skipping access log key with unknown action");
                    continue;
                }
            }
            found = true;
        }

        Ok((stats, found))
    }
}

#[derive(Debug, Default, Clone)]
pub struct Stats {
    pub filename: String,
    pub reads: Vec<Count>,
    pub writes: Vec<Count>,
    pub deletes: Vec<Count>,
}

impl Stats {
    pub fn total_reads(&self) -> i64 {
        self.reads.iter().map(|c| c.count).sum()
    }

    pub fn total_writes(&self) -> i64 {
        self.writes.iter().map(|c| c.count).sum()
    }

    pub fn created(&self) -> Option<Date> {
        self.writes.first().map(|c| c.date)
    }

    pub fn last_read(&self) -> Option<Date> {
        self.reads.last().map(|c| c.date)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Count {
    pub date: Date,
    pub count: i64,
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::kv::SqliteKv;

    fn kv() -> Kv {
        Kv::new(Arc::new(SqliteKv::open_in_memory().unwrap()))
    }

    fn at(date: &'static str) -> impl Fn() -> Timestamp {
        move || format!("{date}T12:00:00Z").parse().unwrap()
    }

    #[tokio::test]
    async fn daily_counts_accumulate_per_operation() {
        let store = kv();
        let day1 = AccessLog::with_now(store.clone(), at("2026-08-01"));
        for _ in 0..5 {
            day1.read("fileA").await.unwrap();
        }
        let day2 = AccessLog::with_now(store.clone(), at("2026-08-02"));
        for _ in 0..7 {
            day2.read("fileA").await.unwrap();
        }
        day2.write("fileA").await.unwrap();

        let (stats, found) = day2.get("fileA").await.unwrap();
        assert!(found);
        assert_eq!(stats.reads.len(), 2);
        assert_eq!(stats.reads[0].count, 5);
        assert_eq!(stats.reads[1].count, 7);
        assert_eq!(stats.total_reads(), 12);
        assert_eq!(stats.total_writes(), 1);
    }

    #[tokio::test]
    async fn deletes_are_tracked_separately_from_writes() {
        let store = kv();
        let log = AccessLog::with_now(store.clone(), at("2026-08-02"));
        log.delete("fileB").await.unwrap();
        log.delete("fileB").await.unwrap();

        let (stats, found) = log.get("fileB").await.unwrap();
        assert!(found);
        assert!(stats.writes.is_empty());
        assert_eq!(stats.deletes.len(), 1);
        assert_eq!(stats.deletes[0].count, 2);
    }

    #[tokio::test]
    async fn unknown_files_report_not_found() {
        let log = AccessLog::new(kv());
        let (_, found) = log.get("nothing").await.unwrap();
        assert!(!found);
    }

    #[tokio::test]
    async fn filenames_with_slashes_stay_one_segment() {
        let store = kv();
        let log = AccessLog::with_now(store.clone(), at("2026-08-02"));
        log.read("left-pad/-/left-pad-1.3.0.tgz").await.unwrap();

        let rows = store.get_prefix("/accesslog/", 0, UNBOUNDED).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].key,
            "/accesslog/left-pad%2F-%2Fleft-pad-1.3.0.tgz/2026-08-02/r"
        );
    }
}
