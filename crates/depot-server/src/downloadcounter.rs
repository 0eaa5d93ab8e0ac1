//! Client-facing per-artifact download counters, grouped by ecosystem.
//!
//! Same version-as-counter trick as the access log, keyed by
//! `/downloadcounter/{group}/{name}/{yyyy-mm-dd}`. Handlers push
//! events into a bounded channel; a single background task records
//! them so the response path never waits on the metadata store.

use jiff::Timestamp;
use jiff::civil::Date;
use jiff::tz::TimeZone;
use tokio::sync::{mpsc, oneshot};

use crate::kv::{Kv, KvError, UNBOUNDED, escape_segment};
use crate::metrics::Metrics;

pub const BUFFER_SIZE: usize = 2048;

#[derive(Debug)]
pub struct DownloadEvent {
    pub group: String,
    pub name: String,
}

/// Cloneable sender handed to the adapters. Sending blocks when the
/// buffer is full: losing counts is worse than adding tail latency.
#[derive(Clone)]
pub struct DownloadSender {
    tx: mpsc::Sender<Message>,
}

impl DownloadSender {
    pub async fn record(&self, group: &str, name: &str) {
        let event = DownloadEvent {
            group: group.to_string(),
            name: name.to_string(),
        };
        if self.tx.send(Message::Event(event)).await.is_err() {
            tracing::debug!("download counter is shut down, dropping event");
        }
    }
}

enum Message {
    Event(DownloadEvent),
    Shutdown(oneshot::Sender<()>),
}

/// Handle used to stop the consumer after the HTTP server exits.
pub struct CounterShutdown {
    tx: mpsc::Sender<Message>,
}

impl CounterShutdown {
    /// Seal the channel and wait for buffered events to drain.
    pub async fn shutdown(self, timeout: std::time::Duration) -> Result<(), ShutdownTimeout> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Message::Shutdown(ack_tx)).await.is_err() {
            return Ok(());
        }
        tokio::time::timeout(timeout, ack_rx)
            .await
            .map(|_| ())
            .map_err(|_| ShutdownTimeout)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("timed out waiting for buffered events to complete")]
pub struct ShutdownTimeout;

/// Spawn the buffered counter. Events recorded through the returned
/// sender are tallied by the background task until shutdown.
pub fn spawn_buffered(kv: Kv, metrics: Metrics) -> (DownloadSender, CounterShutdown) {
    let (tx, mut rx) = mpsc::channel::<Message>(BUFFER_SIZE);
    let counter = Counter::new(kv);

    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match message {
                Message::Event(event) => {
                    tracing::debug!(group = %event.group, name = %event.name, "recording download");
                    if let Err(e) = counter.increment(&event.group, &event.name).await {
                        tracing::error!(group = %event.group, name = %event.name, error = %e, "failed to record download");
                        metrics.record_download_counter_error(&event.group);
                    }
                }
                Message::Shutdown(ack) => {
                    let _ = ack.send(());
                    break;
                }
            }
        }
    });

    (DownloadSender { tx: tx.clone() }, CounterShutdown { tx })
}

type NowFn = Box<dyn Fn() -> Timestamp + Send + Sync>;

pub struct Counter {
    kv: Kv,
    now: NowFn,
}

impl Counter {
    pub fn new(kv: Kv) -> Self {
        Self {
            kv,
            now: Box::new(Timestamp::now),
        }
    }

    pub fn with_now(kv: Kv, now: impl Fn() -> Timestamp + Send + Sync + 'static) -> Self {
        Self { kv, now: Box::new(now) }
    }

    fn key(&self, group: &str, name: &str, date: Date) -> String {
        format!(
            "/downloadcounter/{}/{}/{}",
            escape_segment(group),
            escape_segment(name),
            date
        )
    }

    fn prefix(&self, group: &str, name: &str) -> String {
        format!("/downloadcounter/{}/{}/", escape_segment(group), escape_segment(name))
    }

    pub async fn increment(&self, group: &str, name: &str) -> Result<(), KvError> {
        let date = (self.now)().to_zoned(TimeZone::UTC).date();
        self.kv.bump(&self.key(group, name, date)).await.map(|_| ())
    }

    pub async fn get(&self, group: &str, name: &str) -> Result<Counts, KvError> {
        let rows = self.kv.get_prefix(&self.prefix(group, name), 0, UNBOUNDED).await?;
        let mut counts = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(day) = row.key.rsplit('/').next() else {
                continue;
            };
            let Ok(date) = day.parse::<Date>() else {
                tracing::warn!(key = %row.key, "skipping download counter key with bad date");
                continue;
            };
            counts.push(Count {
                date,
                count: row.version,
            });
        }
        Ok(Counts(counts))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Count {
    pub date: Date,
    pub count: i64,
}

#[derive(Debug, Clone, Default)]
pub struct Counts(pub Vec<Count>);

impl Counts {
    pub fn total(&self) -> i64 {
        self.0.iter().map(|c| c.count).sum()
    }

    /// Date range covered, assuming counts sorted by date.
    pub fn range(&self) -> Option<(Date, Date)> {
        match (self.0.first(), self.0.last()) {
            (Some(first), Some(last)) => Some((first.date, last.date)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::kv::{Kv, SqliteKv};

    fn kv() -> Kv {
        Kv::new(Arc::new(SqliteKv::open_in_memory().unwrap()))
    }

    fn at(date: &'static str) -> impl Fn() -> Timestamp {
        move || format!("{date}T00:30:00Z").parse().unwrap()
    }

    #[tokio::test]
    async fn increments_bucket_by_day_and_group() {
        let store = kv();
        let counter = Counter::with_now(store.clone(), at("2026-08-01"));
        for _ in 0..3 {
            counter.increment("npm", "left-pad/-/left-pad-1.3.0.tgz").await.unwrap();
        }
        let counter = Counter::with_now(store.clone(), at("2026-08-02"));
        counter.increment("npm", "left-pad/-/left-pad-1.3.0.tgz").await.unwrap();
        counter.increment("nix", "nar/abc.nar.xz").await.unwrap();

        let counts = counter.get("npm", "left-pad/-/left-pad-1.3.0.tgz").await.unwrap();
        assert_eq!(counts.0.len(), 2);
        assert_eq!(counts.0[0].count, 3);
        assert_eq!(counts.0[1].count, 1);
        assert_eq!(counts.total(), 4);

        let (from, to) = counts.range().unwrap();
        assert_eq!(from.to_string(), "2026-08-01");
        assert_eq!(to.to_string(), "2026-08-02");

        let nix = counter.get("nix", "nar/abc.nar.xz").await.unwrap();
        assert_eq!(nix.total(), 1);
    }

    #[tokio::test]
    async fn concurrent_increments_all_land() {
        let store = kv();
        let counter = Arc::new(Counter::with_now(store.clone(), at("2026-08-02")));

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let counter = Arc::clone(&counter);
            tasks.push(tokio::spawn(async move {
                counter.increment("python", "flask/Flask-2.3.0.tar.gz").await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let counts = counter.get("python", "flask/Flask-2.3.0.tar.gz").await.unwrap();
        assert_eq!(counts.total(), 32);
    }

    #[tokio::test]
    async fn buffered_counter_drains_on_shutdown() {
        let store = kv();
        let metrics = crate::metrics::Metrics::new().unwrap();
        let (sender, shutdown) = spawn_buffered(store.clone(), metrics);

        for _ in 0..10 {
            sender.record("npm", "tarball.tgz").await;
        }
        shutdown.shutdown(std::time::Duration::from_secs(5)).await.unwrap();

        let counts = Counter::new(store).get("npm", "tarball.tgz").await.unwrap();
        assert_eq!(counts.total(), 10);
    }
}
