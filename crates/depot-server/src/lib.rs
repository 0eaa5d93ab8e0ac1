//! Depot server - a multi-ecosystem package cache.
//!
//! This crate provides the server side of depot:
//! - Nix binary cache (narinfo signing, NAR serving, build logs)
//! - NPM registry (abbreviated metadata, tarballs)
//! - Python simple repository (PEP 503/691)
//! - blob storage backends (filesystem, S3) with access logging
//! - a versioned key/value metadata store (sqlite, rqlite, postgres)
//! - JWT-over-SSH request authorization

pub mod accesslog;
pub mod auth;
pub mod downloadcounter;
pub mod kv;
pub mod metrics;
pub mod nix;
pub mod npm;
pub mod python;
pub mod reply;
pub mod routes;
pub mod storage;

pub use accesslog::AccessLog;
pub use auth::AuthConfig;
pub use downloadcounter::{Counter, DownloadSender};
pub use kv::{Kv, KvStore};
pub use metrics::Metrics;
pub use routes::router;
pub use storage::{FsStorage, LoggedStorage, S3Config, S3Storage, Storage};
