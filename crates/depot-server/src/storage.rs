//! Blob storage backends.
//!
//! Adapters address blobs by an opaque logical filename; the backend
//! decides where the bytes live. Not-found is `Ok(None)`, never an
//! error. `put` consumes the whole stream and returns only once the
//! bytes are durable from the server's perspective.

use std::io;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncRead;

mod fs;
mod logged;
mod s3;

pub use fs::FsStorage;
pub use logged::{LoggedStorage, ShutdownHandle};
pub use s3::{S3Config, S3Storage};

/// A boxed async reader for streaming blob contents.
pub type ByteReader = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("s3 error: {0}")]
    S3(String),
}

#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Size of the blob, or `None` if it does not exist.
    async fn stat(&self, name: &str) -> Result<Option<u64>, StorageError>;

    /// Open the blob for streaming, or `None` if it does not exist.
    async fn get(&self, name: &str) -> Result<Option<ByteReader>, StorageError>;

    /// Stream `data` into the blob, replacing any existing content.
    /// Returns the number of bytes written after they are durable.
    async fn put(&self, name: &str, data: ByteReader) -> Result<u64, StorageError>;
}
