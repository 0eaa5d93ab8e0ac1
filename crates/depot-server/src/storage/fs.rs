//! Local filesystem storage backend.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};

use super::{ByteReader, Storage, StorageError};

pub struct FsStorage {
    base_path: PathBuf,
}

impl FsStorage {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn full_path(&self, name: &str) -> PathBuf {
        // Logical names are forward-slash separated on every platform.
        let mut path = self.base_path.clone();
        for segment in name.split('/').filter(|s| !s.is_empty() && *s != "." && *s != "..") {
            path.push(segment);
        }
        path
    }
}

#[async_trait]
impl Storage for FsStorage {
    async fn stat(&self, name: &str) -> Result<Option<u64>, StorageError> {
        match fs::metadata(self.full_path(name)).await {
            Ok(meta) => Ok(Some(meta.len())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, name: &str) -> Result<Option<ByteReader>, StorageError> {
        match File::open(self.full_path(name)).await {
            Ok(file) => Ok(Some(Box::new(BufReader::with_capacity(64 * 1024, file)))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, name: &str, mut data: ByteReader) -> Result<u64, StorageError> {
        let path = self.full_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = File::create(&path).await?;
        let mut written = 0u64;
        let mut buf = vec![0u8; 128 * 1024];
        loop {
            let n = data.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            file.write_all(&buf[..n]).await?;
            written += n as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stat_reports_absent_files_without_error() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        assert!(storage.stat("nar/missing.nar").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn put_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());

        let body: ByteReader = Box::new(std::io::Cursor::new(b"tarball bytes".to_vec()));
        let written = storage.put("left-pad/-/left-pad-1.3.0.tgz", body).await.unwrap();
        assert_eq!(written, 13);

        assert_eq!(storage.stat("left-pad/-/left-pad-1.3.0.tgz").await.unwrap(), Some(13));

        let mut reader = storage.get("left-pad/-/left-pad-1.3.0.tgz").await.unwrap().unwrap();
        let mut contents = Vec::new();
        reader.read_to_end(&mut contents).await.unwrap();
        assert_eq!(contents, b"tarball bytes");
    }

    #[tokio::test]
    async fn traversal_segments_are_stripped() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path().join("store"));

        let body: ByteReader = Box::new(std::io::Cursor::new(b"x".to_vec()));
        storage.put("../escape.txt", body).await.unwrap();
        assert!(!dir.path().join("escape.txt").exists());
    }
}
