//! S3-compatible storage backend.
//!
//! Works against AWS proper (region + IAM credentials) and MinIO
//! (custom endpoint, static credentials, path-style addressing).
//! Uploads are chunked into a multipart upload so `put` only returns
//! once the object is complete; bodies smaller than one part go
//! through a single PutObject.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use tokio::io::AsyncReadExt;

use super::{ByteReader, Storage, StorageError};

const PART_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct S3Config {
    pub bucket: String,
    pub prefix: String,
    pub region: String,
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub force_path_style: bool,
}

pub struct S3Storage {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl S3Storage {
    pub async fn new(cfg: S3Config) -> Result<Self, StorageError> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if !cfg.region.is_empty() {
            loader = loader.region(aws_config::Region::new(cfg.region.clone()));
        }
        if !cfg.access_key_id.is_empty() && !cfg.secret_access_key.is_empty() {
            loader = loader.credentials_provider(Credentials::new(
                cfg.access_key_id.clone(),
                cfg.secret_access_key.clone(),
                None,
                None,
                "depot-server",
            ));
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if !cfg.endpoint.is_empty() {
            builder = builder.endpoint_url(cfg.endpoint.clone());
        }
        builder = builder.force_path_style(cfg.force_path_style);

        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            bucket: cfg.bucket,
            prefix: cfg.prefix,
        })
    }

    fn key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}{}", self.prefix, name)
        }
    }

    async fn abort_upload(&self, key: &str, upload_id: &str) {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await;
        if let Err(e) = result {
            tracing::warn!(key, error = %e, "failed to abort multipart upload");
        }
    }
}

/// Read up to `PART_SIZE` bytes, returning the chunk and whether the
/// stream is exhausted.
async fn read_part(data: &mut ByteReader) -> Result<(Vec<u8>, bool), StorageError> {
    let mut chunk = Vec::with_capacity(64 * 1024);
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = data.read(&mut buf).await?;
        if n == 0 {
            return Ok((chunk, true));
        }
        chunk.extend_from_slice(&buf[..n]);
        if chunk.len() >= PART_SIZE {
            return Ok((chunk, false));
        }
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn stat(&self, name: &str) -> Result<Option<u64>, StorageError> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(name))
            .send()
            .await;
        match result {
            Ok(output) => Ok(Some(output.content_length().unwrap_or(0) as u64)),
            Err(e) => {
                if e.as_service_error().map(|se| se.is_not_found()).unwrap_or(false) {
                    Ok(None)
                } else {
                    Err(StorageError::S3(e.to_string()))
                }
            }
        }
    }

    async fn get(&self, name: &str) -> Result<Option<ByteReader>, StorageError> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(name))
            .send()
            .await;
        match result {
            Ok(output) => Ok(Some(Box::new(output.body.into_async_read()))),
            Err(e) => {
                if e.as_service_error().map(|se| se.is_no_such_key()).unwrap_or(false) {
                    Ok(None)
                } else {
                    Err(StorageError::S3(e.to_string()))
                }
            }
        }
    }

    async fn put(&self, name: &str, mut data: ByteReader) -> Result<u64, StorageError> {
        let key = self.key(name);

        let (first, done) = read_part(&mut data).await?;
        if done {
            let written = first.len() as u64;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&key)
                .body(ByteStream::from(first))
                .send()
                .await
                .map_err(|e| StorageError::S3(e.to_string()))?;
            return Ok(written);
        }

        let upload = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| StorageError::S3(e.to_string()))?;
        let upload_id = upload.upload_id().unwrap_or_default().to_string();

        let mut written = 0u64;
        let mut parts = Vec::new();
        let mut part_number = 1i32;
        let mut chunk = first;
        let mut exhausted = false;
        loop {
            written += chunk.len() as u64;
            let result = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(&key)
                .upload_id(&upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk))
                .send()
                .await;
            let uploaded = match result {
                Ok(uploaded) => uploaded,
                Err(e) => {
                    self.abort_upload(&key, &upload_id).await;
                    return Err(StorageError::S3(e.to_string()));
                }
            };
            parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .build(),
            );
            part_number += 1;

            if exhausted {
                break;
            }
            let (next, done) = match read_part(&mut data).await {
                Ok(next) => next,
                Err(e) => {
                    self.abort_upload(&key, &upload_id).await;
                    return Err(e);
                }
            };
            if next.is_empty() && done {
                break;
            }
            chunk = next;
            exhausted = done;
        }

        let completed = CompletedMultipartUpload::builder().set_parts(Some(parts)).build();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .upload_id(&upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| StorageError::S3(e.to_string()))?;

        Ok(written)
    }
}
