//! OpenDAL object-store backend
//!
//! Objects are keyed `ab/12/cdef….ctn`, mirroring the filesystem layout.
//! Object stores publish an object only when its writer closes, so an
//! aborted write never leaves a partial blob behind.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::BytesMut;
use ctn_core::config::S3Config;
use opendal::{ErrorKind, Operator};
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use super::{ByteStream, StorageBackend, WriteOutcome, BLOB_EXTENSION};
use crate::error::StorageError;
use crate::key::BlobKey;

const UPLOAD_PART_LEN: usize = 256 * 1024;
const READ_CHUNK_LEN: usize = 256 * 1024;

#[derive(Debug, Clone)]
pub struct ObjectStoreBackend {
    op: Operator,
}

impl ObjectStoreBackend {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }

    /// Volatile in-process store.
    pub fn memory() -> Result<Self> {
        let op = Operator::new(opendal::services::Memory::default())
            .context("creating in-memory operator")?
            .finish();
        Ok(Self::new(op))
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    fn object_path(key: &BlobKey) -> String {
        key.relative_path(BLOB_EXTENSION)
    }

    async fn upload(
        &self,
        path: &str,
        mut data: ByteStream,
        cancel: &CancellationToken,
    ) -> Result<u64, StorageError> {
        let mut writer = self.op.writer(path).await?;
        let mut total = 0u64;
        let copied: Result<(), StorageError> = async {
            loop {
                let mut buf = BytesMut::with_capacity(UPLOAD_PART_LEN);
                let n = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(StorageError::Cancelled),
                    r = data.read_buf(&mut buf) => r?,
                };
                if n == 0 {
                    return Ok(());
                }
                total += n as u64;
                writer.write(buf.freeze()).await?;
            }
        }
        .await;

        match copied {
            Ok(()) => {
                writer.close().await?;
                Ok(total)
            }
            Err(e) => {
                if let Err(abort) = writer.abort().await {
                    tracing::warn!(path, error = %abort, "failed to abort object upload");
                }
                Err(e)
            }
        }
    }
}

#[async_trait]
impl StorageBackend for ObjectStoreBackend {
    fn name(&self) -> &'static str {
        "object-store"
    }

    async fn write(
        &self,
        key: &BlobKey,
        data: ByteStream,
        cancel: &CancellationToken,
    ) -> Result<WriteOutcome, StorageError> {
        let path = Self::object_path(key);
        if self.op.exists(&path).await? {
            tracing::info!(uid = %key, "blob already stored, skipping write");
            return Ok(WriteOutcome::Deduplicated);
        }
        let bytes = self.upload(&path, data, cancel).await?;
        tracing::info!(uid = %key, bytes, "blob uploaded");
        Ok(WriteOutcome::Stored { bytes })
    }

    /// Streams the object in ranged fetches; it is never loaded whole.
    async fn read(&self, key: &BlobKey) -> Result<ByteStream, StorageError> {
        let not_found = |e: opendal::Error| match e.kind() {
            ErrorKind::NotFound => StorageError::NotFound(key.to_string()),
            _ => e.into(),
        };
        let reader = self
            .op
            .reader_with(&Self::object_path(key))
            .chunk(READ_CHUNK_LEN)
            .await
            .map_err(not_found)?;
        let chunks = reader.into_bytes_stream(..).await.map_err(not_found)?;
        Ok(Box::pin(StreamReader::new(chunks)))
    }

    async fn exists(&self, key: &BlobKey) -> Result<bool, StorageError> {
        Ok(self.op.exists(&Self::object_path(key)).await?)
    }

    async fn delete(&self, key: &BlobKey) -> Result<bool, StorageError> {
        let path = Self::object_path(key);
        if !self.op.exists(&path).await? {
            return Ok(false);
        }
        self.op.delete(&path).await?;
        tracing::info!(uid = %key, "blob deleted");
        Ok(true)
    }
}

/// Build an S3 operator (SeaweedFS, MinIO or AWS).
///
/// Credentials come from the standard `AWS_*` environment. Path-style
/// addressing is the opendal default and is what SeaweedFS and MinIO expect.
/// A plaintext endpoint is an error with `enforce_tls` and a warning without.
pub fn build_s3_operator(cfg: &S3Config) -> Result<Operator> {
    if cfg.endpoint.starts_with("http://") {
        if cfg.enforce_tls {
            anyhow::bail!(
                "S3 endpoint uses plaintext HTTP ({}), but enforce_tls is enabled. \
                 Use an HTTPS endpoint or set storage.s3.enforce_tls = false for local development.",
                cfg.endpoint
            );
        }
        tracing::warn!(
            endpoint = %cfg.endpoint,
            "S3 endpoint uses plaintext HTTP; set storage.s3.enforce_tls = true and use HTTPS in production"
        );
    }

    let builder = opendal::services::S3::default()
        .endpoint(&cfg.endpoint)
        .region(&cfg.region)
        .bucket(&cfg.bucket);

    let op = Operator::new(builder)
        .context("creating OpenDAL S3 operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        )
        .finish();

    Ok(op)
}
