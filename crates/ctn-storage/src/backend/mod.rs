//! Durable blob storage keyed by content address

pub mod fs;
pub mod object_store;

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use ctn_core::config::{BackendKind, StorageConfig};
use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;

use crate::error::StorageError;
use crate::key::BlobKey;

pub use fs::FileSystemBackend;
pub use object_store::ObjectStoreBackend;

/// Owned async byte stream passed between pipeline stages.
pub type ByteStream = Pin<Box<dyn AsyncRead + Send>>;

/// File extension for committed blobs
pub const BLOB_EXTENSION: &str = "ctn";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// A new blob was committed
    Stored { bytes: u64 },
    /// A blob with this key already existed; the input was discarded
    Deduplicated,
}

/// Blob store. Blobs are immutable once written.
///
/// Implementations must tolerate concurrent calls for the same key: two
/// writers racing on one key both succeed and exactly one blob remains.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Store `data` under `key` unless a blob already exists there.
    async fn write(
        &self,
        key: &BlobKey,
        data: ByteStream,
        cancel: &CancellationToken,
    ) -> Result<WriteOutcome, StorageError>;

    /// Open a blob for sequential reading. Missing blob → `NotFound`.
    async fn read(&self, key: &BlobKey) -> Result<ByteStream, StorageError>;

    async fn exists(&self, key: &BlobKey) -> Result<bool, StorageError>;

    /// Remove a blob. Returns `false` if it was already gone.
    async fn delete(&self, key: &BlobKey) -> Result<bool, StorageError>;
}

/// Build the configured backend.
pub fn build_backend(cfg: &StorageConfig) -> anyhow::Result<Arc<dyn StorageBackend>> {
    let backend: Arc<dyn StorageBackend> = match cfg.backend {
        BackendKind::Filesystem => {
            Arc::new(FileSystemBackend::new(cfg.root.clone(), cfg.scratch_dir()))
        }
        BackendKind::Memory => Arc::new(ObjectStoreBackend::memory()?),
        BackendKind::S3 => Arc::new(ObjectStoreBackend::new(object_store::build_s3_operator(
            &cfg.s3,
        )?)),
    };
    tracing::debug!(backend = backend.name(), "storage backend ready");
    Ok(backend)
}
