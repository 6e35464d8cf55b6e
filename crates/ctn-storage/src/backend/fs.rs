//! Filesystem blob backend
//!
//! Layout: `{root}/{key[0..2]}/{key[2..4]}/{key[4..]}.ctn`
//!
//! Writes stream into `{scratch}/{key}.{uuid}.tmp` (created exclusively),
//! are synced, then committed with a no-clobber hard link (rename where
//! links are unsupported). A half-written blob is never visible under its
//! final name, and racing writers of the same key converge on one blob.
//! Committed blobs are read-only.

use std::fs::Permissions;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{ByteStream, StorageBackend, WriteOutcome, BLOB_EXTENSION};
use crate::error::StorageError;
use crate::key::BlobKey;

#[derive(Debug, Clone)]
pub struct FileSystemBackend {
    root: PathBuf,
    scratch: PathBuf,
}

impl FileSystemBackend {
    /// `scratch` should live on the same filesystem as `root`.
    pub fn new(root: PathBuf, scratch: PathBuf) -> Self {
        Self { root, scratch }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch
    }

    /// Final path of a blob.
    pub fn blob_path(&self, key: &BlobKey) -> PathBuf {
        let (a, b, rest) = key.shard();
        self.root
            .join(a)
            .join(b)
            .join(format!("{rest}.{BLOB_EXTENSION}"))
    }

    async fn write_temp(
        &self,
        tmp: &Path,
        mut data: ByteStream,
        cancel: &CancellationToken,
    ) -> Result<u64, StorageError> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(tmp)
            .await?;
        let bytes = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StorageError::Cancelled),
            r = tokio::io::copy(&mut data, &mut file) => r?,
        };
        file.flush().await?;
        file.sync_all().await?;
        Ok(bytes)
    }

    /// Move a synced temp file to `target` without clobbering.
    async fn commit(&self, tmp: &Path, target: &Path) -> Result<bool, StorageError> {
        match fs::hard_link(tmp, target).await {
            Ok(()) => {
                remove_quietly(tmp).await;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                remove_quietly(tmp).await;
                Ok(false)
            }
            Err(e) => {
                tracing::debug!(error = %e, "hard link failed, falling back to rename");
                if fs::try_exists(target).await? {
                    remove_quietly(tmp).await;
                    return Ok(false);
                }
                fs::rename(tmp, target).await?;
                Ok(true)
            }
        }
    }
}

#[async_trait]
impl StorageBackend for FileSystemBackend {
    fn name(&self) -> &'static str {
        "filesystem"
    }

    async fn write(
        &self,
        key: &BlobKey,
        data: ByteStream,
        cancel: &CancellationToken,
    ) -> Result<WriteOutcome, StorageError> {
        let target = self.blob_path(key);
        if fs::try_exists(&target).await? {
            tracing::info!(uid = %key, "blob already stored, skipping write");
            return Ok(WriteOutcome::Deduplicated);
        }

        fs::create_dir_all(&self.scratch).await?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }

        let tmp = self
            .scratch
            .join(format!("{key}.{}.tmp", Uuid::new_v4().simple()));
        let result = match self.write_temp(&tmp, data, cancel).await {
            Ok(bytes) => self.commit(&tmp, &target).await.map(|stored| (stored, bytes)),
            Err(e) => Err(e),
        };

        match result {
            Ok((true, bytes)) => {
                set_readonly(&target).await;
                tracing::info!(uid = %key, bytes, "blob committed");
                Ok(WriteOutcome::Stored { bytes })
            }
            Ok((false, _)) => {
                tracing::info!(uid = %key, "blob committed concurrently, discarding copy");
                Ok(WriteOutcome::Deduplicated)
            }
            Err(e) => {
                remove_quietly(&tmp).await;
                Err(e)
            }
        }
    }

    async fn read(&self, key: &BlobKey) -> Result<ByteStream, StorageError> {
        match fs::File::open(self.blob_path(key)).await {
            Ok(file) => Ok(Box::pin(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &BlobKey) -> Result<bool, StorageError> {
        Ok(fs::try_exists(self.blob_path(key)).await?)
    }

    async fn delete(&self, key: &BlobKey) -> Result<bool, StorageError> {
        let path = self.blob_path(key);
        let meta = match fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let mut perms = meta.permissions();
        if perms.readonly() {
            make_writable(&mut perms);
            fs::set_permissions(&path, perms).await?;
        }
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::info!(uid = %key, "blob deleted");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path).await {
        if e.kind() != io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove temp file");
        }
    }
}

async fn set_readonly(path: &Path) {
    let result = async {
        let mut perms = fs::metadata(path).await?.permissions();
        perms.set_readonly(true);
        fs::set_permissions(path, perms).await
    }
    .await;
    if let Err(e) = result {
        tracing::warn!(path = %path.display(), error = %e, "failed to mark blob read-only");
    }
}

#[cfg(unix)]
fn make_writable(perms: &mut Permissions) {
    use std::os::unix::fs::PermissionsExt;
    perms.set_mode(perms.mode() | 0o200);
}

#[cfg(not(unix))]
#[allow(clippy::permissions_set_readonly_false)]
fn make_writable(perms: &mut Permissions) {
    perms.set_readonly(false);
}
