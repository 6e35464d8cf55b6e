//! Storage pipeline: processors in priority order in front of a backend
//!
//! ```text
//! write(uid, plaintext) ─► [gate] ─► exists? ─► stage(high) ─► … ─► stage(low) ─► backend.write
//! read(uid)             ─► cache? ─► backend.read ─► stage(low) ─► … ─► stage(high) ─► plaintext
//! ```
//!
//! Every stage runs as a background task behind a bounded pipe, so a blob
//! streams through the whole chain without being held in memory.

use std::collections::HashMap;
use std::io::{self, Cursor};
use std::sync::Arc;

use bytes::Bytes;
use ctn_crypto::{spawn_pipe, BufferPool, PipeWriter};
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::backend::{ByteStream, StorageBackend, WriteOutcome};
use crate::cache::HotCache;
use crate::error::StorageError;
use crate::key::BlobKey;
use crate::processor::Processor;

/// Per-call hints. None of them is needed for correctness.
#[derive(Debug, Clone, Default)]
pub struct PipelineContext {
    /// Exact plaintext length of the blob being written, if known
    pub size_hint: Option<u64>,
    /// Keep the decoded blob in the hot cache after reading it
    pub cache: bool,
    /// Decoded length per uid, used to skip caching oversized blobs
    pub chunk_lengths: HashMap<String, u64>,
    pub cancel: CancellationToken,
}

impl PipelineContext {
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            ..Default::default()
        }
    }
}

#[derive(Clone)]
pub struct StoragePipeline {
    backend: Arc<dyn StorageBackend>,
    /// highest priority first
    processors: Arc<[Processor]>,
    write_gate: Arc<Semaphore>,
    cache: Option<Arc<HotCache>>,
    pipe_capacity: usize,
    pool: BufferPool,
}

impl std::fmt::Debug for StoragePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoragePipeline")
            .field("backend", &self.backend.name())
            .field("stages", &self.stages())
            .field("cache", &self.cache.is_some())
            .finish()
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl StoragePipeline {
    /// Fails with `PipelineMisconfigured` if two processors share a priority.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        mut processors: Vec<Processor>,
    ) -> Result<Self, StorageError> {
        processors.sort_by_key(|p| std::cmp::Reverse(p.priority()));
        if let Some(pair) = processors
            .windows(2)
            .find(|w| w[0].priority() == w[1].priority())
        {
            return Err(StorageError::PipelineMisconfigured(format!(
                "{} and {} processors share priority {}",
                pair[0].stage(),
                pair[1].stage(),
                pair[0].priority()
            )));
        }
        if processors.is_empty() {
            tracing::warn!("storage pipeline has no processors, blobs are stored as-is");
        }

        Ok(Self {
            backend,
            processors: processors.into(),
            write_gate: Arc::new(Semaphore::new(default_parallelism())),
            cache: None,
            pipe_capacity: 8,
            pool: BufferPool::global().clone(),
        })
    }

    /// Concurrent `write` calls allowed at once (0 = CPU count).
    pub fn with_max_parallel_writes(mut self, n: usize) -> Self {
        let n = if n == 0 { default_parallelism() } else { n };
        self.write_gate = Arc::new(Semaphore::new(n));
        self
    }

    pub fn with_cache(mut self, cache: HotCache) -> Self {
        self.cache = Some(Arc::new(cache));
        self
    }

    pub fn with_pipe(mut self, capacity: usize, pool: BufferPool) -> Self {
        self.pipe_capacity = capacity;
        self.pool = pool;
        self
    }

    pub fn backend(&self) -> &Arc<dyn StorageBackend> {
        &self.backend
    }

    pub fn cache(&self) -> Option<&HotCache> {
        self.cache.as_deref()
    }

    /// Stage names in write order.
    pub fn stages(&self) -> Vec<&'static str> {
        self.processors.iter().map(Processor::stage).collect()
    }

    pub async fn exists(&self, uid: &str) -> Result<bool, StorageError> {
        let key = BlobKey::parse(uid)?;
        self.backend.exists(&key).await
    }

    /// Encode `input` through every stage and store it under `uid`.
    ///
    /// Content already stored is not re-encoded; the input is dropped and
    /// the call reports `Deduplicated`.
    pub async fn write(
        &self,
        uid: &str,
        input: ByteStream,
        ctx: &PipelineContext,
    ) -> Result<WriteOutcome, StorageError> {
        let key = BlobKey::parse(uid)?;
        let _permit = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(StorageError::Cancelled),
            permit = self.write_gate.acquire() => permit
                .map_err(|_| StorageError::PipelineMisconfigured("write gate closed".into()))?,
        };

        if self.backend.exists(&key).await? {
            tracing::info!(uid = %key, "content already stored, skipping write");
            return Ok(WriteOutcome::Deduplicated);
        }

        let mut stream = input;
        let mut declared = ctx.size_hint;
        for processor in self.processors.iter() {
            stream = processor.write(&key, stream, declared, ctx).await?;
            declared = None;
        }

        let outcome = self.backend.write(&key, stream, &ctx.cancel).await?;
        if let WriteOutcome::Stored { bytes } = outcome {
            tracing::info!(
                uid = %key,
                stored_bytes = bytes,
                plaintext_bytes = ?ctx.size_hint,
                "blob written"
            );
        }
        Ok(outcome)
    }

    /// Open `uid` and undo every stage, yielding the original bytes.
    pub async fn read(&self, uid: &str, ctx: &PipelineContext) -> Result<ByteStream, StorageError> {
        let key = BlobKey::parse(uid)?;
        if let Some(data) = self.cache.as_ref().and_then(|c| c.get(&key)) {
            tracing::debug!(uid = %key, bytes = data.len(), "hot cache hit");
            return Ok(Box::pin(Cursor::new(data)));
        }

        let mut stream = self.backend.read(&key).await?;
        for processor in self.processors.iter().rev() {
            stream = processor.read(&key, stream, ctx).await?.ok_or_else(|| {
                StorageError::UnresolvedContent {
                    uid: key.to_string(),
                    stage: processor.stage(),
                }
            })?;
        }

        match (&self.cache, ctx.cache) {
            (Some(cache), true) => self.admit(cache, key, stream, ctx).await,
            _ => Ok(stream),
        }
    }

    /// Buffer a small decoded blob into the cache, handing back an
    /// equivalent stream either way.
    async fn admit(
        &self,
        cache: &HotCache,
        key: BlobKey,
        mut stream: ByteStream,
        ctx: &PipelineContext,
    ) -> Result<ByteStream, StorageError> {
        let limit = cache.item_max_bytes();
        if ctx
            .chunk_lengths
            .get(key.as_str())
            .is_some_and(|&len| len > limit)
        {
            return Ok(stream);
        }

        let mut head = Vec::new();
        (&mut stream).take(limit + 1).read_to_end(&mut head).await?;
        if head.len() as u64 > limit {
            tracing::debug!(uid = %key, "blob too large for hot cache");
            return Ok(Box::pin(Cursor::new(head).chain(stream)));
        }

        let data = Bytes::from(head);
        cache.insert(key.clone(), data.clone());
        tracing::debug!(uid = %key, bytes = data.len(), "hot cache fill");
        Ok(Box::pin(Cursor::new(data)))
    }

    /// Remove `uid` from the backend and the hot cache.
    pub async fn delete(&self, uid: &str) -> Result<bool, StorageError> {
        let key = BlobKey::parse(uid)?;
        if let Some(cache) = &self.cache {
            cache.remove(&key);
        }
        self.backend.delete(&key).await
    }

    /// One stream carrying the decoded content of `uids` back to back.
    ///
    /// All keys are validated up front; blobs are opened one at a time as
    /// the reader reaches them. A missing or undecodable blob fails the
    /// stream at that point.
    pub async fn read_concatenated<I, S>(
        &self,
        uids: I,
        ctx: &PipelineContext,
    ) -> Result<ByteStream, StorageError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys = uids
            .into_iter()
            .map(|uid| BlobKey::parse(uid.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        let pipeline = self.clone();
        let owned_ctx = ctx.clone();
        let reader = spawn_pipe(
            self.pipe_capacity,
            self.pool.clone(),
            &ctx.cancel,
            move |writer| concatenate(pipeline, keys, owned_ctx, writer),
        );
        Ok(Box::pin(reader))
    }
}

async fn concatenate(
    pipeline: StoragePipeline,
    keys: Vec<BlobKey>,
    ctx: PipelineContext,
    mut writer: PipeWriter,
) -> io::Result<()> {
    let ctx = PipelineContext {
        cancel: writer.cancellation(),
        ..ctx
    };
    let mut total = 0u64;
    for key in &keys {
        let mut blob = pipeline.read(key.as_str(), &ctx).await?;
        total += tokio::io::copy(&mut blob, &mut writer).await?;
    }
    tracing::debug!(blobs = keys.len(), bytes = total, "concatenated read finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ObjectStoreBackend;
    use crate::processor::CompressionProcessor;

    fn memory() -> Arc<dyn StorageBackend> {
        Arc::new(ObjectStoreBackend::memory().unwrap())
    }

    #[test]
    fn test_duplicate_priority_rejected() {
        let err = StoragePipeline::new(
            memory(),
            vec![
                Processor::Compression(CompressionProcessor::new(3, 10)),
                Processor::Compression(CompressionProcessor::new(5, 10)),
            ],
        )
        .unwrap_err();
        assert!(matches!(err, StorageError::PipelineMisconfigured(_)));
    }

    #[tokio::test]
    async fn test_invalid_uid_rejected_before_io() {
        let p = StoragePipeline::new(memory(), Vec::new()).unwrap();
        let ctx = PipelineContext::default();
        assert!(matches!(
            p.write("nothex!", Box::pin(Cursor::new(Vec::new())), &ctx).await,
            Err(StorageError::InvalidKey(_))
        ));
        assert!(matches!(
            p.read_concatenated(["abcdef", "xy"], &ctx).await,
            Err(StorageError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_write() {
        let p = StoragePipeline::new(memory(), Vec::new()).unwrap();
        let ctx = PipelineContext::default();
        ctx.cancel.cancel();
        let err = p
            .write("abcdef", Box::pin(Cursor::new(b"x".to_vec())), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Cancelled));
        assert!(!p.exists("abcdef").await.unwrap());
    }

    #[tokio::test]
    async fn test_passthrough_without_processors() {
        let p = StoragePipeline::new(memory(), Vec::new()).unwrap();
        let ctx = PipelineContext::default();
        p.write("abcdef", Box::pin(Cursor::new(b"raw".to_vec())), &ctx)
            .await
            .unwrap();
        let mut out = Vec::new();
        p.read("ABCDEF", &ctx)
            .await
            .unwrap()
            .read_to_end(&mut out)
            .await
            .unwrap();
        assert_eq!(out, b"raw");
    }
}
