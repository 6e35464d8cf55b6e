//! Chunked AES-256-GCM stream cipher
//!
//! Plaintext is read sequentially in `chunk_size` pieces, sealed in place on
//! up to `threads` blocking workers, and written back strictly in chunk
//! order. One chunk of read-ahead decides which chunk carries the final bit.
//!
//! ```text
//! input ─► read chunk i+1 ─► [seal i | seal i-1 | ...] ─► ordered queue ─► write frame i-k
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::sync::Arc;

use aes_gcm::aead::AeadInPlace;
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::CipherError;
use crate::format::{
    chunk_aad, chunk_nonce, decode_chunk_len, encode_chunk_len, read_header, ContainerHeader,
    HeaderLayout, WrappedKey, FLAG_HAS_FOOTER, FLAG_NONE, FOOTER_INDEX, FOOTER_LEN,
    KEY_CHECK_INDEX,
};
use crate::keys::{DataKey, DetachedKey, KeyRegistry, OpeningKey};
use crate::pool::{BufferPool, PooledBuffer};
use crate::{KEY_SIZE, MAX_CHUNK_SIZE, NONCE_SIZE, TAG_SIZE};

/// Envelope-encrypting stream cipher bound to a key registry.
#[derive(Clone)]
pub struct StreamCipher {
    registry: Arc<dyn KeyRegistry>,
    threads: usize,
    pool: BufferPool,
}

impl std::fmt::Debug for StreamCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamCipher")
            .field("active_key_id", &self.registry.active_key_id())
            .field("threads", &self.threads)
            .finish()
    }
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(2)
}

struct SealedChunk {
    buf: PooledBuffer,
    tag: [u8; TAG_SIZE],
    is_final: bool,
}

impl StreamCipher {
    pub fn new(registry: Arc<dyn KeyRegistry>) -> Self {
        Self {
            registry,
            threads: default_threads(),
            pool: BufferPool::global().clone(),
        }
    }

    /// Worker count for sealing/opening chunks (0 = available parallelism).
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = if threads == 0 {
            default_threads()
        } else {
            threads
        };
        self
    }

    pub fn with_pool(mut self, pool: BufferPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn registry(&self) -> &Arc<dyn KeyRegistry> {
        &self.registry
    }

    /// Encrypt `input` into a full-header container on `output`.
    ///
    /// The plaintext length is not declared; an authenticated footer carries
    /// it instead. Returns the number of plaintext bytes sealed.
    pub async fn encrypt<R, W>(
        &self,
        input: &mut R,
        output: &mut W,
        chunk_size: usize,
        cancel: &CancellationToken,
    ) -> Result<u64, CipherError>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        self.encrypt_with_material(DataKey::generate(), nonce, None, input, output, chunk_size, cancel)
            .await
    }

    /// Encrypt with the plaintext length declared in the header.
    ///
    /// Fails with `TruncatedOrCorrupt` if `input` does not hold exactly
    /// `plaintext_length` bytes.
    pub async fn encrypt_with_length<R, W>(
        &self,
        input: &mut R,
        output: &mut W,
        chunk_size: usize,
        plaintext_length: u64,
        cancel: &CancellationToken,
    ) -> Result<u64, CipherError>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        self.encrypt_with_material(
            DataKey::generate(),
            nonce,
            Some(plaintext_length),
            input,
            output,
            chunk_size,
            cancel,
        )
        .await
    }

    /// Full-header encryption with caller-chosen data key and nonce.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn encrypt_with_material<R, W>(
        &self,
        data_key: DataKey,
        nonce: [u8; NONCE_SIZE],
        declared: Option<u64>,
        input: &mut R,
        output: &mut W,
        chunk_size: usize,
        cancel: &CancellationToken,
    ) -> Result<u64, CipherError>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        check_chunk_size(chunk_size)?;
        let (flags, plaintext_length) = length_fields(declared)?;
        let key_id = self.registry.active_key_id();

        let mut header = ContainerHeader::full(
            key_id,
            flags,
            nonce,
            [0u8; TAG_SIZE],
            [0u8; KEY_SIZE],
            plaintext_length,
        );
        let (encrypted_key, tag) = self.registry.wrap(key_id, &nonce, &header.aad(), &data_key)?;
        header.tag = tag;
        header.wrapped = Some(WrappedKey {
            nonce,
            encrypted_key,
        });

        self.seal_stream(&header, &data_key, &nonce, input, output, chunk_size, cancel)
            .await
    }

    /// Encrypt under a caller-held key, writing a compact header.
    ///
    /// The key is consumed: its nonce must never seal a second container.
    pub async fn encrypt_with_key<R, W>(
        &self,
        key: DetachedKey,
        input: &mut R,
        output: &mut W,
        chunk_size: usize,
        cancel: &CancellationToken,
    ) -> Result<u64, CipherError>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        check_chunk_size(chunk_size)?;
        let key_id = key.key_id;
        let (data_key, nonce) = key.into_parts();
        let mut header = ContainerHeader::compact(key_id, FLAG_HAS_FOOTER, [0u8; TAG_SIZE], -1);
        let check_nonce = chunk_nonce(&nonce, KEY_CHECK_INDEX);
        let tag = data_key
            .aead()
            .encrypt_in_place_detached(Nonce::from_slice(&check_nonce), &header.aad(), &mut [])
            .map_err(|_| CipherError::AuthenticationFailed("key check seal"))?;
        header.tag.copy_from_slice(&tag);

        self.seal_stream(&header, &data_key, &nonce, input, output, chunk_size, cancel)
            .await
    }

    /// Decrypt a full-header container. Returns the plaintext byte count.
    pub async fn decrypt<R, W>(
        &self,
        input: &mut R,
        output: &mut W,
        cancel: &CancellationToken,
    ) -> Result<u64, CipherError>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let header = cancellable_header(input, cancel).await?;
        let wrapped = header.wrapped.as_ref().ok_or(CipherError::LayoutMismatch {
            expected: HeaderLayout::Full.name(),
            found: HeaderLayout::Compact.name(),
        })?;
        let data_key = self.registry.unwrap(
            header.key_id,
            &wrapped.nonce,
            &header.aad(),
            &wrapped.encrypted_key,
            &header.tag,
        )?;
        self.open_stream(&header, &data_key, &wrapped.nonce, input, output, cancel)
            .await
    }

    /// Decrypt a compact-header container with a caller-held key.
    pub async fn decrypt_with_key<R, W>(
        &self,
        key: &OpeningKey,
        input: &mut R,
        output: &mut W,
        cancel: &CancellationToken,
    ) -> Result<u64, CipherError>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let header = cancellable_header(input, cancel).await?;
        if header.layout() != HeaderLayout::Compact {
            return Err(CipherError::LayoutMismatch {
                expected: HeaderLayout::Compact.name(),
                found: header.layout().name(),
            });
        }
        if header.key_id != key.key_id {
            return Err(CipherError::UnknownKeyId(header.key_id));
        }
        let check_nonce = chunk_nonce(key.nonce(), KEY_CHECK_INDEX);
        key.data_key()
            .aead()
            .decrypt_in_place_detached(
                Nonce::from_slice(&check_nonce),
                &header.aad(),
                &mut [],
                Tag::from_slice(&header.tag),
            )
            .map_err(|_| CipherError::AuthenticationFailed("key check"))?;

        self.open_stream(&header, key.data_key(), key.nonce(), input, output, cancel)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn seal_stream<R, W>(
        &self,
        header: &ContainerHeader,
        data_key: &DataKey,
        base_nonce: &[u8; NONCE_SIZE],
        input: &mut R,
        output: &mut W,
        chunk_size: usize,
        cancel: &CancellationToken,
    ) -> Result<u64, CipherError>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let aead = Arc::new(data_key.aead());
        cancellable(cancel, output.write_all(&header.to_bytes())).await?;

        let mut workers = OrderedWorkers::new(self.threads);
        let result = self
            .seal_chunks(&mut workers, header, &aead, base_nonce, input, output, chunk_size, cancel)
            .await;
        if result.is_err() {
            workers.join_all().await;
        }
        let (total, chunks) = result?;

        if header.has_footer() {
            let mut footer = total.to_le_bytes();
            let nonce = chunk_nonce(base_nonce, FOOTER_INDEX);
            let aad = chunk_aad(header.layout(), header.key_id, FOOTER_INDEX, 8, true);
            let tag = aead
                .encrypt_in_place_detached(Nonce::from_slice(&nonce), &aad, &mut footer)
                .map_err(|_| CipherError::AuthenticationFailed("footer seal"))?;
            cancellable(cancel, output.write_all(&footer)).await?;
            cancellable(cancel, output.write_all(&tag)).await?;
        }
        cancellable(cancel, output.flush()).await?;

        tracing::debug!(
            key_id = header.key_id,
            layout = header.layout().name(),
            bytes = total,
            chunks,
            "container sealed"
        );
        Ok(total)
    }

    #[allow(clippy::too_many_arguments)]
    async fn seal_chunks<R, W>(
        &self,
        workers: &mut OrderedWorkers<SealedChunk>,
        header: &ContainerHeader,
        aead: &Arc<Aes256Gcm>,
        base_nonce: &[u8; NONCE_SIZE],
        input: &mut R,
        output: &mut W,
        chunk_size: usize,
        cancel: &CancellationToken,
    ) -> Result<(u64, u64), CipherError>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let declared = header.declared_length();
        let mut total: u64 = 0;
        let mut index: u64 = 0;
        let mut current = self.read_chunk(input, chunk_size, cancel).await?;

        loop {
            let next = if current.len() == chunk_size {
                let buf = self.read_chunk(input, chunk_size, cancel).await?;
                (!buf.is_empty()).then_some(buf)
            } else {
                None
            };
            let is_final = next.is_none();

            total += current.len() as u64;
            if declared.is_some_and(|d| total > d) {
                return Err(CipherError::TruncatedOrCorrupt(
                    "input longer than declared length".into(),
                ));
            }

            let nonce = chunk_nonce(base_nonce, index);
            let aad = chunk_aad(header.layout(), header.key_id, index, current.len() as u32, is_final);
            let aead = Arc::clone(aead);
            let mut buf = current;
            workers.push(move || {
                let tag = aead
                    .encrypt_in_place_detached(Nonce::from_slice(&nonce), &aad, &mut buf)
                    .map_err(|_| CipherError::AuthenticationFailed("chunk seal"))?;
                let mut tag_bytes = [0u8; TAG_SIZE];
                tag_bytes.copy_from_slice(&tag);
                Ok(SealedChunk {
                    buf,
                    tag: tag_bytes,
                    is_final,
                })
            });

            if workers.is_full() {
                if let Some(sealed) = workers.pop().await {
                    write_sealed(output, sealed?, cancel).await?;
                }
            }

            match next {
                Some(buf) => {
                    current = buf;
                    index += 1;
                }
                None => break,
            }
        }

        while let Some(sealed) = workers.pop().await {
            write_sealed(output, sealed?, cancel).await?;
        }

        if declared.is_some_and(|d| total != d) {
            return Err(CipherError::TruncatedOrCorrupt(format!(
                "input shorter than declared length ({total} bytes)"
            )));
        }
        Ok((total, index + 1))
    }

    async fn open_stream<R, W>(
        &self,
        header: &ContainerHeader,
        data_key: &DataKey,
        base_nonce: &[u8; NONCE_SIZE],
        input: &mut R,
        output: &mut W,
        cancel: &CancellationToken,
    ) -> Result<u64, CipherError>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let aead = Arc::new(data_key.aead());
        let mut workers = OrderedWorkers::new(self.threads);
        let result = self
            .open_chunks(&mut workers, header, &aead, base_nonce, input, output, cancel)
            .await;
        if result.is_err() {
            workers.join_all().await;
        }
        let total = result?;

        if header.has_footer() {
            let mut footer = [0u8; FOOTER_LEN];
            read_frame(input, &mut footer, cancel, "footer").await?;
            let (sealed, tag) = footer.split_at_mut(8);
            let nonce = chunk_nonce(base_nonce, FOOTER_INDEX);
            let aad = chunk_aad(header.layout(), header.key_id, FOOTER_INDEX, 8, true);
            aead.decrypt_in_place_detached(
                Nonce::from_slice(&nonce),
                &aad,
                sealed,
                Tag::from_slice(tag),
            )
            .map_err(|_| CipherError::AuthenticationFailed("footer"))?;
            let mut stated = [0u8; 8];
            stated.copy_from_slice(sealed);
            let stated = u64::from_le_bytes(stated);
            if stated != total {
                return Err(CipherError::TruncatedOrCorrupt(format!(
                    "footer states {stated} bytes, decrypted {total}"
                )));
            }
        }
        if header.declared_length().is_some_and(|d| d != total) {
            return Err(CipherError::TruncatedOrCorrupt(format!(
                "header declares {} bytes, decrypted {total}",
                header.plaintext_length
            )));
        }

        let mut probe = [0u8; 1];
        if cancellable(cancel, input.read(&mut probe)).await? != 0 {
            return Err(CipherError::TruncatedOrCorrupt(
                "trailing data after final chunk".into(),
            ));
        }
        cancellable(cancel, output.flush()).await?;

        tracing::debug!(key_id = header.key_id, bytes = total, "container opened");
        Ok(total)
    }

    #[allow(clippy::too_many_arguments)]
    async fn open_chunks<R, W>(
        &self,
        workers: &mut OrderedWorkers<PooledBuffer>,
        header: &ContainerHeader,
        aead: &Arc<Aes256Gcm>,
        base_nonce: &[u8; NONCE_SIZE],
        input: &mut R,
        output: &mut W,
        cancel: &CancellationToken,
    ) -> Result<u64, CipherError>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let declared = header.declared_length();
        let mut total: u64 = 0;
        let mut index: u64 = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(CipherError::Cancelled);
            }
            let mut prefix = [0u8; 4];
            read_frame(input, &mut prefix, cancel, "chunk").await?;
            let (sealed_len, is_final) = decode_chunk_len(prefix);
            if !(TAG_SIZE..=MAX_CHUNK_SIZE + TAG_SIZE).contains(&sealed_len) {
                return Err(CipherError::InvalidChunkSize(sealed_len));
            }
            let plain_len = sealed_len - TAG_SIZE;

            total += plain_len as u64;
            if declared.is_some_and(|d| total > d) {
                return Err(CipherError::TruncatedOrCorrupt(
                    "container longer than declared length".into(),
                ));
            }

            let mut buf = self.pool.lease(plain_len);
            buf.set_sensitive();
            read_frame(input, &mut buf, cancel, "chunk").await?;
            let mut tag = [0u8; TAG_SIZE];
            read_frame(input, &mut tag, cancel, "chunk").await?;

            let nonce = chunk_nonce(base_nonce, index);
            let aad = chunk_aad(header.layout(), header.key_id, index, plain_len as u32, is_final);
            let aead = Arc::clone(aead);
            workers.push(move || {
                aead.decrypt_in_place_detached(
                    Nonce::from_slice(&nonce),
                    &aad,
                    &mut buf,
                    Tag::from_slice(&tag),
                )
                .map_err(|_| CipherError::AuthenticationFailed("chunk"))?;
                Ok(buf)
            });

            if workers.is_full() {
                if let Some(plain) = workers.pop().await {
                    cancellable(cancel, output.write_all(&plain?)).await?;
                }
            }

            if is_final {
                break;
            }
            index += 1;
            if index >= FOOTER_INDEX {
                return Err(CipherError::TruncatedOrCorrupt("chunk index overflow".into()));
            }
        }

        while let Some(plain) = workers.pop().await {
            cancellable(cancel, output.write_all(&plain?)).await?;
        }
        Ok(total)
    }

    async fn read_chunk<R>(
        &self,
        input: &mut R,
        chunk_size: usize,
        cancel: &CancellationToken,
    ) -> Result<PooledBuffer, CipherError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        if cancel.is_cancelled() {
            return Err(CipherError::Cancelled);
        }
        let mut buf = self.pool.lease(chunk_size);
        buf.set_sensitive();
        let mut filled = 0;
        while filled < chunk_size {
            let n = cancellable(cancel, input.read(&mut buf[filled..])).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

fn check_chunk_size(chunk_size: usize) -> Result<(), CipherError> {
    if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
        return Err(CipherError::InvalidChunkSize(chunk_size));
    }
    Ok(())
}

/// Header `(flags, plaintext_length)` for an optionally declared length.
fn length_fields(declared: Option<u64>) -> Result<(i32, i64), CipherError> {
    match declared {
        None => Ok((FLAG_HAS_FOOTER, -1)),
        Some(len) => {
            let len = i64::try_from(len).map_err(|_| {
                CipherError::InvalidFormat(format!("plaintext length {len} out of range"))
            })?;
            Ok((FLAG_NONE, len))
        }
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = io::Result<T>>,
) -> Result<T, CipherError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CipherError::Cancelled),
        r = fut => r.map_err(CipherError::from),
    }
}

async fn cancellable_header<R>(
    input: &mut R,
    cancel: &CancellationToken,
) -> Result<ContainerHeader, CipherError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(CipherError::Cancelled),
        r = read_header(input) => r,
    }
}

/// Read an exact frame section; a short stream means the container was cut.
async fn read_frame<R>(
    input: &mut R,
    buf: &mut [u8],
    cancel: &CancellationToken,
    what: &str,
) -> Result<(), CipherError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match cancellable(cancel, input.read_exact(buf)).await {
        Ok(_) => Ok(()),
        Err(CipherError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => Err(
            CipherError::TruncatedOrCorrupt(format!("stream ended inside {what} frame")),
        ),
        Err(e) => Err(e),
    }
}

async fn write_sealed<W>(
    output: &mut W,
    sealed: SealedChunk,
    cancel: &CancellationToken,
) -> Result<(), CipherError>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let prefix = encode_chunk_len(sealed.buf.len() + TAG_SIZE, sealed.is_final);
    cancellable(cancel, output.write_all(&prefix)).await?;
    cancellable(cancel, output.write_all(&sealed.buf)).await?;
    cancellable(cancel, output.write_all(&sealed.tag)).await?;
    Ok(())
}

enum Slot<T> {
    Done(Result<T, CipherError>),
    Running(JoinHandle<Result<T, CipherError>>),
}

/// Bounded set of chunk jobs whose results are taken strictly in push order.
///
/// With a limit of one, jobs run inline on the calling task.
pub(crate) struct OrderedWorkers<T> {
    limit: usize,
    queue: VecDeque<Slot<T>>,
}

impl<T: Send + 'static> OrderedWorkers<T> {
    pub(crate) fn new(threads: usize) -> Self {
        let limit = threads.max(1);
        Self {
            limit,
            queue: VecDeque::with_capacity(limit),
        }
    }

    pub(crate) fn push<F>(&mut self, job: F)
    where
        F: FnOnce() -> Result<T, CipherError> + Send + 'static,
    {
        let slot = if self.limit == 1 {
            Slot::Done(job())
        } else {
            Slot::Running(tokio::task::spawn_blocking(job))
        };
        self.queue.push_back(slot);
    }

    pub(crate) fn is_full(&self) -> bool {
        self.queue.len() >= self.limit
    }

    /// Oldest result, waiting for it if still running.
    pub(crate) async fn pop(&mut self) -> Option<Result<T, CipherError>> {
        let slot = self.queue.pop_front()?;
        Some(match slot {
            Slot::Done(result) => result,
            Slot::Running(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(CipherError::Worker(e.to_string())),
            },
        })
    }

    /// Wait for every in-flight job so their buffers are back in the pool.
    pub(crate) async fn join_all(&mut self) {
        while let Some(slot) = self.queue.pop_front() {
            if let Slot::Running(handle) = slot {
                let _ = handle.await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{COMPACT_HEADER_LEN, FULL_HEADER_LEN};
    use crate::keys::{MasterKey, StaticKeyRing};
    use proptest::prelude::*;

    fn registry() -> Arc<dyn KeyRegistry> {
        Arc::new(StaticKeyRing::single(1, MasterKey::from_bytes([42u8; KEY_SIZE])))
    }

    fn cipher(threads: usize) -> StreamCipher {
        StreamCipher::new(registry())
            .with_threads(threads)
            .with_pool(BufferPool::new(32, 4 * 1024 * 1024))
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    async fn seal(c: &StreamCipher, data: &[u8], chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        c.encrypt(&mut &data[..], &mut out, chunk, &CancellationToken::new())
            .await
            .unwrap();
        out
    }

    async fn open(c: &StreamCipher, container: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut out = Vec::new();
        c.decrypt(&mut &container[..], &mut out, &CancellationToken::new())
            .await?;
        Ok(out)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_roundtrip_edge_sizes() {
        let c = cipher(4);
        let chunk = 4096;
        for len in [0, 1, chunk - 1, chunk, chunk + 1, 3 * chunk] {
            let data = sample(len);
            let container = seal(&c, &data, chunk).await;
            assert_eq!(open(&c, &container).await.unwrap(), data, "len {len}");
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_roundtrip_multi_megabyte() {
        let c = cipher(4);
        let data = sample(5 * 1024 * 1024 + 123);
        let container = seal(&c, &data, 64 * 1024).await;
        assert_eq!(open(&c, &container).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_empty_input_single_final_chunk() {
        let c = cipher(1);
        let container = seal(&c, b"", 16).await;
        // header + one empty final chunk + footer
        assert_eq!(container.len(), FULL_HEADER_LEN + 4 + TAG_SIZE + FOOTER_LEN);
        let (len, is_final) = decode_chunk_len(
            container[FULL_HEADER_LEN..FULL_HEADER_LEN + 4]
                .try_into()
                .unwrap(),
        );
        assert_eq!(len, TAG_SIZE);
        assert!(is_final);
    }

    #[tokio::test]
    async fn test_tampered_chunk_fails() {
        let c = cipher(1);
        let data = sample(100);
        let container = seal(&c, &data, 32).await;

        // every byte of the first chunk frame body (ciphertext and tag)
        let body = FULL_HEADER_LEN + 4..FULL_HEADER_LEN + 4 + 32 + TAG_SIZE;
        for pos in body {
            let mut bad = container.clone();
            bad[pos] ^= 0x01;
            let err = open(&c, &bad).await.unwrap_err();
            assert!(
                matches!(err, CipherError::AuthenticationFailed(_)),
                "byte {pos}: {err:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_tampered_header_fails() {
        let c = cipher(1);
        let container = seal(&c, &sample(10), 32).await;

        // wrap tag
        let mut bad = container.clone();
        bad[30] ^= 0x80;
        assert!(matches!(
            open(&c, &bad).await.unwrap_err(),
            CipherError::AuthenticationFailed(_)
        ));

        // encrypted key
        let mut bad = container.clone();
        bad[50] ^= 0x80;
        assert!(matches!(
            open(&c, &bad).await.unwrap_err(),
            CipherError::AuthenticationFailed(_)
        ));

        // magic
        let mut bad = container;
        bad[1] = b'Z';
        assert!(matches!(
            open(&c, &bad).await.unwrap_err(),
            CipherError::InvalidFormat(_)
        ));
    }

    #[tokio::test]
    async fn test_swapped_chunks_fail() {
        let c = cipher(1);
        let container = seal(&c, &sample(64), 32).await;
        let frame = 4 + 32 + TAG_SIZE;
        let first = FULL_HEADER_LEN..FULL_HEADER_LEN + frame;
        let second = FULL_HEADER_LEN + frame..FULL_HEADER_LEN + 2 * frame;

        let mut bad = container.clone();
        bad[first.clone()].copy_from_slice(&container[second.clone()]);
        bad[second].copy_from_slice(&container[first]);
        assert!(matches!(
            open(&c, &bad).await.unwrap_err(),
            CipherError::AuthenticationFailed(_)
        ));
    }

    #[tokio::test]
    async fn test_truncation_detected() {
        let c = cipher(1);
        let container = seal(&c, &sample(40), 16).await;
        let frame = 4 + 16 + TAG_SIZE;

        // dropped final chunk, cut at a frame boundary
        let cut = &container[..FULL_HEADER_LEN + 2 * frame];
        assert!(matches!(
            open(&c, cut).await.unwrap_err(),
            CipherError::TruncatedOrCorrupt(_)
        ));

        // dropped footer
        let cut = &container[..container.len() - FOOTER_LEN];
        assert!(matches!(
            open(&c, cut).await.unwrap_err(),
            CipherError::TruncatedOrCorrupt(_)
        ));

        // cut mid-chunk
        let cut = &container[..FULL_HEADER_LEN + 10];
        assert!(matches!(
            open(&c, cut).await.unwrap_err(),
            CipherError::TruncatedOrCorrupt(_)
        ));

        // cut mid-header
        let cut = &container[..20];
        assert!(matches!(
            open(&c, cut).await.unwrap_err(),
            CipherError::InvalidFormat(_)
        ));
    }

    #[tokio::test]
    async fn test_trailing_bytes_rejected() {
        let c = cipher(1);
        let mut container = seal(&c, &sample(40), 16).await;
        container.push(0);
        assert!(matches!(
            open(&c, &container).await.unwrap_err(),
            CipherError::TruncatedOrCorrupt(_)
        ));
    }

    #[tokio::test]
    async fn test_fresh_key_and_nonce_per_encrypt() {
        let c = cipher(1);
        let data = sample(1000);
        let a = seal(&c, &data, 256).await;
        let b = seal(&c, &data, 256).await;
        assert_ne!(a[..FULL_HEADER_LEN], b[..FULL_HEADER_LEN]);
        assert_ne!(a[FULL_HEADER_LEN..], b[FULL_HEADER_LEN..]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_output_matches_sequential() {
        let data = sample(300_000);
        let nonce = [5u8; NONCE_SIZE];
        let key = [9u8; KEY_SIZE];
        let cancel = CancellationToken::new();

        let mut outputs = Vec::new();
        for threads in [1, 2, 8] {
            let mut out = Vec::new();
            cipher(threads)
                .encrypt_with_material(
                    DataKey::from_bytes(key),
                    nonce,
                    None,
                    &mut &data[..],
                    &mut out,
                    4096,
                    &cancel,
                )
                .await
                .unwrap();
            outputs.push(out);
        }
        assert_eq!(outputs[0], outputs[1]);
        assert_eq!(outputs[0], outputs[2]);
        assert_eq!(open(&cipher(8), &outputs[2]).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_declared_length() {
        let c = cipher(1);
        let data = sample(500);
        let cancel = CancellationToken::new();

        let mut out = Vec::new();
        c.encrypt_with_length(&mut &data[..], &mut out, 128, 500, &cancel)
            .await
            .unwrap();
        let header = ContainerHeader::parse(&out).unwrap();
        assert_eq!(header.declared_length(), Some(500));
        assert!(!header.has_footer());
        assert_eq!(open(&c, &out).await.unwrap(), data);

        let mut out = Vec::new();
        let err = c
            .encrypt_with_length(&mut &data[..], &mut out, 128, 499, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CipherError::TruncatedOrCorrupt(_)));

        let mut out = Vec::new();
        let err = c
            .encrypt_with_length(&mut &data[..], &mut out, 128, 501, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CipherError::TruncatedOrCorrupt(_)));
    }

    #[tokio::test]
    async fn test_detached_key_roundtrip() {
        let c = cipher(2);
        let key = DetachedKey::generate(11);
        let opening = key.opening_key();
        let data = sample(10_000);
        let cancel = CancellationToken::new();

        let mut container = Vec::new();
        c.encrypt_with_key(key, &mut &data[..], &mut container, 1024, &cancel)
            .await
            .unwrap();
        assert_eq!(
            ContainerHeader::parse(&container).unwrap().layout(),
            HeaderLayout::Compact
        );

        let mut out = Vec::new();
        c.decrypt_with_key(&opening, &mut &container[..], &mut out, &cancel)
            .await
            .unwrap();
        assert_eq!(out, data);

        // compact containers need the detached-key API
        assert!(matches!(
            open(&c, &container).await.unwrap_err(),
            CipherError::LayoutMismatch { .. }
        ));

        // wrong key fails at the key check
        let other = DetachedKey::generate(11).opening_key();
        let err = c
            .decrypt_with_key(&other, &mut &container[..], &mut Vec::new(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CipherError::AuthenticationFailed("key check")));
    }

    #[tokio::test]
    async fn test_detached_seals_share_no_keystream() {
        let c = cipher(1);
        let cancel = CancellationToken::new();
        let zeros = [0u8; 64];
        let secret = b"attack at dawn attack at dawn attack at dawn attack at dawn 1234";

        let mut first = Vec::new();
        let key = DetachedKey::generate(4);
        c.encrypt_with_key(key, &mut &zeros[..], &mut first, 1024, &cancel)
            .await
            .unwrap();
        let mut second = Vec::new();
        let key = DetachedKey::generate(4);
        c.encrypt_with_key(key, &mut &secret[..], &mut second, 1024, &cancel)
            .await
            .unwrap();

        // xor of the two chunk-0 ciphertexts with the known plaintext must
        // not give back the other plaintext
        let body = COMPACT_HEADER_LEN + 4..COMPACT_HEADER_LEN + 4 + 64;
        let recovered: Vec<u8> = first[body.clone()]
            .iter()
            .zip(&second[body])
            .zip(zeros.iter())
            .map(|((a, b), p)| a ^ b ^ p)
            .collect();
        assert_ne!(recovered.as_slice(), &secret[..]);
    }

    #[tokio::test]
    async fn test_opening_key_from_stored_parts() {
        let c = cipher(1);
        let key = DetachedKey::generate(6);
        let opening = key.opening_key();
        let stored = OpeningKey::from_parts(6, opening.data_key().clone(), *opening.nonce());

        let cancel = CancellationToken::new();
        let mut container = Vec::new();
        c.encrypt_with_key(key, &mut &b"kept elsewhere"[..], &mut container, 16, &cancel)
            .await
            .unwrap();
        let mut out = Vec::new();
        c.decrypt_with_key(&stored, &mut &container[..], &mut out, &cancel)
            .await
            .unwrap();
        assert_eq!(out, b"kept elsewhere");
    }

    #[tokio::test]
    async fn test_detached_key_rejects_full_container() {
        let c = cipher(1);
        let container = seal(&c, b"full layout", 16).await;
        let err = c
            .decrypt_with_key(
                &DetachedKey::generate(1).opening_key(),
                &mut &container[..],
                &mut Vec::new(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CipherError::LayoutMismatch { .. }));
    }

    #[tokio::test]
    async fn test_key_rotation() {
        let old = cipher(1);
        let data = sample(777);
        let container = seal(&old, &data, 100).await;

        let mut ring = StaticKeyRing::new(2);
        ring.insert(1, MasterKey::from_bytes([42u8; KEY_SIZE]));
        ring.insert(2, MasterKey::from_bytes([43u8; KEY_SIZE]));
        let rotated = StreamCipher::new(Arc::new(ring)).with_threads(1);
        assert_eq!(open(&rotated, &container).await.unwrap(), data);

        let fresh = seal(&rotated, &data, 100).await;
        assert_eq!(ContainerHeader::parse(&fresh).unwrap().key_id, 2);

        let retired =
            StreamCipher::new(Arc::new(StaticKeyRing::single(2, MasterKey::from_bytes([43u8; KEY_SIZE]))));
        assert!(matches!(
            open(&retired, &container).await.unwrap_err(),
            CipherError::UnknownKeyId(1)
        ));
    }

    #[tokio::test]
    async fn test_invalid_chunk_size() {
        let c = cipher(1);
        let mut out = Vec::new();
        let err = c
            .encrypt(&mut &b"x"[..], &mut out, 0, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CipherError::InvalidChunkSize(0)));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let c = cipher(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut out = Vec::new();
        let err = c
            .encrypt(&mut &sample(100)[..], &mut out, 16, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CipherError::Cancelled));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_buffers_returned_after_failure() {
        let pool = BufferPool::new(32, 1024 * 1024);
        let c = StreamCipher::new(registry()).with_threads(4).with_pool(pool.clone());
        let mut container = Vec::new();
        c.encrypt(&mut &sample(50_000)[..], &mut container, 1024, &CancellationToken::new())
            .await
            .unwrap();
        container[FULL_HEADER_LEN + 4 + 3_000] ^= 0xFF;

        let err = c
            .decrypt(&mut &container[..], &mut Vec::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CipherError::AuthenticationFailed(_)));
        assert_eq!(pool.outstanding(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..4096), chunk in 1usize..600) {
            let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let c = cipher(1);
            let out = rt.block_on(async {
                let container = seal(&c, &data, chunk).await;
                open(&c, &container).await
            }).unwrap();
            prop_assert_eq!(out, data);
        }
    }
}
