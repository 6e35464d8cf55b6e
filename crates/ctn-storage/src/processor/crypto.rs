//! Envelope encryption stage

use std::io;

use ctn_crypto::{spawn_pipe, BufferPool, PipeWriter, StreamCipher, MAGIC};
use tokio::io::BufWriter;

use super::{peek_magic, STAGE_BUFFER_LEN};
use crate::backend::ByteStream;
use crate::pipeline::PipelineContext;

#[derive(Debug, Clone)]
pub struct CryptoProcessor {
    cipher: StreamCipher,
    chunk_size: usize,
    priority: i32,
    pipe_capacity: usize,
    pool: BufferPool,
}

impl CryptoProcessor {
    pub fn new(cipher: StreamCipher, chunk_size: usize, priority: i32) -> Self {
        Self {
            cipher,
            chunk_size,
            priority,
            pipe_capacity: 8,
            pool: BufferPool::global().clone(),
        }
    }

    /// Queue depth and buffer pool of the stage's output pipe.
    pub fn with_pipe(mut self, capacity: usize, pool: BufferPool) -> Self {
        self.pipe_capacity = capacity;
        self.pool = pool;
        self
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn cipher(&self) -> &StreamCipher {
        &self.cipher
    }

    pub(crate) fn encode(
        &self,
        input: ByteStream,
        declared_len: Option<u64>,
        ctx: &PipelineContext,
    ) -> ByteStream {
        let cipher = self.cipher.clone();
        let chunk_size = self.chunk_size;
        let reader = spawn_pipe(
            self.pipe_capacity,
            self.pool.clone(),
            &ctx.cancel,
            move |writer| seal(cipher, input, declared_len, chunk_size, writer),
        );
        Box::pin(reader)
    }

    pub(crate) async fn decode(
        &self,
        input: ByteStream,
        ctx: &PipelineContext,
    ) -> io::Result<Option<ByteStream>> {
        let Some(input) = peek_magic(input, &MAGIC).await? else {
            return Ok(None);
        };
        let cipher = self.cipher.clone();
        let reader = spawn_pipe(
            self.pipe_capacity,
            self.pool.clone(),
            &ctx.cancel,
            move |writer| open(cipher, input, writer),
        );
        Ok(Some(Box::pin(reader)))
    }
}

async fn seal(
    cipher: StreamCipher,
    mut input: ByteStream,
    declared_len: Option<u64>,
    chunk_size: usize,
    writer: PipeWriter,
) -> io::Result<()> {
    // the pipe's own token, so a dropped reader stops the cipher and its workers
    let cancel = writer.cancellation();
    let mut out = BufWriter::with_capacity(STAGE_BUFFER_LEN, writer);
    let plaintext = match declared_len {
        Some(len) => {
            cipher
                .encrypt_with_length(&mut input, &mut out, chunk_size, len, &cancel)
                .await?
        }
        None => cipher.encrypt(&mut input, &mut out, chunk_size, &cancel).await?,
    };
    tracing::debug!(plaintext, "sealed stream");
    Ok(())
}

async fn open(cipher: StreamCipher, mut input: ByteStream, writer: PipeWriter) -> io::Result<()> {
    let cancel = writer.cancellation();
    let mut out = BufWriter::with_capacity(STAGE_BUFFER_LEN, writer);
    let plaintext = cipher.decrypt(&mut input, &mut out, &cancel).await?;
    tracing::debug!(plaintext, "opened stream");
    Ok(())
}
