//! zstd compression stage
//!
//! zstd's streaming coder is synchronous, so each transform runs on a
//! blocking thread bridged to the async streams with `SyncIoBridge`.

use std::io;

use ctn_crypto::{spawn_pipe, BufferPool, PipeWriter};
use tokio_util::io::SyncIoBridge;

use super::{peek_magic, STAGE_BUFFER_LEN};
use crate::backend::ByteStream;
use crate::pipeline::PipelineContext;

/// zstd frame magic number (little-endian 0xFD2FB528)
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

#[derive(Debug, Clone)]
pub struct CompressionProcessor {
    level: i32,
    priority: i32,
    pipe_capacity: usize,
    pool: BufferPool,
}

impl CompressionProcessor {
    pub fn new(level: i32, priority: i32) -> Self {
        Self {
            level,
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

    pub fn level(&self) -> i32 {
        self.level
    }

    pub(crate) fn encode(&self, input: ByteStream, ctx: &PipelineContext) -> ByteStream {
        let level = self.level;
        let reader = spawn_pipe(
            self.pipe_capacity,
            self.pool.clone(),
            &ctx.cancel,
            move |writer| compress(input, writer, level),
        );
        Box::pin(reader)
    }

    pub(crate) async fn decode(
        &self,
        input: ByteStream,
        ctx: &PipelineContext,
    ) -> io::Result<Option<ByteStream>> {
        let Some(input) = peek_magic(input, &ZSTD_MAGIC).await? else {
            return Ok(None);
        };
        let reader = spawn_pipe(
            self.pipe_capacity,
            self.pool.clone(),
            &ctx.cancel,
            move |writer| decompress(input, writer),
        );
        Ok(Some(Box::pin(reader)))
    }
}

async fn compress(input: ByteStream, writer: PipeWriter, level: i32) -> io::Result<()> {
    let source = SyncIoBridge::new(input);
    let mut sink = SyncIoBridge::new(writer);
    tokio::task::spawn_blocking(move || {
        let source = io::BufReader::with_capacity(STAGE_BUFFER_LEN, source);
        zstd::stream::copy_encode(source, &mut sink, level)?;
        sink.shutdown()
    })
    .await
    .map_err(io::Error::other)?
}

async fn decompress(input: ByteStream, writer: PipeWriter) -> io::Result<()> {
    let source = SyncIoBridge::new(input);
    let mut sink = SyncIoBridge::new(writer);
    tokio::task::spawn_blocking(move || {
        let source = io::BufReader::with_capacity(STAGE_BUFFER_LEN, source);
        zstd::stream::copy_decode(source, &mut sink)?;
        sink.shutdown()
    })
    .await
    .map_err(io::Error::other)?
}
