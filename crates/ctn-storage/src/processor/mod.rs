//! Byte-stream transforms applied between the caller and the backend
//!
//! Processors run in descending priority on write and ascending priority on
//! read, so the last transform applied on write is the first one undone on
//! read:
//!
//! ```text
//! write: plaintext ─► compression(20) ─► crypto(10) ─► backend
//! read:  backend ─► crypto(10) ─► compression(20) ─► plaintext
//! ```
//!
//! A processor recognises its own output by a leading magic number. When the
//! stored bytes do not start with it, `read` yields `None` and the pipeline
//! reports the content as unresolved.

pub mod compression;
pub mod crypto;

use std::io;

use tokio::io::AsyncReadExt;

pub use compression::CompressionProcessor;
pub use crypto::CryptoProcessor;

use crate::backend::ByteStream;
use crate::error::StorageError;
use crate::key::BlobKey;
use crate::pipeline::PipelineContext;

/// Buffer between a processor's transform and its pipe.
pub(crate) const STAGE_BUFFER_LEN: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub enum Processor {
    Crypto(CryptoProcessor),
    Compression(CompressionProcessor),
}

impl Processor {
    pub fn priority(&self) -> i32 {
        match self {
            Processor::Crypto(p) => p.priority(),
            Processor::Compression(p) => p.priority(),
        }
    }

    /// Stage name used in logs and `UnresolvedContent` errors.
    pub fn stage(&self) -> &'static str {
        match self {
            Processor::Crypto(_) => "crypto",
            Processor::Compression(_) => "compression",
        }
    }

    /// Wrap `input` in this processor's encoding.
    ///
    /// `declared_len` is the exact length of `input` when known.
    pub async fn write(
        &self,
        uid: &BlobKey,
        input: ByteStream,
        declared_len: Option<u64>,
        ctx: &PipelineContext,
    ) -> Result<ByteStream, StorageError> {
        tracing::debug!(uid = %uid, stage = self.stage(), "applying write stage");
        match self {
            Processor::Crypto(p) => Ok(p.encode(input, declared_len, ctx)),
            Processor::Compression(p) => Ok(p.encode(input, ctx)),
        }
    }

    /// Undo this processor's encoding, or `None` if `input` is not ours.
    pub async fn read(
        &self,
        uid: &BlobKey,
        input: ByteStream,
        ctx: &PipelineContext,
    ) -> Result<Option<ByteStream>, StorageError> {
        let decoded = match self {
            Processor::Crypto(p) => p.decode(input, ctx).await?,
            Processor::Compression(p) => p.decode(input, ctx).await?,
        };
        if decoded.is_none() {
            tracing::debug!(uid = %uid, stage = self.stage(), "content not recognised");
        }
        Ok(decoded)
    }
}

/// Check that `input` starts with `magic`, handing back an equivalent stream.
///
/// Streams shorter than the magic are not recognised.
pub(crate) async fn peek_magic(
    mut input: ByteStream,
    magic: &[u8; 4],
) -> io::Result<Option<ByteStream>> {
    let mut prefix = [0u8; 4];
    let mut filled = 0;
    while filled < prefix.len() {
        let n = input.read(&mut prefix[filled..]).await?;
        if n == 0 {
            return Ok(None);
        }
        filled += n;
    }
    if &prefix != magic {
        return Ok(None);
    }
    Ok(Some(Box::pin(io::Cursor::new(prefix).chain(input))))
}
