//! Container header and chunk framing
//!
//! Header (all integers little-endian):
//! ```text
//! offset  size  field
//! 0       4     magic "CTN1"
//! 4       4     header_len (u32, whole header including magic)
//! 8       1     layout (1 = full, 2 = compact)
//! 9       4     key_id (i32)
//! 13      4     flags (i32, bit 0 = HAS_FOOTER)
//! 17      12    nonce                 } full layout only
//! 29      16    tag
//! 45      32    encrypted_key         } full layout only
//! 77      8     plaintext_len (i64, -1 = not declared)
//! ```
//!
//! The 8-byte prefix is read first; it is the only way to know how much more
//! header follows. `header_len` must match the tagged layout exactly.
//!
//! Chunk frame: `[chunk_len:u32][ciphertext][tag:16]` where `chunk_len`
//! counts ciphertext plus tag and bit 31 marks the final chunk.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::CipherError;
use crate::{KEY_SIZE, MAGIC, NONCE_SIZE, TAG_SIZE};

pub const FLAG_NONE: i32 = 0;
pub const FLAG_HAS_FOOTER: i32 = 1;

/// magic + header_len
pub const PREFIX_LEN: usize = 8;
pub const FULL_HEADER_LEN: usize = PREFIX_LEN + 1 + 4 + 4 + NONCE_SIZE + TAG_SIZE + KEY_SIZE + 8;
pub const COMPACT_HEADER_LEN: usize = PREFIX_LEN + 1 + 4 + 4 + TAG_SIZE + 8;

/// Sealed `u64` total length plus its tag
pub const FOOTER_LEN: usize = 8 + TAG_SIZE;

pub(crate) const FINAL_CHUNK_BIT: u32 = 0x8000_0000;

/// Nonce index reserved for the compact header key-check tag
pub(crate) const KEY_CHECK_INDEX: u64 = u64::MAX;

/// Nonce index reserved for the footer
pub(crate) const FOOTER_INDEX: u64 = u64::MAX - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderLayout {
    /// Data key wrapped in the header
    Full,
    /// Data key supplied by the caller
    Compact,
}

impl HeaderLayout {
    fn tag(self) -> u8 {
        match self {
            HeaderLayout::Full => 1,
            HeaderLayout::Compact => 2,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(HeaderLayout::Full),
            2 => Some(HeaderLayout::Compact),
            _ => None,
        }
    }

    pub fn header_len(self) -> usize {
        match self {
            HeaderLayout::Full => FULL_HEADER_LEN,
            HeaderLayout::Compact => COMPACT_HEADER_LEN,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HeaderLayout::Full => "full",
            HeaderLayout::Compact => "compact",
        }
    }
}

/// Wrapped data key carried by a full header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    /// Wrap nonce, also the base for chunk nonces
    pub nonce: [u8; NONCE_SIZE],
    pub encrypted_key: [u8; KEY_SIZE],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHeader {
    pub key_id: i32,
    pub flags: i32,
    /// Key-wrap tag (full) or key-check tag (compact)
    pub tag: [u8; TAG_SIZE],
    /// `None` for the compact layout
    pub wrapped: Option<WrappedKey>,
    pub plaintext_length: i64,
}

impl ContainerHeader {
    pub fn full(
        key_id: i32,
        flags: i32,
        nonce: [u8; NONCE_SIZE],
        tag: [u8; TAG_SIZE],
        encrypted_key: [u8; KEY_SIZE],
        plaintext_length: i64,
    ) -> Self {
        Self {
            key_id,
            flags,
            tag,
            wrapped: Some(WrappedKey {
                nonce,
                encrypted_key,
            }),
            plaintext_length,
        }
    }

    pub fn compact(key_id: i32, flags: i32, tag: [u8; TAG_SIZE], plaintext_length: i64) -> Self {
        Self {
            key_id,
            flags,
            tag,
            wrapped: None,
            plaintext_length,
        }
    }

    pub fn layout(&self) -> HeaderLayout {
        if self.wrapped.is_some() {
            HeaderLayout::Full
        } else {
            HeaderLayout::Compact
        }
    }

    pub fn header_len(&self) -> usize {
        self.layout().header_len()
    }

    pub fn has_footer(&self) -> bool {
        self.flags & FLAG_HAS_FOOTER != 0
    }

    /// Declared plaintext length, if the writer knew it up front.
    pub fn declared_length(&self) -> Option<u64> {
        u64::try_from(self.plaintext_length).ok()
    }

    /// Associated data binding every header field except the tag.
    pub fn aad(&self) -> Vec<u8> {
        let mut aad = Vec::with_capacity(PREFIX_LEN + 1 + 4 + 4 + 8);
        aad.extend_from_slice(&MAGIC);
        aad.extend_from_slice(&(self.header_len() as u32).to_le_bytes());
        aad.push(self.layout().tag());
        aad.extend_from_slice(&self.key_id.to_le_bytes());
        aad.extend_from_slice(&self.flags.to_le_bytes());
        aad.extend_from_slice(&self.plaintext_length.to_le_bytes());
        aad
    }

    /// Serialize; `header_len` is back-filled once the body is written.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.header_len());
        buf.extend_from_slice(&MAGIC);
        buf.extend_from_slice(&[0u8; 4]);
        buf.push(self.layout().tag());
        buf.extend_from_slice(&self.key_id.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        if let Some(w) = &self.wrapped {
            buf.extend_from_slice(&w.nonce);
        }
        buf.extend_from_slice(&self.tag);
        if let Some(w) = &self.wrapped {
            buf.extend_from_slice(&w.encrypted_key);
        }
        buf.extend_from_slice(&self.plaintext_length.to_le_bytes());

        let total = buf.len() as u32;
        buf[4..8].copy_from_slice(&total.to_le_bytes());
        buf
    }

    /// Parse a complete header from `bytes` (trailing data is ignored).
    pub fn parse(bytes: &[u8]) -> Result<Self, CipherError> {
        let header_len = check_prefix(bytes)?;
        if bytes.len() < header_len {
            return Err(truncated_header());
        }
        parse_body(&bytes[..header_len])
    }
}

/// Validate the 8-byte prefix and return the declared header length.
fn check_prefix(prefix: &[u8]) -> Result<usize, CipherError> {
    if prefix.len() < PREFIX_LEN {
        return Err(truncated_header());
    }
    if prefix[..4] != MAGIC {
        return Err(CipherError::InvalidFormat(format!(
            "bad magic {:02x?}",
            &prefix[..4]
        )));
    }
    let mut len = [0u8; 4];
    len.copy_from_slice(&prefix[4..8]);
    let header_len = u32::from_le_bytes(len) as usize;
    if header_len != FULL_HEADER_LEN && header_len != COMPACT_HEADER_LEN {
        return Err(CipherError::UnsupportedHeaderLayout(format!(
            "header length {header_len}"
        )));
    }
    Ok(header_len)
}

fn parse_body(header: &[u8]) -> Result<ContainerHeader, CipherError> {
    let mut cur = Cursor {
        buf: header,
        pos: PREFIX_LEN,
    };
    let [layout_tag] = cur.array::<1>()?;
    let layout = HeaderLayout::from_tag(layout_tag).ok_or_else(|| {
        CipherError::UnsupportedHeaderLayout(format!("layout tag {layout_tag}"))
    })?;
    if header.len() != layout.header_len() {
        return Err(CipherError::UnsupportedHeaderLayout(format!(
            "{} header declared as {} bytes",
            layout.name(),
            header.len()
        )));
    }

    let key_id = i32::from_le_bytes(cur.array()?);
    let flags = i32::from_le_bytes(cur.array()?);
    let header = match layout {
        HeaderLayout::Full => {
            let nonce = cur.array()?;
            let tag = cur.array()?;
            let encrypted_key = cur.array()?;
            let plaintext_length = i64::from_le_bytes(cur.array()?);
            ContainerHeader::full(key_id, flags, nonce, tag, encrypted_key, plaintext_length)
        }
        HeaderLayout::Compact => {
            let tag = cur.array()?;
            let plaintext_length = i64::from_le_bytes(cur.array()?);
            ContainerHeader::compact(key_id, flags, tag, plaintext_length)
        }
    };

    if header.flags & !FLAG_HAS_FOOTER != 0 {
        return Err(CipherError::InvalidFormat(format!(
            "unknown flags {:#x}",
            header.flags
        )));
    }
    if header.plaintext_length < -1 {
        return Err(CipherError::InvalidFormat(format!(
            "negative plaintext length {}",
            header.plaintext_length
        )));
    }
    if (header.plaintext_length == -1) != header.has_footer() {
        return Err(CipherError::InvalidFormat(
            "footer flag disagrees with declared length".into(),
        ));
    }
    Ok(header)
}

/// Read and validate a container header from the front of a stream.
///
/// Consumes exactly `header_len` bytes; the stream is left at the first chunk.
pub async fn read_header<R>(input: &mut R) -> Result<ContainerHeader, CipherError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = [0u8; FULL_HEADER_LEN];
    read_header_bytes(input, &mut buf[..PREFIX_LEN]).await?;
    let header_len = check_prefix(&buf[..PREFIX_LEN])?;
    read_header_bytes(input, &mut buf[PREFIX_LEN..header_len]).await?;
    let header = parse_body(&buf[..header_len])?;
    tracing::debug!(
        layout = header.layout().name(),
        key_id = header.key_id,
        plaintext_length = header.plaintext_length,
        "container header parsed"
    );
    Ok(header)
}

/// Read only the header of a container, for inspection.
pub async fn inspect_header<R>(input: &mut R) -> Result<ContainerHeader, CipherError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    read_header(input).await
}

async fn read_header_bytes<R>(input: &mut R, buf: &mut [u8]) -> Result<(), CipherError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    match input.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(truncated_header()),
        Err(e) => Err(e.into()),
    }
}

fn truncated_header() -> CipherError {
    CipherError::InvalidFormat("stream ended inside the header".into())
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn array<const N: usize>(&mut self) -> Result<[u8; N], CipherError> {
        let end = self.pos + N;
        let slice = self.buf.get(self.pos..end).ok_or_else(truncated_header)?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }
}

/// Per-chunk nonce: the base nonce with its last 8 bytes XOR the big-endian index.
pub(crate) fn chunk_nonce(base: &[u8; NONCE_SIZE], index: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = *base;
    for (n, i) in nonce[NONCE_SIZE - 8..].iter_mut().zip(index.to_be_bytes()) {
        *n ^= i;
    }
    nonce
}

/// Chunk associated data: magic ‖ layout ‖ key_id ‖ index (BE) ‖ plaintext_len ‖ final
pub(crate) fn chunk_aad(
    layout: HeaderLayout,
    key_id: i32,
    index: u64,
    plaintext_len: u32,
    is_final: bool,
) -> [u8; 22] {
    let mut aad = [0u8; 22];
    aad[..4].copy_from_slice(&MAGIC);
    aad[4] = layout.tag();
    aad[5..9].copy_from_slice(&key_id.to_le_bytes());
    aad[9..17].copy_from_slice(&index.to_be_bytes());
    aad[17..21].copy_from_slice(&plaintext_len.to_le_bytes());
    aad[21] = u8::from(is_final);
    aad
}

/// Encode a chunk length prefix. `sealed_len` counts ciphertext plus tag.
pub(crate) fn encode_chunk_len(sealed_len: usize, is_final: bool) -> [u8; 4] {
    let mut raw = sealed_len as u32;
    if is_final {
        raw |= FINAL_CHUNK_BIT;
    }
    raw.to_le_bytes()
}

/// Decode a chunk length prefix into `(sealed_len, is_final)`.
pub(crate) fn decode_chunk_len(raw: [u8; 4]) -> (usize, bool) {
    let raw = u32::from_le_bytes(raw);
    ((raw & !FINAL_CHUNK_BIT) as usize, raw & FINAL_CHUNK_BIT != 0)
}
