//! ctn-crypto: streaming envelope encryption for the ctn blob store
//!
//! A plaintext stream becomes a self-describing container:
//!
//! ```text
//! header  [magic "CTN1"][header_len:u32][layout:u8][key_id:i32][flags:i32]
//!         [nonce:12][tag:16][encrypted_key:32][plaintext_len:i64]      (full, 85 bytes)
//!         [magic "CTN1"][header_len:u32][layout:u8][key_id:i32][flags:i32]
//!         [tag:16][plaintext_len:i64]                                   (compact, 41 bytes)
//! chunks  [chunk_len:u32, bit31 = final][ciphertext][tag:16]  ...  exactly one final chunk
//! footer  [sealed total_len:u64][tag:16]                               (only with HAS_FOOTER)
//! ```
//!
//! Each container gets a fresh AES-256-GCM data key, wrapped under a master
//! key picked by `key_id`. Chunk nonces are derived from the header nonce and
//! the chunk index, so chunks can be sealed and opened on parallel workers.

pub mod cipher;
pub mod error;
pub mod format;
pub mod keys;
pub mod pipe;
pub mod pool;

pub use cipher::StreamCipher;
pub use error::CipherError;
pub use format::{inspect_header, ContainerHeader, HeaderLayout};
pub use keys::{DataKey, DetachedKey, KeyRegistry, MasterKey, OpeningKey, StaticKeyRing};
pub use pipe::{bounded_pipe, spawn_pipe, PipeReader, PipeWriter};
pub use pool::{BufferPool, PooledBuffer};

/// Container magic
pub const MAGIC: [u8; 4] = *b"CTN1";

/// AES-256 key size in bytes
pub const KEY_SIZE: usize = 32;

/// AES-GCM nonce size in bytes
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Default plaintext bytes per chunk (1 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Largest plaintext chunk accepted on either side (64 MiB)
pub const MAX_CHUNK_SIZE: usize = 64 * 1024 * 1024;
