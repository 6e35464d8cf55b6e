//! ctn-storage: content-addressed blob storage
//!
//! Blobs are addressed by a hex content hash and pass through an ordered
//! chain of processors (compression, envelope encryption) on their way to a
//! backend (local filesystem or an OpenDAL object store). Writes are
//! deduplicated by address and committed atomically.

pub mod backend;
pub mod builder;
pub mod cache;
pub mod error;
pub mod key;
pub mod pipeline;
pub mod processor;

pub use backend::{
    build_backend, ByteStream, FileSystemBackend, ObjectStoreBackend, StorageBackend,
    WriteOutcome,
};
pub use builder::{build_pipeline, build_pipeline_with_key};
pub use cache::HotCache;
pub use error::StorageError;
pub use key::{normalize, shard, BlobKey};
pub use pipeline::{PipelineContext, StoragePipeline};
pub use processor::{CompressionProcessor, CryptoProcessor, Processor};
