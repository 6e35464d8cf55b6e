//! Assemble a [`StoragePipeline`] from configuration

use std::sync::Arc;

use anyhow::{Context, Result};
use ctn_core::config::{CryptoConfig, CtnConfig, MASTER_KEY_ENV};
use ctn_crypto::{BufferPool, StaticKeyRing, StreamCipher};
use secrecy::SecretString;

use crate::backend::build_backend;
use crate::cache::HotCache;
use crate::pipeline::StoragePipeline;
use crate::processor::{CompressionProcessor, CryptoProcessor, Processor};

/// Build the pipeline described by `config`, reading `CTN_MASTER_KEY` from
/// the environment.
pub fn build_pipeline(config: &CtnConfig) -> Result<StoragePipeline> {
    let env_key = std::env::var(MASTER_KEY_ENV).ok().map(SecretString::from);
    build_pipeline_with_key(config, env_key)
}

/// Like [`build_pipeline`], with the active master key material passed in.
pub fn build_pipeline_with_key(
    config: &CtnConfig,
    active_key: Option<SecretString>,
) -> Result<StoragePipeline> {
    let backend = build_backend(&config.storage).context("building storage backend")?;
    let pool = BufferPool::global().clone();
    let capacity = config.pipeline.pipe_capacity;

    let mut processors = Vec::new();
    if config.crypto.enabled {
        let ring = key_ring(&config.crypto, active_key)?;
        tracing::debug!(
            keys = ring.len(),
            active_key_id = config.crypto.active_key_id,
            "key ring loaded"
        );
        let cipher = StreamCipher::new(Arc::new(ring)).with_threads(config.crypto.threads);
        processors.push(Processor::Crypto(
            CryptoProcessor::new(cipher, config.crypto.chunk_size, config.crypto.priority)
                .with_pipe(capacity, pool.clone()),
        ));
    }
    if config.compression.enabled {
        processors.push(Processor::Compression(
            CompressionProcessor::new(config.compression.level, config.compression.priority)
                .with_pipe(capacity, pool.clone()),
        ));
    }

    let mut pipeline = StoragePipeline::new(backend, processors)?
        .with_max_parallel_writes(config.pipeline.max_parallel_writes)
        .with_pipe(capacity, pool);
    if config.pipeline.cache_max_bytes > 0 {
        pipeline = pipeline.with_cache(HotCache::new(
            config.pipeline.cache_max_bytes,
            config.pipeline.cache_item_max_bytes,
        ));
    }
    tracing::info!(
        backend = pipeline.backend().name(),
        stages = ?pipeline.stages(),
        "storage pipeline ready"
    );
    Ok(pipeline)
}

/// Key ring from the configured key list. `active_key`, when present,
/// supplies (or replaces) the material for `active_key_id`.
fn key_ring(cfg: &CryptoConfig, active_key: Option<SecretString>) -> Result<StaticKeyRing> {
    let mut materials: Vec<(i32, SecretString)> = cfg
        .keys
        .iter()
        .filter(|k| active_key.is_none() || k.id != cfg.active_key_id)
        .map(|k| (k.id, SecretString::from(k.material.clone())))
        .collect();
    if let Some(material) = active_key {
        materials.push((cfg.active_key_id, material));
    }

    StaticKeyRing::from_materials(cfg.active_key_id, materials.iter().map(|(id, m)| (*id, m)))
        .with_context(|| {
            format!(
                "no usable master key for active_key_id {}; add it to [[crypto.keys]] or set {MASTER_KEY_ENV}",
                cfg.active_key_id
            )
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctn_core::config::{BackendKind, KeyEntry};

    fn memory_config() -> CtnConfig {
        let mut cfg = CtnConfig::default();
        cfg.storage.backend = BackendKind::Memory;
        cfg
    }

    #[test]
    fn test_build_requires_active_key() {
        let err = build_pipeline_with_key(&memory_config(), None).unwrap_err();
        assert!(format!("{err:#}").contains("active_key_id 1"));
    }

    #[test]
    fn test_build_with_supplied_key() {
        let p = build_pipeline_with_key(&memory_config(), Some(SecretString::from("passphrase")))
            .unwrap();
        assert_eq!(p.stages(), vec!["compression", "crypto"]);
        assert_eq!(p.backend().name(), "object-store");
        assert!(p.cache().is_some());
    }

    #[test]
    fn test_build_plain_pipeline() {
        let mut cfg = memory_config();
        cfg.crypto.enabled = false;
        cfg.compression.enabled = false;
        cfg.pipeline.cache_max_bytes = 0;
        let p = build_pipeline_with_key(&cfg, None).unwrap();
        assert!(p.stages().is_empty());
        assert!(p.cache().is_none());
    }

    #[test]
    fn test_key_ring_keeps_old_keys() {
        let cfg = CryptoConfig {
            active_key_id: 2,
            keys: vec![
                KeyEntry {
                    id: 1,
                    material: "old".into(),
                },
                KeyEntry {
                    id: 2,
                    material: "new".into(),
                },
            ],
            ..Default::default()
        };
        assert_eq!(key_ring(&cfg, None).unwrap().len(), 2);
        // supplied material replaces the file entry for the active id
        assert_eq!(
            key_ring(&cfg, Some(SecretString::from("env"))).unwrap().len(),
            2
        );
    }
}
