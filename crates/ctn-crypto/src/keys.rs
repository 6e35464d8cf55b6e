//! Key hierarchy: master keys (by id) → per-container data keys
//!
//! ```text
//! Master Key (256-bit, key_id N, from config or CTN_MASTER_KEY)
//!   └── Data Key (per container, 256-bit random)
//!         wrapped with AES-256-GCM under the master key,
//!         nonce = header nonce, AAD = header fields
//! ```
//!
//! Rotation adds a new master key id and makes it active; containers sealed
//! under older ids stay readable as long as the registry still holds them.

use std::collections::HashMap;

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use base64::Engine;
use hkdf::Hkdf;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::CipherError;
use crate::{KEY_SIZE, NONCE_SIZE, TAG_SIZE};

/// HKDF info string for master keys derived from non-raw material
const MASTER_KEY_INFO: &[u8] = b"ctn-master-key";

/// A 256-bit master key. Zeroized on drop.
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    /// Build a master key from configured material.
    ///
    /// Base64 of exactly 32 bytes is used as-is; any other non-empty string
    /// is run through HKDF-SHA256.
    pub fn from_material(material: &SecretString) -> Result<Self, CipherError> {
        let text = material.expose_secret().trim();
        if text.is_empty() {
            return Err(CipherError::InvalidKeyMaterial("empty key material".into()));
        }

        if let Ok(mut raw) = base64::engine::general_purpose::STANDARD.decode(text) {
            if raw.len() == KEY_SIZE {
                let mut bytes = [0u8; KEY_SIZE];
                bytes.copy_from_slice(&raw);
                raw.zeroize();
                return Ok(Self::from_bytes(bytes));
            }
            raw.zeroize();
        }

        let hkdf = Hkdf::<Sha256>::new(None, text.as_bytes());
        let mut bytes = [0u8; KEY_SIZE];
        hkdf.expand(MASTER_KEY_INFO, &mut bytes)
            .map_err(|e| CipherError::InvalidKeyMaterial(format!("HKDF expand failed: {e}")))?;
        Ok(Self::from_bytes(bytes))
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A per-container data-encryption key. Zeroized on drop.
#[derive(Clone)]
pub struct DataKey {
    bytes: [u8; KEY_SIZE],
}

impl DataKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }

    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::from_bytes(bytes)
    }

    pub(crate) fn aead(&self) -> Aes256Gcm {
        Aes256Gcm::new((&self.bytes).into())
    }
}

impl Drop for DataKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for DataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// A single-use sealing key held by the caller instead of being embedded in
/// the container.
///
/// Used with the compact header. The base nonce travels with the key, so a
/// `DetachedKey` can seal only one container: `encrypt_with_key` consumes it
/// and there is no way to rebuild one from existing material. Take an
/// [`OpeningKey`] before sealing to decrypt the result.
pub struct DetachedKey {
    pub key_id: i32,
    key: DataKey,
    nonce: [u8; NONCE_SIZE],
}

impl DetachedKey {
    /// Fresh random data key and nonce.
    pub fn generate(key_id: i32) -> Self {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self {
            key_id,
            key: DataKey::generate(),
            nonce,
        }
    }

    /// Decryption half of this key.
    pub fn opening_key(&self) -> OpeningKey {
        OpeningKey {
            key_id: self.key_id,
            key: self.key.clone(),
            nonce: self.nonce,
        }
    }

    pub(crate) fn into_parts(self) -> (DataKey, [u8; NONCE_SIZE]) {
        (self.key, self.nonce)
    }
}

impl std::fmt::Debug for DetachedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DetachedKey")
            .field("key_id", &self.key_id)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Opens compact containers sealed by a [`DetachedKey`]. Cannot seal.
#[derive(Clone)]
pub struct OpeningKey {
    pub key_id: i32,
    key: DataKey,
    nonce: [u8; NONCE_SIZE],
}

impl OpeningKey {
    /// Rebuild an opening key from material stored out of band.
    pub fn from_parts(key_id: i32, key: DataKey, nonce: [u8; NONCE_SIZE]) -> Self {
        Self { key_id, key, nonce }
    }

    pub fn nonce(&self) -> &[u8; NONCE_SIZE] {
        &self.nonce
    }

    pub fn data_key(&self) -> &DataKey {
        &self.key
    }
}

impl std::fmt::Debug for OpeningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpeningKey")
            .field("key_id", &self.key_id)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Source of master keys for envelope encryption.
pub trait KeyRegistry: Send + Sync {
    /// Key id used to wrap new data keys.
    fn active_key_id(&self) -> i32;

    fn master_key(&self, key_id: i32) -> Option<&MasterKey>;

    /// Wrap `data_key` under master key `key_id`. Returns `(ciphertext, tag)`.
    fn wrap(
        &self,
        key_id: i32,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        data_key: &DataKey,
    ) -> Result<([u8; KEY_SIZE], [u8; TAG_SIZE]), CipherError> {
        let master = self
            .master_key(key_id)
            .ok_or(CipherError::UnknownKeyId(key_id))?;
        let cipher = Aes256Gcm::new(master.as_bytes().into());
        let mut wrapped = *data_key.as_bytes();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(nonce), aad, &mut wrapped)
            .map_err(|_| CipherError::AuthenticationFailed("data key wrap"))?;
        let mut tag_bytes = [0u8; TAG_SIZE];
        tag_bytes.copy_from_slice(&tag);
        Ok((wrapped, tag_bytes))
    }

    /// Unwrap a data key sealed by [`KeyRegistry::wrap`].
    fn unwrap(
        &self,
        key_id: i32,
        nonce: &[u8; NONCE_SIZE],
        aad: &[u8],
        encrypted_key: &[u8; KEY_SIZE],
        tag: &[u8; TAG_SIZE],
    ) -> Result<DataKey, CipherError> {
        let master = self
            .master_key(key_id)
            .ok_or(CipherError::UnknownKeyId(key_id))?;
        let cipher = Aes256Gcm::new(master.as_bytes().into());
        let mut bytes = *encrypted_key;
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(nonce),
                aad,
                &mut bytes,
                Tag::from_slice(tag),
            )
            .map_err(|_| CipherError::AuthenticationFailed("data key unwrap"))?;
        Ok(DataKey::from_bytes(bytes))
    }
}

/// In-memory key registry keyed by master key id.
#[derive(Debug, Clone)]
pub struct StaticKeyRing {
    active: i32,
    keys: HashMap<i32, MasterKey>,
}

impl StaticKeyRing {
    pub fn new(active: i32) -> Self {
        Self {
            active,
            keys: HashMap::new(),
        }
    }

    /// Ring holding a single key, which is also the active one.
    pub fn single(key_id: i32, key: MasterKey) -> Self {
        let mut ring = Self::new(key_id);
        ring.insert(key_id, key);
        ring
    }

    /// Build a ring from `(id, material)` pairs.
    ///
    /// Fails if the active id has no material, since nothing could be written.
    pub fn from_materials<'a>(
        active: i32,
        materials: impl IntoIterator<Item = (i32, &'a SecretString)>,
    ) -> Result<Self, CipherError> {
        let mut ring = Self::new(active);
        for (id, material) in materials {
            ring.insert(id, MasterKey::from_material(material)?);
        }
        if !ring.keys.contains_key(&active) {
            return Err(CipherError::UnknownKeyId(active));
        }
        Ok(ring)
    }

    pub fn insert(&mut self, key_id: i32, key: MasterKey) {
        self.keys.insert(key_id, key);
    }

    pub fn set_active(&mut self, key_id: i32) {
        self.active = key_id;
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl KeyRegistry for StaticKeyRing {
    fn active_key_id(&self) -> i32 {
        self.active
    }

    fn master_key(&self, key_id: i32) -> Option<&MasterKey> {
        self.keys.get(&key_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring() -> StaticKeyRing {
        StaticKeyRing::single(1, MasterKey::from_bytes([42u8; KEY_SIZE]))
    }

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let ring = ring();
        let dek = DataKey::generate();
        let nonce = [7u8; NONCE_SIZE];

        let (wrapped, tag) = ring.wrap(1, &nonce, b"aad", &dek).unwrap();
        assert_ne!(&wrapped, dek.as_bytes());

        let unwrapped = ring.unwrap(1, &nonce, b"aad", &wrapped, &tag).unwrap();
        assert_eq!(unwrapped.as_bytes(), dek.as_bytes());
    }

    #[test]
    fn test_unwrap_wrong_aad_fails() {
        let ring = ring();
        let dek = DataKey::generate();
        let nonce = [7u8; NONCE_SIZE];

        let (wrapped, tag) = ring.wrap(1, &nonce, b"aad", &dek).unwrap();
        let err = ring.unwrap(1, &nonce, b"tampered", &wrapped, &tag).unwrap_err();
        assert!(matches!(err, CipherError::AuthenticationFailed(_)));
    }

    #[test]
    fn test_unwrap_under_other_master_fails() {
        let mut ring = ring();
        ring.insert(2, MasterKey::from_bytes([9u8; KEY_SIZE]));
        let dek = DataKey::generate();
        let nonce = [0u8; NONCE_SIZE];

        let (wrapped, tag) = ring.wrap(1, &nonce, b"", &dek).unwrap();
        assert!(ring.unwrap(2, &nonce, b"", &wrapped, &tag).is_err());
    }

    #[test]
    fn test_unknown_key_id() {
        let ring = ring();
        let dek = DataKey::generate();
        let err = ring.wrap(5, &[0u8; NONCE_SIZE], b"", &dek).unwrap_err();
        assert!(matches!(err, CipherError::UnknownKeyId(5)));
    }

    #[test]
    fn test_material_base64_raw_key() {
        let raw: Vec<u8> = (0u8..32).collect();
        let encoded = base64::engine::general_purpose::STANDARD.encode(&raw);
        let key = MasterKey::from_material(&SecretString::from(encoded)).unwrap();
        assert_eq!(key.as_bytes().as_slice(), raw.as_slice());
    }

    #[test]
    fn test_material_passphrase_derived() {
        let a = MasterKey::from_material(&SecretString::from("correct horse".to_string())).unwrap();
        let b = MasterKey::from_material(&SecretString::from("correct horse".to_string())).unwrap();
        let c = MasterKey::from_material(&SecretString::from("battery staple".to_string())).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_ne!(a.as_bytes(), c.as_bytes());
    }

    #[test]
    fn test_material_empty_rejected() {
        let err = MasterKey::from_material(&SecretString::from("  ".to_string())).unwrap_err();
        assert!(matches!(err, CipherError::InvalidKeyMaterial(_)));
    }

    #[test]
    fn test_ring_requires_active_material() {
        let material = SecretString::from("only key two".to_string());
        let err = StaticKeyRing::from_materials(1, [(2, &material)]).unwrap_err();
        assert!(matches!(err, CipherError::UnknownKeyId(1)));

        let ring = StaticKeyRing::from_materials(2, [(2, &material)]).unwrap();
        assert_eq!(ring.active_key_id(), 2);
        assert_eq!(ring.len(), 1);
    }

    #[test]
    fn test_debug_redacts() {
        let key = DetachedKey::generate(3);
        let opening = key.opening_key();
        let printed = format!(
            "{key:?} {opening:?} {:?} {:?}",
            opening.data_key(),
            MasterKey::from_bytes([1; KEY_SIZE])
        );
        assert!(printed.contains("[REDACTED]"));
        assert!(printed.contains("key_id: 3"));
        assert!(!printed.contains(&format!("{:?}", opening.nonce())));
    }
}
