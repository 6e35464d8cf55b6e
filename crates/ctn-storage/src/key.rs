//! Content-address keys
//!
//! A blob key is a lowercase hex string of at least 6 characters (normally a
//! SHA-256 digest). Keys are sharded two levels deep so no directory holds
//! more than 256 entries per level:
//!
//! ```text
//! ab12cdef…  →  ab/12/cdef…
//! ```

use std::fmt;

use crate::error::StorageError;

pub const MIN_KEY_LEN: usize = 6;

/// A validated, normalized content-address key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlobKey(String);

impl BlobKey {
    pub fn parse(uid: &str) -> Result<Self, StorageError> {
        normalize(uid).map(Self)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `(level-1 dir, level-2 dir, file stem)`
    pub fn shard(&self) -> (&str, &str, &str) {
        (&self.0[..2], &self.0[2..4], &self.0[4..])
    }

    /// Slash-separated relative path with the given extension.
    pub fn relative_path(&self, extension: &str) -> String {
        let (a, b, rest) = self.shard();
        format!("{a}/{b}/{rest}.{extension}")
    }
}

impl fmt::Display for BlobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for BlobKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for BlobKey {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Trim, lowercase and validate a content address.
pub fn normalize(uid: &str) -> Result<String, StorageError> {
    let key = uid.trim().to_ascii_lowercase();
    if key.len() < MIN_KEY_LEN || !key.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(StorageError::InvalidKey(uid.to_string()));
    }
    Ok(key)
}

/// Shard a raw uid into `(dir1, dir2, filename)`.
pub fn shard(uid: &str) -> Result<(String, String, String), StorageError> {
    let key = BlobKey::parse(uid)?;
    let (a, b, rest) = key.shard();
    Ok((a.to_string(), b.to_string(), rest.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalize_trims_and_lowercases() {
        assert_eq!(normalize("  AB12CD  ").unwrap(), "ab12cd");
    }

    #[test]
    fn test_normalize_rejects_short_and_non_hex() {
        assert!(matches!(normalize("xy"), Err(StorageError::InvalidKey(_))));
        assert!(matches!(normalize("zz0011"), Err(StorageError::InvalidKey(_))));
        assert!(matches!(normalize("abc12"), Err(StorageError::InvalidKey(_))));
        assert!(matches!(normalize("ab 12cd"), Err(StorageError::InvalidKey(_))));
        assert!(matches!(normalize(""), Err(StorageError::InvalidKey(_))));
    }

    #[test]
    fn test_shard() {
        assert_eq!(
            shard("ab12cdef").unwrap(),
            ("ab".to_string(), "12".to_string(), "cdef".to_string())
        );
        let key = BlobKey::parse("AB12CDEF").unwrap();
        assert_eq!(key.shard(), ("ab", "12", "cdef"));
        assert_eq!(key.relative_path("ctn"), "ab/12/cdef.ctn");
    }

    #[test]
    fn test_minimum_length_shard_has_two_char_stem() {
        let key = BlobKey::parse("a1b2c3").unwrap();
        assert_eq!(key.shard(), ("a1", "b2", "c3"));
    }

    proptest! {
        #[test]
        fn prop_normalize_idempotent(s in "[ ]{0,2}[0-9a-fA-F]{6,64}[ ]{0,2}") {
            let once = normalize(&s).unwrap();
            let twice = normalize(&once).unwrap();
            prop_assert_eq!(&once, &twice);
        }

        #[test]
        fn prop_shard_reassembles(s in "[0-9a-f]{6,64}") {
            let key = BlobKey::parse(&s).unwrap();
            let (a, b, rest) = key.shard();
            prop_assert_eq!(format!("{a}{b}{rest}"), s);
        }

        #[test]
        fn prop_rejects_any_non_hex(prefix in "[0-9a-f]{3,10}", bad in "[g-zG-Z_.-]", suffix in "[0-9a-f]{3,10}") {
            let uid = format!("{prefix}{bad}{suffix}");
            prop_assert!(normalize(&uid).is_err());
        }
    }
}
