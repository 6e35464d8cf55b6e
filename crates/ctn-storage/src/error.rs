use std::io;

use ctn_crypto::CipherError;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid blob key {0:?}: expected at least 6 hex characters")]
    InvalidKey(String),

    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("no {stage} processor could resolve content of {uid}")]
    UnresolvedContent { uid: String, stage: &'static str },

    #[error("pipeline misconfigured: {0}")]
    PipelineMisconfigured(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Cipher(CipherError),

    #[error("object store error: {0}")]
    Backend(#[from] opendal::Error),

    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl StorageError {
    /// Only transient medium failures are worth retrying, and only as a whole
    /// operation.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::Io(_) => true,
            StorageError::Backend(e) => e.is_temporary(),
            StorageError::Cipher(e) => e.is_retryable(),
            _ => false,
        }
    }
}

impl From<CipherError> for StorageError {
    fn from(e: CipherError) -> Self {
        match e {
            CipherError::Cancelled => StorageError::Cancelled,
            CipherError::Io(inner) => StorageError::Io(inner),
            other => StorageError::Cipher(other),
        }
    }
}

/// Recovers typed errors raised inside a processor stage and carried to the
/// consumer as `io::Error`.
impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        let (is_storage, is_cipher) = match e.get_ref() {
            Some(inner) => (inner.is::<StorageError>(), inner.is::<CipherError>()),
            None => (false, false),
        };
        if is_storage {
            if let Some(Ok(typed)) = e.into_inner().map(|i| i.downcast::<StorageError>()) {
                return *typed;
            }
            return StorageError::PipelineMisconfigured("lost stage error".into());
        }
        if is_cipher {
            return CipherError::from(e).into();
        }
        StorageError::Io(e)
    }
}

impl From<StorageError> for io::Error {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Io(inner) => inner,
            StorageError::Cipher(c) => c.into(),
            StorageError::NotFound(_) => io::Error::new(io::ErrorKind::NotFound, e),
            StorageError::Cancelled => io::Error::new(io::ErrorKind::Interrupted, e),
            other => io::Error::other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cipher_error_survives_io_boundary() {
        let io_err: io::Error = CipherError::AuthenticationFailed("chunk").into();
        let err = StorageError::from(io_err);
        assert!(matches!(
            err,
            StorageError::Cipher(CipherError::AuthenticationFailed(_))
        ));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_storage_error_survives_io_boundary() {
        let io_err: io::Error = StorageError::UnresolvedContent {
            uid: "abcdef".into(),
            stage: "compression",
        }
        .into();
        assert!(matches!(
            StorageError::from(io_err),
            StorageError::UnresolvedContent { stage: "compression", .. }
        ));
    }

    #[test]
    fn test_cancel_maps_through() {
        let io_err: io::Error = CipherError::Cancelled.into();
        assert!(matches!(StorageError::from(io_err), StorageError::Cancelled));
        assert!(matches!(
            StorageError::from(CipherError::Cancelled),
            StorageError::Cancelled
        ));
    }

    #[test]
    fn test_plain_io_is_retryable() {
        let err = StorageError::from(io::Error::new(io::ErrorKind::TimedOut, "slow disk"));
        assert!(err.is_retryable());
    }
}
