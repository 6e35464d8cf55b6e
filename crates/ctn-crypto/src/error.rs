use std::io;

/// Errors raised while framing, sealing or opening a container.
///
/// Only [`CipherError::Io`] is worth retrying; everything else means the
/// data is foreign, tampered with, or was encrypted under another key.
#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("invalid container format: {0}")]
    InvalidFormat(String),

    #[error("unsupported header layout: {0}")]
    UnsupportedHeaderLayout(String),

    #[error("header layout mismatch: expected {expected}, found {found}")]
    LayoutMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("unknown master key id {0}")]
    UnknownKeyId(i32),

    #[error("invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(&'static str),

    #[error("truncated or corrupt container: {0}")]
    TruncatedOrCorrupt(String),

    #[error("invalid chunk size {0}")]
    InvalidChunkSize(usize),

    #[error("operation cancelled")]
    Cancelled,

    #[error("worker failed: {0}")]
    Worker(String),

    #[error("I/O error: {0}")]
    Io(io::Error),
}

impl CipherError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CipherError::Io(_))
    }
}

/// Recovers a typed error that crossed a byte-stream boundary.
impl From<io::Error> for CipherError {
    fn from(e: io::Error) -> Self {
        if e.get_ref().is_some_and(|inner| inner.is::<CipherError>()) {
            if let Some(Ok(typed)) = e.into_inner().map(|inner| inner.downcast::<CipherError>()) {
                return *typed;
            }
            return CipherError::Worker("lost error while unwrapping I/O error".into());
        }
        CipherError::Io(e)
    }
}

impl From<CipherError> for io::Error {
    fn from(e: CipherError) -> Self {
        match e {
            CipherError::Io(inner) => inner,
            CipherError::Cancelled => io::Error::new(io::ErrorKind::Interrupted, e),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_through_io_error() {
        let io_err: io::Error = CipherError::AuthenticationFailed("chunk 3").into();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidData);

        let back = CipherError::from(io_err);
        assert!(matches!(back, CipherError::AuthenticationFailed("chunk 3")));
    }

    #[test]
    fn test_plain_io_error_stays_io() {
        let err = CipherError::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(err.is_retryable());
        assert!(matches!(err, CipherError::Io(ref e) if e.kind() == io::ErrorKind::BrokenPipe));
    }

    #[test]
    fn test_crypto_errors_not_retryable() {
        assert!(!CipherError::AuthenticationFailed("x").is_retryable());
        assert!(!CipherError::InvalidFormat("x".into()).is_retryable());
        assert!(!CipherError::Cancelled.is_retryable());
    }
}
