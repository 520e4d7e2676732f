//! ALFA Vault Store - Error Types

use thiserror::Error;

/// Result type for vault operations
pub type VaultResult<T> = Result<T, VaultError>;

/// Vault error types
#[derive(Error, Debug)]
pub enum VaultError {
    // ═══════════════════════════════════════════════════════════════
    // STORAGE ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Short read at offset {offset}: requested {length} bytes, got {got}")]
    ReadError { offset: u64, length: u64, got: u64 },

    #[error("Write error: {0}")]
    WriteError(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ═══════════════════════════════════════════════════════════════
    // INDEX ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Index decryption failed - wrong key or corrupted index")]
    IndexDecryptionFailed,

    #[error("Corrupted data: {0}")]
    CorruptedData(String),

    // ═══════════════════════════════════════════════════════════════
    // CRYPTO ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivationFailed(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    // ═══════════════════════════════════════════════════════════════
    // IMPORT ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Import failed: {0}")]
    ImportFailed(String),

    #[error("Thumbnail generation failed: {0}")]
    ThumbnailFailed(String),

    #[error("Worker task failed: {0}")]
    TaskFailed(String),

    // ═══════════════════════════════════════════════════════════════
    // CONFIG / SERIALIZATION ERRORS
    // ═══════════════════════════════════════════════════════════════

    #[error("Invalid configuration: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl VaultError {
    /// Check if this is a security-critical error
    pub fn is_security_critical(&self) -> bool {
        matches!(
            self,
            VaultError::IndexDecryptionFailed
                | VaultError::DecryptionFailed(_)
                | VaultError::CorruptedData(_)
        )
    }

    /// Errors scoped to a single imported item. The pipeline turns these into
    /// failed events; everything else is fatal to the operation.
    pub fn is_item_local(&self) -> bool {
        matches!(
            self,
            VaultError::ReadError { .. }
                | VaultError::WriteError(_)
                | VaultError::FileNotFound(_)
                | VaultError::Io(_)
                | VaultError::EncryptionFailed(_)
                | VaultError::ImportFailed(_)
                | VaultError::ThumbnailFailed(_)
                | VaultError::TaskFailed(_)
        )
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(e: serde_json::Error) -> Self {
        VaultError::SerializationError(e.to_string())
    }
}

impl From<image::ImageError> for VaultError {
    fn from(e: image::ImageError) -> Self {
        VaultError::ThumbnailFailed(e.to_string())
    }
}

impl From<tokio::task::JoinError> for VaultError {
    fn from(e: tokio::task::JoinError) -> Self {
        VaultError::TaskFailed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(VaultError::IndexDecryptionFailed.is_security_critical());
        assert!(!VaultError::IndexDecryptionFailed.is_item_local());

        let short = VaultError::ReadError { offset: 0, length: 0, got: 0 };
        assert!(short.is_item_local());
        assert!(VaultError::WriteError("too big".into()).is_item_local());
        assert!(!VaultError::CorruptedData("x".into()).is_item_local());
    }
}
