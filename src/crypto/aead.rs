//! ALFA Vault Store - AEAD Encryption
//!
//! AES-256-GCM for file content chunks, XChaCha20-Poly1305 for the index
//! document, the wrapped master key, thumbnails and header previews.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};

use super::keys::{
    generate_nonce, generate_xchacha_nonce, MasterKey, SecretKey, VaultKey, NONCE_LEN,
    XCHACHA_NONCE_LEN,
};
use crate::error::{VaultError, VaultResult};

/// GCM / Poly1305 authentication tag size
pub const TAG_LEN: usize = 16;

/// Encrypted data with nonce prepended
pub struct EncryptedData {
    /// Nonce (12 or 24 bytes depending on cipher)
    pub nonce: Vec<u8>,
    /// Ciphertext with authentication tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedData {
    /// Serialize to bytes (nonce || ciphertext)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(self.nonce.len() + self.ciphertext.len());
        result.extend_from_slice(&self.nonce);
        result.extend_from_slice(&self.ciphertext);
        result
    }

    /// Deserialize from bytes (AES-GCM format)
    pub fn from_bytes_aes(data: &[u8]) -> VaultResult<Self> {
        if data.len() < NONCE_LEN + TAG_LEN {
            return Err(VaultError::DecryptionFailed("Data too short".into()));
        }

        Ok(Self {
            nonce: data[..NONCE_LEN].to_vec(),
            ciphertext: data[NONCE_LEN..].to_vec(),
        })
    }

    /// Deserialize from bytes (XChaCha20 format)
    pub fn from_bytes_xchacha(data: &[u8]) -> VaultResult<Self> {
        if data.len() < XCHACHA_NONCE_LEN + TAG_LEN {
            return Err(VaultError::DecryptionFailed("Data too short".into()));
        }

        Ok(Self {
            nonce: data[..XCHACHA_NONCE_LEN].to_vec(),
            ciphertext: data[XCHACHA_NONCE_LEN..].to_vec(),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// AES-256-GCM (content chunks)
// ═══════════════════════════════════════════════════════════════════════════

/// Encrypt one content chunk, binding it to `aad`. Output is nonce || ct || tag.
pub fn encrypt_chunk(key: &SecretKey, plaintext: &[u8], aad: &[u8]) -> VaultResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key.expose())
        .map_err(|e| VaultError::EncryptionFailed(e.to_string()))?;

    let nonce_bytes = generate_nonce();
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|e| VaultError::EncryptionFailed(e.to_string()))?;

    Ok(EncryptedData {
        nonce: nonce_bytes.to_vec(),
        ciphertext,
    }
    .to_bytes())
}

/// Decrypt one content chunk produced by [`encrypt_chunk`]
pub fn decrypt_chunk(key: &SecretKey, data: &[u8], aad: &[u8]) -> VaultResult<Vec<u8>> {
    let encrypted = EncryptedData::from_bytes_aes(data)?;
    let cipher = Aes256Gcm::new_from_slice(key.expose())
        .map_err(|e| VaultError::DecryptionFailed(e.to_string()))?;

    cipher
        .decrypt(
            Nonce::from_slice(&encrypted.nonce),
            Payload {
                msg: encrypted.ciphertext.as_slice(),
                aad,
            },
        )
        .map_err(|_| VaultError::DecryptionFailed("Authentication failed".into()))
}

// ═══════════════════════════════════════════════════════════════════════════
// XChaCha20-Poly1305 (index, wrapped keys, thumbnails)
// ═══════════════════════════════════════════════════════════════════════════

/// Encrypt data with XChaCha20-Poly1305
pub fn encrypt_xchacha(key: &SecretKey, plaintext: &[u8]) -> VaultResult<EncryptedData> {
    let cipher = XChaCha20Poly1305::new_from_slice(key.expose())
        .map_err(|e| VaultError::EncryptionFailed(e.to_string()))?;

    let nonce_bytes = generate_xchacha_nonce();
    let nonce = XNonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| VaultError::EncryptionFailed(e.to_string()))?;

    Ok(EncryptedData {
        nonce: nonce_bytes.to_vec(),
        ciphertext,
    })
}

/// Decrypt data with XChaCha20-Poly1305
pub fn decrypt_xchacha(key: &SecretKey, encrypted: &EncryptedData) -> VaultResult<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new_from_slice(key.expose())
        .map_err(|e| VaultError::DecryptionFailed(e.to_string()))?;

    if encrypted.nonce.len() != XCHACHA_NONCE_LEN {
        return Err(VaultError::DecryptionFailed("Invalid nonce length".into()));
    }

    let nonce = XNonce::from_slice(&encrypted.nonce);

    cipher
        .decrypt(nonce, encrypted.ciphertext.as_slice())
        .map_err(|_| VaultError::DecryptionFailed("Authentication failed".into()))
}

/// Encrypt a small blob (thumbnail, preview) under the master key
pub fn seal(master: &MasterKey, plaintext: &[u8]) -> VaultResult<Vec<u8>> {
    Ok(encrypt_xchacha(master.as_secret(), plaintext)?.to_bytes())
}

/// Inverse of [`seal`]
pub fn open(master: &MasterKey, sealed: &[u8]) -> VaultResult<Vec<u8>> {
    let encrypted = EncryptedData::from_bytes_xchacha(sealed)?;
    decrypt_xchacha(master.as_secret(), &encrypted)
}

// ═══════════════════════════════════════════════════════════════════════════
// Master key wrapping
// ═══════════════════════════════════════════════════════════════════════════

/// Wrap the master key under a vault key
pub fn wrap_master_key(master: &MasterKey, vault_key: &VaultKey) -> VaultResult<Vec<u8>> {
    let wrap = vault_key.wrap_key()?;
    Ok(encrypt_xchacha(&wrap, master.expose())?.to_bytes())
}

/// Unwrap a master key. A failure here means the index that carried it is
/// damaged, since that index already decrypted under the same vault key.
pub fn unwrap_master_key(wrapped: &[u8], vault_key: &VaultKey) -> VaultResult<MasterKey> {
    let wrap = vault_key.wrap_key()?;
    let encrypted = EncryptedData::from_bytes_xchacha(wrapped)
        .map_err(|_| VaultError::CorruptedData("wrapped master key truncated".into()))?;
    let bytes = decrypt_xchacha(&wrap, &encrypted)
        .map_err(|_| VaultError::CorruptedData("wrapped master key does not open".into()))?;
    MasterKey::from_slice(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_roundtrip_and_aad_binding() {
        let key = SecretKey::generate();
        let sealed = encrypt_chunk(&key, b"chunk body", b"file-1:0").unwrap();

        assert_eq!(sealed.len(), NONCE_LEN + b"chunk body".len() + TAG_LEN);
        assert_eq!(decrypt_chunk(&key, &sealed, b"file-1:0").unwrap(), b"chunk body");
        assert!(decrypt_chunk(&key, &sealed, b"file-1:1").is_err());
    }

    #[test]
    fn test_xchacha_roundtrip() {
        let key = SecretKey::generate();
        let plaintext = b"ALFA Index Document";

        let encrypted = encrypt_xchacha(&key, plaintext).unwrap();
        let decrypted = decrypt_xchacha(&key, &encrypted).unwrap();

        assert_eq!(plaintext.as_slice(), decrypted.as_slice());
    }

    #[test]
    fn test_wrap_unwrap_master_key() {
        let vault_key = VaultKey::generate();
        let master = MasterKey::generate();

        let wrapped = wrap_master_key(&master, &vault_key).unwrap();
        let unwrapped = unwrap_master_key(&wrapped, &vault_key).unwrap();
        assert_eq!(master.expose(), unwrapped.expose());

        let other = VaultKey::generate();
        assert!(matches!(
            unwrap_master_key(&wrapped, &other),
            Err(VaultError::CorruptedData(_))
        ));
    }

    #[test]
    fn test_seal_open() {
        let master = MasterKey::generate();
        let sealed = seal(&master, b"thumbnail").unwrap();
        assert_eq!(open(&master, &sealed).unwrap(), b"thumbnail");
    }
}
