//! ALFA Vault Store - Key Management
//!
//! Two key tiers: the externally derived `VaultKey` unlocks one vault's index,
//! the random per-vault `MasterKey` (stored wrapped inside that index)
//! encrypts all file content and thumbnails.

use std::fmt;

use hkdf::Hkdf;
use hmac::digest::{Key, KeyInit};
use hmac::{Hmac, Mac};
use rand::RngCore;
use secrecy::{ExposeSecret, Secret};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::{VaultError, VaultResult};

/// Key length for AES-256 / XChaCha20
pub const KEY_LEN: usize = 32;

/// Nonce length for AES-GCM
pub const NONCE_LEN: usize = 12;

/// Nonce length for XChaCha20
pub const XCHACHA_NONCE_LEN: usize = 24;

/// Hex characters kept from the fingerprint MAC
pub const FINGERPRINT_LEN: usize = 16;

/// HKDF contexts for key derivation
pub mod contexts {
    /// Context for the index document key
    pub const INDEX: &[u8] = b"ALFA:STORE:INDEX:v1";

    /// Context for the master key wrapping key
    pub const WRAP: &[u8] = b"ALFA:STORE:WRAP:v1";

    /// Message MACed to produce the vault fingerprint
    pub const FINGERPRINT: &[u8] = b"ALFA:STORE:FINGERPRINT:v1";

    /// Salt for pattern stretching
    pub const PATTERN_SALT: &[u8] = b"ALFA_VAULT_STORE_PATTERN_v1";
}

/// Secret 256-bit key with automatic zeroization
pub struct SecretKey {
    inner: Secret<[u8; KEY_LEN]>,
}

impl SecretKey {
    /// Create a key from bytes
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            inner: Secret::new(bytes),
        }
    }

    /// Create a key from a slice, checking its length
    pub fn from_slice(bytes: &[u8]) -> VaultResult<Self> {
        let arr: [u8; KEY_LEN] = bytes.try_into().map_err(|_| VaultError::InvalidKeyLength {
            expected: KEY_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self::new(arr))
    }

    /// Expose the key bytes (use with caution)
    pub fn expose(&self) -> &[u8; KEY_LEN] {
        self.inner.expose_secret()
    }

    /// Generate a random key
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self::new(bytes)
    }
}

impl Clone for SecretKey {
    fn clone(&self) -> Self {
        Self::new(*self.expose())
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey([REDACTED])")
    }
}

/// Externally supplied secret that unlocks one vault. Never persisted.
#[derive(Clone, Debug)]
pub struct VaultKey(SecretKey);

impl VaultKey {
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(SecretKey::new(bytes))
    }

    pub fn from_slice(bytes: &[u8]) -> VaultResult<Self> {
        SecretKey::from_slice(bytes).map(Self)
    }

    pub fn generate() -> Self {
        Self(SecretKey::generate())
    }

    pub fn expose(&self) -> &[u8; KEY_LEN] {
        self.0.expose()
    }

    /// Stretch an unlock pattern into a vault key using Argon2id
    pub fn from_pattern(pattern: &[u8]) -> VaultResult<Self> {
        use argon2::{Algorithm, Argon2, Params, Version};

        if pattern.is_empty() {
            return Err(VaultError::KeyDerivationFailed("empty pattern".into()));
        }

        let params = Params::new(19456, 2, 1, Some(KEY_LEN))
            .map_err(|e| VaultError::KeyDerivationFailed(e.to_string()))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut out = [0u8; KEY_LEN];
        argon2
            .hash_password_into(pattern, contexts::PATTERN_SALT, &mut out)
            .map_err(|e| VaultError::KeyDerivationFailed(e.to_string()))?;

        Ok(Self::new(out))
    }

    /// Short deterministic identifier: names the index file and staging dir
    pub fn fingerprint(&self) -> String {
        // HMAC zero-pads short keys to the block size, so this equals the
        // MAC keyed with the bare 32 bytes
        let mut block = Key::<Hmac<Sha256>>::default();
        block[..KEY_LEN].copy_from_slice(self.expose());
        let mut mac = <Hmac<Sha256> as KeyInit>::new(&block);
        block.as_mut_slice().zeroize();
        mac.update(contexts::FINGERPRINT);
        let digest = mac.finalize().into_bytes();
        let mut hex = hex::encode(digest);
        hex.truncate(FINGERPRINT_LEN);
        hex
    }

    /// Key that encrypts the index document
    pub fn index_key(&self) -> VaultResult<SecretKey> {
        derive_key(self.expose(), b"index", contexts::INDEX)
    }

    /// Key that wraps the master key
    pub fn wrap_key(&self) -> VaultResult<SecretKey> {
        derive_key(self.expose(), b"wrap", contexts::WRAP)
    }
}

/// Per-vault random content key. Only ever persisted wrapped.
#[derive(Clone, Debug)]
pub struct MasterKey(SecretKey);

impl MasterKey {
    pub fn generate() -> Self {
        Self(SecretKey::generate())
    }

    pub fn from_slice(bytes: &[u8]) -> VaultResult<Self> {
        SecretKey::from_slice(bytes).map(Self)
    }

    pub fn expose(&self) -> &[u8; KEY_LEN] {
        self.0.expose()
    }

    pub fn as_secret(&self) -> &SecretKey {
        &self.0
    }
}

/// Derive a key using HKDF-SHA256
pub fn derive_key(ikm: &[u8], salt: &[u8], info: &[u8]) -> VaultResult<SecretKey> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = [0u8; KEY_LEN];

    hk.expand(info, &mut okm)
        .map_err(|e| VaultError::KeyDerivationFailed(e.to_string()))?;

    Ok(SecretKey::new(okm))
}

/// Generate a random nonce for AES-GCM
pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

/// Generate a random nonce for XChaCha20
pub fn generate_xchacha_nonce() -> [u8; XCHACHA_NONCE_LEN] {
    let mut nonce = [0u8; XCHACHA_NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}
