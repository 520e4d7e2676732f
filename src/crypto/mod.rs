//! ALFA Vault Store - Cryptographic Core
//!
//! Vault/master key hierarchy, AEAD helpers and chunked content framing.

pub mod keys;
pub mod aead;
pub mod stream;

pub use keys::*;
pub use aead::*;
