//! ALFA Vault Store - Encrypted Index
//!
//! Document model, schema migration and the transactional manager.

pub mod manager;
pub mod migrate;
pub mod model;

pub use manager::{index_file_name, BatchGuard, IndexManager};
pub use model::{
    BlobDescriptor, ShareRecord, VaultFileEntry, VaultFileItem, VaultIndex, CURRENT_VERSION,
};
