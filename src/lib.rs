//! # ALFA Vault Store
//!
//! Encrypted local object store with a parallel import pipeline.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     ALFA VAULT STORE                      │
//! │  ┌──────────────┐  ┌───────────────┐  ┌───────────────┐  │
//! │  │   STAGING    │  │ IMPORT        │  │  THUMBNAILS   │  │
//! │  │  (pending)   │─▶│ PIPELINE      │─▶│  gen + cache  │  │
//! │  └──────────────┘  │ queues/steal  │  └───────────────┘  │
//! │                    └──────┬────────┘                     │
//! │                           │ allocate / prepare / commit  │
//! │  ┌──────────────┐  ┌──────┴────────┐  ┌───────────────┐  │
//! │  │ INDEX        │◀─│ BLOB          │─▶│ ENCRYPTED     │  │
//! │  │ MANAGER      │  │ ALLOCATOR     │  │ BLOB (AES-GCM)│  │
//! │  │ (XChaCha20)  │  └───────────────┘  └───────────────┘  │
//! │  └──────────────┘                                        │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Model
//!
//! - VaultKey (Argon2id from the unlock pattern) only unlocks the index
//! - Per-vault random MasterKey, stored wrapped inside the index
//! - File content: chunked AES-256-GCM bound to file id and chunk index
//! - Index, thumbnails and previews: XChaCha20-Poly1305
//! - Deletes overwrite ciphertext with random bytes

pub mod allocator;
pub mod blob;
pub mod config;
pub mod crypto;
pub mod error;
pub mod index;
pub mod pipeline;
pub mod secure_fs;
pub mod staging;
pub mod thumbs;
pub mod vault;

pub use allocator::{BlobAllocation, BlobAllocator, PreparedEntry, SourceFile};
pub use blob::{EncryptedBlob, Region};
pub use config::StoreConfig;
pub use crypto::{MasterKey, VaultKey};
pub use error::{VaultError, VaultResult};
pub use index::{IndexManager, VaultFileEntry, VaultFileItem, VaultIndex};
pub use pipeline::{ImportEvent, ImportPipeline, ImportRun, ImportSummary};
pub use staging::{PendingImportResult, StagingArea};
pub use thumbs::{MemoryThumbnailCache, ThumbnailCache, ThumbnailEngine, ThumbnailGenerator};
pub use vault::{SelfTestReport, Vault};

/// ALFA Vault Store version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
