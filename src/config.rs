//! ALFA Vault Store - Configuration
//!
//! Policy knobs for the index manager, the blob allocator and the import
//! pipeline. Loaded from JSON; every field has a default.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Batch mode forces a disk flush every N mutations
    pub flush_interval: usize,
    /// Staged batches are discarded after this many failed attempts
    pub max_import_attempts: u32,
    /// Plaintext bytes per encrypted content chunk
    pub chunk_size: usize,
    /// Sources larger than this are stream-encrypted chunk by chunk
    pub streaming_threshold: u64,
    /// Capacity reserved when a primary container is first created
    pub initial_container_size: u64,
    /// Cursor ceiling before allocation moves to a secondary container
    pub max_container_size: u64,
    /// Workers pulling from the video queue
    pub video_workers: usize,
    /// Workers pulling from the "other" queue
    pub other_workers: usize,
    /// Let idle workers pull from a peer queue
    pub work_stealing: bool,
    /// Runs with at least this many items use index batch mode
    pub batch_mode_threshold: usize,
    /// Prepared entries gathered before a mid-run commit (batch mode)
    pub commit_every: usize,
    /// Square thumbnail edge in pixels
    pub thumbnail_size: u32,
    /// Sources above this size get no thumbnail
    pub thumbnail_max_source: u64,
    /// Plaintext bytes covered by the encrypted header preview
    pub preview_len: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            flush_interval: 20,
            max_import_attempts: 2,
            chunk_size: 256 * 1024,
            streaming_threshold: 1024 * 1024,
            initial_container_size: 0,
            max_container_size: 4 * 1024 * 1024 * 1024,
            video_workers: 2,
            other_workers: 2,
            work_stealing: true,
            batch_mode_threshold: 10,
            commit_every: 8,
            thumbnail_size: 256,
            thumbnail_max_source: 32 * 1024 * 1024,
            preview_len: 256,
        }
    }
}

impl StoreConfig {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> VaultResult<Self> {
        let data = std::fs::read(path.as_ref())?;
        let config: StoreConfig = serde_json::from_slice(&data)
            .map_err(|e| VaultError::ConfigError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the store cannot run with
    pub fn validate(&self) -> VaultResult<()> {
        if self.flush_interval == 0 {
            return Err(VaultError::ConfigError("flush_interval must be > 0".into()));
        }
        if self.chunk_size == 0 || self.chunk_size > u32::MAX as usize {
            return Err(VaultError::ConfigError("chunk_size out of range".into()));
        }
        if self.streaming_threshold < self.chunk_size as u64 {
            return Err(VaultError::ConfigError(
                "streaming_threshold must be >= chunk_size".into(),
            ));
        }
        if self.video_workers + self.other_workers == 0 {
            return Err(VaultError::ConfigError("at least one worker required".into()));
        }
        if self.commit_every == 0 {
            return Err(VaultError::ConfigError("commit_every must be > 0".into()));
        }
        if self.max_import_attempts == 0 {
            return Err(VaultError::ConfigError("max_import_attempts must be > 0".into()));
        }
        Ok(())
    }
}
