//! ALFA Vault Store - Staged Imports
//!
//! Sources can be staged first and imported later (e.g. from a share
//! extension). Layout:
//! ```text
//! <root>/pending_imports/<fingerprint>/<batchId>/manifest.json
//! <root>/pending_imports/<fingerprint>/<batchId>/<fileId>.bin
//! ```
//! A payload is deleted as soon as its entry is in the index, so a missing
//! payload means the item was imported by an earlier attempt.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::allocator::SourceFile;
use crate::crypto::VaultKey;
use crate::error::VaultResult;
use crate::index::IndexManager;
use crate::pipeline::{ImportEvent, ImportPipeline};
use crate::secure_fs::SecureFs;

/// Staging directory under the vault root
pub const PENDING_DIR: &str = "pending_imports";

const MANIFEST: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedItem {
    pub file_id: Uuid,
    pub filename: String,
    pub mime_type: String,
    /// Payload file name inside the batch directory
    pub payload: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchManifest {
    pub batch_id: Uuid,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub attempts: u32,
    pub items: Vec<StagedItem>,
}

/// Outcome of [`StagingArea::process_pending_imports`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingImportResult {
    pub imported: usize,
    pub failed: usize,
    pub batches_cleaned: usize,
    pub failure_reason: Option<String>,
}

/// Staging Area
pub struct StagingArea {
    fs: SecureFs,
    max_attempts: u32,
}

impl StagingArea {
    pub fn new(root: &Path, max_attempts: u32) -> Self {
        Self {
            fs: SecureFs::new(root),
            max_attempts: max_attempts.max(1),
        }
    }

    fn vault_dir(key: &VaultKey) -> String {
        format!("{}/{}", PENDING_DIR, key.fingerprint())
    }

    fn batch_dir(key: &VaultKey, batch_id: &Uuid) -> String {
        format!("{}/{}", Self::vault_dir(key), batch_id)
    }

    /// Copy `paths` into a new batch and write its manifest
    pub fn stage(&self, key: &VaultKey, paths: &[PathBuf]) -> VaultResult<BatchManifest> {
        let batch_id = Uuid::new_v4();
        let dir = Self::batch_dir(key, &batch_id);

        let mut items = Vec::with_capacity(paths.len());
        for path in paths {
            let source = SourceFile::from_path(path)?;
            let payload = format!("{}.bin", source.file_id);
            self.fs.write_file(&format!("{}/{}", dir, payload), &std::fs::read(path)?)?;
            items.push(StagedItem {
                file_id: source.file_id,
                filename: source.filename,
                mime_type: source.mime_type,
                payload,
            });
        }

        let manifest = BatchManifest {
            batch_id,
            created_at: Utc::now(),
            attempts: 0,
            items,
        };
        self.write_manifest(key, &manifest)?;
        info!("Staged batch {} with {} item(s)", batch_id, manifest.items.len());
        Ok(manifest)
    }

    /// Batch ids waiting for this vault, oldest name first
    pub fn pending_batches(&self, key: &VaultKey) -> VaultResult<Vec<Uuid>> {
        Ok(self
            .fs
            .list_dir(&Self::vault_dir(key))?
            .iter()
            .filter_map(|name| Uuid::parse_str(name).ok())
            .collect())
    }

    pub fn load_manifest(&self, key: &VaultKey, batch_id: &Uuid) -> VaultResult<BatchManifest> {
        let data = self
            .fs
            .read_file(&format!("{}/{}", Self::batch_dir(key, batch_id), MANIFEST))?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn write_manifest(&self, key: &VaultKey, manifest: &BatchManifest) -> VaultResult<()> {
        let path = format!("{}/{}", Self::batch_dir(key, &manifest.batch_id), MANIFEST);
        self.fs.write_file(&path, &serde_json::to_vec_pretty(manifest)?)
    }

    fn payload_path(&self, key: &VaultKey, batch_id: &Uuid, item: &StagedItem) -> String {
        format!("{}/{}", Self::batch_dir(key, batch_id), item.payload)
    }

    /// Remove every staged batch of a vault
    pub fn clear(&self, key: &VaultKey) -> VaultResult<()> {
        self.fs.delete_dir(&Self::vault_dir(key))
    }

    /// Import every staged batch for `key`.
    ///
    /// `on_progress(completed, total)` is called once per finished item.
    /// Batches are removed once fully imported, or after `max_attempts`
    /// failed attempts.
    pub async fn process_pending_imports<F>(
        &self,
        key: &VaultKey,
        pipeline: &ImportPipeline,
        indexes: &IndexManager,
        mut on_progress: F,
    ) -> VaultResult<PendingImportResult>
    where
        F: FnMut(usize, usize),
    {
        let mut result = PendingImportResult::default();

        let mut batches = Vec::new();
        for batch_id in self.pending_batches(key)? {
            match self.load_manifest(key, &batch_id) {
                Ok(manifest) => batches.push(manifest),
                Err(e) => {
                    warn!("Discarding batch {} with unreadable manifest: {}", batch_id, e);
                    self.fs.delete_dir(&Self::batch_dir(key, &batch_id))?;
                    result.batches_cleaned += 1;
                }
            }
        }

        let total: usize = batches.iter().map(|b| b.items.len()).sum();
        let mut completed = 0usize;

        for mut manifest in batches {
            let batch_id = manifest.batch_id;
            let index = indexes.load_index(key)?;

            let mut sources = Vec::new();
            for item in &manifest.items {
                let payload = self.payload_path(key, &batch_id, item);
                if !self.fs.exists(&payload) {
                    completed += 1;
                    on_progress(completed, total);
                    continue;
                }
                if index.contains(&item.file_id) {
                    // Committed before a crash, payload not yet removed
                    self.fs.delete_file(&payload)?;
                    completed += 1;
                    on_progress(completed, total);
                    continue;
                }
                sources.push(SourceFile {
                    path: self.fs.full_path(&payload),
                    filename: item.filename.clone(),
                    mime_type: item.mime_type.clone(),
                    file_id: item.file_id,
                });
            }

            if !sources.is_empty() {
                let count = sources.len();
                let (mut seen, mut landed) = (0usize, 0usize);
                let run = pipeline
                    .run(key, sources, CancellationToken::new(), |event| {
                        seen += 1;
                        completed += 1;
                        on_progress(completed, total);
                        match event {
                            ImportEvent::Imported(_) => landed += 1,
                            ImportEvent::Failed { reason } => {
                                warn!("Staged item failed: {}", reason.as_deref().unwrap_or("unknown"))
                            }
                        }
                    })
                    .await;

                match run {
                    Ok(summary) => {
                        result.imported += summary.imported;
                        result.failed += summary.failed;
                        if summary.failure_reason.is_some() {
                            result.failure_reason = summary.failure_reason;
                        }
                    }
                    // Counts as a failed attempt for this batch
                    Err(e) => {
                        warn!("Import run for staged batch {} failed: {}", batch_id, e);
                        result.imported += landed;
                        result.failed += count - landed;
                        result.failure_reason = Some(e.to_string());
                        if seen < count {
                            completed += count - seen;
                            on_progress(completed, total);
                        }
                    }
                }
            }

            // Trust the index, not the events, for what actually landed
            let index = indexes.load_index(key)?;
            let mut remaining = 0usize;
            for item in &manifest.items {
                let payload = self.payload_path(key, &batch_id, item);
                if !self.fs.exists(&payload) {
                    continue;
                }
                if index.contains(&item.file_id) {
                    self.fs.delete_file(&payload)?;
                } else {
                    remaining += 1;
                }
            }

            if remaining == 0 {
                self.fs.delete_dir(&Self::batch_dir(key, &batch_id))?;
                result.batches_cleaned += 1;
                info!("Staged batch {} fully imported", batch_id);
                continue;
            }

            manifest.attempts += 1;
            if manifest.attempts >= self.max_attempts {
                warn!(
                    "Discarding staged batch {} after {} attempts, {} item(s) not imported",
                    batch_id, manifest.attempts, remaining
                );
                self.fs.delete_dir(&Self::batch_dir(key, &batch_id))?;
                result.batches_cleaned += 1;
            } else {
                info!(
                    "Staged batch {} attempt {} left {} item(s) pending",
                    batch_id, manifest.attempts, remaining
                );
                self.write_manifest(key, &manifest)?;
            }
        }

        Ok(result)
    }
}
