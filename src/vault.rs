//! ALFA Vault Store - Vault Facade
//!
//! One explicitly constructed service object per storage root. It owns the
//! index manager, the blob allocator, the import pipeline and the staging
//! area, and threads them together; there is no global state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::allocator::{blob_file_name, BlobAllocator, SourceFile};
use crate::blob::{EncryptedBlob, Region, DEFAULT_RANDOMNESS_SAMPLE};
use crate::config::StoreConfig;
use crate::crypto::stream::decrypt_content;
use crate::crypto::{open, VaultKey};
use crate::error::{VaultError, VaultResult};
use crate::index::{IndexManager, VaultFileEntry, VaultFileItem, VaultIndex};
use crate::pipeline::{ImportEvent, ImportPipeline, ImportRun, ImportSummary};
use crate::secure_fs::wipe_and_remove;
use crate::staging::{BatchManifest, PendingImportResult, StagingArea, PENDING_DIR};
use crate::thumbs::{MemoryThumbnailCache, ThumbnailCache, ThumbnailEngine, ThumbnailGenerator};

/// Health of one container, from [`Vault::self_test`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHealth {
    pub path: PathBuf,
    pub size: u64,
    pub looks_random: bool,
}

/// Self-test report
#[derive(Debug, Clone, Default)]
pub struct SelfTestReport {
    pub containers: Vec<ContainerHealth>,
    /// Live entries whose content failed to decrypt
    pub unreadable: Vec<Uuid>,
}

impl SelfTestReport {
    pub fn is_healthy(&self) -> bool {
        self.unreadable.is_empty() && self.containers.iter().all(|c| c.looks_random)
    }
}

/// Vault
pub struct Vault {
    root: PathBuf,
    config: StoreConfig,
    indexes: Arc<IndexManager>,
    allocator: Arc<BlobAllocator>,
    cache: Arc<dyn ThumbnailCache>,
    pipeline: ImportPipeline,
    staging: StagingArea,
}

impl Vault {
    // ═══════════════════════════════════════════════════════════════════════
    // INITIALIZATION
    // ═══════════════════════════════════════════════════════════════════════

    /// Open a storage root with the default thumbnail collaborators
    pub fn open<P: AsRef<Path>>(path: P, config: StoreConfig) -> VaultResult<Self> {
        let generator = Arc::new(ThumbnailEngine::new(config.thumbnail_size));
        Self::with_collaborators(path, config, generator, Arc::new(MemoryThumbnailCache::default()))
    }

    /// Open a storage root with caller-supplied thumbnail collaborators
    pub fn with_collaborators<P: AsRef<Path>>(
        path: P,
        config: StoreConfig,
        generator: Arc<dyn ThumbnailGenerator>,
        cache: Arc<dyn ThumbnailCache>,
    ) -> VaultResult<Self> {
        config.validate()?;
        let root = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;

        let indexes = Arc::new(IndexManager::new(
            &root,
            config.flush_interval,
            config.initial_container_size,
        ));
        let allocator = Arc::new(BlobAllocator::new(&root, Arc::clone(&indexes), &config));
        let pipeline = ImportPipeline::new(
            Arc::clone(&indexes),
            Arc::clone(&allocator),
            generator,
            Arc::clone(&cache),
            config.clone(),
        );
        let staging = StagingArea::new(&root, config.max_import_attempts);

        Ok(Self {
            root,
            config,
            indexes,
            allocator,
            cache,
            pipeline,
            staging,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn indexes(&self) -> &Arc<IndexManager> {
        &self.indexes
    }

    pub fn thumbnail_cache(&self) -> &Arc<dyn ThumbnailCache> {
        &self.cache
    }

    /// Load the vault's index, creating the vault if the key is new
    pub fn init(&self, key: &VaultKey) -> VaultResult<VaultIndex> {
        self.indexes.load_index(key)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // READ OPERATIONS
    // ═══════════════════════════════════════════════════════════════════════

    /// Live (non-tombstoned) files
    pub fn list_files(&self, key: &VaultKey) -> VaultResult<Vec<VaultFileItem>> {
        let index = self.indexes.load_index(key)?;
        Ok(index.live_files().map(VaultFileItem::from).collect())
    }

    /// Index entry of a live file
    pub fn entry(&self, key: &VaultKey, file_id: &Uuid) -> VaultResult<VaultFileEntry> {
        self.indexes.load_index(key)?.find(file_id).cloned()
    }

    /// Decrypt a file's full content
    pub fn read_file(&self, key: &VaultKey, file_id: &Uuid) -> VaultResult<Vec<u8>> {
        let index = self.indexes.load_index(key)?;
        let entry = index.find(file_id)?;
        let master = IndexManager::get_master_key(&index, key)?;

        let blob = self.allocator.open_blob(&key.fingerprint(), entry.blob_id)?;
        let raw = blob.read(Region::new(entry.offset, entry.size))?;
        decrypt_content(&master, file_id, &raw)
    }

    /// Decrypt a file into `out`; returns the plaintext length
    pub fn export_file(&self, key: &VaultKey, file_id: &Uuid, out: &Path) -> VaultResult<u64> {
        let data = self.read_file(key, file_id)?;
        std::fs::write(out, &data)?;
        Ok(data.len() as u64)
    }

    /// Decrypted thumbnail, `None` if the file has none
    pub fn read_thumbnail(&self, key: &VaultKey, file_id: &Uuid) -> VaultResult<Option<Vec<u8>>> {
        let index = self.indexes.load_index(key)?;
        let entry = index.find(file_id)?;
        match &entry.thumbnail_data {
            Some(sealed) => {
                let master = IndexManager::get_master_key(&index, key)?;
                Ok(Some(open(&master, sealed)?))
            }
            None => Ok(None),
        }
    }

    /// Decrypted leading bytes of a file, without touching its container
    pub fn read_preview(&self, key: &VaultKey, file_id: &Uuid) -> VaultResult<Vec<u8>> {
        let index = self.indexes.load_index(key)?;
        let entry = index.find(file_id)?;
        let sealed = entry
            .encrypted_header_preview
            .as_ref()
            .ok_or_else(|| VaultError::CorruptedData(format!("{} has no header preview", file_id)))?;
        let master = IndexManager::get_master_key(&index, key)?;
        open(&master, sealed)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // MUTATIONS
    // ═══════════════════════════════════════════════════════════════════════

    /// Tombstone a file, then overwrite its region with random bytes.
    /// Space is not reclaimed.
    pub fn delete_file(&self, key: &VaultKey, file_id: &Uuid) -> VaultResult<()> {
        let (blob_id, region) = self.indexes.with_transaction(key, |index, _| {
            let entry = index.find_mut(file_id)?;
            entry.is_deleted = true;
            entry.thumbnail_data = None;
            entry.encrypted_header_preview = None;
            Ok((entry.blob_id, Region::new(entry.offset, entry.size)))
        })?;

        if region.length > 0 {
            let blob = self.allocator.open_blob(&key.fingerprint(), blob_id)?;
            blob.overwrite_with_random(region)?;
        }
        self.cache.remove(file_id);
        info!("Deleted file {}", file_id);
        Ok(())
    }

    /// Re-wrap the master key under `new_key` and move the vault's files to
    /// the new fingerprint. File content is not re-encrypted.
    pub fn change_key(&self, old_key: &VaultKey, new_key: &VaultKey) -> VaultResult<()> {
        let old_fp = old_key.fingerprint();
        let new_fp = new_key.fingerprint();
        if old_fp == new_fp {
            return Ok(());
        }
        if !self.indexes.exists(old_key) {
            return Err(VaultError::FileNotFound(format!("no vault for key {}", old_fp)));
        }
        if self.indexes.exists(new_key) {
            return Err(VaultError::WriteError(format!(
                "a vault already exists for key {}",
                new_fp
            )));
        }

        let index = self.indexes.load_index(old_key)?;
        self.allocator.forget(&old_fp);

        let ids: Vec<Option<Uuid>> = std::iter::once(None)
            .chain(index.blobs.iter().flatten().map(|b| Some(b.blob_id)))
            .collect();
        let mut moved = Vec::new();
        for id in ids {
            let from = self.root.join(blob_file_name(&old_fp, id));
            let to = self.root.join(blob_file_name(&new_fp, id));
            if from.exists() {
                std::fs::rename(&from, &to)?;
                moved.push((from, to));
            }
        }

        if let Err(e) = self.indexes.rekey(old_key, new_key) {
            warn!("Re-key failed, restoring container names: {}", e);
            for (from, to) in moved {
                std::fs::rename(&to, &from)?;
            }
            return Err(e);
        }

        let old_pending = self.root.join(PENDING_DIR).join(&old_fp);
        if old_pending.exists() {
            std::fs::rename(&old_pending, self.root.join(PENDING_DIR).join(&new_fp))?;
        }

        self.indexes.invalidate(old_key)?;
        self.indexes.invalidate(new_key)?;
        info!("Vault key changed {} -> {}", old_fp, new_fp);
        Ok(())
    }

    /// Securely remove every container, the index and staged imports
    pub fn delete_vault(&self, key: &VaultKey) -> VaultResult<()> {
        let fp = key.fingerprint();
        let index = self.indexes.load_index(key)?;

        self.allocator.forget(&fp);
        for path in self.allocator.container_paths(&fp, &index) {
            wipe_and_remove(&path)?;
        }
        self.staging.clear(key)?;
        self.indexes.delete_index(key)?;
        for entry in &index.files {
            self.cache.remove(&entry.file_id);
        }

        info!("Vault {} deleted", fp);
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // IMPORT
    // ═══════════════════════════════════════════════════════════════════════

    /// Start a parallel import; drain the returned run for live events
    pub fn start_import(
        &self,
        key: &VaultKey,
        sources: Vec<SourceFile>,
        cancel: CancellationToken,
    ) -> ImportRun {
        self.pipeline.start(key, sources, cancel)
    }

    /// Import and wait, forwarding each event to `on_event`
    pub async fn import_files<F: FnMut(&ImportEvent)>(
        &self,
        key: &VaultKey,
        sources: Vec<SourceFile>,
        cancel: CancellationToken,
        on_event: F,
    ) -> VaultResult<ImportSummary> {
        self.pipeline.run(key, sources, cancel, on_event).await
    }

    /// Stage files for a later [`Vault::process_pending_imports`]
    pub fn stage_import(&self, key: &VaultKey, paths: &[PathBuf]) -> VaultResult<BatchManifest> {
        self.staging.stage(key, paths)
    }

    pub async fn process_pending_imports<F: FnMut(usize, usize)>(
        &self,
        key: &VaultKey,
        on_progress: F,
    ) -> VaultResult<PendingImportResult> {
        self.staging
            .process_pending_imports(key, &self.pipeline, &self.indexes, on_progress)
            .await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // SELF-TEST
    // ═══════════════════════════════════════════════════════════════════════

    /// Randomness check over every container plus a decrypt of every live file
    pub fn self_test(&self, key: &VaultKey) -> VaultResult<SelfTestReport> {
        let fp = key.fingerprint();
        let index = self.indexes.load_index(key)?;
        let mut report = SelfTestReport::default();

        for path in self.allocator.container_paths(&fp, &index) {
            if !path.exists() {
                continue;
            }
            let blob = EncryptedBlob::open(&path)?;
            let size = blob.file_size()?;
            if size == 0 {
                continue;
            }
            report.containers.push(ContainerHealth {
                looks_random: blob.passes_randomness_check(DEFAULT_RANDOMNESS_SAMPLE)?,
                path,
                size,
            });
        }

        for entry in index.live_files() {
            if let Err(e) = self.read_file(key, &entry.file_id) {
                warn!("Self-test: {} unreadable: {}", entry.file_id, e);
                report.unreadable.push(entry.file_id);
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::DynamicImage;
    use rand::RngCore;
    use std::io::Cursor;
    use tempfile::{tempdir, TempDir};

    fn vault() -> (TempDir, Vault) {
        let dir = tempdir().unwrap();
        let vault = Vault::open(dir.path().join("store"), StoreConfig::default()).unwrap();
        (dir, vault)
    }

    fn write(dir: &Path, name: &str, data: &[u8]) -> SourceFile {
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        SourceFile::from_path(path).unwrap()
    }

    fn png() -> Vec<u8> {
        let mut buffer = Vec::new();
        DynamicImage::new_rgb8(64, 48)
            .write_to(&mut Cursor::new(&mut buffer), image::ImageFormat::Png)
            .unwrap();
        buffer
    }

    async fn import(vault: &Vault, key: &VaultKey, sources: Vec<SourceFile>) -> ImportSummary {
        vault
            .import_files(key, sources, CancellationToken::new(), |_| {})
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_import_read_back() {
        let (dir, vault) = vault();
        let key = VaultKey::generate();
        let image = png();
        let pic = write(dir.path(), "pic.png", &image);
        let note = write(dir.path(), "note.txt", b"plain words");
        let (pic_id, note_id) = (pic.file_id, note.file_id);

        let summary = import(&vault, &key, vec![pic, note]).await;
        assert_eq!(summary.imported, 2);

        let listed = vault.list_files(&key).unwrap();
        assert_eq!(listed.len(), 2);

        assert_eq!(vault.read_file(&key, &pic_id).unwrap(), image);
        assert_eq!(vault.read_file(&key, &note_id).unwrap(), b"plain words");
        assert_eq!(vault.read_preview(&key, &note_id).unwrap(), b"plain words");

        let thumb = vault.read_thumbnail(&key, &pic_id).unwrap().unwrap();
        assert!(image::load_from_memory(&thumb).is_ok());
        assert_eq!(vault.thumbnail_cache().get(&pic_id), Some(thumb));
        assert!(vault.read_thumbnail(&key, &note_id).unwrap().is_none());

        let out = dir.path().join("exported.png");
        assert_eq!(vault.export_file(&key, &pic_id, &out).unwrap(), image.len() as u64);
        assert_eq!(std::fs::read(out).unwrap(), image);
    }

    #[tokio::test]
    async fn test_delete_tombstones_and_wipes() {
        let (dir, vault) = vault();
        let key = VaultKey::generate();
        let src = write(dir.path(), "a.txt", &[7u8; 512]);
        let id = src.file_id;
        import(&vault, &key, vec![src]).await;

        let entry = vault.entry(&key, &id).unwrap();
        let blob = EncryptedBlob::open(vault.root().join(blob_file_name(&key.fingerprint(), None))).unwrap();
        let before = blob.read(Region::new(entry.offset, entry.size)).unwrap();

        vault.delete_file(&key, &id).unwrap();

        assert!(matches!(vault.read_file(&key, &id), Err(VaultError::FileNotFound(_))));
        assert!(vault.list_files(&key).unwrap().is_empty());
        assert_ne!(blob.read(Region::new(entry.offset, entry.size)).unwrap(), before);

        let index = vault.indexes().load_index(&key).unwrap();
        assert_eq!(index.files.len(), 1);
        assert!(index.files[0].is_deleted);
        assert!(matches!(vault.delete_file(&key, &id), Err(VaultError::FileNotFound(_))));
    }

    #[tokio::test]
    async fn test_change_key_keeps_content() {
        let (dir, vault) = vault();
        let old_key = VaultKey::generate();
        let new_key = VaultKey::generate();
        let src = write(dir.path(), "k.txt", b"survives rekey");
        let id = src.file_id;
        import(&vault, &old_key, vec![src]).await;

        vault.change_key(&old_key, &new_key).unwrap();

        assert_eq!(vault.read_file(&new_key, &id).unwrap(), b"survives rekey");
        assert!(!vault.indexes().exists(&old_key));
        assert!(!vault.root().join(blob_file_name(&old_key.fingerprint(), None)).exists());
    }

    #[tokio::test]
    async fn test_change_key_refuses_existing_target() {
        let (_dir, vault) = vault();
        let a = VaultKey::generate();
        let b = VaultKey::generate();
        vault.init(&a).unwrap();
        vault.init(&b).unwrap();

        assert!(matches!(vault.change_key(&a, &b), Err(VaultError::WriteError(_))));
    }

    #[tokio::test]
    async fn test_change_key_keeps_other_vaults_batch_cursor() {
        let (dir, vault) = vault();
        let busy = VaultKey::generate();
        let old_key = VaultKey::generate();
        let new_key = VaultKey::generate();
        import(&vault, &old_key, vec![write(dir.path(), "o.txt", b"other")]).await;

        vault.indexes().begin_batch();
        let (first, _) = vault.allocator.allocate_batch_space(&[100], &busy).unwrap();
        vault.change_key(&old_key, &new_key).unwrap();
        let (second, _) = vault.allocator.allocate_batch_space(&[100], &busy).unwrap();
        vault.indexes().end_batch(&busy).unwrap();

        let (a, b) = (first[0].region(), second[0].region());
        assert_eq!(first[0].blob_id, second[0].blob_id);
        assert!(a.offset + a.length <= b.offset, "{:?} overlaps {:?}", a, b);
    }

    #[tokio::test]
    async fn test_delete_vault_keeps_other_thumbnails() {
        let (dir, vault) = vault();
        let doomed = VaultKey::generate();
        let kept = VaultKey::generate();
        let image = png();
        let gone = write(dir.path(), "gone.png", &image);
        let stay = write(dir.path(), "stay.png", &image);
        let (gone_id, stay_id) = (gone.file_id, stay.file_id);
        import(&vault, &doomed, vec![gone]).await;
        import(&vault, &kept, vec![stay]).await;
        assert!(vault.thumbnail_cache().get(&gone_id).is_some());

        vault.delete_vault(&doomed).unwrap();

        assert!(vault.thumbnail_cache().get(&gone_id).is_none());
        assert!(vault.thumbnail_cache().get(&stay_id).is_some());
    }

    #[tokio::test]
    async fn test_delete_vault_removes_everything() {
        let (dir, vault) = vault();
        let key = VaultKey::generate();
        let src = write(dir.path(), "x.txt", b"bye");
        import(&vault, &key, vec![src]).await;
        vault.stage_import(&key, &[dir.path().join("x.txt")]).unwrap();

        vault.delete_vault(&key).unwrap();

        assert!(!vault.indexes().exists(&key));
        assert!(!vault.root().join(blob_file_name(&key.fingerprint(), None)).exists());
        assert!(!vault.root().join(PENDING_DIR).join(key.fingerprint()).exists());
    }

    #[tokio::test]
    async fn test_self_test_passes_on_ciphertext() {
        let (dir, vault) = vault();
        let key = VaultKey::generate();
        let mut data = vec![0u8; 16 * 1024];
        rand::thread_rng().fill_bytes(&mut data);
        let sources = vec![
            write(dir.path(), "one.bin", &data),
            write(dir.path(), "two.txt", &vec![b'a'; 16 * 1024]),
        ];
        import(&vault, &key, sources).await;

        let report = vault.self_test(&key).unwrap();
        assert_eq!(report.containers.len(), 1);
        assert!(report.is_healthy(), "{:?}", report);
    }
}
