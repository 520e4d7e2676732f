//! ALFA Vault Store - Index Manager
//!
//! Sole owner of decrypted index state. Every mutation goes through
//! [`IndexManager::with_transaction`], which runs under one lock, so at most
//! one transaction executes at a time and callers queue behind it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::Mutex;
use zeroize::Zeroizing;

use super::migrate;
use super::model::VaultIndex;
use crate::crypto::{
    decrypt_xchacha, encrypt_xchacha, unwrap_master_key, wrap_master_key, EncryptedData,
    MasterKey, VaultKey,
};
use crate::error::{VaultError, VaultResult};
use crate::secure_fs::SecureFs;

/// Index file name for a vault fingerprint
pub fn index_file_name(fingerprint: &str) -> String {
    format!("index_{}.vidx", fingerprint)
}

#[derive(Default)]
struct ManagerState {
    /// One decrypted index per vault fingerprint
    cache: HashMap<String, VaultIndex>,
    /// Nesting depth of begin_batch/end_batch
    batch_depth: usize,
    /// Vaults with unflushed batch mutations: count since last flush + key
    dirty: HashMap<String, (usize, VaultKey)>,
}

/// Index Manager
pub struct IndexManager {
    fs: SecureFs,
    flush_interval: usize,
    initial_container_size: u64,
    state: Mutex<ManagerState>,
}

impl IndexManager {
    /// Create a manager rooted at the vault directory
    pub fn new(root: &Path, flush_interval: usize, initial_container_size: u64) -> Self {
        Self {
            fs: SecureFs::new(root),
            flush_interval: flush_interval.max(1),
            initial_container_size,
            state: Mutex::new(ManagerState::default()),
        }
    }

    pub fn root(&self) -> &Path {
        self.fs.root()
    }

    /// On-disk location of a vault's index
    pub fn index_path(&self, key: &VaultKey) -> PathBuf {
        self.fs.full_path(&index_file_name(&key.fingerprint()))
    }

    /// True if an index file exists for this key
    pub fn exists(&self, key: &VaultKey) -> bool {
        self.fs.exists(&index_file_name(&key.fingerprint()))
    }

    // ═══════════════════════════════════════════════════════════════════════
    // LOAD / SAVE
    // ═══════════════════════════════════════════════════════════════════════

    /// Cached index for `key`, reading, decrypting and migrating on first use.
    /// A key that has never been seen gets a brand-new index.
    pub fn load_index(&self, key: &VaultKey) -> VaultResult<VaultIndex> {
        let mut state = self.state.lock();
        self.load_locked(&mut state, key).cloned()
    }

    /// Encrypt and atomically replace the on-disk index; refresh the cache
    pub fn save_index(&self, index: &VaultIndex, key: &VaultKey) -> VaultResult<()> {
        index.validate()?;
        let mut state = self.state.lock();
        self.write_to_disk(index, key)?;

        let fp = key.fingerprint();
        state.dirty.remove(&fp);
        state.cache.insert(fp, index.clone());
        Ok(())
    }

    /// Unwrap the master key carried by `index`
    pub fn get_master_key(index: &VaultIndex, vault_key: &VaultKey) -> VaultResult<MasterKey> {
        let wrapped = index
            .encrypted_master_key
            .as_ref()
            .ok_or_else(|| VaultError::CorruptedData("index has no encryptedMasterKey".into()))?;
        unwrap_master_key(wrapped, vault_key)
    }

    fn load_locked<'a>(
        &self,
        state: &'a mut ManagerState,
        key: &VaultKey,
    ) -> VaultResult<&'a mut VaultIndex> {
        let fp = key.fingerprint();

        if !state.cache.contains_key(&fp) {
            let index = self.read_from_disk(key)?;
            state.cache.insert(fp.clone(), index);
        }

        state
            .cache
            .get_mut(&fp)
            .ok_or_else(|| VaultError::CorruptedData("index cache miss after load".into()))
    }

    fn read_from_disk(&self, key: &VaultKey) -> VaultResult<VaultIndex> {
        let name = index_file_name(&key.fingerprint());

        if !self.fs.exists(&name) {
            let master = MasterKey::generate();
            let index = VaultIndex::new(
                wrap_master_key(&master, key)?,
                self.initial_container_size,
            );
            self.write_to_disk(&index, key)?;
            info!("Created new vault index {}", name);
            return Ok(index);
        }

        let ciphertext = self.fs.read_file(&name)?;
        let index_key = key.index_key()?;
        let plaintext = EncryptedData::from_bytes_xchacha(&ciphertext)
            .and_then(|enc| decrypt_xchacha(&index_key, &enc))
            .map(Zeroizing::new)
            .map_err(|_| VaultError::IndexDecryptionFailed)?;

        let index: VaultIndex = serde_json::from_slice(&plaintext)
            .map_err(|e| VaultError::CorruptedData(format!("index does not parse: {}", e)))?;
        index.validate()?;

        let (index, migrated) = migrate::migrate(index, key)?;
        if migrated {
            self.write_to_disk(&index, key)?;
        }
        Ok(index)
    }

    fn write_to_disk(&self, index: &VaultIndex, key: &VaultKey) -> VaultResult<()> {
        let plaintext = Zeroizing::new(serde_json::to_vec(index)?);
        let encrypted = encrypt_xchacha(&key.index_key()?, &plaintext)?;
        self.fs
            .write_file(&index_file_name(&key.fingerprint()), &encrypted.to_bytes())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // TRANSACTIONS
    // ═══════════════════════════════════════════════════════════════════════

    /// Run `mutate` against the vault's index and persist the result.
    ///
    /// `mutate` works on a copy that shares unchanged entries with the cached
    /// index: if it fails, or persisting fails, the cached index is left
    /// untouched. Outside batch mode the result is written
    /// immediately; inside batch mode only every `flush_interval`-th mutation
    /// is written.
    pub fn with_transaction<T, F>(&self, key: &VaultKey, mutate: F) -> VaultResult<T>
    where
        F: FnOnce(&mut VaultIndex, &MasterKey) -> VaultResult<T>,
    {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let mut working = self.load_locked(state, key)?.clone();
        let master = Self::get_master_key(&working, key)?;
        let out = mutate(&mut working, &master)?;
        working.validate()?;

        let fp = key.fingerprint();
        if state.batch_depth == 0 {
            self.write_to_disk(&working, key)?;
            state.dirty.remove(&fp);
        } else {
            let pending = state
                .dirty
                .get(&fp)
                .map(|(count, _)| *count)
                .unwrap_or(0)
                + 1;
            if pending >= self.flush_interval {
                self.write_to_disk(&working, key)?;
                debug!("Interim batch flush for vault {} after {} mutations", fp, pending);
                state.dirty.remove(&fp);
            } else {
                state.dirty.insert(fp.clone(), (pending, key.clone()));
            }
        }

        state.cache.insert(fp, working);
        Ok(out)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // BATCH MODE
    // ═══════════════════════════════════════════════════════════════════════

    /// Enter (or nest) batch mode
    pub fn begin_batch(&self) {
        let mut state = self.state.lock();
        state.batch_depth += 1;
        debug!("Index batch depth -> {}", state.batch_depth);
    }

    /// Leave one batch level. At depth 0 the vault's index is always flushed,
    /// along with any other vault mutated during the batch.
    pub fn end_batch(&self, key: &VaultKey) -> VaultResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        state.batch_depth = state.batch_depth.saturating_sub(1);
        if state.batch_depth > 0 {
            return Ok(());
        }

        let fp = key.fingerprint();
        if let Some(index) = state.cache.get(&fp) {
            self.write_to_disk(index, key)?;
        }
        state.dirty.remove(&fp);

        let others: Vec<(String, VaultKey)> = state
            .dirty
            .drain()
            .map(|(fp, (_, key))| (fp, key))
            .collect();
        for (other_fp, other_key) in others {
            if let Some(index) = state.cache.get(&other_fp) {
                self.write_to_disk(index, &other_key)?;
            }
        }

        info!("Index batch closed, vault {} flushed", fp);
        Ok(())
    }

    /// Current batch nesting depth
    pub fn batch_depth(&self) -> usize {
        self.state.lock().batch_depth
    }

    // ═══════════════════════════════════════════════════════════════════════
    // CACHE / LIFECYCLE
    // ═══════════════════════════════════════════════════════════════════════

    /// Drop one vault's cached index; the next load re-reads from disk.
    /// Unflushed batch mutations are written first so the cursor never
    /// falls back to a stale value.
    pub fn invalidate(&self, key: &VaultKey) -> VaultResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let fp = key.fingerprint();

        self.flush_dirty(state, &fp)?;
        state.cache.remove(&fp);
        debug!("Index cache for vault {} invalidated", fp);
        Ok(())
    }

    /// Drop every cached index after flushing any vault with unflushed
    /// batch mutations. On a flush error nothing is dropped.
    pub fn invalidate_cache(&self) -> VaultResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let dirty: Vec<String> = state.dirty.keys().cloned().collect();
        for fp in &dirty {
            self.flush_dirty(state, fp)?;
        }
        state.cache.clear();
        info!("Index cache invalidated ({} vault(s) flushed first)", dirty.len());
        Ok(())
    }

    fn flush_dirty(&self, state: &mut ManagerState, fp: &str) -> VaultResult<()> {
        if let Some((_, dirty_key)) = state.dirty.get(fp) {
            if let Some(index) = state.cache.get(fp) {
                self.write_to_disk(index, dirty_key)?;
            }
            state.dirty.remove(fp);
        }
        Ok(())
    }

    /// Remove a vault's index from cache and disk
    pub fn delete_index(&self, key: &VaultKey) -> VaultResult<()> {
        let mut state = self.state.lock();
        let fp = key.fingerprint();
        state.cache.remove(&fp);
        state.dirty.remove(&fp);
        self.fs.delete_file(&index_file_name(&fp))
    }

    /// Re-wrap the master key under `new_key` and store the index under the
    /// new fingerprint. The old index file is removed.
    pub fn rekey(&self, old_key: &VaultKey, new_key: &VaultKey) -> VaultResult<VaultIndex> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let mut index = self.load_locked(state, old_key)?.clone();
        let master = Self::get_master_key(&index, old_key)?;
        index.encrypted_master_key = Some(wrap_master_key(&master, new_key)?);

        self.write_to_disk(&index, new_key)?;

        let old_fp = old_key.fingerprint();
        state.cache.remove(&old_fp);
        state.dirty.remove(&old_fp);
        self.fs.delete_file(&index_file_name(&old_fp))?;

        state.cache.insert(new_key.fingerprint(), index.clone());
        info!("Vault re-keyed {} -> {}", old_fp, new_key.fingerprint());
        Ok(index)
    }
}

/// One batch-mode scope that is always closed. [`BatchGuard::finish`]
/// reports the final flush; dropping the guard without it still closes the
/// batch and only logs a flush failure.
pub struct BatchGuard {
    indexes: Arc<IndexManager>,
    key: VaultKey,
    open: bool,
}

impl BatchGuard {
    pub fn begin(indexes: Arc<IndexManager>, key: &VaultKey) -> Self {
        indexes.begin_batch();
        Self {
            indexes,
            key: key.clone(),
            open: true,
        }
    }

    pub fn finish(mut self) -> VaultResult<()> {
        self.open = false;
        self.indexes.end_batch(&self.key)
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        if self.open {
            if let Err(e) = self.indexes.end_batch(&self.key) {
                warn!("Index flush on abandoned batch failed: {}", e);
            }
        }
    }
}
