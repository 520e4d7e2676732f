//! ALFA Vault Store - Blob Allocator
//!
//! Hands out disjoint regions in a vault's containers, streams encrypted
//! content into them and gathers finished entries into the index.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use log::{debug, info};
use parking_lot::Mutex;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::blob::{EncryptedBlob, Region};
use crate::config::StoreConfig;
use crate::crypto::stream::{chunk_size_for, encrypt_stream, encrypted_len};
use crate::crypto::{seal, MasterKey, VaultKey};
use crate::error::{VaultError, VaultResult};
use crate::index::{BlobDescriptor, IndexManager, VaultFileEntry, VaultFileItem, VaultIndex};

/// Container file name. `None` is the primary container.
pub fn blob_file_name(fingerprint: &str, blob_id: Option<Uuid>) -> String {
    match blob_id {
        None => format!("blob_{}.bin", fingerprint),
        Some(id) => format!("blob_{}_{}.bin", fingerprint, id),
    }
}

/// A file waiting to be imported
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub filename: String,
    pub mime_type: String,
    pub file_id: Uuid,
}

impl SourceFile {
    /// Describe a file on disk, sniffing its MIME type from the first bytes
    pub fn from_path<P: AsRef<Path>>(path: P) -> VaultResult<Self> {
        let path = path.as_ref().to_path_buf();
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".into());

        let mut head = [0u8; 16];
        let mut file = File::open(&path)
            .map_err(|_| VaultError::FileNotFound(path.display().to_string()))?;
        let n = file.read(&mut head)?;

        Ok(Self {
            mime_type: detect_mime(&head[..n], &filename),
            path,
            filename,
            file_id: Uuid::new_v4(),
        })
    }

    pub fn is_video(&self) -> bool {
        self.mime_type.starts_with("video/")
    }
}

/// Detect MIME type from magic bytes, falling back to the extension
pub fn detect_mime(head: &[u8], filename: &str) -> String {
    if head.len() >= 12 && &head[4..8] == b"ftyp" {
        return match &head[8..12] {
            b"heic" | b"heix" => "image/heic",
            b"mif1" => "image/heif",
            b"qt  " => "video/quicktime",
            _ => "video/mp4",
        }
        .into();
    }

    if head.len() >= 8 {
        match head {
            [0xFF, 0xD8, 0xFF, ..] => return "image/jpeg".into(),
            [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, ..] => return "image/png".into(),
            [0x47, 0x49, 0x46, 0x38, ..] => return "image/gif".into(),
            [0x52, 0x49, 0x46, 0x46, ..] if head.len() >= 12 && &head[8..12] == b"WEBP" => {
                return "image/webp".into()
            }
            [0x1A, 0x45, 0xDF, 0xA3, ..] => return "video/x-matroska".into(),
            [0x25, 0x50, 0x44, 0x46, ..] => return "application/pdf".into(),
            _ => {}
        }
    }

    let ext = filename
        .rsplit_once('.')
        .map(|(_, e)| e.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "txt" => "text/plain",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
    .into()
}

/// Reserved region with an open write handle. Used once, then dropped.
#[derive(Debug, Clone)]
pub struct BlobAllocation {
    pub blob_id: Option<Uuid>,
    pub offset: u64,
    pub size: u64,
    blob: Arc<EncryptedBlob>,
}

impl BlobAllocation {
    pub fn region(&self) -> Region {
        Region::new(self.offset, self.size)
    }

    pub fn blob(&self) -> &EncryptedBlob {
        &self.blob
    }
}

/// A fully encrypted file awaiting commit
#[derive(Debug, Clone)]
pub struct PreparedEntry {
    pub entry: VaultFileEntry,
    /// Decrypted thumbnail, handed to the thumbnail cache after commit
    pub thumbnail_plain: Option<Vec<u8>>,
}

impl PreparedEntry {
    pub fn item(&self) -> VaultFileItem {
        VaultFileItem::from(&self.entry)
    }
}

/// Blob Allocator
pub struct BlobAllocator {
    root: PathBuf,
    indexes: Arc<IndexManager>,
    chunk_size: usize,
    streaming_threshold: u64,
    max_container_size: u64,
    preview_len: usize,
    open: Mutex<HashMap<String, Arc<EncryptedBlob>>>,
}

impl BlobAllocator {
    pub fn new(root: &Path, indexes: Arc<IndexManager>, config: &StoreConfig) -> Self {
        Self {
            root: root.to_path_buf(),
            indexes,
            chunk_size: config.chunk_size,
            streaming_threshold: config.streaming_threshold,
            max_container_size: config.max_container_size,
            preview_len: config.preview_len,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Encrypted size of a source of `plain_len` bytes
    pub fn estimate_size(&self, plain_len: u64) -> u64 {
        let chunk = chunk_size_for(plain_len, self.chunk_size, self.streaming_threshold);
        encrypted_len(plain_len, chunk)
    }

    /// Shared handle to a container, opened on first use
    pub fn open_blob(&self, fingerprint: &str, blob_id: Option<Uuid>) -> VaultResult<Arc<EncryptedBlob>> {
        let name = blob_file_name(fingerprint, blob_id);
        let mut open = self.open.lock();
        if let Some(blob) = open.get(&name) {
            return Ok(Arc::clone(blob));
        }
        let blob = Arc::new(EncryptedBlob::open(self.root.join(&name))?);
        open.insert(name, Arc::clone(&blob));
        Ok(blob)
    }

    /// Paths of every container the index references
    pub fn container_paths(&self, fingerprint: &str, index: &VaultIndex) -> Vec<PathBuf> {
        let mut paths = vec![self.root.join(blob_file_name(fingerprint, None))];
        for desc in index.blobs.iter().flatten() {
            paths.push(self.root.join(blob_file_name(fingerprint, Some(desc.blob_id))));
        }
        paths
    }

    /// Drop cached handles for one vault (before renaming or deleting files)
    pub fn forget(&self, fingerprint: &str) {
        let prefix = format!("blob_{}", fingerprint);
        self.open.lock().retain(|name, _| !name.starts_with(&prefix));
    }

    // ═══════════════════════════════════════════════════════════════════════
    // ALLOCATION
    // ═══════════════════════════════════════════════════════════════════════

    /// Reserve one disjoint region per size, all in the same container, in
    /// one index transaction. The container is grown to cover the new
    /// cursor before any handle is returned.
    pub fn allocate_batch_space(
        &self,
        sizes: &[u64],
        key: &VaultKey,
    ) -> VaultResult<(Vec<BlobAllocation>, MasterKey)> {
        let fp = key.fingerprint();
        let total: u64 = sizes.iter().sum();

        self.indexes.with_transaction(key, |index, master| {
            let (blob_id, start) = self.reserve(index, total);
            let end = start + total;

            let blob = self.open_blob(&fp, blob_id)?;
            blob.ensure_len(end)?;

            let mut cursor = start;
            let allocations: Vec<BlobAllocation> = sizes
                .iter()
                .map(|&size| {
                    let alloc = BlobAllocation {
                        blob_id,
                        offset: cursor,
                        size,
                        blob: Arc::clone(&blob),
                    };
                    cursor += size;
                    alloc
                })
                .collect();

            debug!(
                "Allocated {} region(s), {} bytes at {} in {:?}",
                sizes.len(),
                total,
                start,
                blob_id
            );
            Ok((allocations, master.clone()))
        })
    }

    /// Pick a container with room for `total` bytes and advance its cursor.
    /// Returns the container id and the start of the reserved range.
    fn reserve(&self, index: &mut VaultIndex, total: u64) -> (Option<Uuid>, u64) {
        if index.next_offset == 0 || index.next_offset + total <= self.max_container_size {
            let start = index.next_offset;
            index.next_offset += total;
            index.total_size = index.total_size.max(index.next_offset);
            return (None, start);
        }

        let limit = self.max_container_size;
        let blobs = index.blobs.get_or_insert_with(Vec::new);
        if let Some(desc) = blobs
            .iter_mut()
            .find(|b| b.next_offset == 0 || b.next_offset + total <= limit)
        {
            let start = desc.next_offset;
            desc.next_offset += total;
            desc.capacity = desc.capacity.max(desc.next_offset);
            return (Some(desc.blob_id), start);
        }

        let desc = BlobDescriptor {
            blob_id: Uuid::new_v4(),
            capacity: total,
            next_offset: total,
            created_at: Utc::now(),
        };
        info!("Opening secondary container {}", desc.blob_id);
        let id = desc.blob_id;
        blobs.push(desc);
        (Some(id), 0)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // PREPARE / COMMIT
    // ═══════════════════════════════════════════════════════════════════════

    /// Stream-encrypt `source` into `allocation` and build its index entry.
    ///
    /// Fails with `WriteError` if the encrypted payload would not fit the
    /// allocation; nothing is retried at a different size.
    pub fn prepare_file_entry(
        &self,
        source: &SourceFile,
        thumbnail: Option<Vec<u8>>,
        master: &MasterKey,
        allocation: &BlobAllocation,
    ) -> VaultResult<PreparedEntry> {
        let mut file = File::open(&source.path)
            .map_err(|_| VaultError::FileNotFound(source.path.display().to_string()))?;
        let plain_len = file.metadata()?.len();

        let needed = self.estimate_size(plain_len);
        if needed > allocation.size {
            return Err(VaultError::WriteError(format!(
                "{}: {} encrypted bytes exceed allocation of {}",
                source.filename, needed, allocation.size
            )));
        }

        let mut preview = Zeroizing::new(vec![0u8; self.preview_len.min(plain_len as usize)]);
        file.read_exact(preview.as_mut_slice())?;
        file.seek(SeekFrom::Start(0))?;

        let chunk = chunk_size_for(plain_len, self.chunk_size, self.streaming_threshold);
        let mut written = 0u64;
        let total = encrypt_stream(&mut file, master, &source.file_id, chunk, |piece| {
            if written + piece.len() as u64 > allocation.size {
                return Err(VaultError::WriteError(format!(
                    "{}: source grew past its allocation",
                    source.filename
                )));
            }
            allocation.blob.write(piece, allocation.offset + written)?;
            written += piece.len() as u64;
            Ok(())
        })?;
        allocation.blob.sync()?;

        let thumbnail_data = thumbnail.as_deref().map(|t| seal(master, t)).transpose()?;

        Ok(PreparedEntry {
            entry: VaultFileEntry {
                file_id: source.file_id,
                offset: allocation.offset,
                size: total,
                encrypted_header_preview: Some(seal(master, &preview)?),
                is_deleted: false,
                thumbnail_data,
                mime_type: source.mime_type.clone(),
                filename: source.filename.clone(),
                blob_id: allocation.blob_id,
                created_at: Utc::now(),
                original_size: plain_len,
            },
            thumbnail_plain: thumbnail,
        })
    }

    /// Append prepared entries to the index in one transaction.
    ///
    /// Entries whose id is already present are skipped. Returns the items
    /// that were actually appended.
    pub fn commit_entries(
        &self,
        entries: &[PreparedEntry],
        key: &VaultKey,
    ) -> VaultResult<Vec<VaultFileItem>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        self.indexes.with_transaction(key, |index, _| {
            let mut committed = Vec::with_capacity(entries.len());
            for prepared in entries {
                let entry = &prepared.entry;
                if index.contains(&entry.file_id) {
                    debug!("Skipping duplicate entry {}", entry.file_id);
                    continue;
                }

                let capacity = index.capacity_of(entry.blob_id).ok_or_else(|| {
                    VaultError::CorruptedData(format!("unknown container {:?}", entry.blob_id))
                })?;
                if entry.offset + entry.size > capacity {
                    return Err(VaultError::WriteError(format!(
                        "entry {} ends at {} past container capacity {}",
                        entry.file_id,
                        entry.offset + entry.size,
                        capacity
                    )));
                }

                index.files.push(Arc::new(entry.clone()));
                committed.push(VaultFileItem::from(entry));
            }
            Ok(committed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::open;
    use crate::crypto::stream::decrypt_content;
    use tempfile::{tempdir, TempDir};

    fn setup(config: StoreConfig) -> (TempDir, Arc<IndexManager>, BlobAllocator) {
        let dir = tempdir().unwrap();
        let indexes = Arc::new(IndexManager::new(
            dir.path(),
            config.flush_interval,
            config.initial_container_size,
        ));
        let allocator = BlobAllocator::new(dir.path(), Arc::clone(&indexes), &config);
        (dir, indexes, allocator)
    }

    fn source(dir: &Path, name: &str, data: &[u8]) -> SourceFile {
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        SourceFile::from_path(path).unwrap()
    }

    #[test]
    fn test_allocations_are_disjoint() {
        let (_dir, indexes, allocator) = setup(StoreConfig::default());
        let key = VaultKey::generate();
        let before = indexes.load_index(&key).unwrap().next_offset;

        let (allocs, _) = allocator.allocate_batch_space(&[100, 50, 200], &key).unwrap();
        assert_eq!(allocs.len(), 3);
        for (i, a) in allocs.iter().enumerate() {
            for b in &allocs[i + 1..] {
                assert!(a.region().end() <= b.offset || b.region().end() <= a.offset);
            }
        }

        let index = indexes.load_index(&key).unwrap();
        assert_eq!(index.next_offset, before + 350);
        assert!(allocs[0].blob().file_size().unwrap() >= index.next_offset);
    }

    #[test]
    fn test_prepare_commit_and_decrypt() {
        let (dir, indexes, allocator) = setup(StoreConfig::default());
        let key = VaultKey::generate();
        let src = source(dir.path(), "note.txt", b"hello vault");

        let size = allocator.estimate_size(11);
        let (allocs, master) = allocator.allocate_batch_space(&[size], &key).unwrap();
        let prepared = allocator
            .prepare_file_entry(&src, Some(b"thumb".to_vec()), &master, &allocs[0])
            .unwrap();
        assert_eq!(prepared.entry.size, size);

        let committed = allocator.commit_entries(&[prepared.clone()], &key).unwrap();
        assert_eq!(committed.len(), 1);
        assert_eq!(committed[0].mime_type, "text/plain");

        let index = indexes.load_index(&key).unwrap();
        let entry = index.find(&src.file_id).unwrap();
        let raw = allocs[0].blob().read(Region::new(entry.offset, entry.size)).unwrap();
        assert_eq!(decrypt_content(&master, &src.file_id, &raw).unwrap(), b"hello vault");
        assert_eq!(open(&master, entry.thumbnail_data.as_ref().unwrap()).unwrap(), b"thumb");

        // Second commit of the same entry is a no-op
        assert!(allocator.commit_entries(&[prepared], &key).unwrap().is_empty());
        assert_eq!(indexes.load_index(&key).unwrap().files.len(), 1);
    }

    #[test]
    fn test_streamed_large_source() {
        let config = StoreConfig {
            chunk_size: 64,
            streaming_threshold: 128,
            ..StoreConfig::default()
        };
        let (dir, _indexes, allocator) = setup(config);
        let key = VaultKey::generate();
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let src = source(dir.path(), "big.bin", &data);

        let size = allocator.estimate_size(data.len() as u64);
        let (allocs, master) = allocator.allocate_batch_space(&[size], &key).unwrap();
        let prepared = allocator.prepare_file_entry(&src, None, &master, &allocs[0]).unwrap();

        let raw = allocs[0].blob().read(allocs[0].region()).unwrap();
        assert_eq!(prepared.entry.size, size);
        assert_eq!(decrypt_content(&master, &src.file_id, &raw).unwrap(), data);
    }

    #[test]
    fn test_undersized_allocation_is_write_error() {
        let (dir, _indexes, allocator) = setup(StoreConfig::default());
        let key = VaultKey::generate();
        let src = source(dir.path(), "a.bin", &[1u8; 100]);

        let (allocs, master) = allocator.allocate_batch_space(&[50], &key).unwrap();
        assert!(matches!(
            allocator.prepare_file_entry(&src, None, &master, &allocs[0]),
            Err(VaultError::WriteError(_))
        ));
    }

    #[test]
    fn test_full_primary_spills_to_secondary() {
        let config = StoreConfig {
            max_container_size: 300,
            ..StoreConfig::default()
        };
        let (_dir, indexes, allocator) = setup(config);
        let key = VaultKey::generate();

        let (first, _) = allocator.allocate_batch_space(&[200], &key).unwrap();
        let (second, _) = allocator.allocate_batch_space(&[200], &key).unwrap();
        let (third, _) = allocator.allocate_batch_space(&[50], &key).unwrap();

        assert_eq!(first[0].blob_id, None);
        let secondary = second[0].blob_id.expect("secondary container");
        assert_eq!(second[0].offset, 0);
        assert_eq!(third[0].blob_id, None);
        assert_eq!(third[0].offset, 200);

        let index = indexes.load_index(&key).unwrap();
        let blobs = index.blobs.unwrap();
        assert_eq!(blobs.len(), 1);
        assert_eq!(blobs[0].blob_id, secondary);
        assert_eq!(blobs[0].next_offset, 200);
    }

    #[test]
    fn test_detect_mime() {
        assert_eq!(detect_mime(&[0xFF, 0xD8, 0xFF, 0xE0, 0, 0, 0, 0], "x"), "image/jpeg");
        assert_eq!(detect_mime(b"\0\0\0\x18ftypisom", "clip"), "video/mp4");
        assert_eq!(detect_mime(b"", "movie.MOV"), "video/quicktime");
        assert_eq!(detect_mime(b"", "unknown"), "application/octet-stream");
    }
}
