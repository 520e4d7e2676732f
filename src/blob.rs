//! ALFA Vault Store - Encrypted Blob Container
//!
//! Byte-range I/O over one append-only ciphertext container file.
//! The container never interprets its content; regions are handed out by
//! the allocator and framed by `crypto::stream`.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use rand::RngCore;

use crate::error::{VaultError, VaultResult};

/// Default sample size for [`EncryptedBlob::passes_randomness_check`]
pub const DEFAULT_RANDOMNESS_SAMPLE: usize = 10_000;

/// Relative deviation from the uniform bucket count tolerated per byte value
const RANDOMNESS_TOLERANCE: f64 = 0.5;

/// Fraction of byte values allowed outside the tolerance
const RANDOMNESS_OUTLIER_SHARE: f64 = 0.05;

/// A byte range inside a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub offset: u64,
    pub length: u64,
}

impl Region {
    pub fn new(offset: u64, length: u64) -> Self {
        Self { offset, length }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// File-backed ciphertext container
#[derive(Debug)]
pub struct EncryptedBlob {
    path: PathBuf,
    file: Mutex<File>,
}

impl EncryptedBlob {
    /// Open a container, creating an empty one if missing
    pub fn open<P: AsRef<Path>>(path: P) -> VaultResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Create a container pre-sized to `capacity` bytes
    pub fn create<P: AsRef<Path>>(path: P, capacity: u64) -> VaultResult<Self> {
        let blob = Self::open(path)?;
        blob.ensure_len(capacity)?;
        Ok(blob)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current length of the backing file
    pub fn file_size(&self) -> VaultResult<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    /// Grow the backing file to at least `len` bytes. Never shrinks.
    pub fn ensure_len(&self, len: u64) -> VaultResult<()> {
        let file = self.file.lock();
        if file.metadata()?.len() < len {
            file.set_len(len)?;
        }
        Ok(())
    }

    /// Read exactly `region.length` bytes. Short and zero-length reads fail.
    pub fn read(&self, region: Region) -> VaultResult<Vec<u8>> {
        let short = |got: u64| VaultError::ReadError {
            offset: region.offset,
            length: region.length,
            got,
        };

        if region.length == 0 {
            return Err(short(0));
        }

        let mut file = self.file.lock();
        let available = file.metadata()?.len().saturating_sub(region.offset);
        if available < region.length {
            return Err(short(available));
        }

        let mut buf = vec![0u8; region.length as usize];
        file.seek(SeekFrom::Start(region.offset))?;
        let mut got = 0usize;
        while got < buf.len() {
            match file.read(&mut buf[got..]) {
                Ok(0) => return Err(short(got as u64)),
                Ok(n) => got += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(buf)
    }

    /// Write `data` at `offset`. The caller owns the region via an allocation.
    pub fn write(&self, data: &[u8], offset: u64) -> VaultResult<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)
            .map_err(|e| VaultError::WriteError(format!("{} @ {}: {}", self.path.display(), offset, e)))?;
        Ok(())
    }

    /// Fill a region with fresh random bytes
    pub fn overwrite_with_random(&self, region: Region) -> VaultResult<()> {
        let mut rng = rand::thread_rng();
        let mut buf = vec![0u8; (region.length as usize).min(1024 * 1024)];
        let mut pos = region.offset;
        let end = region.end();

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(pos))?;
        while pos < end {
            let n = ((end - pos) as usize).min(buf.len());
            rng.fill_bytes(&mut buf[..n]);
            file.write_all(&buf[..n])?;
            pos += n as u64;
        }
        file.sync_data()?;
        Ok(())
    }

    /// Flush written regions to stable storage
    pub fn sync(&self) -> VaultResult<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }

    /// Coarse regression guard: ciphertext should look uniformly distributed.
    ///
    /// Reads up to `sample_size` bytes from the start of the container and
    /// fails when too many byte values stray more than 50% from the uniform
    /// expectation. Not a cryptographic test.
    pub fn passes_randomness_check(&self, sample_size: usize) -> VaultResult<bool> {
        let len = self.file_size()?.min(sample_size as u64);
        if len == 0 {
            return Ok(false);
        }
        let sample = self.read(Region::new(0, len))?;
        Ok(looks_uniform(&sample))
    }
}

/// Byte-histogram check behind [`EncryptedBlob::passes_randomness_check`]
pub fn looks_uniform(sample: &[u8]) -> bool {
    if sample.is_empty() {
        return false;
    }

    let mut counts = [0u64; 256];
    for &b in sample {
        counts[b as usize] += 1;
    }

    let expected = sample.len() as f64 / 256.0;
    let outliers = counts
        .iter()
        .filter(|&&c| ((c as f64 - expected).abs() / expected) > RANDOMNESS_TOLERANCE)
        .count();

    (outliers as f64) <= 256.0 * RANDOMNESS_OUTLIER_SHARE
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_scattered_writes_read_back() {
        let dir = tempdir().unwrap();
        let blob = EncryptedBlob::create(dir.path().join("c.bin"), 2048).unwrap();

        let a = vec![0xAAu8; 300];
        let b = vec![0xBBu8; 400];
        let c = vec![0xCCu8; 500];
        blob.write(&a, 0).unwrap();
        blob.write(&b, 500).unwrap();
        blob.write(&c, 1000).unwrap();

        assert_eq!(blob.read(Region::new(0, 300)).unwrap(), a);
        assert_eq!(blob.read(Region::new(500, 400)).unwrap(), b);
        assert_eq!(blob.read(Region::new(1000, 500)).unwrap(), c);
        assert_eq!(blob.file_size().unwrap(), 2048);
    }

    #[test]
    fn test_zero_length_read_fails() {
        let dir = tempdir().unwrap();
        let blob = EncryptedBlob::create(dir.path().join("c.bin"), 64).unwrap();

        assert!(matches!(
            blob.read(Region::new(10, 0)),
            Err(VaultError::ReadError { length: 0, .. })
        ));
    }

    #[test]
    fn test_short_read_fails() {
        let dir = tempdir().unwrap();
        let blob = EncryptedBlob::create(dir.path().join("c.bin"), 64).unwrap();

        match blob.read(Region::new(60, 10)) {
            Err(VaultError::ReadError { got, .. }) => assert_eq!(got, 4),
            other => panic!("expected ReadError, got {:?}", other),
        }
    }

    #[test]
    fn test_overwrite_with_random() {
        let dir = tempdir().unwrap();
        let blob = EncryptedBlob::create(dir.path().join("c.bin"), 256).unwrap();
        blob.write(&[0u8; 128], 64).unwrap();

        blob.overwrite_with_random(Region::new(64, 128)).unwrap();
        let wiped = blob.read(Region::new(64, 128)).unwrap();
        assert!(wiped.iter().any(|&b| b != 0));
        assert_eq!(blob.read(Region::new(0, 64)).unwrap(), vec![0u8; 64]);
    }

    #[test]
    fn test_randomness_check() {
        let dir = tempdir().unwrap();

        let mut random = vec![0u8; DEFAULT_RANDOMNESS_SAMPLE];
        rand::thread_rng().fill_bytes(&mut random);
        let good = EncryptedBlob::open(dir.path().join("random.bin")).unwrap();
        good.write(&random, 0).unwrap();
        assert!(good.passes_randomness_check(DEFAULT_RANDOMNESS_SAMPLE).unwrap());

        let bad = EncryptedBlob::open(dir.path().join("pattern.bin")).unwrap();
        bad.write(&vec![0x41u8; DEFAULT_RANDOMNESS_SAMPLE], 0).unwrap();
        assert!(!bad.passes_randomness_check(DEFAULT_RANDOMNESS_SAMPLE).unwrap());
    }
}
