//! ALFA Vault Store - Secure Filesystem Operations
//!
//! Whole-file writes with write-temp-then-rename semantics and random
//! overwrite before removal.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use rand::RngCore;

use crate::error::{VaultError, VaultResult};

/// Largest buffer used when overwriting a file
const WIPE_CHUNK: usize = 1024 * 1024;

/// Secure Filesystem Handler
#[derive(Debug, Clone)]
pub struct SecureFs {
    /// Root directory
    root: PathBuf,
}

impl SecureFs {
    /// Create new SecureFs with root directory
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get full path for a relative file
    pub fn full_path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Write file atomically: a crash leaves either the old or the new content
    pub fn write_file(&self, relative_path: &str, data: &[u8]) -> VaultResult<()> {
        let path = self.full_path(relative_path);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let temp_path = path.with_extension("tmp");

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)?;

        file.write_all(data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &path)?;

        Ok(())
    }

    /// Read whole file
    pub fn read_file(&self, relative_path: &str) -> VaultResult<Vec<u8>> {
        let path = self.full_path(relative_path);

        if !path.exists() {
            return Err(VaultError::FileNotFound(path.display().to_string()));
        }

        let mut file = File::open(&path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        Ok(data)
    }

    /// Overwrite with random bytes, then remove. Missing files are not an error.
    pub fn delete_file(&self, relative_path: &str) -> VaultResult<()> {
        wipe_and_remove(&self.full_path(relative_path))
    }

    /// Rename within the root
    pub fn rename(&self, from: &str, to: &str) -> VaultResult<()> {
        fs::rename(self.full_path(from), self.full_path(to))?;
        Ok(())
    }

    /// Check if file exists
    pub fn exists(&self, relative_path: &str) -> bool {
        self.full_path(relative_path).exists()
    }

    /// List entry names in a directory (empty if it does not exist)
    pub fn list_dir(&self, relative_path: &str) -> VaultResult<Vec<String>> {
        let path = self.full_path(relative_path);
        let mut names = Vec::new();

        if path.exists() {
            for entry in fs::read_dir(&path)? {
                let entry = entry?;
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }

        names.sort();
        Ok(names)
    }

    /// Remove a directory tree, wiping every file in it first
    pub fn delete_dir(&self, relative_path: &str) -> VaultResult<()> {
        let path = self.full_path(relative_path);
        if !path.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&path)? {
            let entry = entry?;
            let p = entry.path();
            if p.is_dir() {
                let rel = format!("{}/{}", relative_path, entry.file_name().to_string_lossy());
                self.delete_dir(&rel)?;
            } else {
                wipe_and_remove(&p)?;
            }
        }
        fs::remove_dir(&path)?;
        Ok(())
    }
}

/// Overwrite a file with random bytes and remove it
pub fn wipe_and_remove(path: &Path) -> VaultResult<()> {
    if !path.exists() {
        return Ok(());
    }

    let size = fs::metadata(path)?.len();
    if size > 0 {
        let mut file = OpenOptions::new().write(true).open(path)?;
        let mut buf = vec![0u8; (size as usize).min(WIPE_CHUNK)];
        let mut remaining = size;
        let mut rng = rand::thread_rng();
        while remaining > 0 {
            let n = (remaining as usize).min(buf.len());
            rng.fill_bytes(&mut buf[..n]);
            file.write_all(&buf[..n])?;
            remaining -= n as u64;
        }
        file.sync_all()?;
    }

    fs::remove_file(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_secure_fs() {
        let dir = tempdir().unwrap();
        let fs = SecureFs::new(dir.path());

        fs.write_file("test/data.enc", b"encrypted data").unwrap();
        assert!(fs.exists("test/data.enc"));
        assert!(!fs.exists("test/data.tmp"));

        let data = fs.read_file("test/data.enc").unwrap();
        assert_eq!(data, b"encrypted data");

        fs.write_file("test/data.enc", b"replaced").unwrap();
        assert_eq!(fs.read_file("test/data.enc").unwrap(), b"replaced");

        fs.delete_file("test/data.enc").unwrap();
        assert!(!fs.exists("test/data.enc"));
        assert!(matches!(fs.read_file("test/data.enc"), Err(VaultError::FileNotFound(_))));
    }

    #[test]
    fn test_delete_dir() {
        let dir = tempdir().unwrap();
        let fs = SecureFs::new(dir.path());

        fs.write_file("a/b/one", b"1").unwrap();
        fs.write_file("a/two", b"2").unwrap();
        assert_eq!(fs.list_dir("a").unwrap(), vec!["b".to_string(), "two".to_string()]);

        fs.delete_dir("a").unwrap();
        assert!(!fs.exists("a"));
    }
}
