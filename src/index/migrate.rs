//! Forward schema migration.
//!
//! Each step lifts a document by exactly one version and is a no-op when the
//! field it introduces is already present, so re-running a step is safe.

use log::info;

use super::model::{VaultIndex, CURRENT_VERSION};
use crate::crypto::{wrap_master_key, MasterKey, VaultKey};
use crate::error::{VaultError, VaultResult};

/// v1 → v2: introduce a wrapped master key
pub fn v1_to_v2(mut index: VaultIndex, vault_key: &VaultKey) -> VaultResult<VaultIndex> {
    if index.encrypted_master_key.is_none() {
        let master = MasterKey::generate();
        index.encrypted_master_key = Some(wrap_master_key(&master, vault_key)?);
    }
    index.version = index.version.max(2);
    Ok(index)
}

/// v2 → v3: introduce secondary container descriptors
pub fn v2_to_v3(mut index: VaultIndex) -> VaultIndex {
    if index.blobs.is_none() {
        index.blobs = Some(Vec::new());
    }
    index.version = index.version.max(3);
    index
}

/// Apply steps until the document reaches [`CURRENT_VERSION`].
///
/// Returns the document and whether anything changed.
pub fn migrate(mut index: VaultIndex, vault_key: &VaultKey) -> VaultResult<(VaultIndex, bool)> {
    let from = index.version;
    if from == 0 {
        return Err(VaultError::CorruptedData("index version 0".into()));
    }

    while index.version < CURRENT_VERSION {
        index = match index.version {
            1 => v1_to_v2(index, vault_key)?,
            2 => v2_to_v3(index),
            v => {
                return Err(VaultError::CorruptedData(format!(
                    "no migration from index version {v}"
                )))
            }
        };
    }

    let migrated = index.version != from;
    if migrated {
        info!("Index migrated from v{} to v{}", from, index.version);
    }
    Ok((index, migrated))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::unwrap_master_key;

    fn v1_index() -> VaultIndex {
        VaultIndex {
            version: 1,
            files: Vec::new(),
            next_offset: 12,
            total_size: 64,
            encrypted_master_key: None,
            blobs: None,
            active_shares: None,
        }
    }

    #[test]
    fn test_v1_to_v2_wraps_new_master_key() {
        let key = VaultKey::generate();
        let index = v1_to_v2(v1_index(), &key).unwrap();

        assert_eq!(index.version, 2);
        let wrapped = index.encrypted_master_key.clone().unwrap();
        assert!(unwrap_master_key(&wrapped, &key).is_ok());

        // Idempotent: the existing key survives a second run
        let again = v1_to_v2(index, &key).unwrap();
        assert_eq!(again.encrypted_master_key.unwrap(), wrapped);
    }

    #[test]
    fn test_v2_to_v3_adds_blobs() {
        let key = VaultKey::generate();
        let v2 = v1_to_v2(v1_index(), &key).unwrap();
        let v3 = v2_to_v3(v2);

        assert_eq!(v3.version, 3);
        assert_eq!(v3.blobs, Some(Vec::new()));
        assert_eq!(v3.next_offset, 12);
    }

    #[test]
    fn test_full_chain() {
        let key = VaultKey::generate();
        let (index, migrated) = migrate(v1_index(), &key).unwrap();
        assert!(migrated);
        assert_eq!(index.version, CURRENT_VERSION);

        let (same, migrated) = migrate(index.clone(), &key).unwrap();
        assert!(!migrated);
        assert_eq!(same, index);
    }
}
