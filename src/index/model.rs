//! Index document types.
//!
//! The whole document is serialized to JSON and encrypted as one unit; byte
//! fields are base64 strings inside that JSON.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{VaultError, VaultResult};

/// Schema generation written by this build
pub const CURRENT_VERSION: u32 = 3;

/// Root metadata document of one vault
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultIndex {
    pub version: u32,
    /// Entries are shared so copying the document for a transaction does
    /// not copy thumbnails or previews; edits go through [`Arc::make_mut`].
    #[serde(default)]
    pub files: Vec<Arc<VaultFileEntry>>,
    /// Append cursor into the primary container
    #[serde(default)]
    pub next_offset: u64,
    /// Primary container capacity
    #[serde(default)]
    pub total_size: u64,
    #[serde(default, with = "b64::option")]
    pub encrypted_master_key: Option<Vec<u8>>,
    /// Secondary containers (schema v3)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blobs: Option<Vec<BlobDescriptor>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_shares: Option<Vec<ShareRecord>>,
}

/// One logical stored file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultFileEntry {
    pub file_id: Uuid,
    pub offset: u64,
    pub size: u64,
    #[serde(default, with = "b64::option")]
    pub encrypted_header_preview: Option<Vec<u8>>,
    #[serde(default)]
    pub is_deleted: bool,
    #[serde(default, with = "b64::option")]
    pub thumbnail_data: Option<Vec<u8>>,
    pub mime_type: String,
    pub filename: String,
    /// Owning container; `None` is the primary
    #[serde(default)]
    pub blob_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub original_size: u64,
}

/// Descriptor of a secondary container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobDescriptor {
    pub blob_id: Uuid,
    pub capacity: u64,
    pub next_offset: u64,
    pub created_at: DateTime<Utc>,
}

/// Share record owned by the sharing collaborator; persisted untouched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareRecord {
    pub share_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub file_ids: Vec<Uuid>,
}

/// Public view of a stored file, carried by import events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VaultFileItem {
    pub file_id: Uuid,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub original_size: u64,
    pub has_thumbnail: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&VaultFileEntry> for VaultFileItem {
    fn from(entry: &VaultFileEntry) -> Self {
        Self {
            file_id: entry.file_id,
            filename: entry.filename.clone(),
            mime_type: entry.mime_type.clone(),
            size: entry.size,
            original_size: entry.original_size,
            has_thumbnail: entry.thumbnail_data.is_some(),
            created_at: entry.created_at,
        }
    }
}

impl VaultIndex {
    /// Fresh current-version document
    pub fn new(encrypted_master_key: Vec<u8>, total_size: u64) -> Self {
        Self {
            version: CURRENT_VERSION,
            files: Vec::new(),
            next_offset: 0,
            total_size,
            encrypted_master_key: Some(encrypted_master_key),
            blobs: Some(Vec::new()),
            active_shares: None,
        }
    }

    /// Non-tombstoned entries
    pub fn live_files(&self) -> impl Iterator<Item = &VaultFileEntry> {
        self.files.iter().map(Arc::as_ref).filter(|f| !f.is_deleted)
    }

    /// Look up a live entry
    pub fn find(&self, file_id: &Uuid) -> VaultResult<&VaultFileEntry> {
        self.files
            .iter()
            .find(|f| f.file_id == *file_id && !f.is_deleted)
            .map(Arc::as_ref)
            .ok_or_else(|| VaultError::FileNotFound(file_id.to_string()))
    }

    /// Look up a live entry for mutation
    pub fn find_mut(&mut self, file_id: &Uuid) -> VaultResult<&mut VaultFileEntry> {
        self.files
            .iter_mut()
            .find(|f| f.file_id == *file_id && !f.is_deleted)
            .map(Arc::make_mut)
            .ok_or_else(|| VaultError::FileNotFound(file_id.to_string()))
    }

    /// True if any entry (live or tombstoned) carries this id
    pub fn contains(&self, file_id: &Uuid) -> bool {
        self.files.iter().any(|f| f.file_id == *file_id)
    }

    /// Capacity of the container an entry lives in
    pub fn capacity_of(&self, blob_id: Option<Uuid>) -> Option<u64> {
        match blob_id {
            None => Some(self.total_size),
            Some(id) => self
                .blobs
                .as_ref()?
                .iter()
                .find(|b| b.blob_id == id)
                .map(|b| b.capacity),
        }
    }

    /// Structural checks applied after every decrypt
    pub fn validate(&self) -> VaultResult<()> {
        if self.version >= 2 && self.encrypted_master_key.is_none() {
            return Err(VaultError::CorruptedData(format!(
                "index v{} without encryptedMasterKey",
                self.version
            )));
        }
        if self.version > CURRENT_VERSION {
            return Err(VaultError::CorruptedData(format!(
                "index version {} is newer than supported {}",
                self.version, CURRENT_VERSION
            )));
        }
        if self.next_offset > self.total_size {
            return Err(VaultError::CorruptedData(
                "primary cursor beyond container capacity".into(),
            ));
        }
        Ok(())
    }
}

/// Base64 (de)serialization for byte fields
pub(crate) mod b64 {
    pub mod option {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
            match value {
                Some(bytes) => s.serialize_some(&STANDARD.encode(bytes)),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
            let text: Option<String> = Option::deserialize(d)?;
            text.map(|t| STANDARD.decode(t).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(deleted: bool) -> VaultFileEntry {
        VaultFileEntry {
            file_id: Uuid::new_v4(),
            offset: 0,
            size: 10,
            encrypted_header_preview: Some(vec![1, 2, 3]),
            is_deleted: deleted,
            thumbnail_data: None,
            mime_type: "image/jpeg".into(),
            filename: "a.jpg".into(),
            blob_id: None,
            created_at: Utc::now(),
            original_size: 5,
        }
    }

    #[test]
    fn test_json_shape() {
        let mut index = VaultIndex::new(vec![9; 8], 100);
        index.files.push(Arc::new(entry(false)));

        let json = serde_json::to_value(&index).unwrap();
        assert!(json.get("nextOffset").is_some());
        assert!(json.get("encryptedMasterKey").unwrap().is_string());
        assert!(json["files"][0].get("encryptedHeaderPreview").is_some());

        let back: VaultIndex = serde_json::from_value(json).unwrap();
        assert_eq!(back, index);
    }

    #[test]
    fn test_find_skips_tombstones() {
        let mut index = VaultIndex::new(vec![0; 8], 0);
        let dead = entry(true);
        let dead_id = dead.file_id;
        index.files.push(Arc::new(dead));

        assert!(matches!(index.find(&dead_id), Err(VaultError::FileNotFound(_))));
        assert!(index.contains(&dead_id));
        assert_eq!(index.live_files().count(), 0);
    }

    #[test]
    fn test_validate_requires_master_key() {
        let mut index = VaultIndex::new(vec![0; 8], 0);
        index.encrypted_master_key = None;
        assert!(matches!(index.validate(), Err(VaultError::CorruptedData(_))));

        index.version = 1;
        assert!(index.validate().is_ok());
    }
}
