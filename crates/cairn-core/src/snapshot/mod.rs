pub mod backup;
pub mod check;
pub mod importer;
pub mod restore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use cairn_types::error::{CairnError, Result};
use cairn_types::mac::Mac;
use cairn_types::resource::ResourceType;

use crate::repo::Repository;

/// Snapshot document, stored as a `Snapshot` blob whose MAC is the
/// snapshot identifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub created: DateTime<Utc>,
    pub total_size: u64,
    pub files: Vec<FileEntry>,
}

/// One backed-up file: its path relative to the import root and the
/// ordered chunk MACs that reassemble its content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub size: u64,
    pub chunks: Vec<Mac>,
}

impl Snapshot {
    /// Load and parse a snapshot document from the repository.
    pub fn load(repo: &Repository, mac: Mac) -> Result<Self> {
        let bytes = repo.get_blob(ResourceType::Snapshot, mac).map_err(|e| match e {
            CairnError::BlobNotFound(..) => CairnError::SnapshotNotFound(mac),
            other => other,
        })?;
        rmp_serde::from_slice(&bytes).map_err(|_| CairnError::CorruptBlob(mac))
    }
}
