use thiserror::Error;

use crate::mac::Mac;
use crate::resource::ResourceType;

pub type Result<T> = std::result::Result<T, CairnError>;

#[derive(Debug, Error)]
pub enum CairnError {
    #[error("blob not found: {0} {1}")]
    BlobNotFound(ResourceType, Mac),

    #[error("packfile not found: {0}")]
    PackfileNotFound(Mac),

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(Mac),

    #[error("state not found: {0}")]
    StateNotFound(Mac),

    #[error("corrupt frame: {0}")]
    CorruptFrame(String),

    #[error("corrupt blob: {0}")]
    CorruptBlob(Mac),

    #[error("corrupt packfile: {0}")]
    CorruptPackfile(Mac),

    #[error("corrupt state: {0}")]
    CorruptState(Mac),

    #[error("authentication failed: wrong passphrase or corrupted data")]
    AuthFailed,

    #[error("repository not found at '{0}'")]
    RepositoryNotFound(String),

    #[error("repository already exists at '{0}'")]
    RepositoryAlreadyExists(String),

    #[error("unknown resource type tag: {0}")]
    UnknownResourceType(u32),

    #[error("unsupported format version: {0}")]
    UnsupportedVersion(u32),

    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] rmp_serde::encode::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[from] rmp_serde::decode::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("cache error: {0}")]
    Cache(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("{0}")]
    Other(String),
}
