use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use cairn_types::error::{CairnError, Result};

use crate::crypto::KdfParams;

/// On-disk format version carried in every frame header.
pub const FORMAT_VERSION: u32 = 1;

/// Repository configuration, immutable after creation.
///
/// Serialized as msgpack, framed as a `Config` resource, and written at the
/// store's well-known config location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub version: u32,
    pub repository_id: Uuid,
    pub created: DateTime<Utc>,

    pub packfile: PackfileConfig,
    pub chunking: ChunkingConfig,
    pub hashing: HashingConfig,

    pub compression: Option<CompressionConfig>,
    pub encryption: Option<EncryptionConfig>,
}

impl RepositoryConfig {
    pub fn new() -> Self {
        Self {
            version: FORMAT_VERSION,
            repository_id: Uuid::new_v4(),
            created: Utc::now(),
            packfile: PackfileConfig::default(),
            chunking: ChunkingConfig::default(),
            hashing: HashingConfig::default(),
            compression: Some(CompressionConfig::default()),
            encryption: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.version != FORMAT_VERSION {
            return Err(CairnError::UnsupportedVersion(self.version));
        }
        self.packfile.validate()?;
        self.chunking.validate()?;
        self.hashing.validate()?;
        Ok(())
    }

    /// Initial state-delta serial for this repository.
    ///
    /// Derived from the repository UUID so that concurrent first backups
    /// against a fresh repository never produce colliding serials.
    pub fn serial_seed(&self) -> u64 {
        let bytes = self.repository_id.as_bytes();
        u64::from_le_bytes(bytes[..8].try_into().expect("uuid has 16 bytes"))
    }
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackfileConfig {
    /// Flush threshold for the in-flight packfile builder, in bytes.
    pub max_size: u32,
}

impl PackfileConfig {
    fn validate(&self) -> Result<()> {
        if self.max_size == 0 {
            return Err(CairnError::Config("packfile max_size must be non-zero".into()));
        }
        if self.max_size > 512 * 1024 * 1024 {
            return Err(CairnError::Config(format!(
                "packfile max_size ({}) exceeds hard limit of 512 MiB",
                self.max_size
            )));
        }
        Ok(())
    }
}

impl Default for PackfileConfig {
    fn default() -> Self {
        Self {
            max_size: 20 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub algorithm: String,
    pub min_size: u32,
    pub normal_size: u32,
    pub max_size: u32,
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.algorithm.to_lowercase() != "fastcdc" {
            return Err(CairnError::Config(format!(
                "unknown chunking algorithm: '{}'",
                self.algorithm
            )));
        }
        if self.min_size == 0 {
            return Err(CairnError::Config("chunking min_size must be non-zero".into()));
        }
        if !(self.min_size <= self.normal_size && self.normal_size <= self.max_size) {
            return Err(CairnError::Config(format!(
                "chunking sizes must satisfy min <= normal <= max (got {} / {} / {})",
                self.min_size, self.normal_size, self.max_size
            )));
        }
        Ok(())
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            algorithm: "fastcdc".into(),
            min_size: 64 * 1024,
            normal_size: 1024 * 1024,
            max_size: 4 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashingConfig {
    pub algorithm: String,
}

impl HashingConfig {
    fn validate(&self) -> Result<()> {
        if self.algorithm.to_uppercase() != "SHA256-HMAC" {
            return Err(CairnError::Config(format!(
                "unknown hashing algorithm: '{}'",
                self.algorithm
            )));
        }
        Ok(())
    }
}

impl Default for HashingConfig {
    fn default() -> Self {
        Self {
            algorithm: "SHA256-HMAC".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CompressionAlgorithm {
    #[default]
    Lz4,
    Gzip,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CompressionConfig {
    pub algorithm: CompressionAlgorithm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EncryptionAlgorithm {
    #[default]
    Aes256GcmSiv,
    Chacha20Poly1305,
}

impl EncryptionAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aes256GcmSiv => "aes256-gcm-siv",
            Self::Chacha20Poly1305 => "chacha20-poly1305",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub algorithm: EncryptionAlgorithm,
    pub kdf: KdfParams,
    /// Known plaintext sealed under the derived key; decryption must succeed
    /// before a passphrase is accepted.
    pub canary: Vec<u8>,
}
