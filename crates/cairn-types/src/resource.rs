use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CairnError, Result};

/// Resource type tags carried in the framing header and blob locators.
///
/// The `u32` values are part of the on-disk format and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u32)]
pub enum ResourceType {
    Config = 1,
    State = 2,
    Packfile = 3,
    Snapshot = 4,
    Chunk = 5,
    Object = 6,
    Vfs = 7,
    ErrorEntry = 8,
    Signature = 9,
}

impl ResourceType {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(v: u32) -> Result<Self> {
        match v {
            1 => Ok(Self::Config),
            2 => Ok(Self::State),
            3 => Ok(Self::Packfile),
            4 => Ok(Self::Snapshot),
            5 => Ok(Self::Chunk),
            6 => Ok(Self::Object),
            7 => Ok(Self::Vfs),
            8 => Ok(Self::ErrorEntry),
            9 => Ok(Self::Signature),
            _ => Err(CairnError::UnknownResourceType(v)),
        }
    }

    /// Single byte tag used as a cache key prefix.
    pub fn as_u8(self) -> u8 {
        self as u32 as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::State => "state",
            Self::Packfile => "packfile",
            Self::Snapshot => "snapshot",
            Self::Chunk => "chunk",
            Self::Object => "object",
            Self::Vfs => "vfs",
            Self::ErrorEntry => "error-entry",
            Self::Signature => "signature",
        }
    }

    /// All resource types that may appear inside a packfile, in tag order.
    pub fn all() -> &'static [ResourceType] {
        &[
            Self::Config,
            Self::State,
            Self::Packfile,
            Self::Snapshot,
            Self::Chunk,
            Self::Object,
            Self::Vfs,
            Self::ErrorEntry,
            Self::Signature,
        ]
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
