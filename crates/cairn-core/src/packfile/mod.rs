use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use cairn_types::error::{CairnError, Result};
use cairn_types::mac::Mac;
use cairn_types::resource::ResourceType;

/// Trailing field recording the byte length of the encoded index.
pub const INDEX_LEN_SIZE: usize = 4;

/// One entry in a packfile's trailing index. Offsets are relative to the
/// start of the packfile payload; lengths cover the encoded blob bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub resource: ResourceType,
    pub mac: Mac,
    pub offset: u64,
    pub length: u32,
}

/// Accumulates encoded blobs in memory until the caller decides to flush.
///
/// Blobs are stored contiguously in insertion order; the index maps each
/// `(resource, mac)` to its `(offset, length)`. Adding a blob that is
/// already present is a silent no-op: a blob appears at most once per
/// packfile.
pub struct PackfileBuilder {
    buffer: Vec<u8>,
    entries: Vec<IndexEntry>,
    seen: HashSet<(ResourceType, Mac)>,
}

impl PackfileBuilder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            entries: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Append an encoded blob. Returns `false` (and does nothing) if this
    /// `(resource, mac)` pair is already buffered.
    pub fn add_blob(&mut self, resource: ResourceType, mac: Mac, encoded: &[u8]) -> bool {
        if !self.seen.insert((resource, mac)) {
            return false;
        }
        self.entries.push(IndexEntry {
            resource,
            mac,
            offset: self.buffer.len() as u64,
            length: encoded.len() as u32,
        });
        self.buffer.extend_from_slice(encoded);
        true
    }

    pub fn contains(&self, resource: ResourceType, mac: Mac) -> bool {
        self.seen.contains(&(resource, mac))
    }

    /// Buffered payload bytes so far (blob bodies only).
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    pub fn blob_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Assemble the packfile payload: `blobs ‖ encoded_index ‖ len[4 LE]`.
    ///
    /// `encode_index` runs the serialized index through the codec pipeline
    /// so locator metadata gets the same protection as blob data. The
    /// builder is reset and its index entries are returned for the caller's
    /// state delta.
    pub fn finish(
        &mut self,
        encode_index: impl FnOnce(&[u8]) -> Result<Vec<u8>>,
    ) -> Result<(Vec<u8>, Vec<IndexEntry>)> {
        if self.entries.is_empty() {
            return Err(CairnError::Other("cannot flush an empty packfile".into()));
        }

        let index_bytes = rmp_serde::to_vec(&self.entries)?;
        let encoded_index = encode_index(&index_bytes)?;

        let mut payload = std::mem::take(&mut self.buffer);
        payload.reserve(encoded_index.len() + INDEX_LEN_SIZE);
        payload.extend_from_slice(&encoded_index);
        payload.extend_from_slice(&(encoded_index.len() as u32).to_le_bytes());

        let entries = std::mem::take(&mut self.entries);
        self.seen.clear();

        Ok((payload, entries))
    }
}

impl Default for PackfileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the trailing index out of a packfile payload.
///
/// `decode_index` reverses the codec pipeline applied by
/// `PackfileBuilder::finish`.
pub fn parse_index(
    payload: &[u8],
    decode_index: impl FnOnce(&[u8]) -> Result<Vec<u8>>,
) -> Result<Vec<IndexEntry>> {
    if payload.len() < INDEX_LEN_SIZE {
        return Err(CairnError::Other("packfile payload too short".into()));
    }
    let len_start = payload.len() - INDEX_LEN_SIZE;
    let index_len = u32::from_le_bytes(
        payload[len_start..].try_into().expect("4 bytes"),
    ) as usize;
    if index_len > len_start {
        return Err(CairnError::Other("packfile index length out of range".into()));
    }

    let index_start = len_start - index_len;
    let index_bytes = decode_index(&payload[index_start..len_start])?;
    let entries: Vec<IndexEntry> = rmp_serde::from_slice(&index_bytes)?;
    Ok(entries)
}
