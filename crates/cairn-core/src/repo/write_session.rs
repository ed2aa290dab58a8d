use tracing::debug;

use cairn_types::error::Result;
use cairn_types::mac::Mac;
use cairn_types::resource::ResourceType;

use crate::packfile::PackfileBuilder;
use crate::state::{DeltaWriter, Locator};

use super::Repository;

/// Single-writer session over a repository.
///
/// Owns the one open packfile builder and the in-flight state delta. Blobs
/// accumulate until the configured packfile threshold, flush as an
/// immutable packfile, and their locators land in the delta. `commit`
/// seals the delta and advertises it; dropping the session abandons any
/// unflushed blobs (flushed packfiles stay — they are unreferenced until a
/// delta points at them, so an abort leaks at most garbage for
/// maintenance to sweep).
pub struct WriteSession<'r> {
    repo: &'r mut Repository,
    builder: PackfileBuilder,
    writer: DeltaWriter,
}

impl<'r> WriteSession<'r> {
    pub(crate) fn new(repo: &'r mut Repository) -> Self {
        let writer = repo.state().derive();
        Self {
            repo,
            builder: PackfileBuilder::new(),
            writer,
        }
    }

    /// Store a blob unless the repository already holds it. Returns its
    /// MAC either way; the dedup invariant means a hit costs one hash.
    pub fn put_blob(&mut self, resource: ResourceType, data: &[u8]) -> Result<Mac> {
        let mac = self.repo.compute_mac(data);
        if self.repo.blob_exists(resource, mac) || self.is_pending(resource, mac) {
            return Ok(mac);
        }
        self.append_blob(resource, mac, data)?;
        Ok(mac)
    }

    /// Store a blob even if the authoritative state already has a locator
    /// for it. Used by maintenance to move blobs out of packfiles being
    /// retired; the fresh locator wins the state merge by serial.
    pub fn rewrite_blob(&mut self, resource: ResourceType, data: &[u8]) -> Result<Mac> {
        let mac = self.repo.compute_mac(data);
        if self.is_pending(resource, mac) {
            return Ok(mac);
        }
        self.append_blob(resource, mac, data)?;
        Ok(mac)
    }

    /// Whether this session already buffered or flushed the blob.
    fn is_pending(&self, resource: ResourceType, mac: Mac) -> bool {
        self.builder.contains(resource, mac) || self.writer.has_locator(resource, mac)
    }

    fn append_blob(&mut self, resource: ResourceType, mac: Mac, data: &[u8]) -> Result<()> {
        let encoded = self.repo.encode_buffer(data)?;
        self.builder.add_blob(resource, mac, &encoded);
        if self.builder.size() >= self.repo.configuration().packfile.max_size as usize {
            self.flush_packfile()?;
        }
        Ok(())
    }

    /// Seal the open packfile builder into an immutable packfile and
    /// record its locators in the in-flight delta. No-op when empty.
    pub fn flush_packfile(&mut self) -> Result<()> {
        if self.builder.is_empty() {
            return Ok(());
        }

        let repo = &*self.repo;
        let (payload, entries) = self.builder.finish(|index| repo.encode_buffer(index))?;
        let packfile_mac = repo.compute_mac(&payload);

        debug!(
            packfile = %packfile_mac,
            blobs = entries.len(),
            bytes = payload.len(),
            "flushing packfile"
        );
        repo.put_packfile(packfile_mac, payload)?;

        for entry in entries {
            self.writer.push_locator(
                entry.resource,
                entry.mac,
                Locator {
                    packfile: packfile_mac,
                    offset: entry.offset,
                    length: entry.length,
                },
            );
        }
        Ok(())
    }

    /// Carry an existing locator into the in-flight delta unchanged.
    /// Used when consolidating state: blobs that stay put keep their
    /// physical position but must appear in the new delta.
    pub fn record_locator(&mut self, resource: ResourceType, mac: Mac, locator: Locator) {
        self.writer.push_locator(resource, mac, locator);
    }

    /// Declare a snapshot in the in-flight delta.
    pub fn record_snapshot(&mut self, mac: Mac) {
        self.writer.record_snapshot(mac);
    }

    /// Tombstone a snapshot in the in-flight delta.
    pub fn record_tombstone(&mut self, mac: Mac) {
        self.writer.record_tombstone(mac);
    }

    pub fn serial(&self) -> u64 {
        self.writer.serial()
    }

    /// Flush pending blobs, seal the delta, write it through the pipeline,
    /// and fold it into the authoritative state. Returns the state MAC, or
    /// `None` when the session recorded nothing.
    pub fn commit(mut self) -> Result<Option<Mac>> {
        self.flush_packfile()?;
        if self.writer.is_empty() {
            return Ok(None);
        }
        let state_mac = self.repo.commit_delta(self.writer)?;
        Ok(Some(state_mac))
    }
}
