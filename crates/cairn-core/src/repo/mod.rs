pub mod write_session;

use std::collections::BTreeSet;
use std::io::{Cursor, Read};
use std::sync::Arc;

use tracing::{debug, warn};
use zeroize::Zeroizing;

use cairn_types::error::{CairnError, Result};
use cairn_types::mac::Mac;
use cairn_types::resource::ResourceType;

use crate::chunker::Chunker;
use crate::compress::{deflate_stream, inflate_stream};
use crate::config::{
    ChunkingConfig, CompressionConfig, EncryptionAlgorithm, EncryptionConfig, PackfileConfig,
    RepositoryConfig, FORMAT_VERSION,
};
use crate::context::AppContext;
use crate::crypto::stream::{DecryptReader, EncryptReader};
use crate::crypto::{derive_key, engine_for, make_canary, verify_canary, CipherEngine, KdfParams};
use crate::format::{
    config_from_wrapped_bytes, deserialize_bytes, serialize, HEADER_SIZE,
};
use crate::packfile::{parse_index, IndexEntry};
use crate::state::{DeltaWriter, LocalState, StateDelta};
use crate::storage::{ObjectStore, StoreRegistry};

pub use write_session::WriteSession;

/// Options for `Repository::create`.
pub struct CreateOptions {
    pub passphrase: Option<String>,
    pub encryption_algorithm: EncryptionAlgorithm,
    pub compression: Option<CompressionConfig>,
    pub chunking: ChunkingConfig,
    pub packfile: PackfileConfig,
    /// Override the generated KDF parameters (e.g. to lower the cost on
    /// throwaway repositories).
    pub kdf: Option<KdfParams>,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            passphrase: None,
            encryption_algorithm: EncryptionAlgorithm::default(),
            compression: Some(CompressionConfig::default()),
            chunking: ChunkingConfig::default(),
            packfile: PackfileConfig::default(),
            kdf: None,
        }
    }
}

/// A handle to an opened repository: orchestrates the codec pipeline,
/// local cache, authoritative state, and object store, and exposes blob
/// granularity reads and writes.
pub struct Repository {
    store: Box<dyn ObjectStore>,
    config: RepositoryConfig,
    state: LocalState,
    mac_key: Zeroizing<Vec<u8>>,
    cipher: Option<Arc<dyn CipherEngine>>,
    ctx: AppContext,
}

impl Repository {
    /// Create a repository at a fresh location and open it.
    pub fn create(
        ctx: &AppContext,
        registry: &StoreRegistry,
        location: &str,
        options: CreateOptions,
    ) -> Result<Self> {
        let store = registry.store_for(location)?;

        let mut config = RepositoryConfig::new();
        config.compression = options.compression;
        config.chunking = options.chunking;
        config.packfile = options.packfile;

        let (mac_key, cipher) = match &options.passphrase {
            Some(passphrase) => {
                let kdf = options.kdf.clone().unwrap_or_else(KdfParams::generate);
                let key = derive_key(passphrase, &kdf)?;
                let engine: Arc<dyn CipherEngine> =
                    Arc::from(engine_for(options.encryption_algorithm, &key));
                let canary = make_canary(engine.as_ref())?;
                config.encryption = Some(EncryptionConfig {
                    algorithm: options.encryption_algorithm,
                    kdf,
                    canary,
                });
                (Zeroizing::new(key.to_vec()), Some(engine))
            }
            None => (
                Zeroizing::new(config.repository_id.as_bytes().to_vec()),
                None,
            ),
        };

        config.validate()?;
        let config_payload = rmp_serde::to_vec(&config)?;
        let mut framed = Vec::new();
        serialize(
            &mac_key,
            ResourceType::Config,
            FORMAT_VERSION,
            Box::new(Cursor::new(config_payload)),
        )
        .read_to_end(&mut framed)?;
        store.create(&framed)?;

        let cache = ctx.cache().repository(config.repository_id)?;
        let mut state = LocalState::new(cache);
        state.update_serial_or(config.serial_seed());

        debug!(repository = %config.repository_id, location, "created repository");
        Ok(Self {
            store,
            config,
            state,
            mac_key,
            cipher,
            ctx: ctx.clone(),
        })
    }

    /// Open an existing repository and rebuild its authoritative state.
    pub fn open(
        ctx: &AppContext,
        registry: &StoreRegistry,
        location: &str,
        passphrase: Option<&str>,
    ) -> Result<Self> {
        let store = registry.store_for(location)?;
        let config_bytes = store.open()?;

        // First parse bootstraps key derivation; the frame MAC is verified
        // below once the key is known.
        let (version, payload) = config_from_wrapped_bytes(&config_bytes)?;
        let config: RepositoryConfig = rmp_serde::from_slice(payload)
            .map_err(|_| CairnError::CorruptFrame("unreadable configuration".into()))?;
        if version != FORMAT_VERSION {
            return Err(CairnError::UnsupportedVersion(version));
        }
        config.validate()?;

        let (mac_key, cipher) = match &config.encryption {
            Some(encryption) => {
                let passphrase = passphrase.ok_or_else(|| {
                    CairnError::Config("passphrase required for encrypted repository".into())
                })?;
                let key = derive_key(passphrase, &encryption.kdf)?;
                let engine: Arc<dyn CipherEngine> =
                    Arc::from(engine_for(encryption.algorithm, &key));
                verify_canary(encryption, engine.as_ref())?;
                (Zeroizing::new(key.to_vec()), Some(engine))
            }
            None => (
                Zeroizing::new(config.repository_id.as_bytes().to_vec()),
                None,
            ),
        };

        // Re-verify the configuration frame now that the MAC key is known.
        deserialize_bytes(&mac_key, ResourceType::Config, &config_bytes)?;

        let cache = ctx.cache().repository(config.repository_id)?;
        let state = LocalState::new(cache);

        let mut repo = Self {
            store,
            config,
            state,
            mac_key,
            cipher,
            ctx: ctx.clone(),
        };
        repo.rebuild_state()?;
        Ok(repo)
    }

    pub fn close(self) -> Result<()> {
        self.store.close()
    }

    pub fn configuration(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn location(&self) -> &str {
        self.store.location()
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    pub fn compute_mac(&self, data: &[u8]) -> Mac {
        Mac::compute(&self.mac_key, data)
    }

    /// Copy of the MAC key for workers that chunk and hash off-thread.
    /// The returned guard zeroizes on drop like the original.
    pub(crate) fn chunk_key(&self) -> Zeroizing<Vec<u8>> {
        self.mac_key.clone()
    }

    /// Content-defined chunker over `reader`, keyed with this repository's
    /// MAC key so chunk identities line up with stored blobs.
    pub fn chunker(&self, reader: Box<dyn Read + Send>) -> Result<Chunker> {
        Chunker::new(reader, &self.config.chunking, &self.mac_key)
    }

    // --- codec pipeline ---

    /// compress → encrypt, both lazy.
    pub fn encode(&self, reader: Box<dyn Read + Send>) -> Box<dyn Read + Send> {
        let mut stream = reader;
        if let Some(compression) = &self.config.compression {
            stream = deflate_stream(compression.algorithm, stream);
        }
        if let Some(cipher) = &self.cipher {
            stream = Box::new(EncryptReader::new(stream, Arc::clone(cipher)));
        }
        stream
    }

    /// decrypt → decompress, reversing `encode`.
    pub fn decode(&self, reader: Box<dyn Read + Send>) -> Box<dyn Read + Send> {
        let mut stream = reader;
        if let Some(cipher) = &self.cipher {
            stream = Box::new(DecryptReader::new(stream, Arc::clone(cipher)));
        }
        if let Some(compression) = &self.config.compression {
            stream = inflate_stream(compression.algorithm, stream);
        }
        stream
    }

    pub fn encode_buffer(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.encode(Box::new(Cursor::new(data.to_vec())))
            .read_to_end(&mut out)?;
        Ok(out)
    }

    pub fn decode_buffer(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.decode(Box::new(Cursor::new(data.to_vec())))
            .read_to_end(&mut out)?;
        Ok(out)
    }

    // --- state plumbing ---

    /// Rebuild the authoritative state by reconciling the local cache with
    /// the remote state list. Deltas merge in `(serial, mac)` order so the
    /// result is deterministic for a fixed input set.
    fn rebuild_state(&mut self) -> Result<()> {
        let local: BTreeSet<Mac> = self
            .state
            .cache_state_macs()?
            .into_iter()
            .collect();
        let remote: BTreeSet<Mac> = self.store.list_states()?.into_iter().collect();

        for &outdated in local.difference(&remote) {
            debug!(state = %outdated, "dropping outdated local state");
            self.state.forget_state(outdated)?;
        }

        let mut pending: Vec<(u64, Mac, StateDelta, Option<Vec<u8>>)> = Vec::new();
        for &mac in &remote {
            let (payload, fresh) = if local.contains(&mac) {
                match self.state.cached_state_payload(mac)? {
                    Some(payload) => (payload, false),
                    None => (self.fetch_state_payload(mac)?, true),
                }
            } else {
                (self.fetch_state_payload(mac)?, true)
            };
            let delta: StateDelta = rmp_serde::from_slice(&payload)
                .map_err(|_| CairnError::CorruptState(mac))?;
            pending.push((delta.serial, mac, delta, fresh.then_some(payload)));
        }

        pending.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        for (_, mac, delta, payload) in pending {
            if let Some(payload) = payload {
                self.state.cache_state_payload(mac, &payload)?;
            }
            self.state.merge_delta(mac, &delta)?;
        }

        self.state.update_serial_or(self.config.serial_seed());
        Ok(())
    }

    /// Fetch a state from the store, verify its frame, and decode it.
    fn fetch_state_payload(&self, mac: Mac) -> Result<Vec<u8>> {
        let mut rd = self.store.get_state(mac)?;
        let mut framed = Vec::new();
        rd.read_to_end(&mut framed)?;
        let (_, encoded) = deserialize_bytes(&self.mac_key, ResourceType::State, &framed)
            .map_err(|_| CairnError::CorruptState(mac))?;
        self.decode_buffer(encoded)
            .map_err(|_| CairnError::CorruptState(mac))
    }

    /// Write a serialized delta through the pipeline to the remote store.
    pub(crate) fn put_state(&self, mac: Mac, payload: &[u8]) -> Result<()> {
        let encoded = self.encode(Box::new(Cursor::new(payload.to_vec())));
        let mut framed = serialize(&self.mac_key, ResourceType::State, FORMAT_VERSION, encoded);
        self.store.put_state(mac, &mut framed)
    }

    pub fn list_states(&self) -> Result<Vec<Mac>> {
        self.store.list_states()
    }

    pub fn delete_state(&self, mac: Mac) -> Result<()> {
        self.store.delete_state(mac)
    }

    pub(crate) fn state(&self) -> &LocalState {
        &self.state
    }

    // --- packfile plumbing ---

    pub(crate) fn put_packfile(&self, mac: Mac, payload: Vec<u8>) -> Result<()> {
        let mut framed = serialize(
            &self.mac_key,
            ResourceType::Packfile,
            FORMAT_VERSION,
            Box::new(Cursor::new(payload)),
        );
        self.store.put_packfile(mac, &mut framed)
    }

    pub fn list_packfiles(&self) -> Result<Vec<Mac>> {
        self.store.list_packfiles()
    }

    pub fn delete_packfile(&self, mac: Mac) -> Result<()> {
        self.store.delete_packfile(mac)
    }

    /// Read a whole packfile, verify its frame and content address, and
    /// return the decoded payload (blobs ‖ index ‖ len).
    pub fn get_packfile_payload(&self, mac: Mac) -> Result<Vec<u8>> {
        let mut rd = self.store.get_packfile(mac)?;
        let mut framed = Vec::new();
        rd.read_to_end(&mut framed)?;
        let (_, payload) = deserialize_bytes(&self.mac_key, ResourceType::Packfile, &framed)
            .map_err(|_| CairnError::CorruptPackfile(mac))?;
        if self.compute_mac(payload) != mac {
            return Err(CairnError::CorruptPackfile(mac));
        }
        Ok(payload.to_vec())
    }

    /// Parse a packfile's trailing index.
    pub fn get_packfile_index(&self, mac: Mac) -> Result<Vec<IndexEntry>> {
        let payload = self.get_packfile_payload(mac)?;
        parse_index(&payload, |encoded| {
            self.decode_buffer(encoded)
                .map_err(|_| CairnError::CorruptPackfile(mac))
        })
    }

    /// Range-read one encoded blob out of a packfile and decode it.
    /// `offset` is relative to the payload; the framing header is skipped
    /// here so callers never see it.
    pub fn get_packfile_blob(&self, mac: Mac, offset: u64, length: u32) -> Result<Vec<u8>> {
        let mut rd = self
            .store
            .get_packfile_blob(mac, offset + HEADER_SIZE as u64, length)?;
        let mut encoded = Vec::new();
        rd.read_to_end(&mut encoded)?;
        if encoded.len() != length as usize {
            return Err(CairnError::CorruptPackfile(mac));
        }
        Ok(encoded)
    }

    // --- blob granularity ---

    pub fn blob_exists(&self, resource: ResourceType, mac: Mac) -> bool {
        self.state.blob_exists(resource, mac)
    }

    /// Resolve, fetch, decode, and verify one blob.
    pub fn get_blob(&self, resource: ResourceType, mac: Mac) -> Result<Vec<u8>> {
        let locator = self
            .state
            .lookup(resource, mac)
            .ok_or(CairnError::BlobNotFound(resource, mac))?;

        let encoded = self.get_packfile_blob(locator.packfile, locator.offset, locator.length)?;
        let decoded = self
            .decode_buffer(&encoded)
            .map_err(|_| CairnError::CorruptBlob(mac))?;
        if self.compute_mac(&decoded) != mac {
            return Err(CairnError::CorruptBlob(mac));
        }
        Ok(decoded)
    }

    /// Current locator for a blob, if the authoritative state has one.
    pub fn state_locator(&self, resource: ResourceType, mac: Mac) -> Option<crate::state::Locator> {
        self.state.lookup(resource, mac)
    }

    /// Drop a state's local cache mirror after remote garbage collection.
    pub fn forget_cached_state(&self, mac: Mac) -> Result<()> {
        self.state.forget_state(mac)
    }

    pub fn list_snapshots(&self) -> Vec<Mac> {
        self.state.list_snapshots()
    }

    pub fn snapshot_visible(&self, mac: Mac) -> bool {
        self.state.snapshot_visible(mac)
    }

    /// Write a tombstone-only delta for one snapshot. Packfiles are not
    /// touched; physical reclamation belongs to maintenance.
    pub fn delete_snapshot(&mut self, mac: Mac) -> Result<Mac> {
        if !self.state.snapshot_visible(mac) {
            return Err(CairnError::SnapshotNotFound(mac));
        }
        let mut writer = self.state.derive();
        writer.record_tombstone(mac);
        self.commit_delta(writer)
    }

    /// Serialize a delta, write it through the pipeline, and fold it into
    /// the authoritative state.
    pub(crate) fn commit_delta(&mut self, writer: DeltaWriter) -> Result<Mac> {
        let payload = writer.serialize()?;
        let state_mac = self.compute_mac(&payload);
        self.put_state(state_mac, &payload)?;
        if let Err(e) = self.state.insert_state(state_mac, &payload) {
            warn!(state = %state_mac, "failed to fold committed delta into local state: {e}");
            return Err(e);
        }
        Ok(state_mac)
    }

    /// Start a single-writer session: one open packfile builder plus an
    /// in-flight state delta. The exclusive borrow is the per-repository
    /// write lock.
    pub fn session(&mut self) -> WriteSession<'_> {
        WriteSession::new(self)
    }
}
