use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use redb::{Database, ReadableTable, TableDefinition};
use uuid::Uuid;

use cairn_types::error::{CairnError, Result};
use cairn_types::mac::Mac;
use cairn_types::resource::ResourceType;

/// Mirror of remote state-delta documents, keyed by state MAC.
const STATES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("states");
/// Merged blob locators, keyed by `[type_tag ‖ mac]`.
const DELTAS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("deltas");
/// Tombstone markers, keyed by `[type_tag ‖ mac]`, value = serial LE.
const DELETED: TableDefinition<&[u8], &[u8]> = TableDefinition::new("deleted");
/// Packfile-level metadata, keyed by `[state_mac ‖ packfile_mac]`.
const PACKFILES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("packfiles");

fn cache_err(e: impl std::fmt::Display) -> CairnError {
    CairnError::Cache(e.to_string())
}

fn typed_key(resource: ResourceType, mac: Mac) -> [u8; 33] {
    let mut key = [0u8; 33];
    key[0] = resource.as_u8();
    key[1..].copy_from_slice(mac.as_bytes());
    key
}

fn paired_key(a: Mac, b: Mac) -> [u8; 64] {
    let mut key = [0u8; 64];
    key[..32].copy_from_slice(a.as_bytes());
    key[32..].copy_from_slice(b.as_bytes());
    key
}

/// Hands out per-repository caches under a common cache directory.
/// One instance per AppContext; not a global. Handles are shared: the
/// backing database holds a process lock, so concurrent sessions against
/// the same repository reuse one instance.
pub struct CacheManager {
    root: PathBuf,
    open: Mutex<HashMap<Uuid, Arc<RepositoryCache>>>,
}

impl CacheManager {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Open (or create) the durable cache for one repository.
    pub fn repository(&self, repository_id: Uuid) -> Result<Arc<RepositoryCache>> {
        let mut open = self.open.lock().expect("cache manager poisoned");
        if let Some(cache) = open.get(&repository_id) {
            return Ok(Arc::clone(cache));
        }
        let dir = self.root.join("repository");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{repository_id}.redb"));
        let cache = Arc::new(RepositoryCache::open(&path)?);
        open.insert(repository_id, Arc::clone(&cache));
        Ok(cache)
    }
}

/// Durable key/value index of known states, merged locators, tombstones,
/// and packfile metadata for a single repository.
pub struct RepositoryCache {
    db: Database,
}

impl RepositoryCache {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path).map_err(cache_err)?;
        // Create all tables up front so readers never hit a missing table.
        let tx = db.begin_write().map_err(cache_err)?;
        {
            tx.open_table(STATES).map_err(cache_err)?;
            tx.open_table(DELTAS).map_err(cache_err)?;
            tx.open_table(DELETED).map_err(cache_err)?;
            tx.open_table(PACKFILES).map_err(cache_err)?;
        }
        tx.commit().map_err(cache_err)?;
        Ok(Self { db })
    }

    fn put(&self, table: TableDefinition<&[u8], &[u8]>, key: &[u8], value: &[u8]) -> Result<()> {
        let tx = self.db.begin_write().map_err(cache_err)?;
        {
            let mut t = tx.open_table(table).map_err(cache_err)?;
            t.insert(key, value).map_err(cache_err)?;
        }
        tx.commit().map_err(cache_err)?;
        Ok(())
    }

    fn get(&self, table: TableDefinition<&[u8], &[u8]>, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let tx = self.db.begin_read().map_err(cache_err)?;
        let t = tx.open_table(table).map_err(cache_err)?;
        Ok(t.get(key).map_err(cache_err)?.map(|v| v.value().to_vec()))
    }

    fn delete(&self, table: TableDefinition<&[u8], &[u8]>, key: &[u8]) -> Result<()> {
        let tx = self.db.begin_write().map_err(cache_err)?;
        {
            let mut t = tx.open_table(table).map_err(cache_err)?;
            t.remove(key).map_err(cache_err)?;
        }
        tx.commit().map_err(cache_err)?;
        Ok(())
    }

    // --- states (mirror of remote deltas) ---

    pub fn put_state(&self, mac: Mac, payload: &[u8]) -> Result<()> {
        self.put(STATES, mac.as_bytes(), payload)
    }

    pub fn get_state(&self, mac: Mac) -> Result<Option<Vec<u8>>> {
        self.get(STATES, mac.as_bytes())
    }

    pub fn has_state(&self, mac: Mac) -> Result<bool> {
        Ok(self.get_state(mac)?.is_some())
    }

    pub fn del_state(&self, mac: Mac) -> Result<()> {
        self.delete(STATES, mac.as_bytes())
    }

    /// MACs of all mirrored states, extracted from keys without touching
    /// the values.
    pub fn state_macs(&self) -> Result<Vec<Mac>> {
        let tx = self.db.begin_read().map_err(cache_err)?;
        let t = tx.open_table(STATES).map_err(cache_err)?;
        let mut macs = Vec::new();
        for entry in t.iter().map_err(cache_err)? {
            let entry = entry.map_err(cache_err)?;
            if let Some(mac) = Mac::from_bytes(entry.0.value()) {
                macs.push(mac);
            }
        }
        Ok(macs)
    }

    // --- deltas (merged locator view) ---

    pub fn put_delta(&self, resource: ResourceType, mac: Mac, value: &[u8]) -> Result<()> {
        self.put(DELTAS, &typed_key(resource, mac), value)
    }

    pub fn get_delta(&self, resource: ResourceType, mac: Mac) -> Result<Option<Vec<u8>>> {
        self.get(DELTAS, &typed_key(resource, mac))
    }

    pub fn has_delta(&self, resource: ResourceType, mac: Mac) -> Result<bool> {
        Ok(self.get_delta(resource, mac)?.is_some())
    }

    /// All delta entries of one resource type. The MAC is recovered from
    /// the key; values are returned undecoded.
    pub fn deltas_for_type(&self, resource: ResourceType) -> Result<Vec<(Mac, Vec<u8>)>> {
        self.typed_range(DELTAS, resource)
    }

    // --- deleted (tombstones) ---

    pub fn put_deleted(&self, resource: ResourceType, mac: Mac, serial: u64) -> Result<()> {
        self.put(DELETED, &typed_key(resource, mac), &serial.to_le_bytes())
    }

    pub fn has_deleted(&self, resource: ResourceType, mac: Mac) -> Result<bool> {
        Ok(self.get(DELETED, &typed_key(resource, mac))?.is_some())
    }

    pub fn deleted_for_type(&self, resource: ResourceType) -> Result<Vec<(Mac, Vec<u8>)>> {
        self.typed_range(DELETED, resource)
    }

    // --- packfile metadata ---

    pub fn put_packfile(&self, state: Mac, packfile: Mac, value: &[u8]) -> Result<()> {
        self.put(PACKFILES, &paired_key(state, packfile), value)
    }

    /// Packfile MACs recorded for one state, key-only extraction.
    pub fn packfiles_for_state(&self, state: Mac) -> Result<Vec<Mac>> {
        let tx = self.db.begin_read().map_err(cache_err)?;
        let t = tx.open_table(PACKFILES).map_err(cache_err)?;
        let start = paired_key(state, Mac([0u8; 32]));
        let end = paired_key(state, Mac([0xFFu8; 32]));
        let mut macs = Vec::new();
        for entry in t
            .range(start.as_slice()..=end.as_slice())
            .map_err(cache_err)?
        {
            let entry = entry.map_err(cache_err)?;
            if let Some(mac) = Mac::from_bytes(&entry.0.value()[32..]) {
                macs.push(mac);
            }
        }
        Ok(macs)
    }

    fn typed_range(
        &self,
        table: TableDefinition<&[u8], &[u8]>,
        resource: ResourceType,
    ) -> Result<Vec<(Mac, Vec<u8>)>> {
        let tx = self.db.begin_read().map_err(cache_err)?;
        let t = tx.open_table(table).map_err(cache_err)?;
        let start = [resource.as_u8()];
        let end = [resource.as_u8() + 1];
        let mut out = Vec::new();
        for entry in t.range(start.as_slice()..end.as_slice()).map_err(cache_err)? {
            let entry = entry.map_err(cache_err)?;
            let key = entry.0.value();
            if let Some(mac) = Mac::from_bytes(&key[1..]) {
                out.push((mac, entry.1.value().to_vec()));
            }
        }
        Ok(out)
    }
}
