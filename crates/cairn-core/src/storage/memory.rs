use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::sync::{Arc, Mutex};

use cairn_types::error::{CairnError, Result};
use cairn_types::mac::Mac;

use super::ObjectStore;

#[derive(Default)]
pub struct Inner {
    config: Option<Vec<u8>>,
    states: HashMap<Mac, Vec<u8>>,
    packfiles: HashMap<Mac, Vec<u8>>,
}

/// Backing storage shared by every `MemoryStore` opened at the same
/// location within one registry, so concurrent sessions observe each
/// other the way they would against a real backend.
pub type SharedStore = Arc<Mutex<Inner>>;

/// In-memory object store for tests and `mem://` locations.
pub struct MemoryStore {
    location: String,
    shared: SharedStore,
}

impl MemoryStore {
    pub fn new(location: &str, shared: SharedStore) -> Self {
        Self {
            location: location.to_string(),
            shared,
        }
    }

    fn read_all(rd: &mut dyn Read) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        rd.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

impl ObjectStore for MemoryStore {
    fn location(&self) -> &str {
        &self.location
    }

    fn create(&self, config: &[u8]) -> Result<()> {
        let mut inner = self.shared.lock().expect("memory store poisoned");
        if inner.config.is_some() {
            return Err(CairnError::RepositoryAlreadyExists(self.location.clone()));
        }
        inner.config = Some(config.to_vec());
        Ok(())
    }

    fn open(&self) -> Result<Vec<u8>> {
        let inner = self.shared.lock().expect("memory store poisoned");
        inner
            .config
            .clone()
            .ok_or_else(|| CairnError::RepositoryNotFound(self.location.clone()))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn list_states(&self) -> Result<Vec<Mac>> {
        let inner = self.shared.lock().expect("memory store poisoned");
        Ok(inner.states.keys().copied().collect())
    }

    fn put_state(&self, mac: Mac, rd: &mut dyn Read) -> Result<()> {
        let data = Self::read_all(rd)?;
        let mut inner = self.shared.lock().expect("memory store poisoned");
        inner.states.entry(mac).or_insert(data);
        Ok(())
    }

    fn get_state(&self, mac: Mac) -> Result<Box<dyn Read + Send>> {
        let inner = self.shared.lock().expect("memory store poisoned");
        match inner.states.get(&mac) {
            Some(data) => Ok(Box::new(Cursor::new(data.clone()))),
            None => Err(CairnError::StateNotFound(mac)),
        }
    }

    fn delete_state(&self, mac: Mac) -> Result<()> {
        let mut inner = self.shared.lock().expect("memory store poisoned");
        inner.states.remove(&mac);
        Ok(())
    }

    fn list_packfiles(&self) -> Result<Vec<Mac>> {
        let inner = self.shared.lock().expect("memory store poisoned");
        Ok(inner.packfiles.keys().copied().collect())
    }

    fn put_packfile(&self, mac: Mac, rd: &mut dyn Read) -> Result<()> {
        let data = Self::read_all(rd)?;
        let mut inner = self.shared.lock().expect("memory store poisoned");
        inner.packfiles.entry(mac).or_insert(data);
        Ok(())
    }

    fn get_packfile(&self, mac: Mac) -> Result<Box<dyn Read + Send>> {
        let inner = self.shared.lock().expect("memory store poisoned");
        match inner.packfiles.get(&mac) {
            Some(data) => Ok(Box::new(Cursor::new(data.clone()))),
            None => Err(CairnError::PackfileNotFound(mac)),
        }
    }

    fn get_packfile_blob(
        &self,
        mac: Mac,
        offset: u64,
        length: u32,
    ) -> Result<Box<dyn Read + Send>> {
        let inner = self.shared.lock().expect("memory store poisoned");
        let data = inner
            .packfiles
            .get(&mac)
            .ok_or(CairnError::PackfileNotFound(mac))?;
        let start = std::cmp::min(offset as usize, data.len());
        let end = std::cmp::min(start + length as usize, data.len());
        Ok(Box::new(Cursor::new(data[start..end].to_vec())))
    }

    fn delete_packfile(&self, mac: Mac) -> Result<()> {
        let mut inner = self.shared.lock().expect("memory store poisoned");
        inner.packfiles.remove(&mac);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new("mem://test", SharedStore::default())
    }

    #[test]
    fn put_is_idempotent_by_mac() {
        let store = store();
        let mac = Mac([3u8; 32]);
        store.put_packfile(mac, &mut Cursor::new(b"bytes".to_vec())).unwrap();
        store.put_packfile(mac, &mut Cursor::new(b"bytes".to_vec())).unwrap();
        assert_eq!(store.list_packfiles().unwrap().len(), 1);
    }

    #[test]
    fn blob_range_clamps_to_object() {
        let store = store();
        let mac = Mac([4u8; 32]);
        store.put_packfile(mac, &mut Cursor::new(b"abcdef".to_vec())).unwrap();

        let mut out = Vec::new();
        store
            .get_packfile_blob(mac, 4, 100)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, b"ef");
    }

    #[test]
    fn missing_state_reports_not_found() {
        let store = store();
        assert!(matches!(
            store.get_state(Mac([9u8; 32])),
            Err(CairnError::StateNotFound(_))
        ));
    }
}
