pub mod fs;
pub mod memory;

use std::collections::HashMap;
use std::io::Read;
use std::sync::{Arc, Mutex};

use cairn_types::error::{CairnError, Result};
use cairn_types::mac::Mac;

/// Minimal byte-level CRUD a backend must expose for state blobs and
/// packfiles. The core treats every backend identically; all integrity
/// checking happens above this interface.
///
/// Calls are idempotent on the `(mac, bytes)` pair: re-putting the same
/// object is a no-op, and callers may retry on transient errors. A put with
/// a colliding MAC and different bytes is undefined behavior the core never
/// produces.
pub trait ObjectStore: Send + Sync {
    /// The location string this store was opened with.
    fn location(&self) -> &str;

    /// Initialize the backing store and write the framed configuration.
    fn create(&self, config: &[u8]) -> Result<()>;

    /// Read back the framed configuration bytes.
    fn open(&self) -> Result<Vec<u8>>;

    fn close(&self) -> Result<()>;

    fn list_states(&self) -> Result<Vec<Mac>>;
    fn put_state(&self, mac: Mac, rd: &mut dyn Read) -> Result<()>;
    fn get_state(&self, mac: Mac) -> Result<Box<dyn Read + Send>>;
    fn delete_state(&self, mac: Mac) -> Result<()>;

    fn list_packfiles(&self) -> Result<Vec<Mac>>;
    fn put_packfile(&self, mac: Mac, rd: &mut dyn Read) -> Result<()>;
    fn get_packfile(&self, mac: Mac) -> Result<Box<dyn Read + Send>>;
    /// Range read inside a packfile object. `offset` is absolute within the
    /// stored object; callers account for the framing header themselves.
    fn get_packfile_blob(&self, mac: Mac, offset: u64, length: u32)
        -> Result<Box<dyn Read + Send>>;
    fn delete_packfile(&self, mac: Mac) -> Result<()>;
}

type StoreFactory = dyn Fn(&str) -> Result<Box<dyn ObjectStore>> + Send + Sync;

/// Per-process registry of store backends keyed by URL scheme.
///
/// Deliberately not a global: tests and embedders instantiate their own
/// registry and thread it through the AppContext.
pub struct StoreRegistry {
    factories: HashMap<String, Arc<StoreFactory>>,
}

impl StoreRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with the built-in backends: `fs://` (also bare paths) and
    /// `mem://` (process-local, shared between stores of the same location).
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();

        registry.register("fs", |location| {
            let path = location.strip_prefix("fs://").unwrap_or(location);
            Ok(Box::new(fs::FsStore::new(path)) as Box<dyn ObjectStore>)
        });

        // All mem:// stores created from this registry share one namespace,
        // so concurrent sessions against the same location see each other.
        let namespace: Arc<Mutex<HashMap<String, memory::SharedStore>>> =
            Arc::new(Mutex::new(HashMap::new()));
        registry.register("mem", move |location| {
            let mut namespace = namespace.lock().expect("memory namespace poisoned");
            let shared = namespace
                .entry(location.to_string())
                .or_default()
                .clone();
            Ok(Box::new(memory::MemoryStore::new(location, shared)) as Box<dyn ObjectStore>)
        });

        registry
    }

    pub fn register<F>(&mut self, scheme: &str, factory: F)
    where
        F: Fn(&str) -> Result<Box<dyn ObjectStore>> + Send + Sync + 'static,
    {
        self.factories.insert(scheme.to_string(), Arc::new(factory));
    }

    /// Instantiate a store for a location. Bare paths map to `fs`.
    pub fn store_for(&self, location: &str) -> Result<Box<dyn ObjectStore>> {
        let scheme = match location.split_once("://") {
            Some((scheme, _)) => scheme,
            None => "fs",
        };
        let factory = self.factories.get(scheme).ok_or_else(|| {
            CairnError::Backend(format!("no backend registered for scheme '{scheme}'"))
        })?;
        factory(location)
    }

    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.factories.keys().cloned().collect();
        schemes.sort();
        schemes
    }
}

impl Default for StoreRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn registry_resolves_schemes() {
        let registry = StoreRegistry::with_defaults();
        assert!(registry.store_for("mem://a").is_ok());
        assert!(registry.store_for("fs:///tmp/cairn-test-repo").is_ok());
        assert!(registry.store_for("/tmp/cairn-test-repo").is_ok());
        assert!(registry.store_for("carrier-pigeon://x").is_err());
    }

    #[test]
    fn memory_stores_share_a_namespace() {
        let registry = StoreRegistry::with_defaults();
        let a = registry.store_for("mem://shared").unwrap();
        let b = registry.store_for("mem://shared").unwrap();

        let mac = Mac([1u8; 32]);
        a.put_state(mac, &mut Cursor::new(b"delta".to_vec())).unwrap();
        assert_eq!(b.list_states().unwrap(), vec![mac]);

        let other = registry.store_for("mem://other").unwrap();
        assert!(other.list_states().unwrap().is_empty());
    }

    #[test]
    fn distinct_registries_are_isolated() {
        let mac = Mac([2u8; 32]);
        let r1 = StoreRegistry::with_defaults();
        r1.store_for("mem://x")
            .unwrap()
            .put_state(mac, &mut Cursor::new(b"d".to_vec()))
            .unwrap();

        let r2 = StoreRegistry::with_defaults();
        assert!(r2.store_for("mem://x").unwrap().list_states().unwrap().is_empty());
    }
}
