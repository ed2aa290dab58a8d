use std::fs;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;

use cairn_types::error::{CairnError, Result};
use cairn_types::mac::Mac;

use super::ObjectStore;

const CONFIG_FILE: &str = "CONFIG";
const STATES_DIR: &str = "states";
const PACKFILES_DIR: &str = "packfiles";

/// Filesystem object store.
///
/// Layout: `<root>/CONFIG`, `<root>/states/<2-hex>/<hex-mac>`,
/// `<root>/packfiles/<2-hex>/<hex-mac>`. The two-char shard directories
/// keep listings tractable for large repositories.
pub struct FsStore {
    location: String,
    root: PathBuf,
}

impl FsStore {
    pub fn new(path: &str) -> Self {
        Self {
            location: path.to_string(),
            root: PathBuf::from(path),
        }
    }

    fn object_path(&self, kind: &str, mac: Mac) -> PathBuf {
        self.root.join(kind).join(mac.shard_prefix()).join(mac.to_hex())
    }

    fn put_object(&self, kind: &str, mac: Mac, rd: &mut dyn Read) -> Result<()> {
        let path = self.object_path(kind, mac);
        if path.exists() {
            // Content-addressed: same MAC means same bytes, nothing to do.
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&path)?;
        std::io::copy(rd, &mut file)?;
        file.sync_all()?;
        Ok(())
    }

    fn get_object(&self, kind: &str, mac: Mac) -> std::io::Result<fs::File> {
        fs::File::open(self.object_path(kind, mac))
    }

    fn delete_object(&self, kind: &str, mac: Mac) -> Result<()> {
        match fs::remove_file(self.object_path(kind, mac)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn list_objects(&self, kind: &str) -> Result<Vec<Mac>> {
        let dir = self.root.join(kind);
        let mut macs = Vec::new();
        let shards = match fs::read_dir(&dir) {
            Ok(shards) => shards,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(macs),
            Err(e) => return Err(e.into()),
        };
        for shard in shards {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let entry = entry?;
                if let Some(mac) = entry.file_name().to_str().and_then(Mac::from_hex) {
                    macs.push(mac);
                }
            }
        }
        Ok(macs)
    }
}

impl ObjectStore for FsStore {
    fn location(&self) -> &str {
        &self.location
    }

    fn create(&self, config: &[u8]) -> Result<()> {
        let config_path = self.root.join(CONFIG_FILE);
        if config_path.exists() {
            return Err(CairnError::RepositoryAlreadyExists(self.location.clone()));
        }
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(self.root.join(STATES_DIR))?;
        fs::create_dir_all(self.root.join(PACKFILES_DIR))?;
        fs::write(&config_path, config)?;
        Ok(())
    }

    fn open(&self) -> Result<Vec<u8>> {
        match fs::read(self.root.join(CONFIG_FILE)) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CairnError::RepositoryNotFound(self.location.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }

    fn list_states(&self) -> Result<Vec<Mac>> {
        self.list_objects(STATES_DIR)
    }

    fn put_state(&self, mac: Mac, rd: &mut dyn Read) -> Result<()> {
        self.put_object(STATES_DIR, mac, rd)
    }

    fn get_state(&self, mac: Mac) -> Result<Box<dyn Read + Send>> {
        match self.get_object(STATES_DIR, mac) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CairnError::StateNotFound(mac))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn delete_state(&self, mac: Mac) -> Result<()> {
        self.delete_object(STATES_DIR, mac)
    }

    fn list_packfiles(&self) -> Result<Vec<Mac>> {
        self.list_objects(PACKFILES_DIR)
    }

    fn put_packfile(&self, mac: Mac, rd: &mut dyn Read) -> Result<()> {
        self.put_object(PACKFILES_DIR, mac, rd)
    }

    fn get_packfile(&self, mac: Mac) -> Result<Box<dyn Read + Send>> {
        match self.get_object(PACKFILES_DIR, mac) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CairnError::PackfileNotFound(mac))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn get_packfile_blob(
        &self,
        mac: Mac,
        offset: u64,
        length: u32,
    ) -> Result<Box<dyn Read + Send>> {
        let mut file = match self.get_object(PACKFILES_DIR, mac) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CairnError::PackfileNotFound(mac))
            }
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(offset))?;
        Ok(Box::new(file.take(length as u64)))
    }

    fn delete_packfile(&self, mac: Mac) -> Result<()> {
        self.delete_object(PACKFILES_DIR, mac)
    }
}
