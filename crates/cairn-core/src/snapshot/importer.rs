use std::io::Read;
use std::path::{Path, PathBuf};

use crossbeam_channel::{bounded, Receiver};
use tracing::warn;
use walkdir::WalkDir;

use cairn_types::error::Result;

/// Buffered scan records in flight between the importer and the backup
/// workers.
const SCAN_QUEUE_DEPTH: usize = 256;

/// One file discovered by an importer. `open` is deferred so file
/// descriptors are only consumed once a worker picks the record up.
pub struct ScanRecord {
    pub path: String,
    pub size: u64,
    pub open: Box<dyn FnOnce() -> std::io::Result<Box<dyn Read + Send>> + Send>,
}

pub struct ScanError {
    pub path: String,
    pub message: String,
}

pub enum ScanEvent {
    Record(ScanRecord),
    Error(ScanError),
}

/// Produces a finite, streamed, non-restartable sequence of scan events.
pub trait Importer: Send {
    fn scan(&self) -> Result<Receiver<ScanEvent>>;
}

/// Filesystem importer: walks a directory tree and emits every regular
/// file, with paths relative to the root.
pub struct FsImporter {
    root: PathBuf,
}

impl FsImporter {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

impl Importer for FsImporter {
    fn scan(&self) -> Result<Receiver<ScanEvent>> {
        let (tx, rx) = bounded(SCAN_QUEUE_DEPTH);
        let root = self.root.clone();

        std::thread::spawn(move || {
            for entry in WalkDir::new(&root).sort_by_file_name() {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(e) => {
                        let path = e
                            .path()
                            .map(|p| p.display().to_string())
                            .unwrap_or_else(|| root.display().to_string());
                        warn!(path, "scan error: {e}");
                        if tx
                            .send(ScanEvent::Error(ScanError {
                                path,
                                message: e.to_string(),
                            }))
                            .is_err()
                        {
                            return; // receiver gone, stop walking
                        }
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }

                let rel = entry
                    .path()
                    .strip_prefix(&root)
                    .unwrap_or(entry.path())
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                let abs = entry.path().to_path_buf();

                let record = ScanRecord {
                    path: rel,
                    size,
                    open: Box::new(move || {
                        std::fs::File::open(&abs).map(|f| Box::new(f) as Box<dyn Read + Send>)
                    }),
                };
                if tx.send(ScanEvent::Record(record)).is_err() {
                    return;
                }
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn walks_regular_files_with_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"alpha").unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), b"beta").unwrap();

        let importer = FsImporter::new(dir.path());
        let mut paths = Vec::new();
        for event in importer.scan().unwrap() {
            match event {
                ScanEvent::Record(record) => {
                    let mut content = Vec::new();
                    (record.open)().unwrap().read_to_end(&mut content).unwrap();
                    assert!(!content.is_empty());
                    paths.push(record.path);
                }
                ScanEvent::Error(e) => panic!("unexpected scan error on {}", e.path),
            }
        }
        paths.sort();
        assert_eq!(paths, vec!["a.txt", "sub/b.txt"]);
    }

    #[test]
    fn empty_tree_yields_no_records() {
        let dir = tempfile::tempdir().unwrap();
        let importer = FsImporter::new(dir.path());
        assert_eq!(importer.scan().unwrap().iter().count(), 0);
    }
}
