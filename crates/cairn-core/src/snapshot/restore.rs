use std::path::{Component, Path, PathBuf};

use tracing::debug;

use cairn_types::error::{CairnError, Result};
use cairn_types::mac::Mac;
use cairn_types::resource::ResourceType;

use crate::repo::Repository;

use super::Snapshot;

#[derive(Debug, Default, Clone)]
pub struct RestoreStats {
    pub files: usize,
    pub bytes: u64,
}

/// Materialise a snapshot under `target`, streaming chunks to files.
pub fn restore(repo: &Repository, snapshot_mac: Mac, target: &Path) -> Result<RestoreStats> {
    let snapshot = Snapshot::load(repo, snapshot_mac)?;
    let ctx = repo.context();

    let mut stats = RestoreStats::default();
    for file in &snapshot.files {
        ctx.check_cancelled()?;

        let rel = sanitize_path(&file.path)?;
        let dest = target.join(rel);
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut out = std::fs::File::create(&dest)?;
        for &chunk in &file.chunks {
            let data = repo.get_blob(ResourceType::Chunk, chunk)?;
            std::io::Write::write_all(&mut out, &data)?;
            stats.bytes += data.len() as u64;
        }
        stats.files += 1;
    }

    debug!(snapshot = %snapshot_mac, files = stats.files, bytes = stats.bytes, "restore finished");
    Ok(stats)
}

/// Reject snapshot paths that would escape the restore target.
fn sanitize_path(path: &str) -> Result<PathBuf> {
    let path = Path::new(path);
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => {
                return Err(CairnError::Other(format!(
                    "unsafe path in snapshot: '{}'",
                    path.display()
                )))
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(CairnError::Other("empty path in snapshot".into()));
    }
    Ok(clean)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_accepts_relative_paths() {
        assert_eq!(sanitize_path("a/b/c.txt").unwrap(), PathBuf::from("a/b/c.txt"));
        assert_eq!(sanitize_path("./a.txt").unwrap(), PathBuf::from("a.txt"));
    }

    #[test]
    fn sanitize_rejects_escapes() {
        assert!(sanitize_path("../evil").is_err());
        assert!(sanitize_path("/etc/passwd").is_err());
        assert!(sanitize_path("a/../../b").is_err());
        assert!(sanitize_path("").is_err());
    }
}
