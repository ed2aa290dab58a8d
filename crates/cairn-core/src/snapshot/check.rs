use crossbeam_channel::bounded;
use tracing::debug;

use cairn_types::error::{CairnError, Result};
use cairn_types::mac::Mac;
use cairn_types::resource::ResourceType;

use crate::repo::Repository;

use super::{FileEntry, Snapshot};

#[derive(Debug, Clone, Copy, Default)]
pub struct CheckOptions {
    /// Fast mode only verifies that every chunk has a locator; full mode
    /// fetches each chunk and re-verifies its MAC.
    pub fast: bool,
}

/// Events emitted while walking a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckEvent {
    ChunkOk(Mac),
    ChunkMissing(Mac),
    ChunkCorrupted(Mac),
    FileOk(String),
    FileCorrupted(String),
}

/// Verify a snapshot's reachable chunks with a bounded worker pool.
/// Returns `true` when everything resolved and verified. Missing or
/// corrupt chunks are reported as events and the walk continues, so one
/// bad object never masks the rest.
pub fn check(
    repo: &Repository,
    snapshot_mac: Mac,
    options: &CheckOptions,
    on_event: &mut dyn FnMut(&CheckEvent),
) -> Result<bool> {
    let snapshot = Snapshot::load(repo, snapshot_mac)?;
    let ctx = repo.context().clone();
    let workers = ctx.max_concurrency();

    let (work_tx, work_rx) = bounded::<FileEntry>(workers * 2);
    let (event_tx, event_rx) = bounded::<CheckEvent>(workers * 4);

    let ok = std::thread::scope(|scope| -> Result<bool> {
        for _ in 0..workers {
            let work_rx = work_rx.clone();
            let event_tx = event_tx.clone();
            let ctx = ctx.clone();

            scope.spawn(move || {
                for file in work_rx.iter() {
                    if ctx.is_cancelled() {
                        return;
                    }
                    let mut file_ok = true;
                    for &chunk in &file.chunks {
                        let event = verify_chunk(repo, chunk, options.fast);
                        if !matches!(event, CheckEvent::ChunkOk(_)) {
                            file_ok = false;
                        }
                        if event_tx.send(event).is_err() {
                            return;
                        }
                    }
                    let file_event = if file_ok {
                        CheckEvent::FileOk(file.path)
                    } else {
                        CheckEvent::FileCorrupted(file.path)
                    };
                    if event_tx.send(file_event).is_err() {
                        return;
                    }
                }
            });
        }
        // Only worker clones may keep these channels alive, otherwise a
        // cancelled run leaves the feeder blocked on a full queue.
        drop(event_tx);
        drop(work_rx);

        let feeder = scope.spawn(move || {
            for file in snapshot.files {
                if work_tx.send(file).is_err() {
                    return;
                }
            }
        });

        let mut ok = true;
        for event in event_rx.iter() {
            if matches!(
                event,
                CheckEvent::ChunkMissing(_)
                    | CheckEvent::ChunkCorrupted(_)
                    | CheckEvent::FileCorrupted(_)
            ) {
                ok = false;
            }
            on_event(&event);
        }
        feeder.join().map_err(|_| {
            CairnError::Other("check feeder thread panicked".into())
        })?;
        ctx.check_cancelled()?;
        Ok(ok)
    })?;

    debug!(snapshot = %snapshot_mac, ok, "check finished");
    Ok(ok)
}

fn verify_chunk(repo: &Repository, mac: Mac, fast: bool) -> CheckEvent {
    if !repo.blob_exists(ResourceType::Chunk, mac) {
        return CheckEvent::ChunkMissing(mac);
    }
    if fast {
        return CheckEvent::ChunkOk(mac);
    }
    // get_blob re-verifies the MAC over the decoded bytes.
    match repo.get_blob(ResourceType::Chunk, mac) {
        Ok(_) => CheckEvent::ChunkOk(mac),
        Err(CairnError::BlobNotFound(..)) | Err(CairnError::PackfileNotFound(_)) => {
            CheckEvent::ChunkMissing(mac)
        }
        Err(_) => CheckEvent::ChunkCorrupted(mac),
    }
}
