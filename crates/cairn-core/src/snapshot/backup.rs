use chrono::Utc;
use crossbeam_channel::bounded;
use tracing::{debug, warn};

use cairn_types::error::{CairnError, Result};
use cairn_types::mac::Mac;
use cairn_types::resource::ResourceType;

use crate::chunker::Chunker;
use crate::repo::Repository;

use super::importer::{Importer, ScanEvent};
use super::{FileEntry, Snapshot};

pub struct BackupOptions {
    pub name: String,
}

#[derive(Debug, Default, Clone)]
pub struct BackupStats {
    pub files: usize,
    pub bytes: u64,
    pub chunks: usize,
    pub errors: usize,
}

/// Messages from the chunking workers to the single writer.
enum WriterMsg {
    Chunk { data: Vec<u8> },
    File(FileEntry),
    Error,
}

/// Run a backup.
///
/// Scan records flow from the importer through a bounded pool of chunking
/// workers; the write session (single writer) stores chunks as they
/// arrive, then the snapshot document, then commits one state delta
/// declaring the snapshot. Returns the snapshot MAC and counters.
pub fn backup(
    repo: &mut Repository,
    importer: &dyn Importer,
    options: &BackupOptions,
) -> Result<(Mac, BackupStats)> {
    let ctx = repo.context().clone();
    let chunking = repo.configuration().chunking.clone();
    let chunk_key = repo.chunk_key();

    let events = importer.scan()?;
    let workers = ctx.max_concurrency();
    let (msg_tx, msg_rx) = bounded::<WriterMsg>(workers * 2);

    let mut stats = BackupStats::default();

    let snapshot_mac = std::thread::scope(|scope| -> Result<Mac> {
        // Owned by the scope so an early error drops the receiver, failing
        // worker sends instead of deadlocking the join.
        let msg_rx = msg_rx;
        for _ in 0..workers {
            let events = events.clone();
            let msg_tx = msg_tx.clone();
            let ctx = ctx.clone();
            let chunking = &chunking;
            let chunk_key = &chunk_key;

            scope.spawn(move || {
                for event in events.iter() {
                    if ctx.is_cancelled() {
                        return;
                    }
                    let record = match event {
                        ScanEvent::Record(record) => record,
                        ScanEvent::Error(e) => {
                            warn!(path = e.path, "importer error: {}", e.message);
                            if msg_tx.send(WriterMsg::Error).is_err() {
                                return;
                            }
                            continue;
                        }
                    };

                    let path = record.path;
                    let reader = match (record.open)() {
                        Ok(reader) => reader,
                        Err(e) => {
                            warn!(path, "cannot open: {e}");
                            if msg_tx.send(WriterMsg::Error).is_err() {
                                return;
                            }
                            continue;
                        }
                    };

                    let chunker = match Chunker::new(reader, chunking, chunk_key) {
                        Ok(chunker) => chunker,
                        Err(e) => {
                            warn!(path, "chunker setup failed: {e}");
                            if msg_tx.send(WriterMsg::Error).is_err() {
                                return;
                            }
                            continue;
                        }
                    };

                    let mut macs = Vec::new();
                    let mut size = 0u64;
                    let mut failed = false;
                    for chunk in chunker {
                        match chunk {
                            Ok(chunk) => {
                                size += chunk.data.len() as u64;
                                macs.push(chunk.mac);
                                if msg_tx.send(WriterMsg::Chunk { data: chunk.data }).is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                warn!(path, "read error: {e}");
                                failed = true;
                                break;
                            }
                        }
                    }

                    let msg = if failed {
                        WriterMsg::Error
                    } else {
                        WriterMsg::File(FileEntry {
                            path,
                            size,
                            chunks: macs,
                        })
                    };
                    if msg_tx.send(msg).is_err() {
                        return;
                    }
                }
            });
        }
        drop(msg_tx);

        let mut files: Vec<FileEntry> = Vec::new();
        let mut session = repo.session();
        for msg in msg_rx.iter() {
            ctx.check_cancelled()?;
            match msg {
                WriterMsg::Chunk { data } => {
                    session.put_blob(ResourceType::Chunk, &data)?;
                    stats.chunks += 1;
                }
                WriterMsg::File(entry) => {
                    stats.files += 1;
                    stats.bytes += entry.size;
                    files.push(entry);
                }
                WriterMsg::Error => stats.errors += 1,
            }
        }

        // Snapshot documents are deterministic for a given content set.
        files.sort_by(|a, b| a.path.cmp(&b.path));
        let snapshot = Snapshot {
            name: options.name.clone(),
            created: Utc::now(),
            total_size: stats.bytes,
            files,
        };
        let doc = rmp_serde::to_vec(&snapshot)?;
        let snapshot_mac = session.put_blob(ResourceType::Snapshot, &doc)?;
        session.record_snapshot(snapshot_mac);
        let state_mac = session
            .commit()?
            .ok_or_else(|| CairnError::Other("backup produced an empty delta".into()))?;

        debug!(
            snapshot = %snapshot_mac,
            state = %state_mac,
            files = stats.files,
            chunks = stats.chunks,
            "backup committed"
        );
        Ok(snapshot_mac)
    })?;

    Ok((snapshot_mac, stats))
}
