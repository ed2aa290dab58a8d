use std::collections::HashSet;

use tracing::{debug, info, warn};

use cairn_types::error::{CairnError, Result};
use cairn_types::mac::Mac;
use cairn_types::resource::ResourceType;

use crate::repo::Repository;
use crate::snapshot::Snapshot;
use crate::state::Locator;

pub struct MaintenanceOptions {
    /// Packfiles whose live fraction falls below this are rewritten.
    pub live_threshold: f64,
}

impl Default for MaintenanceOptions {
    fn default() -> Self {
        Self {
            live_threshold: 0.5,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct MaintenanceStats {
    pub packfiles_kept: usize,
    pub packfiles_rewritten: usize,
    pub packfiles_deleted: usize,
    pub states_pruned: usize,
    pub blobs_moved: usize,
}

/// Offline space reclamation.
///
/// Walks all non-tombstoned snapshots to compute the live blob set, moves
/// live blobs out of packfiles whose live fraction is below the threshold,
/// consolidates the authoritative state into a single delta, prunes the
/// superseded remote states, and finally deletes the now-orphan packfiles.
/// Tombstones only ever subtract snapshots; this is the sole reclaimer of
/// chunk bytes.
pub fn maintenance(
    repo: &mut Repository,
    options: &MaintenanceOptions,
) -> Result<MaintenanceStats> {
    let ctx = repo.context().clone();
    let mut stats = MaintenanceStats::default();

    // Live set: every blob reachable from a visible snapshot.
    let snapshots = repo.list_snapshots();
    let mut live: HashSet<(ResourceType, Mac)> = HashSet::new();
    for &snapshot_mac in &snapshots {
        ctx.check_cancelled()?;
        live.insert((ResourceType::Snapshot, snapshot_mac));
        let snapshot = Snapshot::load(repo, snapshot_mac)?;
        for file in &snapshot.files {
            for &chunk in &file.chunks {
                live.insert((ResourceType::Chunk, chunk));
            }
        }
    }
    debug!(snapshots = snapshots.len(), live_blobs = live.len(), "computed live set");

    // Classify packfiles by the live fraction of their indexed bytes.
    let mut doomed: Vec<Mac> = Vec::new();
    let mut rewrite: Vec<Mac> = Vec::new();
    for packfile in repo.list_packfiles()? {
        ctx.check_cancelled()?;
        let entries = match repo.get_packfile_index(packfile) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(packfile = %packfile, "unreadable packfile index, leaving in place: {e}");
                stats.packfiles_kept += 1;
                continue;
            }
        };

        let total: u64 = entries.iter().map(|e| e.length as u64).sum();
        let live_bytes: u64 = entries
            .iter()
            .filter(|e| live.contains(&(e.resource, e.mac)))
            .map(|e| e.length as u64)
            .sum();

        if live_bytes == 0 {
            doomed.push(packfile);
        } else if (live_bytes as f64) < (total as f64) * options.live_threshold {
            rewrite.push(packfile);
        } else {
            stats.packfiles_kept += 1;
        }
    }

    // Gather the live blobs that have to move before touching any state.
    let mut moved: Vec<(ResourceType, Mac, Vec<u8>)> = Vec::new();
    let mut retired: HashSet<Mac> = doomed.iter().copied().collect();
    for &packfile in &rewrite {
        ctx.check_cancelled()?;
        let payload = repo.get_packfile_payload(packfile)?;
        let entries = repo.get_packfile_index(packfile)?;
        for entry in entries {
            if !live.contains(&(entry.resource, entry.mac)) {
                continue;
            }
            let start = entry.offset as usize;
            let end = start + entry.length as usize;
            let encoded = payload
                .get(start..end)
                .ok_or(CairnError::CorruptPackfile(packfile))?;
            let data = repo
                .decode_buffer(encoded)
                .map_err(|_| CairnError::CorruptBlob(entry.mac))?;
            if repo.compute_mac(&data) != entry.mac {
                return Err(CairnError::CorruptBlob(entry.mac));
            }
            moved.push((entry.resource, entry.mac, data));
        }
        retired.insert(packfile);
    }

    // Locators to carry forward unchanged: live blobs in kept packfiles.
    let mut carried: Vec<(ResourceType, Mac, Locator)> = Vec::new();
    for &(resource, mac) in &live {
        if let Some(locator) = repo.state_locator(resource, mac) {
            if !retired.contains(&locator.packfile) {
                carried.push((resource, mac, locator));
            }
        }
    }
    carried.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

    // One consolidated delta: moved blobs get fresh locators, carried
    // blobs keep theirs, every visible snapshot is re-declared.
    let mut session = repo.session();
    for (resource, _, data) in &moved {
        session.rewrite_blob(*resource, data)?;
        stats.blobs_moved += 1;
    }
    for (resource, mac, locator) in carried {
        session.record_locator(resource, mac, locator);
    }
    for &snapshot_mac in &snapshots {
        session.record_snapshot(snapshot_mac);
    }
    let new_state = session.commit()?;

    // Prune superseded states; the consolidated delta replaces them all.
    for state_mac in repo.list_states()? {
        if Some(state_mac) == new_state {
            continue;
        }
        repo.delete_state(state_mac)?;
        repo.forget_cached_state(state_mac)?;
        stats.states_pruned += 1;
    }

    // Packfiles are deleted last so no state ever references bytes that
    // are already gone.
    for packfile in doomed.iter().chain(rewrite.iter()) {
        repo.delete_packfile(*packfile)?;
        stats.packfiles_deleted += 1;
    }
    stats.packfiles_rewritten = rewrite.len();

    info!(
        rewritten = stats.packfiles_rewritten,
        deleted = stats.packfiles_deleted,
        pruned_states = stats.states_pruned,
        "maintenance finished"
    );
    Ok(stats)
}
