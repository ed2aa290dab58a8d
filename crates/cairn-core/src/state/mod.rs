use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use cairn_types::error::{CairnError, Result};
use cairn_types::mac::Mac;
use cairn_types::resource::ResourceType;

use crate::caching::RepositoryCache;

/// Physical position of a blob: which packfile, and where inside its
/// payload the encoded bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator {
    pub packfile: Mac,
    pub offset: u64,
    pub length: u32,
}

/// One locator row in a state delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocatorEntry {
    pub resource: ResourceType,
    pub mac: Mac,
    pub packfile: Mac,
    pub offset: u64,
    pub length: u32,
}

/// Wire document for one state delta, msgpack-encoded then run through the
/// codec pipeline and framed as a `State` resource.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateDelta {
    pub serial: u64,
    pub locators: Vec<LocatorEntry>,
    pub snapshots: Vec<Mac>,
    pub tombstones: Vec<Mac>,
}

/// Value cached alongside each merged locator.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedLocator {
    locator: Locator,
    serial: u64,
}

/// In-memory authoritative state: the union of all known deltas, with the
/// local cache acting as durable merge accumulator.
///
/// Construction is deterministic for a fixed input set because callers
/// merge deltas in `(serial, state mac)` order.
pub struct LocalState {
    cache: Arc<RepositoryCache>,
    locators: HashMap<(ResourceType, Mac), (Locator, u64)>,
    snapshots: HashMap<Mac, u64>,
    deleted: HashMap<Mac, u64>,
    serial: u64,
}

impl LocalState {
    pub fn new(cache: Arc<RepositoryCache>) -> Self {
        Self {
            cache,
            locators: HashMap::new(),
            snapshots: HashMap::new(),
            deleted: HashMap::new(),
            serial: 0,
        }
    }

    /// Merge one delta into the aggregated state and mirror it in the cache.
    pub fn insert_state(&mut self, state_mac: Mac, payload: &[u8]) -> Result<()> {
        let delta: StateDelta = rmp_serde::from_slice(payload)
            .map_err(|_| CairnError::CorruptState(state_mac))?;
        self.cache.put_state(state_mac, payload)?;
        self.merge_delta(state_mac, &delta)?;
        Ok(())
    }

    /// Apply a parsed delta to the in-memory maps and cache tables.
    pub fn merge_delta(&mut self, state_mac: Mac, delta: &StateDelta) -> Result<()> {
        debug!(
            state = %state_mac,
            serial = delta.serial,
            locators = delta.locators.len(),
            snapshots = delta.snapshots.len(),
            tombstones = delta.tombstones.len(),
            "merging state delta"
        );

        let mut packfiles: HashSet<Mac> = HashSet::new();
        for entry in &delta.locators {
            let locator = Locator {
                packfile: entry.packfile,
                offset: entry.offset,
                length: entry.length,
            };
            let slot = self
                .locators
                .entry((entry.resource, entry.mac))
                .or_insert((locator, delta.serial));
            // Last writer wins; any winner is correct for a
            // content-addressed blob, ordering just keeps merges
            // deterministic.
            if delta.serial >= slot.1 {
                *slot = (locator, delta.serial);
            }
            let cached = CachedLocator {
                locator,
                serial: delta.serial,
            };
            self.cache
                .put_delta(entry.resource, entry.mac, &rmp_serde::to_vec(&cached)?)?;
            packfiles.insert(entry.packfile);
        }

        for &snapshot in &delta.snapshots {
            let slot = self.snapshots.entry(snapshot).or_insert(delta.serial);
            if delta.serial > *slot {
                *slot = delta.serial;
            }
        }

        for &snapshot in &delta.tombstones {
            let slot = self.deleted.entry(snapshot).or_insert(delta.serial);
            if delta.serial > *slot {
                *slot = delta.serial;
            }
            self.cache
                .put_deleted(ResourceType::Snapshot, snapshot, delta.serial)?;
        }

        for packfile in packfiles {
            self.cache.put_packfile(state_mac, packfile, &[])?;
        }

        if delta.serial > self.serial {
            self.serial = delta.serial;
        }
        Ok(())
    }

    /// Drop a state's local mirror (remote garbage collection already ran).
    pub fn forget_state(&self, state_mac: Mac) -> Result<()> {
        self.cache.del_state(state_mac)
    }

    /// MACs of all locally mirrored states.
    pub fn cache_state_macs(&self) -> Result<Vec<Mac>> {
        self.cache.state_macs()
    }

    /// Fetch a mirrored delta payload from the cache, if present.
    pub fn cached_state_payload(&self, state_mac: Mac) -> Result<Option<Vec<u8>>> {
        self.cache.get_state(state_mac)
    }

    /// Mirror a delta payload into the cache without merging it.
    pub fn cache_state_payload(&self, state_mac: Mac, payload: &[u8]) -> Result<()> {
        self.cache.put_state(state_mac, payload)
    }

    /// Initialise the serial counter: keep the merged maximum, or seed from
    /// the repository UUID when no delta has ever been written.
    pub fn update_serial_or(&mut self, seed: u64) {
        if self.serial == 0 {
            self.serial = seed;
        }
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn lookup(&self, resource: ResourceType, mac: Mac) -> Option<Locator> {
        self.locators.get(&(resource, mac)).map(|(loc, _)| *loc)
    }

    pub fn blob_exists(&self, resource: ResourceType, mac: Mac) -> bool {
        self.locators.contains_key(&(resource, mac))
    }

    /// A snapshot is visible unless tombstoned; a tombstone loses only to a
    /// re-declaration carrying a strictly greater serial.
    pub fn list_snapshots(&self) -> Vec<Mac> {
        let mut snapshots: Vec<Mac> = self
            .snapshots
            .iter()
            .filter(|(mac, &added)| match self.deleted.get(*mac) {
                Some(&removed) => added > removed,
                None => true,
            })
            .map(|(mac, _)| *mac)
            .collect();
        snapshots.sort();
        snapshots
    }

    pub fn snapshot_visible(&self, mac: Mac) -> bool {
        match (self.snapshots.get(&mac), self.deleted.get(&mac)) {
            (Some(&added), Some(&removed)) => added > removed,
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// Fork a delta writer whose serial follows the aggregated maximum.
    pub fn derive(&self) -> DeltaWriter {
        DeltaWriter::new(self.serial + 1)
    }
}

/// Accumulates one session's mutations; serialized once on commit and
/// immutable afterwards.
pub struct DeltaWriter {
    delta: StateDelta,
    seen: HashSet<(ResourceType, Mac)>,
}

impl DeltaWriter {
    fn new(serial: u64) -> Self {
        Self {
            delta: StateDelta {
                serial,
                ..StateDelta::default()
            },
            seen: HashSet::new(),
        }
    }

    pub fn serial(&self) -> u64 {
        self.delta.serial
    }

    pub fn push_locator(&mut self, resource: ResourceType, mac: Mac, locator: Locator) {
        if !self.seen.insert((resource, mac)) {
            return;
        }
        self.delta.locators.push(LocatorEntry {
            resource,
            mac,
            packfile: locator.packfile,
            offset: locator.offset,
            length: locator.length,
        });
    }

    pub fn has_locator(&self, resource: ResourceType, mac: Mac) -> bool {
        self.seen.contains(&(resource, mac))
    }

    pub fn record_snapshot(&mut self, mac: Mac) {
        if !self.delta.snapshots.contains(&mac) {
            self.delta.snapshots.push(mac);
        }
    }

    pub fn record_tombstone(&mut self, mac: Mac) {
        if !self.delta.tombstones.contains(&mac) {
            self.delta.tombstones.push(mac);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.delta.locators.is_empty()
            && self.delta.snapshots.is_empty()
            && self.delta.tombstones.is_empty()
    }

    pub fn delta(&self) -> &StateDelta {
        &self.delta
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(&self.delta)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caching::RepositoryCache;

    fn state() -> (tempfile::TempDir, LocalState) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(RepositoryCache::open(&dir.path().join("c.redb")).unwrap());
        (dir, LocalState::new(cache))
    }

    fn mac(byte: u8) -> Mac {
        Mac([byte; 32])
    }

    fn locator(pf: u8, offset: u64) -> Locator {
        Locator {
            packfile: mac(pf),
            offset,
            length: 100,
        }
    }

    fn delta_with(
        serial: u64,
        locators: &[(u8, u8)],
        snapshots: &[u8],
        tombstones: &[u8],
    ) -> StateDelta {
        StateDelta {
            serial,
            locators: locators
                .iter()
                .map(|&(blob, pf)| LocatorEntry {
                    resource: ResourceType::Chunk,
                    mac: mac(blob),
                    packfile: mac(pf),
                    offset: 0,
                    length: 100,
                })
                .collect(),
            snapshots: snapshots.iter().map(|&b| mac(b)).collect(),
            tombstones: tombstones.iter().map(|&b| mac(b)).collect(),
        }
    }

    #[test]
    fn merge_is_commutative_over_locator_insertions() {
        let a = delta_with(10, &[(1, 0xA0), (2, 0xA0)], &[0x51], &[]);
        let b = delta_with(11, &[(3, 0xB0)], &[0x52], &[]);
        let c = delta_with(12, &[(1, 0xC0)], &[], &[0x51]);

        let mut orders = Vec::new();
        for order in [
            [&a, &b, &c],
            [&c, &b, &a],
            [&b, &a, &c],
            [&c, &a, &b],
        ] {
            let (_dir, mut state) = state();
            for (i, delta) in order.iter().enumerate() {
                state.merge_delta(mac(0xF0 + i as u8), delta).unwrap();
            }
            let mut locators: Vec<_> = state
                .locators
                .iter()
                .map(|(&(_, m), &(loc, _))| (m, loc.packfile))
                .collect();
            locators.sort();
            orders.push((locators, state.list_snapshots()));
        }
        for window in orders.windows(2) {
            assert_eq!(window[0], window[1]);
        }
    }

    #[test]
    fn higher_serial_wins_locator_conflicts() {
        let (_dir, mut state) = state();
        state
            .merge_delta(mac(0xF1), &delta_with(5, &[(1, 0xA0)], &[], &[]))
            .unwrap();
        state
            .merge_delta(mac(0xF2), &delta_with(9, &[(1, 0xB0)], &[], &[]))
            .unwrap();
        assert_eq!(
            state.lookup(ResourceType::Chunk, mac(1)).unwrap().packfile,
            mac(0xB0)
        );
    }

    #[test]
    fn tombstone_hides_snapshot() {
        let (_dir, mut state) = state();
        state
            .merge_delta(mac(0xF1), &delta_with(5, &[], &[0x51, 0x52], &[]))
            .unwrap();
        state
            .merge_delta(mac(0xF2), &delta_with(6, &[], &[], &[0x51]))
            .unwrap();
        assert_eq!(state.list_snapshots(), vec![mac(0x52)]);
        assert!(!state.snapshot_visible(mac(0x51)));
    }

    #[test]
    fn readd_with_strictly_greater_serial_revives_snapshot() {
        let (_dir, mut state) = state();
        state
            .merge_delta(mac(0xF1), &delta_with(5, &[], &[0x51], &[]))
            .unwrap();
        state
            .merge_delta(mac(0xF2), &delta_with(6, &[], &[], &[0x51]))
            .unwrap();
        assert!(!state.snapshot_visible(mac(0x51)));

        // Equal serial does not revive.
        state
            .merge_delta(mac(0xF3), &delta_with(6, &[], &[0x51], &[]))
            .unwrap();
        assert!(!state.snapshot_visible(mac(0x51)));

        // Strictly greater serial does.
        state
            .merge_delta(mac(0xF4), &delta_with(7, &[], &[0x51], &[]))
            .unwrap();
        assert!(state.snapshot_visible(mac(0x51)));
    }

    #[test]
    fn serial_seeds_from_uuid_when_no_deltas() {
        let (_dir, mut state) = state();
        state.update_serial_or(0xDEAD_BEEF);
        assert_eq!(state.serial(), 0xDEAD_BEEF);
        assert_eq!(state.derive().serial(), 0xDEAD_BEF0);
    }

    #[test]
    fn serial_keeps_merged_maximum() {
        let (_dir, mut state) = state();
        state
            .merge_delta(mac(0xF1), &delta_with(41, &[], &[], &[]))
            .unwrap();
        state.update_serial_or(7);
        assert_eq!(state.serial(), 41);
    }

    #[test]
    fn delta_writer_dedups_and_serializes() {
        let (_dir, state) = state();
        let mut writer = DeltaWriter::new(3);
        writer.push_locator(ResourceType::Chunk, mac(1), locator(0xA0, 0));
        writer.push_locator(ResourceType::Chunk, mac(1), locator(0xB0, 9));
        writer.record_snapshot(mac(0x51));
        drop(state);

        let bytes = writer.serialize().unwrap();
        let parsed: StateDelta = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(parsed.serial, 3);
        assert_eq!(parsed.locators.len(), 1);
        assert_eq!(parsed.locators[0].packfile, mac(0xA0));
        assert_eq!(parsed.snapshots, vec![mac(0x51)]);
    }
}
