//! Mount scan and format
//!
//! Nothing but cluster markers is trusted at mount. The scan reads every
//! common header once, rebuilds the file index, locates the log's free run
//! and repairs whatever an interrupted operation left behind:
//!
//! - two allocated copies of one block keep the one written later in log order
//! - a file without its header cluster is dropped
//! - a block list is cut at its first gap or first short non-final block
//! - erased clusters outside the main free run are orphaned
//!
//! Repairs are programmed to flash, so mounting again finds nothing to repair
//! and rebuilds the same state.

use crate::core::cluster::{Marker, HEADER_CLUSTER_SIZE};
use crate::core::device::BlockDevice;
use crate::core::engine::Engine;
use crate::core::error::{FlashError, Result};
use crate::core::index::FileRecord;
use ahash::AHashMap;
use tracing::{info, warn};

/// Allocated cluster found by the scan
#[derive(Debug, Clone, Copy)]
struct ScannedCluster {
    cluster_id: u32,
    object_id: u16,
    block_id: u16,
    data_length: u16,
}

impl<D: BlockDevice> Engine<D> {
    /// Rebuild all in-memory state from the device
    ///
    /// All-or-nothing: on failure the index is left empty and the engine
    /// stays unmounted.
    pub fn mount(&mut self) -> Result<()> {
        if self.index.any_open() {
            return Err(FlashError::FileInUse(
                "cannot remount with open handles".to_string(),
            ));
        }

        self.reset_state();
        match self.scan() {
            Ok(()) => {
                self.mounted = true;
                info!(
                    "Mounted {} files: {} free, {} orphaned, head sector {}, tail cluster {}",
                    self.index.len(),
                    self.free_clusters,
                    self.orphaned_clusters,
                    self.head_sector,
                    self.tail_cluster
                );
                Ok(())
            }
            Err(e) => {
                self.reset_state();
                Err(e)
            }
        }
    }

    /// Erase the device, mark every sector formatted and mount it empty
    pub fn format(&mut self) -> Result<()> {
        if self.index.any_open() {
            return Err(FlashError::FileInUse(
                "cannot format with open handles".to_string(),
            ));
        }

        self.reset_state();
        self.device.erase_chip()?;
        for sector in 0..self.layout.sector_count {
            self.set_marker(self.layout.first_cluster_of(sector), Marker::FormattedSector)?;
        }
        info!(
            "Formatted {} sectors of {} clusters",
            self.layout.sector_count, self.layout.clusters_per_sector
        );
        self.mount()
    }

    fn scan(&mut self) -> Result<()> {
        let total = self.layout.total_clusters;
        let cps = self.layout.clusters_per_sector;
        let mut free_map = vec![false; total as usize];
        let mut allocated = Vec::new();

        let mut cluster_id = 0;
        while cluster_id < total {
            self.read_common_header(cluster_id)?;
            let marker = self.cluster.marker().ok_or_else(|| {
                FlashError::NotFormatted(format!(
                    "cluster {} has unknown marker {:#04x}",
                    cluster_id,
                    self.cluster.marker_byte()
                ))
            })?;

            match marker {
                Marker::FormattedSector => {
                    if !self.layout.is_sector_start(cluster_id) {
                        return Err(FlashError::NotFormatted(format!(
                            "sector marker inside sector at cluster {}",
                            cluster_id
                        )));
                    }
                    for free in &mut free_map[cluster_id as usize..(cluster_id + cps) as usize] {
                        *free = true;
                    }
                    cluster_id += cps;
                    continue;
                }
                Marker::Erased => free_map[cluster_id as usize] = true,
                Marker::PendingCluster | Marker::OrphanedCluster => {
                    self.orphaned_clusters += 1;
                    self.sector_orphans[self.layout.sector_of(cluster_id) as usize] += 1;
                }
                Marker::AllocatedCluster => {
                    let scanned = ScannedCluster {
                        cluster_id,
                        object_id: self.cluster.object_id(),
                        block_id: self.cluster.block_id(),
                        data_length: self.cluster.data_length(),
                    };
                    if scanned.block_id as u32 >= total
                        || scanned.data_length as usize
                            > self.layout.capacity_of(scanned.block_id as usize)
                    {
                        return Err(FlashError::NotFormatted(format!(
                            "cluster {} has block {} with {} data bytes",
                            cluster_id, scanned.block_id, scanned.data_length
                        )));
                    }
                    allocated.push(scanned);
                }
            }
            cluster_id += 1;
        }

        self.locate_log(&free_map)?;
        let latest = self.resolve_duplicates(allocated)?;
        self.rebuild_index(latest)
    }

    /// Find the main free run, seal stray erased clusters and set the cursors
    fn locate_log(&mut self, free_map: &[bool]) -> Result<()> {
        let total = self.layout.total_clusters;
        let (start, mut length) = match longest_free_run(free_map) {
            Some(run) => run,
            None => return Ok(()),
        };
        if length == total {
            self.free_clusters = total;
            return Ok(());
        }

        // The run has to end on a sector boundary, where the head begins
        let end = (start + length) % total;
        let head_sector = self.layout.sector_of(end);
        let head_start = self.layout.first_cluster_of(head_sector);
        let overhang = end - head_start;
        length = length.saturating_sub(overhang);

        let mut sealed = 0;
        for (cluster_id, &free) in free_map.iter().enumerate() {
            let cluster_id = cluster_id as u32;
            if free && self.layout.log_distance(start, cluster_id) >= length {
                self.orphan_cluster(cluster_id)?;
                sealed += 1;
            }
        }
        if sealed > 0 {
            warn!("Sealed {} erased clusters outside the free region", sealed);
        }

        if length > 0 {
            self.free_clusters = length;
            self.tail_cluster = start;
            self.head_sector = head_sector;
        }
        Ok(())
    }

    /// Keep the later copy of every (object, block) pair, orphan the rest
    fn resolve_duplicates(
        &mut self,
        allocated: Vec<ScannedCluster>,
    ) -> Result<AHashMap<(u16, u16), ScannedCluster>> {
        let log_start = self.layout.first_cluster_of(self.head_sector);
        let mut latest: AHashMap<(u16, u16), ScannedCluster> = AHashMap::new();
        let mut stale = Vec::new();

        for scanned in allocated {
            let key = (scanned.object_id, scanned.block_id);
            match latest.get(&key) {
                Some(current)
                    if self.layout.log_distance(log_start, current.cluster_id)
                        > self.layout.log_distance(log_start, scanned.cluster_id) =>
                {
                    stale.push(scanned.cluster_id);
                }
                Some(current) => {
                    stale.push(current.cluster_id);
                    latest.insert(key, scanned);
                }
                None => {
                    latest.insert(key, scanned);
                }
            }
        }

        for &cluster_id in &stale {
            self.orphan_cluster(cluster_id)?;
        }
        if !stale.is_empty() {
            warn!("Orphaned {} superseded duplicate clusters", stale.len());
        }
        Ok(latest)
    }

    /// Turn the surviving clusters into file records
    fn rebuild_index(&mut self, latest: AHashMap<(u16, u16), ScannedCluster>) -> Result<()> {
        let mut objects: AHashMap<u16, Vec<ScannedCluster>> = AHashMap::new();
        for scanned in latest.into_values() {
            objects.entry(scanned.object_id).or_default().push(scanned);
        }

        let mut object_ids: Vec<u16> = objects.keys().copied().collect();
        object_ids.sort_unstable();

        for object_id in object_ids {
            let mut clusters = objects.remove(&object_id).unwrap_or_default();
            clusters.sort_by_key(|scanned| scanned.block_id);

            // Longest valid prefix: blocks 0, 1, 2... with only the last one short
            let mut keep = 0;
            for (expected, scanned) in clusters.iter().enumerate() {
                if scanned.block_id as usize != expected {
                    break;
                }
                keep = expected + 1;
                if (scanned.data_length as usize) < self.layout.capacity_of(expected) {
                    break;
                }
            }

            if keep < clusters.len() {
                warn!(
                    "Object {}: dropping {} of {} clusters{}",
                    object_id,
                    clusters.len() - keep,
                    clusters.len(),
                    if keep == 0 { " (no header cluster)" } else { "" }
                );
                for scanned in &clusters[keep..] {
                    self.orphan_cluster(scanned.cluster_id)?;
                }
            }
            if keep == 0 {
                continue;
            }

            let header = clusters[0].cluster_id;
            self.cluster.clear();
            self.device
                .read(header, 0, &mut self.cluster.as_mut_bytes()[..HEADER_CLUSTER_SIZE])?;

            let mut record =
                FileRecord::new(object_id, self.cluster.file_name(), self.cluster.creation_time());
            for scanned in &clusters[..keep] {
                record.blocks.push(scanned.cluster_id);
                record.file_size += scanned.data_length as u32;
            }
            self.index.insert(record);
            self.last_object_id = self.last_object_id.max(object_id);
        }
        Ok(())
    }
}

/// Longest circular run of free clusters as `(start, length)`
fn longest_free_run(free_map: &[bool]) -> Option<(u32, u32)> {
    let total = free_map.len();
    let anchor = match free_map.iter().position(|&free| !free) {
        Some(anchor) => anchor,
        None => return if total == 0 { None } else { Some((0, total as u32)) },
    };

    let mut best: Option<(usize, usize)> = None;
    let mut run_start = 0;
    let mut run_length = 0;
    // Starting right after a used cluster, every run closes before wrapping
    for step in 1..=total {
        let cluster_id = (anchor + step) % total;
        if free_map[cluster_id] {
            if run_length == 0 {
                run_start = cluster_id;
            }
            run_length += 1;
        } else {
            if run_length > 0 && best.map_or(true, |(_, length)| run_length > length) {
                best = Some((run_start, run_length));
            }
            run_length = 0;
        }
    }
    best.map(|(start, length)| (start as u32, length as u32))
}
