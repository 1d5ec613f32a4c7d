//! Compactor
//!
//! Reclaims sectors holding orphaned clusters. A sector is migrated by
//! copying its allocated clusters elsewhere and erasing it. When the migrated
//! sector is not the head, the head sector is then moved into the freed
//! sector so the free region stays a single run ending at the head.
//!
//! Each step strictly lowers the orphan count, so full compaction terminates.

use crate::core::cluster::{Marker, COMMON_HEADER_SIZE};
use crate::core::device::BlockDevice;
use crate::core::engine::Engine;
use crate::core::error::{FlashError, Result};
use tracing::{debug, info, trace};

impl<D: BlockDevice> Engine<D> {
    /// Compact until no orphaned cluster is left
    pub fn compact(&mut self) -> Result<()> {
        self.ensure_mounted()?;
        let before = self.orphaned_clusters;
        let mut steps = 0;
        while self.orphaned_clusters > 0 {
            if !self.compact_step()? {
                break;
            }
            steps += 1;
        }
        info!(
            "Compaction reclaimed {} clusters in {} steps ({} free)",
            before.saturating_sub(self.orphaned_clusters),
            steps,
            self.free_clusters
        );
        Ok(())
    }

    /// Compact only until free space rises above the reserve
    pub(crate) fn compact_partial(&mut self) -> Result<()> {
        let reserved = self.reserved_clusters();
        while self.free_clusters <= reserved && self.orphaned_clusters > 0 {
            if !self.compact_step()? {
                break;
            }
        }
        debug!(
            "Partial compaction done: {} free, {} orphaned",
            self.free_clusters, self.orphaned_clusters
        );
        Ok(())
    }

    /// Reclaim one sector; false when nothing can be reclaimed
    fn compact_step(&mut self) -> Result<bool> {
        let sector = match self.pick_sector_to_compact() {
            Some(sector) => sector,
            None => {
                // The only reclaimable garbage sits in the tail sector: close it off first
                let tail_sector = self.layout.sector_of(self.tail_cluster);
                if self.sector_orphans[tail_sector as usize] == 0
                    || self.layout.clusters_per_sector - self.sector_orphans[tail_sector as usize]
                        > self.free_clusters
                    || !self.seal_tail_sector()?
                {
                    return Ok(false);
                }
                match self.pick_sector_to_compact() {
                    Some(sector) => sector,
                    None => return Ok(false),
                }
            }
        };

        let head = self.head_sector;
        let mut reclaimed = self.migrate_sector(sector, None)?;
        if sector != head {
            let target = self.layout.first_cluster_of(sector);
            reclaimed += self.migrate_sector(head, Some(target))?;
        }
        self.head_sector = self.layout.next_sector(head);
        trace!(
            "Compaction step on sector {} reclaimed {} clusters",
            sector,
            reclaimed
        );
        Ok(true)
    }

    /// Head sector if it holds garbage, else the sector with the most
    /// orphans outside the tail sector
    ///
    /// Only sectors whose live clusters fit in the free region qualify, so a
    /// head that cannot move yet gives way to a sector that can.
    pub(crate) fn pick_sector_to_compact(&self) -> Option<u32> {
        let head = self.head_sector;
        if self.sector_orphans[head as usize] > 0 && self.fits_at_tail(head) {
            return Some(head);
        }

        let tail_sector = self.layout.sector_of(self.tail_cluster);
        let mut best: Option<(u32, u32)> = None;
        for (sector, &orphans) in self.sector_orphans.iter().enumerate() {
            let sector = sector as u32;
            if sector == tail_sector || orphans == 0 || !self.fits_at_tail(sector) {
                continue;
            }
            if best.map_or(true, |(_, most)| orphans > most) {
                best = Some((sector, orphans));
            }
        }
        best.map(|(sector, _)| sector)
    }

    /// Erased clusters of `sector` that belong to the free region
    fn free_in_sector(&self, sector: u32) -> u32 {
        if self.free_clusters == 0 || self.layout.sector_of(self.tail_cluster) != sector {
            return 0;
        }
        let end = self.layout.first_cluster_of(sector) + self.layout.clusters_per_sector;
        (end - self.tail_cluster).min(self.free_clusters)
    }

    /// Allocated clusters of `sector`
    fn live_in_sector(&self, sector: u32) -> u32 {
        self.layout
            .clusters_per_sector
            .saturating_sub(self.sector_orphans[sector as usize] + self.free_in_sector(sector))
    }

    /// True when the live clusters of `sector` can be moved to the tail
    fn fits_at_tail(&self, sector: u32) -> bool {
        self.live_in_sector(sector) <= self.free_clusters - self.free_in_sector(sector)
    }

    /// Orphan the erased rest of the tail sector and move the tail to the
    /// next sector boundary; false when the tail already sits on a boundary
    pub(crate) fn seal_tail_sector(&mut self) -> Result<bool> {
        if self.layout.is_sector_start(self.tail_cluster) || self.free_clusters == 0 {
            return Ok(false);
        }

        let end = self.layout.first_cluster_of(self.layout.sector_of(self.tail_cluster))
            + self.layout.clusters_per_sector;
        let mut sealed = 0;
        for cluster_id in self.tail_cluster..end {
            self.orphan_cluster(cluster_id)?;
            self.free_clusters -= 1;
            sealed += 1;
        }
        self.tail_cluster = self.layout.next_cluster(end - 1);
        trace!("Sealed {} clusters of the tail sector", sealed);
        Ok(true)
    }

    /// Move the live clusters of `sector` to the tail (or into the erased
    /// sector starting at `target`), then erase it
    ///
    /// Returns the number of garbage clusters the erase reclaimed.
    pub(crate) fn migrate_sector(&mut self, sector: u32, target: Option<u32>) -> Result<u32> {
        let cps = self.layout.clusters_per_sector;
        if target.is_none() && self.layout.sector_of(self.tail_cluster) == sector {
            self.seal_tail_sector()?;
        }
        if target.is_none() && self.live_in_sector(sector) > self.free_clusters {
            return Err(FlashError::DiskFull);
        }

        let first = self.layout.first_cluster_of(sector);
        let mut next_target = target;
        let mut already_free = 0;
        let mut moved = 0;

        for cluster_id in first..first + cps {
            self.defrag.clear();
            self.device
                .read(cluster_id, 0, &mut self.defrag.as_mut_bytes()[..COMMON_HEADER_SIZE])?;

            match self.defrag.marker() {
                Some(Marker::FormattedSector) if cluster_id == first => {
                    already_free = cps;
                    break;
                }
                Some(marker) if marker.is_free() => already_free += 1,
                Some(Marker::AllocatedCluster) => {
                    let object_id = self.defrag.object_id();
                    let block_id = self.defrag.block_id();
                    if !self.index.owns(object_id, block_id, cluster_id) {
                        self.orphan_cluster(cluster_id)?;
                        continue;
                    }

                    self.device.read(cluster_id, 0, self.defrag.as_mut_bytes())?;
                    let destination = match next_target {
                        Some(destination) => {
                            next_target = Some(destination + 1);
                            self.free_clusters -= 1;
                            destination
                        }
                        None => self.claim_tail()?,
                    };

                    self.defrag.set_marker(Marker::PendingCluster);
                    self.device.write(destination, 0, self.defrag.as_bytes())?;
                    self.set_marker(destination, Marker::AllocatedCluster)?;
                    self.orphan_cluster(cluster_id)?;
                    if let Some(record) = self.index.get_mut(object_id) {
                        record.blocks[block_id as usize] = destination;
                    }
                    moved += 1;
                    trace!(
                        "Moved object {} block {} from cluster {} to {}",
                        object_id,
                        block_id,
                        cluster_id,
                        destination
                    );
                }
                // Orphaned or pending: reclaimed by the erase
                _ => {}
            }
        }

        // Whatever the target sector did not receive is closed off
        if let (Some(target_start), Some(next)) = (target, next_target) {
            for cluster_id in next..target_start + cps {
                self.orphan_cluster(cluster_id)?;
                self.free_clusters -= 1;
            }
        }

        self.device.erase_sector(sector)?;
        self.set_marker(first, Marker::FormattedSector)?;
        self.free_clusters += cps - already_free;
        self.orphaned_clusters -= self.sector_orphans[sector as usize];
        self.sector_orphans[sector as usize] = 0;

        let reclaimed = cps - already_free - moved;
        debug!(
            "Migrated sector {} ({} live clusters moved{}, {} reclaimed)",
            sector,
            moved,
            if target.is_some() { " into freed sector" } else { "" },
            reclaimed
        );
        Ok(reclaimed)
    }
}
