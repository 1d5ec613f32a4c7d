//! Device geometry and the cluster layout derived from it
//!
//! A device is split into sectors (the erase unit) and each sector into
//! clusters (the allocation unit). The first cluster of a file carries the
//! file name and creation time, so it stores fewer data bytes than every
//! following cluster; [`Layout::locate`] maps file offsets across that
//! asymmetry.

use crate::core::cluster::{COMMON_HEADER_SIZE, HEADER_CLUSTER_SIZE};
use crate::core::error::{FlashError, Result};
use serde::{Deserialize, Serialize};

/// Physical geometry reported by a block device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Total device size in bytes
    pub device_size: u64,

    /// Erase unit in bytes
    pub sector_size: u32,

    /// Allocation unit in bytes (a multiple of the physical page size)
    pub cluster_size: u32,
}

impl Geometry {
    pub fn new(device_size: u64, sector_size: u32, cluster_size: u32) -> Self {
        Geometry {
            device_size,
            sector_size,
            cluster_size,
        }
    }

    /// Check that the geometry can host the on-device cluster format
    pub fn validate(&self) -> Result<()> {
        if self.cluster_size as usize <= HEADER_CLUSTER_SIZE {
            return Err(FlashError::InvalidGeometry(format!(
                "cluster size {} must exceed the {}-byte header cluster overhead",
                self.cluster_size, HEADER_CLUSTER_SIZE
            )));
        }

        if self.cluster_size as usize - COMMON_HEADER_SIZE > u16::MAX as usize {
            return Err(FlashError::InvalidGeometry(format!(
                "cluster size {} is too large for a 16-bit data length",
                self.cluster_size
            )));
        }

        if self.sector_size == 0 || self.sector_size % self.cluster_size != 0 {
            return Err(FlashError::InvalidGeometry(format!(
                "sector size {} is not a multiple of cluster size {}",
                self.sector_size, self.cluster_size
            )));
        }

        if self.device_size == 0 || self.device_size % self.sector_size as u64 != 0 {
            return Err(FlashError::InvalidGeometry(format!(
                "device size {} is not a multiple of sector size {}",
                self.device_size, self.sector_size
            )));
        }

        if self.device_size / self.cluster_size as u64 > u32::MAX as u64 {
            return Err(FlashError::InvalidGeometry(format!(
                "device size {} holds too many clusters",
                self.device_size
            )));
        }

        Ok(())
    }

    pub fn clusters_per_sector(&self) -> u32 {
        self.sector_size / self.cluster_size
    }

    pub fn sector_count(&self) -> u32 {
        (self.device_size / self.sector_size as u64) as u32
    }

    pub fn total_clusters(&self) -> u32 {
        (self.device_size / self.cluster_size as u64) as u32
    }
}

/// Cluster bookkeeping derived from a validated [`Geometry`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub cluster_size: usize,
    pub clusters_per_sector: u32,
    pub sector_count: u32,
    pub total_clusters: u32,
}

impl Layout {
    pub fn new(geometry: &Geometry) -> Result<Self> {
        geometry.validate()?;
        Ok(Layout {
            cluster_size: geometry.cluster_size as usize,
            clusters_per_sector: geometry.clusters_per_sector(),
            sector_count: geometry.sector_count(),
            total_clusters: geometry.total_clusters(),
        })
    }

    /// Data bytes held by the header cluster (block 0)
    pub fn header_data_capacity(&self) -> usize {
        self.cluster_size - HEADER_CLUSTER_SIZE
    }

    /// Data bytes held by every cluster after the header cluster
    pub fn data_cluster_capacity(&self) -> usize {
        self.cluster_size - COMMON_HEADER_SIZE
    }

    pub fn capacity_of(&self, block_id: usize) -> usize {
        if block_id == 0 {
            self.header_data_capacity()
        } else {
            self.data_cluster_capacity()
        }
    }

    /// Map a file-relative byte position to `(block index, offset in block)`
    pub fn locate(&self, position: u64) -> (usize, usize) {
        let header = self.header_data_capacity() as u64;
        if position < header {
            (0, position as usize)
        } else {
            let adjusted = position - header;
            let data = self.data_cluster_capacity() as u64;
            ((adjusted / data) as usize + 1, (adjusted % data) as usize)
        }
    }

    /// File-relative position of the first byte stored in `block_id`
    pub fn block_start(&self, block_id: usize) -> u64 {
        if block_id == 0 {
            0
        } else {
            self.header_data_capacity() as u64
                + (block_id as u64 - 1) * self.data_cluster_capacity() as u64
        }
    }

    pub fn sector_of(&self, cluster_id: u32) -> u32 {
        cluster_id / self.clusters_per_sector
    }

    pub fn first_cluster_of(&self, sector_id: u32) -> u32 {
        sector_id * self.clusters_per_sector
    }

    pub fn is_sector_start(&self, cluster_id: u32) -> bool {
        cluster_id % self.clusters_per_sector == 0
    }

    pub fn next_cluster(&self, cluster_id: u32) -> u32 {
        (cluster_id + 1) % self.total_clusters
    }

    pub fn next_sector(&self, sector_id: u32) -> u32 {
        (sector_id + 1) % self.sector_count
    }

    /// Distance travelled by the log from `from` to reach `cluster_id`
    pub fn log_distance(&self, from: u32, cluster_id: u32) -> u32 {
        (cluster_id + self.total_clusters - from) % self.total_clusters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(cluster_size: u32) -> Layout {
        Layout::new(&Geometry::new(64 * 1024, 4096, cluster_size)).unwrap()
    }

    #[test]
    fn test_derived_counts() {
        let layout = layout(512);
        assert_eq!(layout.clusters_per_sector, 8);
        assert_eq!(layout.sector_count, 16);
        assert_eq!(layout.total_clusters, 128);
        assert_eq!(layout.header_data_capacity(), 480);
        assert_eq!(layout.data_cluster_capacity(), 505);
    }

    #[test]
    fn test_locate_asymmetric_capacity() {
        let layout = layout(512);
        assert_eq!(layout.locate(0), (0, 0));
        assert_eq!(layout.locate(479), (0, 479));
        assert_eq!(layout.locate(480), (1, 0));
        assert_eq!(layout.locate(480 + 504), (1, 504));
        assert_eq!(layout.locate(480 + 505), (2, 0));
        assert_eq!(layout.locate(480 + 505 * 3 + 17), (4, 17));

        assert_eq!(layout.block_start(0), 0);
        assert_eq!(layout.block_start(1), 480);
        assert_eq!(layout.block_start(4), 480 + 505 * 3);
    }

    #[test]
    fn test_log_distance_wraps() {
        let layout = layout(512);
        assert_eq!(layout.log_distance(10, 12), 2);
        assert_eq!(layout.log_distance(120, 3), 11);
        assert_eq!(layout.next_cluster(127), 0);
        assert_eq!(layout.next_sector(15), 0);
    }

    #[test]
    fn test_invalid_geometries() {
        assert!(matches!(
            Geometry::new(64 * 1024, 4096, 32).validate(),
            Err(FlashError::InvalidGeometry(_))
        ));
        assert!(matches!(
            Geometry::new(64 * 1024, 4000, 512).validate(),
            Err(FlashError::InvalidGeometry(_))
        ));
        assert!(matches!(
            Geometry::new(64 * 1024 + 1, 4096, 512).validate(),
            Err(FlashError::InvalidGeometry(_))
        ));
        assert!(Geometry::new(64 * 1024, 4096, 4096).validate().is_ok());
    }
}
