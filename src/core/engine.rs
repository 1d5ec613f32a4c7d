//! Engine context
//!
//! One [`Engine`] owns the block device, the file index, the log cursors and
//! the two cluster scratch buffers. Every mutation of engine state goes
//! through a method on this type; callers serialize access with the lock in
//! [`crate::FlashFs`]. The mount, log, data and compaction paths live in
//! their own modules as further `impl` blocks.

use crate::core::cluster::{ClusterBuffer, Marker};
use crate::core::config::FsConfig;
use crate::core::device::BlockDevice;
use crate::core::error::{FlashError, Result};
use crate::core::geometry::Layout;
use crate::core::index::{fold_name, FileIndex, FileRecord};
use chrono::{DateTime, TimeZone, Utc};
use tracing::{debug, warn};

/// Largest object id handed out; `0xFFFF` is the erased pattern
pub const MAX_OBJECT_ID: u16 = 0xFFFE;

/// Creation-time ticks per second (100 ns resolution)
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Current time as 100 ns ticks since the Unix epoch
pub fn now_ticks() -> i64 {
    let now = Utc::now();
    now.timestamp() * TICKS_PER_SECOND + (now.timestamp_subsec_nanos() / 100) as i64
}

pub fn ticks_to_datetime(ticks: i64) -> DateTime<Utc> {
    let secs = ticks.div_euclid(TICKS_PER_SECOND);
    let nanos = (ticks.rem_euclid(TICKS_PER_SECOND) * 100) as u32;
    Utc.timestamp_opt(secs, nanos).single().unwrap_or_default()
}

/// Counter snapshot taken under the engine lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineCounters {
    pub free_clusters: u32,
    pub orphaned_clusters: u32,
    pub total_clusters: u32,
    pub file_count: usize,
    pub head_sector: u32,
    pub tail_cluster: u32,
}

/// Storage engine over a [`BlockDevice`]
pub struct Engine<D: BlockDevice> {
    /// Raw flash
    pub(crate) device: D,

    /// Cluster counts and capacities derived from the device geometry
    pub(crate) layout: Layout,

    pub(crate) config: FsConfig,

    /// Live files, rebuilt at mount
    pub(crate) index: FileIndex,

    pub(crate) mounted: bool,

    /// Erased clusters in front of the tail
    pub(crate) free_clusters: u32,

    /// Orphaned (and pending) clusters awaiting compaction
    pub(crate) orphaned_clusters: u32,

    /// Orphaned clusters per sector
    pub(crate) sector_orphans: Vec<u32>,

    /// Oldest sector that may still hold live data
    pub(crate) head_sector: u32,

    /// Next cluster the log writer programs
    pub(crate) tail_cluster: u32,

    /// Highest object id seen or assigned
    pub(crate) last_object_id: u16,

    /// Scratch image for file operations
    pub(crate) cluster: ClusterBuffer,

    /// Scratch image for compaction, so a compaction triggered mid-write
    /// leaves the pending write image intact
    pub(crate) defrag: ClusterBuffer,
}

impl<D: BlockDevice> Engine<D> {
    /// Create an unmounted engine
    pub fn new(device: D, config: FsConfig) -> Result<Self> {
        let geometry = device.geometry();
        let layout = Layout::new(&geometry)?;
        config.validate(&geometry)?;

        Ok(Engine {
            device,
            layout,
            config,
            index: FileIndex::new(),
            mounted: false,
            free_clusters: 0,
            orphaned_clusters: 0,
            sector_orphans: vec![0; layout.sector_count as usize],
            head_sector: 0,
            tail_cluster: 0,
            last_object_id: 0,
            cluster: ClusterBuffer::new(layout.cluster_size),
            defrag: ClusterBuffer::new(layout.cluster_size),
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn config(&self) -> &FsConfig {
        &self.config
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn is_mounted(&self) -> bool {
        self.mounted
    }

    pub(crate) fn ensure_mounted(&self) -> Result<()> {
        if self.mounted {
            Ok(())
        } else {
            Err(FlashError::NotMounted)
        }
    }

    /// Free clusters the log writer keeps back for compaction
    pub(crate) fn reserved_clusters(&self) -> u32 {
        self.config.reserved_sectors * self.layout.clusters_per_sector
    }

    /// Forget everything learned from the device
    pub(crate) fn reset_state(&mut self) {
        self.index.clear();
        self.mounted = false;
        self.free_clusters = 0;
        self.orphaned_clusters = 0;
        self.sector_orphans.fill(0);
        self.head_sector = 0;
        self.tail_cluster = 0;
        self.last_object_id = 0;
        self.cluster.clear();
        self.defrag.clear();
    }

    /// Program a single marker byte in place
    pub(crate) fn set_marker(&mut self, cluster_id: u32, marker: Marker) -> Result<()> {
        self.device.write(cluster_id, 0, &[marker as u8])
    }

    /// Mark a cluster orphaned and account for it
    pub(crate) fn orphan_cluster(&mut self, cluster_id: u32) -> Result<()> {
        self.set_marker(cluster_id, Marker::OrphanedCluster)?;
        self.orphaned_clusters += 1;
        self.sector_orphans[self.layout.sector_of(cluster_id) as usize] += 1;
        Ok(())
    }

    /// Read the 7-byte common header of `cluster_id` into the scratch image
    pub(crate) fn read_common_header(&mut self, cluster_id: u32) -> Result<()> {
        self.cluster.clear();
        self.device
            .read(cluster_id, 0, self.cluster.common_header_mut())
    }

    pub(crate) fn record(&self, object_id: u16) -> Result<&FileRecord> {
        self.index
            .get(object_id)
            .ok_or_else(|| FlashError::FileNotFound(format!("object {}", object_id)))
    }

    pub(crate) fn record_mut(&mut self, object_id: u16) -> Result<&mut FileRecord> {
        self.index
            .get_mut(object_id)
            .ok_or_else(|| FlashError::FileNotFound(format!("object {}", object_id)))
    }

    /// Resolve a user-supplied name to an object id
    pub fn lookup(&self, name: &str) -> Result<u16> {
        self.ensure_mounted()?;
        let folded = fold_name(name)?;
        self.index
            .find_by_name(&folded)
            .map(|record| record.object_id)
            .ok_or(FlashError::FileNotFound(folded))
    }

    /// Next object id: monotonic until exhausted, then the lowest unused id
    pub(crate) fn allocate_object_id(&mut self) -> Result<u16> {
        if self.last_object_id < MAX_OBJECT_ID {
            return Ok(self.last_object_id + 1);
        }
        (1..=MAX_OBJECT_ID)
            .find(|&id| !self.index.contains(id))
            .ok_or(FlashError::DiskFull)
    }

    fn note_object_id(&mut self, object_id: u16) {
        self.last_object_id = self.last_object_id.max(object_id);
    }

    /// Create an empty file and return its object id
    pub fn create_file(&mut self, name: &str) -> Result<u16> {
        self.ensure_mounted()?;
        let folded = fold_name(name)?;
        if self.index.find_by_name(&folded).is_some() {
            return Err(FlashError::FileAlreadyExists(folded));
        }

        let object_id = self.allocate_object_id()?;
        let created = now_ticks();

        self.cluster.clear();
        self.cluster.set_object_id(object_id);
        self.cluster.set_block_id(0);
        self.cluster.set_data_length(0);
        self.cluster.set_file_name(&folded);
        self.cluster.set_creation_time(created);
        let cluster_id = self.append_cluster()?;

        debug!("Created {} as object {} at cluster {}", folded, object_id, cluster_id);
        let mut record = FileRecord::new(object_id, folded, created);
        record.blocks.push(cluster_id);
        self.index.insert(record);
        self.note_object_id(object_id);
        Ok(object_id)
    }

    /// Delete a closed file
    pub fn delete_file(&mut self, name: &str) -> Result<()> {
        let object_id = self.lookup(name)?;
        let record = self.record(object_id)?.clone();
        if record.is_open() {
            return Err(FlashError::FileInUse(record.name));
        }

        // Header first: a record without its header is dropped at mount
        for &cluster_id in &record.blocks {
            self.orphan_cluster(cluster_id)?;
        }
        self.index.remove(object_id);
        debug!("Deleted {} ({} clusters)", record.name, record.blocks.len());
        Ok(())
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        self.ensure_mounted()?;
        let folded = fold_name(name)?;
        Ok(self.index.find_by_name(&folded).is_some())
    }

    /// Rename by rewriting the header cluster only
    pub fn rename_file(&mut self, source: &str, destination: &str) -> Result<()> {
        let object_id = self.lookup(source)?;
        let folded = fold_name(destination)?;
        if let Some(existing) = self.index.find_by_name(&folded) {
            if existing.object_id == object_id {
                return Ok(());
            }
            return Err(FlashError::FileAlreadyExists(folded));
        }

        let header = self.record(object_id)?.blocks[0];
        self.cluster.clear();
        self.device.read(header, 0, self.cluster.as_mut_bytes())?;
        self.cluster.set_file_name(&folded);
        let cluster_id = self.append_cluster()?;

        // Compaction may have relocated the header during the append
        let old = self.record(object_id)?.blocks[0];
        self.orphan_cluster(old)?;
        let record = self.record_mut(object_id)?;
        debug!("Renamed {} to {}", record.name, folded);
        record.blocks[0] = cluster_id;
        record.name = folded;
        Ok(())
    }

    /// Copy a file under a new object id; no cluster is shared with the source
    pub fn copy_file(&mut self, source: &str, destination: &str, overwrite: bool) -> Result<()> {
        let source_id = self.lookup(source)?;
        let folded = fold_name(destination)?;

        if let Some(existing) = self.index.find_by_name(&folded) {
            if existing.object_id == source_id || !overwrite {
                return Err(FlashError::FileAlreadyExists(folded));
            }
            self.delete_file(&folded)?;
        }

        let object_id = self.allocate_object_id()?;
        let created = now_ticks();
        match self.copy_blocks(source_id, object_id, &folded, created) {
            Ok(()) => {
                self.note_object_id(object_id);
                debug!("Copied object {} to {} (object {})", source_id, folded, object_id);
                Ok(())
            }
            Err(e) => {
                if let Some(partial) = self.index.remove(object_id) {
                    for cluster_id in partial.blocks {
                        if let Err(rollback) = self.orphan_cluster(cluster_id) {
                            warn!("Failed to release cluster {} of aborted copy: {}", cluster_id, rollback);
                        }
                    }
                }
                Err(e)
            }
        }
    }

    fn copy_blocks(&mut self, source_id: u16, object_id: u16, name: &str, created: i64) -> Result<()> {
        let mut block = 0;
        loop {
            // Re-resolve every block: appends may compact and move the source
            let source_cluster = match self.record(source_id)?.blocks.get(block) {
                Some(&cluster_id) => cluster_id,
                None => return Ok(()),
            };

            self.cluster.clear();
            self.device.read(source_cluster, 0, self.cluster.as_mut_bytes())?;
            self.cluster.set_object_id(object_id);
            if block == 0 {
                self.cluster.set_file_name(name);
                self.cluster.set_creation_time(created);
            }
            let length = self.cluster.data_length() as u32;
            let cluster_id = self.append_cluster()?;

            if block == 0 {
                // Insert right away so compaction treats the copy as live
                let mut record = FileRecord::new(object_id, name.to_string(), created);
                record.blocks.push(cluster_id);
                record.file_size = length;
                self.index.insert(record);
            } else {
                let record = self.record_mut(object_id)?;
                record.blocks.push(cluster_id);
                record.file_size += length;
            }
            block += 1;
        }
    }

    /// Sorted names of every file
    pub fn list_files(&self) -> Result<Vec<String>> {
        self.ensure_mounted()?;
        Ok(self.index.names())
    }

    pub fn file_size(&self, object_id: u16) -> Result<u64> {
        self.ensure_mounted()?;
        Ok(self.record(object_id)?.file_size as u64)
    }

    pub fn creation_time(&self, object_id: u16) -> Result<DateTime<Utc>> {
        self.ensure_mounted()?;
        Ok(ticks_to_datetime(self.record(object_id)?.created))
    }

    pub fn file_name(&self, object_id: u16) -> Result<String> {
        Ok(self.record(object_id)?.name.clone())
    }

    /// Register a new handle on `object_id`
    pub fn acquire(&mut self, object_id: u16) -> Result<()> {
        self.ensure_mounted()?;
        let record = self.record_mut(object_id)?;
        record.open_count = record
            .open_count
            .checked_add(1)
            .ok_or_else(|| FlashError::TooManyHandles(record.name.clone()))?;
        Ok(())
    }

    /// Drop a handle on `object_id`; unknown ids are ignored
    pub fn release(&mut self, object_id: u16) {
        if let Some(record) = self.index.get_mut(object_id) {
            record.open_count = record.open_count.saturating_sub(1);
        }
    }

    /// Drop the index; refused while handles are open
    pub fn unmount(&mut self) -> Result<()> {
        if self.index.any_open() {
            return Err(FlashError::FileInUse(
                "cannot unmount with open handles".to_string(),
            ));
        }
        self.reset_state();
        debug!("Unmounted");
        Ok(())
    }

    pub fn counters(&self) -> Result<EngineCounters> {
        self.ensure_mounted()?;
        Ok(EngineCounters {
            free_clusters: self.free_clusters,
            orphaned_clusters: self.orphaned_clusters,
            total_clusters: self.layout.total_clusters,
            file_count: self.index.len(),
            head_sector: self.head_sector,
            tail_cluster: self.tail_cluster,
        })
    }

    /// Read-only view of the index (tests and diagnostics)
    pub fn index(&self) -> &FileIndex {
        &self.index
    }
}
