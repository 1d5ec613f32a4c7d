//! Log writer
//!
//! The log is a circular run of clusters. Clusters are only ever programmed at
//! the tail; the free region is the run of erased clusters between the tail
//! and the head sector.

use crate::core::cluster::Marker;
use crate::core::device::BlockDevice;
use crate::core::engine::Engine;
use crate::core::error::{FlashError, Result};
use tracing::trace;

impl<D: BlockDevice> Engine<D> {
    /// Append the scratch image at the tail and commit it
    ///
    /// The image is programmed as pending and then marked allocated. The
    /// caller orphans whatever cluster the image supersedes, after this
    /// returns. Compaction may run first and relocate any live cluster, so
    /// callers must re-resolve block pointers afterwards.
    pub(crate) fn append_cluster(&mut self) -> Result<u32> {
        self.reserve_headroom()?;
        let cluster_id = self.claim_tail()?;

        self.cluster.set_marker(Marker::PendingCluster);
        self.device.write(cluster_id, 0, self.cluster.as_bytes())?;
        self.set_marker(cluster_id, Marker::AllocatedCluster)?;

        trace!(
            "Appended object {} block {} at cluster {} ({} free)",
            self.cluster.object_id(),
            self.cluster.block_id(),
            cluster_id,
            self.free_clusters
        );
        Ok(cluster_id)
    }

    /// Make sure an append leaves the reserve untouched, compacting if needed
    pub(crate) fn reserve_headroom(&mut self) -> Result<()> {
        let reserved = self.reserved_clusters();
        if self.free_clusters > reserved {
            return Ok(());
        }

        self.compact_partial()?;
        if self.free_clusters <= reserved {
            return Err(FlashError::DiskFull);
        }
        Ok(())
    }

    /// Take the tail cluster and advance the cursor
    ///
    /// Does not honour the reserve; compaction allocates through here.
    pub(crate) fn claim_tail(&mut self) -> Result<u32> {
        if self.free_clusters == 0 {
            return Err(FlashError::DiskFull);
        }

        let cluster_id = self.tail_cluster;
        if self.config.verify_tail {
            let mut marker = [0u8; 1];
            self.device.read(cluster_id, 0, &mut marker)?;
            if !Marker::from_u8(marker[0]).map_or(false, Marker::is_free) {
                return Err(FlashError::TailNotErased(cluster_id));
            }
        }

        self.tail_cluster = self.layout.next_cluster(cluster_id);
        self.free_clusters -= 1;
        Ok(cluster_id)
    }
}
