//! Block device contract
//!
//! The engine talks to flash only through [`BlockDevice`]. Addresses are
//! cluster-relative; a device is expected to behave like NOR flash: erase
//! sets every byte to `0xFF` and programming can only clear bits.

pub mod mmap;
pub mod ram;

use crate::core::error::{FlashError, Result};
use crate::core::geometry::Geometry;

pub use mmap::MmapFlash;
pub use ram::{FlashCounters, RamFlash};

/// Raw flash capability consumed by the engine
pub trait BlockDevice: Send {
    /// Device geometry; must stay constant for the device's lifetime
    fn geometry(&self) -> Geometry;

    /// Read `buf.len()` bytes starting at `offset` within `cluster_id`
    fn read(&mut self, cluster_id: u32, offset: usize, buf: &mut [u8]) -> Result<()>;

    /// Program `buf` starting at `offset` within `cluster_id`
    fn write(&mut self, cluster_id: u32, offset: usize, buf: &[u8]) -> Result<()>;

    /// Erase one sector back to `0xFF`
    fn erase_sector(&mut self, sector_id: u32) -> Result<()>;

    /// Erase the whole device
    fn erase_chip(&mut self) -> Result<()>;
}

/// Resolve a cluster-relative access to an absolute byte range
pub(crate) fn byte_range(
    geometry: &Geometry,
    cluster_id: u32,
    offset: usize,
    len: usize,
) -> Result<std::ops::Range<usize>> {
    let cluster_size = geometry.cluster_size as usize;
    if cluster_id >= geometry.total_clusters() || offset + len > cluster_size {
        return Err(FlashError::Device(format!(
            "access out of range: cluster {} offset {} length {}",
            cluster_id, offset, len
        )));
    }
    let start = cluster_id as usize * cluster_size + offset;
    Ok(start..start + len)
}

/// Resolve a sector id to an absolute byte range
pub(crate) fn sector_range(geometry: &Geometry, sector_id: u32) -> Result<std::ops::Range<usize>> {
    if sector_id >= geometry.sector_count() {
        return Err(FlashError::Device(format!(
            "sector {} out of range ({} sectors)",
            sector_id,
            geometry.sector_count()
        )));
    }
    let sector_size = geometry.sector_size as usize;
    let start = sector_id as usize * sector_size;
    Ok(start..start + sector_size)
}

/// Program `data` over `target` with NOR semantics (bits can only clear)
pub(crate) fn program(target: &mut [u8], data: &[u8], strict: bool) -> Result<()> {
    if strict {
        if let Some(pos) = target
            .iter()
            .zip(data)
            .position(|(&old, &new)| old & new != new)
        {
            return Err(FlashError::Device(format!(
                "program at byte {} would set bits: {:#04x} -> {:#04x}",
                pos, target[pos], data[pos]
            )));
        }
    }
    for (old, &new) in target.iter_mut().zip(data) {
        *old &= new;
    }
    Ok(())
}
