//! Flash image backed by a memory-mapped file

use super::{byte_range, program, sector_range, BlockDevice};
use crate::core::error::{FlashError, Result};
use crate::core::geometry::Geometry;
use memmap2::{MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Disk-backed flash image with NOR programming semantics
pub struct MmapFlash {
    map: MmapMut,
    _file: File,
    path: PathBuf,
    geometry: Geometry,
}

impl MmapFlash {
    /// Create (or replace) an image file filled with erased bytes
    pub fn create<P: AsRef<Path>>(path: P, geometry: Geometry) -> Result<Self> {
        geometry.validate()?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(geometry.device_size)?;

        let mut flash = Self::map(file, path.as_ref(), geometry)?;
        flash.map.fill(0xFF);
        flash.map.flush()?;
        Ok(flash)
    }

    /// Open an existing image file; its length must match the geometry
    pub fn open<P: AsRef<Path>>(path: P, geometry: Geometry) -> Result<Self> {
        geometry.validate()?;
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        if len != geometry.device_size {
            return Err(FlashError::InvalidGeometry(format!(
                "image {:?} is {} bytes, geometry expects {}",
                path.as_ref(),
                len,
                geometry.device_size
            )));
        }
        Self::map(file, path.as_ref(), geometry)
    }

    fn map(file: File, path: &Path, geometry: Geometry) -> Result<Self> {
        // SAFETY: the file is opened read/write by this process and the map
        // is owned exclusively by this device for its whole lifetime.
        let map = unsafe { MmapOptions::new().map_mut(&file)? };
        Ok(MmapFlash {
            map,
            _file: file,
            path: path.to_path_buf(),
            geometry,
        })
    }

    /// Flush dirty pages of the mapping to the file
    pub fn sync(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl BlockDevice for MmapFlash {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn read(&mut self, cluster_id: u32, offset: usize, buf: &mut [u8]) -> Result<()> {
        let range = byte_range(&self.geometry, cluster_id, offset, buf.len())?;
        buf.copy_from_slice(&self.map[range]);
        Ok(())
    }

    fn write(&mut self, cluster_id: u32, offset: usize, buf: &[u8]) -> Result<()> {
        let range = byte_range(&self.geometry, cluster_id, offset, buf.len())?;
        program(&mut self.map[range.clone()], buf, false)?;
        self.map.flush_range(range.start, range.len())?;
        Ok(())
    }

    fn erase_sector(&mut self, sector_id: u32) -> Result<()> {
        let range = sector_range(&self.geometry, sector_id)?;
        self.map[range.clone()].fill(0xFF);
        self.map.flush_range(range.start, range.len())?;
        Ok(())
    }

    fn erase_chip(&mut self) -> Result<()> {
        self.map.fill(0xFF);
        self.map.flush()?;
        Ok(())
    }
}

impl Drop for MmapFlash {
    fn drop(&mut self) {
        if let Err(e) = self.map.flush() {
            tracing::warn!("Failed to flush flash image {:?}: {}", self.path, e);
        }
    }
}
