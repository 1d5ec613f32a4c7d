//! Shared helpers for the integration tests

#![allow(dead_code)]

use flashlog_rs::core::FileRecord;
use flashlog_rs::{BlockDevice, FlashError, FlashFs, FsConfig, Geometry, Marker, RamFlash, Result};

/// Formatted file system over a fresh RAM device; the returned flash shares
/// its image with the one inside the file system
pub fn formatted(geometry: Geometry, config: FsConfig) -> (FlashFs<RamFlash>, RamFlash) {
    let flash = RamFlash::new(geometry).unwrap();
    let fs = FlashFs::with_config(flash.clone(), config).unwrap();
    fs.format().unwrap();
    (fs, flash)
}

/// Mount a second file system over the same chip
pub fn remount(flash: &RamFlash, config: FsConfig) -> FlashFs<RamFlash> {
    let fs = FlashFs::with_config(flash.clone(), config).unwrap();
    fs.mount().unwrap();
    fs
}

/// Index contents ordered by object id
pub fn records<D: BlockDevice>(fs: &FlashFs<D>) -> Vec<FileRecord> {
    fs.with_engine(|engine| {
        let mut records: Vec<FileRecord> = engine.index().iter().cloned().collect();
        records.sort_by_key(|record| record.object_id);
        records
    })
}

/// Marker byte of every cluster in a raw image
pub fn markers(image: &[u8], cluster_size: usize) -> Vec<u8> {
    image.chunks(cluster_size).map(|cluster| cluster[0]).collect()
}

pub fn count_markers(image: &[u8], cluster_size: usize, marker: Marker) -> usize {
    markers(image, cluster_size)
        .into_iter()
        .filter(|&byte| byte == marker as u8)
        .count()
}

/// RAM flash that loses power after a fixed number of mutating operations
///
/// The failing write is torn: only the first half of its bytes reach the
/// chip. Erases either complete or do not happen. Once power is lost every
/// later mutation fails too.
pub struct CrashingFlash {
    inner: RamFlash,
    remaining: usize,
    crashed: bool,
}

impl CrashingFlash {
    pub fn new(inner: RamFlash, operations: usize) -> Self {
        CrashingFlash {
            inner,
            remaining: operations,
            crashed: false,
        }
    }

    pub fn crashed(&self) -> bool {
        self.crashed
    }

    fn spend(&mut self) -> bool {
        if self.crashed {
            return false;
        }
        if self.remaining == 0 {
            self.crashed = true;
            return false;
        }
        self.remaining -= 1;
        true
    }

    fn power_loss() -> FlashError {
        FlashError::Device("injected power loss".to_string())
    }
}

impl BlockDevice for CrashingFlash {
    fn geometry(&self) -> Geometry {
        self.inner.geometry()
    }

    fn read(&mut self, cluster_id: u32, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.inner.read(cluster_id, offset, buf)
    }

    fn write(&mut self, cluster_id: u32, offset: usize, buf: &[u8]) -> Result<()> {
        let was_crashed = self.crashed;
        if self.spend() {
            return self.inner.write(cluster_id, offset, buf);
        }
        if !was_crashed && buf.len() > 1 {
            self.inner.write(cluster_id, offset, &buf[..buf.len() / 2])?;
        }
        Err(Self::power_loss())
    }

    fn erase_sector(&mut self, sector_id: u32) -> Result<()> {
        if self.spend() {
            self.inner.erase_sector(sector_id)
        } else {
            Err(Self::power_loss())
        }
    }

    fn erase_chip(&mut self) -> Result<()> {
        if self.spend() {
            self.inner.erase_chip()
        } else {
            Err(Self::power_loss())
        }
    }
}
