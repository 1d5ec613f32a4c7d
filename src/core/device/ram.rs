//! In-memory flash emulation
//!
//! Clones of a [`RamFlash`] share one image, so a test can keep a handle to
//! the "chip" after handing a clone to the engine and remount it later.

use super::{byte_range, program, sector_range, BlockDevice};
use crate::core::error::{FlashError, Result};
use crate::core::geometry::Geometry;
use parking_lot::Mutex;
use std::sync::Arc;

/// Operation counters for wear and traffic inspection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlashCounters {
    pub reads: u64,
    pub programs: u64,
    pub sector_erases: u64,
    pub chip_erases: u64,
}

#[derive(Debug)]
struct RamImage {
    bytes: Vec<u8>,
    strict: bool,
    counters: FlashCounters,
}

/// NOR-style flash held in RAM
#[derive(Debug, Clone)]
pub struct RamFlash {
    geometry: Geometry,
    image: Arc<Mutex<RamImage>>,
}

impl RamFlash {
    /// Create an erased device
    pub fn new(geometry: Geometry) -> Result<Self> {
        geometry.validate()?;
        Ok(RamFlash {
            geometry,
            image: Arc::new(Mutex::new(RamImage {
                bytes: vec![0xFF; geometry.device_size as usize],
                strict: false,
                counters: FlashCounters::default(),
            })),
        })
    }

    /// Create a device from an existing raw image
    pub fn from_image(geometry: Geometry, bytes: Vec<u8>) -> Result<Self> {
        geometry.validate()?;
        if bytes.len() as u64 != geometry.device_size {
            return Err(FlashError::InvalidGeometry(format!(
                "image is {} bytes, geometry expects {}",
                bytes.len(),
                geometry.device_size
            )));
        }
        Ok(RamFlash {
            geometry,
            image: Arc::new(Mutex::new(RamImage {
                bytes,
                strict: false,
                counters: FlashCounters::default(),
            })),
        })
    }

    /// Refuse programs that would turn a 0 bit back into 1
    pub fn strict(self) -> Self {
        self.image.lock().strict = true;
        self
    }

    /// Copy of the raw device contents
    pub fn snapshot(&self) -> Vec<u8> {
        self.image.lock().bytes.clone()
    }

    /// Overwrite raw bytes, bypassing flash semantics (fault injection)
    pub fn overwrite_raw(&self, address: usize, bytes: &[u8]) {
        let mut image = self.image.lock();
        image.bytes[address..address + bytes.len()].copy_from_slice(bytes);
    }

    pub fn counters(&self) -> FlashCounters {
        self.image.lock().counters
    }
}

impl BlockDevice for RamFlash {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn read(&mut self, cluster_id: u32, offset: usize, buf: &mut [u8]) -> Result<()> {
        let range = byte_range(&self.geometry, cluster_id, offset, buf.len())?;
        let mut image = self.image.lock();
        buf.copy_from_slice(&image.bytes[range]);
        image.counters.reads += 1;
        Ok(())
    }

    fn write(&mut self, cluster_id: u32, offset: usize, buf: &[u8]) -> Result<()> {
        let range = byte_range(&self.geometry, cluster_id, offset, buf.len())?;
        let mut image = self.image.lock();
        let strict = image.strict;
        program(&mut image.bytes[range], buf, strict)?;
        image.counters.programs += 1;
        Ok(())
    }

    fn erase_sector(&mut self, sector_id: u32) -> Result<()> {
        let range = sector_range(&self.geometry, sector_id)?;
        let mut image = self.image.lock();
        image.bytes[range].fill(0xFF);
        image.counters.sector_erases += 1;
        Ok(())
    }

    fn erase_chip(&mut self) -> Result<()> {
        let mut image = self.image.lock();
        image.bytes.fill(0xFF);
        image.counters.chip_erases += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> Geometry {
        Geometry::new(3 * 256, 256, 64)
    }

    #[test]
    fn test_new_device_is_erased() {
        let mut flash = RamFlash::new(geometry()).unwrap();
        let mut buf = [0u8; 64];
        flash.read(11, 0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_clones_share_the_image() {
        let flash = RamFlash::new(geometry()).unwrap();
        let mut writer = flash.clone();
        writer.write(2, 5, b"abc").unwrap();

        let image = flash.snapshot();
        assert_eq!(&image[2 * 64 + 5..2 * 64 + 8], b"abc");
        assert_eq!(flash.counters().programs, 1);
    }

    #[test]
    fn test_writes_and_with_existing_bits() {
        let mut flash = RamFlash::new(geometry()).unwrap();
        flash.write(0, 0, &[0x3F]).unwrap();
        flash.write(0, 0, &[0xF1]).unwrap();

        let mut marker = [0u8; 1];
        flash.read(0, 0, &mut marker).unwrap();
        assert_eq!(marker[0], 0x31);
    }

    #[test]
    fn test_strict_mode_rejects_setting_bits() {
        let mut flash = RamFlash::new(geometry()).unwrap().strict();
        flash.write(0, 0, &[0x1F]).unwrap();
        assert!(flash.write(0, 0, &[0x3F]).is_err());
        assert!(flash.write(0, 0, &[0x0F]).is_ok());
    }

    #[test]
    fn test_erase_sector_resets_only_that_sector() {
        let mut flash = RamFlash::new(geometry()).unwrap();
        flash.write(0, 0, &[0]).unwrap();
        flash.write(4, 0, &[0]).unwrap();
        flash.erase_sector(1).unwrap();

        let image = flash.snapshot();
        assert_eq!(image[0], 0);
        assert_eq!(image[4 * 64], 0xFF);
        assert_eq!(flash.counters().sector_erases, 1);
    }

    #[test]
    fn test_from_image_checks_length() {
        assert!(RamFlash::from_image(geometry(), vec![0xFF; 10]).is_err());
        assert!(RamFlash::from_image(geometry(), vec![0xFF; 768]).is_ok());
    }
}
