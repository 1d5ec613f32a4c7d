//! Read, write and truncate over a file's block list
//!
//! Every change is copy-on-write: the block's new image is appended and
//! committed at the tail before the cluster it replaces is orphaned, so an
//! interrupted update leaves either the old or the new block on flash.

use crate::core::cluster::{data_offset, ERASED_BYTE};
use crate::core::device::BlockDevice;
use crate::core::engine::Engine;
use crate::core::error::{FlashError, Result};
use tracing::debug;

impl<D: BlockDevice> Engine<D> {
    /// Read up to `buf.len()` bytes at `position`; returns the bytes copied
    pub fn read_at(&mut self, object_id: u16, position: u64, buf: &mut [u8]) -> Result<usize> {
        self.ensure_mounted()?;
        let size = self.record(object_id)?.file_size as u64;
        if position >= size || buf.is_empty() {
            return Ok(0);
        }

        let (mut block, mut offset) = self.layout.locate(position);
        let mut copied = 0;
        while copied < buf.len() {
            let cluster_id = match self.record(object_id)?.blocks.get(block) {
                Some(&cluster_id) => cluster_id,
                None => break,
            };

            self.read_common_header(cluster_id)?;
            let length = self.cluster.data_length() as usize;
            if offset >= length {
                break;
            }

            let count = (length - offset).min(buf.len() - copied);
            self.device.read(
                cluster_id,
                data_offset(block as u16) + offset,
                &mut buf[copied..copied + count],
            )?;
            copied += count;
            offset = 0;
            block += 1;
        }
        Ok(copied)
    }

    /// Write `data` at `position`, which must not lie past the end of the file
    pub fn write_at(&mut self, object_id: u16, position: u64, data: &[u8]) -> Result<usize> {
        self.ensure_mounted()?;
        let size = self.record(object_id)?.file_size as u64;
        if position > size {
            return Err(FlashError::WritePastEnd {
                position,
                length: size,
            });
        }
        if data.is_empty() {
            return Ok(0);
        }
        if position + data.len() as u64 > u32::MAX as u64 {
            return Err(FlashError::FileTooLarge);
        }

        let (mut block, mut offset) = self.layout.locate(position);
        let mut written = 0;
        while written < data.len() {
            if block > u16::MAX as usize {
                return Err(FlashError::FileTooLarge);
            }
            let count = (self.layout.capacity_of(block) - offset).min(data.len() - written);
            self.write_block(object_id, block, offset, &data[written..written + count])?;
            written += count;
            offset = 0;
            block += 1;
        }
        Ok(written)
    }

    /// Rewrite (or append) one block with `bytes` merged in at `offset`
    fn write_block(&mut self, object_id: u16, block: usize, offset: usize, bytes: &[u8]) -> Result<()> {
        let existing = self.record(object_id)?.blocks.get(block).copied();

        self.cluster.clear();
        let old_length = match existing {
            Some(cluster_id) => {
                self.device.read(cluster_id, 0, self.cluster.as_mut_bytes())?;
                self.cluster.data_length() as usize
            }
            None => {
                self.cluster.set_object_id(object_id);
                self.cluster.set_block_id(block as u16);
                0
            }
        };

        let new_length = old_length.max(offset + bytes.len());
        self.cluster.data_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.cluster.set_data_length(new_length as u16);
        let cluster_id = self.append_cluster()?;

        // The append may have compacted; the block can live elsewhere now
        let superseded = self.record(object_id)?.blocks.get(block).copied();
        if let Some(old) = superseded {
            self.orphan_cluster(old)?;
        }

        let record = self.record_mut(object_id)?;
        match superseded {
            Some(_) => record.blocks[block] = cluster_id,
            None => record.blocks.push(cluster_id),
        }
        record.file_size += (new_length - old_length) as u32;
        Ok(())
    }

    /// Cut the file down to `position` bytes
    pub fn truncate(&mut self, object_id: u16, position: u64) -> Result<()> {
        self.ensure_mounted()?;
        let size = self.record(object_id)?.file_size as u64;
        if position > size {
            return Err(FlashError::OutOfBounds {
                position,
                length: size,
            });
        }
        if position == size {
            return Ok(());
        }

        let (block, offset) = self.layout.locate(position);
        // A cut on a block boundary drops that block entirely
        let keep = if offset == 0 && block > 0 { block } else { block + 1 };

        // Highest first, so a crash never leaves a gap in the block list
        loop {
            let blocks = &self.record(object_id)?.blocks;
            if blocks.len() <= keep {
                break;
            }
            let last_block = blocks.len() - 1;
            let last = blocks[last_block];
            self.orphan_cluster(last)?;

            let start = self.layout.block_start(last_block) as u32;
            let record = self.record_mut(object_id)?;
            record.blocks.pop();
            record.file_size = record.file_size.min(start);
        }

        if keep == block + 1 {
            let current = self.record(object_id)?.blocks[block];
            self.cluster.clear();
            self.device.read(current, 0, self.cluster.as_mut_bytes())?;
            self.cluster.set_data_length(offset as u16);
            self.cluster.data_mut()[offset..].fill(ERASED_BYTE);
            let cluster_id = self.append_cluster()?;

            let superseded = self.record(object_id)?.blocks[block];
            self.orphan_cluster(superseded)?;
            self.record_mut(object_id)?.blocks[block] = cluster_id;
        }

        let record = self.record_mut(object_id)?;
        record.file_size = position as u32;
        debug!("Truncated {} to {} bytes", record.name, position);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::core::config::FsConfig;
    use crate::core::device::RamFlash;
    use crate::core::engine::Engine;
    use crate::core::error::FlashError;
    use crate::core::geometry::Geometry;

    // 128-byte clusters: 96 bytes in the header cluster, 121 in the others
    fn engine() -> Engine<RamFlash> {
        let flash = RamFlash::new(Geometry::new(8 * 1024, 1024, 128)).unwrap();
        let mut engine = Engine::new(flash, FsConfig::default()).unwrap();
        engine.format().unwrap();
        engine
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn read_all(engine: &mut Engine<RamFlash>, id: u16) -> Vec<u8> {
        let size = engine.file_size(id).unwrap() as usize;
        let mut buf = vec![0u8; size + 10];
        let n = engine.read_at(id, 0, &mut buf).unwrap();
        buf.truncate(n);
        buf
    }

    #[test]
    fn test_write_spanning_blocks() {
        let mut engine = engine();
        let id = engine.create_file("data").unwrap();
        let data = pattern(96 + 121 + 50);
        assert_eq!(engine.write_at(id, 0, &data).unwrap(), data.len());

        let record = engine.index().get(id).unwrap();
        assert_eq!(record.blocks.len(), 3);
        assert_eq!(record.file_size as usize, data.len());
        assert_eq!(read_all(&mut engine, id), data);
    }

    #[test]
    fn test_read_boundaries() {
        let mut engine = engine();
        let id = engine.create_file("b").unwrap();
        engine.write_at(id, 0, b"hello").unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(engine.read_at(id, 5, &mut buf).unwrap(), 0);
        assert_eq!(engine.read_at(id, 2, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"llo");
    }

    #[test]
    fn test_write_at_end_appends_and_past_end_fails() {
        let mut engine = engine();
        let id = engine.create_file("c").unwrap();
        engine.write_at(id, 0, b"abc").unwrap();
        engine.write_at(id, 3, b"def").unwrap();
        assert_eq!(read_all(&mut engine, id), b"abcdef");

        assert!(matches!(
            engine.write_at(id, 7, b"x"),
            Err(FlashError::WritePastEnd {
                position: 7,
                length: 6
            })
        ));
    }

    #[test]
    fn test_overwrite_in_middle_keeps_length() {
        let mut engine = engine();
        let id = engine.create_file("d").unwrap();
        let mut data = pattern(300);
        engine.write_at(id, 0, &data).unwrap();
        engine.write_at(id, 90, &[0xAA; 20]).unwrap();
        data[90..110].fill(0xAA);

        assert_eq!(engine.file_size(id).unwrap(), 300);
        assert_eq!(read_all(&mut engine, id), data);
    }

    #[test]
    fn test_each_block_rewrite_orphans_one_cluster() {
        let mut engine = engine();
        let id = engine.create_file("e").unwrap();
        let orphans_before = engine.orphaned_clusters;
        engine.write_at(id, 0, &pattern(96 + 10)).unwrap();
        // header rewritten, block 1 appended
        assert_eq!(engine.orphaned_clusters, orphans_before + 1);
    }

    #[test]
    fn test_truncate_inside_block() {
        let mut engine = engine();
        let id = engine.create_file("f").unwrap();
        let data = pattern(300);
        engine.write_at(id, 0, &data).unwrap();

        engine.truncate(id, 150).unwrap();
        assert_eq!(engine.file_size(id).unwrap(), 150);
        assert_eq!(engine.index().get(id).unwrap().blocks.len(), 2);
        assert_eq!(read_all(&mut engine, id), &data[..150]);

        assert!(matches!(
            engine.truncate(id, 151),
            Err(FlashError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn test_truncate_on_block_boundary_drops_block() {
        let mut engine = engine();
        let id = engine.create_file("g").unwrap();
        let data = pattern(250);
        engine.write_at(id, 0, &data).unwrap();

        engine.truncate(id, 96).unwrap();
        let record = engine.index().get(id).unwrap();
        assert_eq!(record.blocks.len(), 1);
        assert_eq!(record.file_size, 96);
        assert_eq!(read_all(&mut engine, id), &data[..96]);
    }

    #[test]
    fn test_truncate_to_zero_then_rewrite() {
        let mut engine = engine();
        let id = engine.create_file("h").unwrap();
        engine.write_at(id, 0, &pattern(200)).unwrap();
        engine.truncate(id, 0).unwrap();
        assert_eq!(engine.file_size(id).unwrap(), 0);

        let fresh = engine.create_file("i").unwrap();
        let data = b"same bytes".to_vec();
        engine.write_at(id, 0, &data).unwrap();
        engine.write_at(fresh, 0, &data).unwrap();
        assert_eq!(read_all(&mut engine, id), read_all(&mut engine, fresh));
        assert_eq!(
            engine.index().get(id).unwrap().blocks.len(),
            engine.index().get(fresh).unwrap().blocks.len()
        );
    }
}
