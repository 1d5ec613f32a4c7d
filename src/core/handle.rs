//! Open file handles
//!
//! A [`FileHandle`] shares the engine lock with the [`crate::FlashFs`] that
//! opened it and keeps its own position. Handles implement the std I/O
//! traits; every write is durable once it returns, so `flush` has nothing to
//! do.

use crate::core::device::BlockDevice;
use crate::core::engine::Engine;
use crate::core::error::{FlashError, Result};
use parking_lot::Mutex;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;
use tracing::debug;

/// How [`crate::FlashFs::open`] treats existing and missing files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Create a file; fail if it exists
    CreateNew,
    /// Create a file, truncating an existing one
    Create,
    /// Open an existing file
    Open,
    /// Open a file, creating it if missing
    OpenOrCreate,
    /// Open or create, positioned at the end; earlier bytes cannot be reached
    Append,
    /// Open an existing file and truncate it
    Truncate,
}

impl OpenMode {
    pub fn creates(self) -> bool {
        matches!(
            self,
            OpenMode::CreateNew | OpenMode::Create | OpenMode::OpenOrCreate | OpenMode::Append
        )
    }

    pub fn truncates(self) -> bool {
        matches!(self, OpenMode::Create | OpenMode::Truncate)
    }
}

impl<D: BlockDevice> Engine<D> {
    /// Resolve `name` under `mode` and register a handle on the result
    ///
    /// Returns the object id and the length of the file once opened.
    pub fn open_file(&mut self, name: &str, mode: OpenMode) -> Result<(u16, u64)> {
        let object_id = match self.lookup(name) {
            Ok(object_id) => {
                if mode == OpenMode::CreateNew {
                    return Err(FlashError::FileAlreadyExists(self.file_name(object_id)?));
                }
                if mode.truncates() {
                    self.truncate(object_id, 0)?;
                }
                object_id
            }
            Err(FlashError::FileNotFound(_)) if mode.creates() => self.create_file(name)?,
            Err(e) => return Err(e),
        };

        self.acquire(object_id)?;
        let length = self.file_size(object_id)?;
        debug!("Opened object {} ({:?}, {} bytes)", object_id, mode, length);
        Ok((object_id, length))
    }
}

/// Open file on a [`crate::FlashFs`]
pub struct FileHandle<D: BlockDevice> {
    engine: Arc<Mutex<Engine<D>>>,
    object_id: u16,
    mode: OpenMode,
    position: u64,
    /// Lowest reachable position (the starting end in append mode)
    floor: u64,
    closed: bool,
}

impl<D: BlockDevice> FileHandle<D> {
    pub(crate) fn new(engine: Arc<Mutex<Engine<D>>>, object_id: u16, mode: OpenMode, length: u64) -> Self {
        let start = if mode == OpenMode::Append { length } else { 0 };
        FileHandle {
            engine,
            object_id,
            mode,
            position: start,
            floor: start,
            closed: false,
        }
    }

    pub fn object_id(&self) -> u16 {
        self.object_id
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn name(&self) -> Result<String> {
        self.engine.lock().file_name(self.object_id)
    }

    pub fn len(&self) -> Result<u64> {
        self.engine.lock().file_size(self.object_id)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Read at the current position and advance it
    pub fn read_bytes(&mut self, buf: &mut [u8]) -> Result<usize> {
        let count = self
            .engine
            .lock()
            .read_at(self.object_id, self.position, buf)?;
        self.position += count as u64;
        Ok(count)
    }

    /// Write at the current position and advance it
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<usize> {
        let count = self
            .engine
            .lock()
            .write_at(self.object_id, self.position, data)?;
        self.position += count as u64;
        Ok(count)
    }

    /// Move the position; it must stay within the file
    pub fn seek_to(&mut self, target: SeekFrom) -> Result<u64> {
        let length = self.len()?;
        let position = match target {
            SeekFrom::Start(offset) => offset as i128,
            SeekFrom::End(delta) => length as i128 + delta as i128,
            SeekFrom::Current(delta) => self.position as i128 + delta as i128,
        };

        if position < self.floor as i128 || position > length as i128 {
            return Err(FlashError::OutOfBounds {
                position: position.max(0) as u64,
                length,
            });
        }
        self.position = position as u64;
        Ok(self.position)
    }

    /// Truncate the file; growing it is refused
    pub fn set_len(&mut self, length: u64) -> Result<()> {
        self.engine.lock().truncate(self.object_id, length)?;
        self.position = self.position.min(length);
        self.floor = self.floor.min(length);
        Ok(())
    }

    /// Release the handle; dropping it does the same
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.closed {
            self.closed = true;
            self.engine.lock().release(self.object_id);
        }
    }
}

impl<D: BlockDevice> Read for FileHandle<D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_bytes(buf)?)
    }
}

impl<D: BlockDevice> Write for FileHandle<D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(self.write_bytes(buf)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<D: BlockDevice> Seek for FileHandle<D> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        Ok(self.seek_to(pos)?)
    }
}

impl<D: BlockDevice> Drop for FileHandle<D> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<D: BlockDevice> std::fmt::Debug for FileHandle<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHandle")
            .field("object_id", &self.object_id)
            .field("mode", &self.mode)
            .field("position", &self.position)
            .finish()
    }
}
