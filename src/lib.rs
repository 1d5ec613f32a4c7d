//! # flashlog - Log-Structured File System for Raw Flash
//!
//! `flashlog-rs` stores a flat namespace of files directly on NOR-style flash:
//! a device that erases in sectors and whose bits can only be programmed from
//! 1 to 0 in between.
//!
//! - **Copy-on-write clusters** appended at a rotating log tail
//! - **No on-flash index**: mount rebuilds everything from per-cluster markers
//! - **Power-loss safe** updates, repaired at the next mount
//! - **Compaction** that reclaims the sectors holding the most garbage
//!
//! ## Quick Start
//!
//! ```rust
//! use flashlog_rs::{FlashFs, Geometry, RamFlash, Result};
//!
//! # fn main() -> Result<()> {
//! // 64 KiB of flash: 16 sectors of 4 KiB, 512-byte clusters
//! let flash = RamFlash::new(Geometry::new(64 * 1024, 4096, 512))?;
//! let fs = FlashFs::new(flash)?;
//! fs.format()?;
//!
//! fs.write_all_bytes("hello.txt", b"Hello, flash!")?;
//! assert_eq!(fs.read_all_bytes("HELLO.TXT")?, b"Hello, flash!");
//! assert_eq!(fs.get_files()?, vec!["HELLO.TXT"]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Streams
//!
//! ```rust
//! use flashlog_rs::{FlashFsBuilder, Geometry, OpenMode, RamFlash};
//! use std::io::{Read, Seek, SeekFrom, Write};
//!
//! # fn main() -> std::io::Result<()> {
//! let flash = RamFlash::new(Geometry::new(64 * 1024, 4096, 512))?;
//! let fs = FlashFsBuilder::new(flash).format_if_unformatted(true).mount()?;
//!
//! let mut log = fs.open("events.log", OpenMode::Append)?;
//! log.write_all(b"boot\n")?;
//! log.write_all(b"ready\n")?;
//! drop(log);
//!
//! let mut log = fs.open("events.log", OpenMode::Open)?;
//! log.seek(SeekFrom::Start(5))?;
//! let mut line = String::new();
//! log.read_to_string(&mut line)?;
//! assert_eq!(line, "ready\n");
//! # Ok(())
//! # }
//! ```

pub mod core;

pub use crate::core::{
    cluster::Marker,
    config::FsConfig,
    device::{BlockDevice, FlashCounters, MmapFlash, RamFlash},
    engine::Engine,
    error::{FlashError, Result},
    geometry::{Geometry, Layout},
    handle::{FileHandle, OpenMode},
};

use crate::core::engine::EngineCounters;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Space accounting snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsStats {
    /// Bytes in erased clusters ready for the log
    pub bytes_free: u64,

    /// Bytes in orphaned clusters that compaction can reclaim
    pub bytes_orphaned: u64,

    pub free_clusters: u32,
    pub orphaned_clusters: u32,
    pub total_clusters: u32,
    pub file_count: usize,

    /// Oldest sector that may hold live data
    pub head_sector: u32,

    /// Next cluster the log will program
    pub tail_cluster: u32,
}

impl FsStats {
    fn from_counters(counters: EngineCounters, cluster_size: usize) -> Self {
        FsStats {
            bytes_free: counters.free_clusters as u64 * cluster_size as u64,
            bytes_orphaned: counters.orphaned_clusters as u64 * cluster_size as u64,
            free_clusters: counters.free_clusters,
            orphaned_clusters: counters.orphaned_clusters,
            total_clusters: counters.total_clusters,
            file_count: counters.file_count,
            head_sector: counters.head_sector,
            tail_cluster: counters.tail_cluster,
        }
    }
}

/// Flash file system
///
/// Cheap to clone: clones share one engine, and every operation holds its
/// lock for the whole call, compaction included. File names are
/// case-insensitive (stored upper-cased) and at most 16 UTF-8 bytes.
///
/// # Examples
///
/// ```rust
/// use flashlog_rs::{FlashFs, Geometry, RamFlash};
///
/// # fn main() -> flashlog_rs::Result<()> {
/// let flash = RamFlash::new(Geometry::new(32 * 1024, 4096, 256))?;
/// let fs = FlashFs::new(flash)?;
/// fs.format()?;
///
/// fs.write_all_bytes("config", b"mode=fast")?;
/// fs.copy("config", "config.bak", false)?;
/// fs.delete("config")?;
/// fs.compact()?;
///
/// assert_eq!(fs.read_all_bytes("config.bak")?, b"mode=fast");
/// assert_eq!(fs.get_stats()?.bytes_orphaned, 0);
/// # Ok(())
/// # }
/// ```
pub struct FlashFs<D: BlockDevice> {
    engine: Arc<Mutex<Engine<D>>>,
}

impl<D: BlockDevice> Clone for FlashFs<D> {
    fn clone(&self) -> Self {
        FlashFs {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<D: BlockDevice> FlashFs<D> {
    /// Wrap a device with the default configuration; call [`FlashFs::mount`]
    /// or [`FlashFs::format`] before anything else
    pub fn new(device: D) -> Result<Self> {
        Self::with_config(device, FsConfig::default())
    }

    pub fn with_config(device: D, config: FsConfig) -> Result<Self> {
        Ok(FlashFs {
            engine: Arc::new(Mutex::new(Engine::new(device, config)?)),
        })
    }

    pub fn builder(device: D) -> FlashFsBuilder<D> {
        FlashFsBuilder::new(device)
    }

    /// Scan the device and rebuild the file index
    pub fn mount(&self) -> Result<()> {
        self.engine.lock().mount()
    }

    /// Drop the file index; refused while handles are open
    pub fn unmount(&self) -> Result<()> {
        self.engine.lock().unmount()
    }

    pub fn is_mounted(&self) -> bool {
        self.engine.lock().is_mounted()
    }

    /// Erase the whole device and mount it empty
    pub fn format(&self) -> Result<()> {
        self.engine.lock().format()
    }

    /// Reclaim every orphaned cluster
    pub fn compact(&self) -> Result<()> {
        self.engine.lock().compact()
    }

    /// Create (or truncate) a file and open it for writing
    pub fn create(&self, name: &str) -> Result<FileHandle<D>> {
        self.open(name, OpenMode::Create)
    }

    pub fn open(&self, name: &str, mode: OpenMode) -> Result<FileHandle<D>> {
        let (object_id, length) = self.engine.lock().open_file(name, mode)?;
        Ok(FileHandle::new(Arc::clone(&self.engine), object_id, mode, length))
    }

    /// Delete a file; refused while it has open handles
    pub fn delete(&self, name: &str) -> Result<()> {
        self.engine.lock().delete_file(name)
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        self.engine.lock().exists(name)
    }

    /// Rename `source` to `destination`
    pub fn move_file(&self, source: &str, destination: &str) -> Result<()> {
        self.engine.lock().rename_file(source, destination)
    }

    /// Copy `source` to `destination`, replacing it only with `overwrite`
    pub fn copy(&self, source: &str, destination: &str, overwrite: bool) -> Result<()> {
        self.engine.lock().copy_file(source, destination, overwrite)
    }

    pub fn read_all_bytes(&self, name: &str) -> Result<Vec<u8>> {
        let mut engine = self.engine.lock();
        let object_id = engine.lookup(name)?;
        let mut data = vec![0u8; engine.file_size(object_id)? as usize];
        let count = engine.read_at(object_id, 0, &mut data)?;
        data.truncate(count);
        Ok(data)
    }

    /// Replace the contents of `name`, creating it if missing
    pub fn write_all_bytes(&self, name: &str, data: &[u8]) -> Result<()> {
        let mut engine = self.engine.lock();
        let object_id = match engine.lookup(name) {
            Ok(object_id) => {
                engine.truncate(object_id, 0)?;
                object_id
            }
            Err(FlashError::FileNotFound(_)) => engine.create_file(name)?,
            Err(e) => return Err(e),
        };
        engine.write_at(object_id, 0, data)?;
        debug!("Wrote {} bytes to {}", data.len(), engine.file_name(object_id)?);
        Ok(())
    }

    /// Sorted file names
    pub fn get_files(&self) -> Result<Vec<String>> {
        self.engine.lock().list_files()
    }

    pub fn get_file_size(&self, name: &str) -> Result<u64> {
        let engine = self.engine.lock();
        let object_id = engine.lookup(name)?;
        engine.file_size(object_id)
    }

    pub fn get_file_creation_time(&self, name: &str) -> Result<DateTime<Utc>> {
        let engine = self.engine.lock();
        let object_id = engine.lookup(name)?;
        engine.creation_time(object_id)
    }

    pub fn get_stats(&self) -> Result<FsStats> {
        let engine = self.engine.lock();
        let counters = engine.counters()?;
        Ok(FsStats::from_counters(counters, engine.layout().cluster_size))
    }

    /// Run `f` with the engine locked (diagnostics and tests)
    pub fn with_engine<R>(&self, f: impl FnOnce(&Engine<D>) -> R) -> R {
        f(&self.engine.lock())
    }
}

/// Builder for configuring and mounting a [`FlashFs`]
///
/// # Examples
///
/// ```rust
/// use flashlog_rs::{FlashFsBuilder, Geometry, RamFlash};
///
/// # fn main() -> flashlog_rs::Result<()> {
/// let flash = RamFlash::new(Geometry::new(64 * 1024, 4096, 512))?;
/// let fs = FlashFsBuilder::new(flash)
///     .reserved_sectors(3)
///     .format_if_unformatted(true)
///     .mount()?;
/// assert!(fs.is_mounted());
/// # Ok(())
/// # }
/// ```
pub struct FlashFsBuilder<D: BlockDevice> {
    device: D,
    config: FsConfig,
    format_if_unformatted: bool,
}

impl<D: BlockDevice> FlashFsBuilder<D> {
    pub fn new(device: D) -> Self {
        FlashFsBuilder {
            device,
            config: FsConfig::default(),
            format_if_unformatted: false,
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: FsConfig) -> Self {
        self.config = config;
        self
    }

    /// Sectors' worth of free clusters kept back for compaction
    pub fn reserved_sectors(mut self, sectors: u32) -> Self {
        self.config.reserved_sectors = sectors;
        self
    }

    /// Check the tail cluster is erased before every append
    pub fn verify_tail(mut self, verify: bool) -> Self {
        self.config.verify_tail = verify;
        self
    }

    /// Format the device when mounting reports it unformatted
    pub fn format_if_unformatted(mut self, format: bool) -> Self {
        self.format_if_unformatted = format;
        self
    }

    /// Build without mounting
    pub fn build(self) -> Result<FlashFs<D>> {
        FlashFs::with_config(self.device, self.config)
    }

    /// Build and mount
    pub fn mount(self) -> Result<FlashFs<D>> {
        let format_if_unformatted = self.format_if_unformatted;
        let fs = self.build()?;
        match fs.mount() {
            Ok(()) => Ok(fs),
            Err(FlashError::NotFormatted(reason)) if format_if_unformatted => {
                info!("Device not formatted ({}), formatting", reason);
                fs.format()?;
                Ok(fs)
            }
            Err(e) => Err(e),
        }
    }
}
