//! Storage engine
//!
//! Leaf modules first: the error type, configuration, geometry and the
//! on-device cluster codec, then the block device contract. The engine
//! context in [`engine`] is extended by the mount, log, data, compaction and
//! handle modules.

pub mod cluster;
pub mod compact;
pub mod config;
pub mod data;
pub mod device;
pub mod engine;
pub mod error;
pub mod geometry;
pub mod handle;
pub mod index;
pub mod log;
pub mod mount;

pub use cluster::{ClusterBuffer, Marker};
pub use config::FsConfig;
pub use device::{BlockDevice, FlashCounters, MmapFlash, RamFlash};
pub use engine::{Engine, EngineCounters};
pub use error::{FlashError, Result};
pub use geometry::{Geometry, Layout};
pub use handle::{FileHandle, OpenMode};
pub use index::{FileIndex, FileRecord};
