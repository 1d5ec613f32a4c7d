//! File system tuning knobs
//!
//! Loaded from TOML or built in code; validated against the device geometry
//! at mount time.

use crate::core::error::{FlashError, Result};
use crate::core::geometry::Geometry;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default number of sectors kept free as compaction headroom
pub const DEFAULT_RESERVED_SECTORS: u32 = 2;

/// Engine configuration
///
/// ```
/// use flashlog_rs::FsConfig;
///
/// let config = FsConfig::from_toml_str("reserved_sectors = 3").unwrap();
/// assert_eq!(config.reserved_sectors, 3);
/// assert!(config.verify_tail);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Sectors' worth of free clusters the log writer never hands out to
    /// callers; compaction runs when free space drops to this level
    pub reserved_sectors: u32,

    /// Read the tail marker before every append and refuse to program a
    /// cluster that is not erased
    pub verify_tail: bool,
}

impl Default for FsConfig {
    fn default() -> Self {
        FsConfig {
            reserved_sectors: DEFAULT_RESERVED_SECTORS,
            verify_tail: true,
        }
    }
}

impl FsConfig {
    pub fn from_toml_str(source: &str) -> Result<Self> {
        Ok(toml::from_str(source)?)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let source = std::fs::read_to_string(path)?;
        Self::from_toml_str(&source)
    }

    /// Check the configuration against a device geometry
    pub fn validate(&self, geometry: &Geometry) -> Result<()> {
        if self.reserved_sectors == 0 {
            return Err(FlashError::InvalidConfig(
                "reserved_sectors must be at least 1".to_string(),
            ));
        }

        if self.reserved_sectors >= geometry.sector_count() {
            return Err(FlashError::InvalidConfig(format!(
                "reserved_sectors ({}) must be below the sector count ({})",
                self.reserved_sectors,
                geometry.sector_count()
            )));
        }

        Ok(())
    }
}
