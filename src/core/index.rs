//! In-memory file index
//!
//! Rebuilt from cluster markers at every mount; never written to flash.

use crate::core::cluster::NAME_CAPACITY;
use crate::core::error::{FlashError, Result};
use ahash::AHashMap;

/// Metadata of one live file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// Unique id stamped into every cluster of the file
    pub object_id: u16,

    /// File size in bytes
    pub file_size: u32,

    /// Number of open handles
    pub open_count: u8,

    /// Cluster ids by block index; `blocks[0]` is the header cluster
    pub blocks: Vec<u32>,

    /// Case-folded file name, cached from the header cluster
    pub name: String,

    /// Creation time in ticks, cached from the header cluster
    pub created: i64,
}

impl FileRecord {
    pub fn new(object_id: u16, name: String, created: i64) -> Self {
        FileRecord {
            object_id,
            file_size: 0,
            open_count: 0,
            blocks: Vec::new(),
            name,
            created,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open_count > 0
    }
}

/// Map from object id to [`FileRecord`]
#[derive(Debug, Default)]
pub struct FileIndex {
    records: AHashMap<u16, FileRecord>,
}

impl FileIndex {
    pub fn new() -> Self {
        FileIndex {
            records: AHashMap::new(),
        }
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, object_id: u16) -> Option<&FileRecord> {
        self.records.get(&object_id)
    }

    pub fn get_mut(&mut self, object_id: u16) -> Option<&mut FileRecord> {
        self.records.get_mut(&object_id)
    }

    pub fn contains(&self, object_id: u16) -> bool {
        self.records.contains_key(&object_id)
    }

    pub fn insert(&mut self, record: FileRecord) {
        self.records.insert(record.object_id, record);
    }

    pub fn remove(&mut self, object_id: u16) -> Option<FileRecord> {
        self.records.remove(&object_id)
    }

    /// Linear lookup by folded name
    pub fn find_by_name(&self, folded: &str) -> Option<&FileRecord> {
        self.records.values().find(|record| record.name == folded)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileRecord> {
        self.records.values()
    }

    /// True when `cluster_id` is the current location of `(object_id, block_id)`
    pub fn owns(&self, object_id: u16, block_id: u16, cluster_id: u32) -> bool {
        self.records
            .get(&object_id)
            .and_then(|record| record.blocks.get(block_id as usize))
            .map_or(false, |&current| current == cluster_id)
    }

    pub fn any_open(&self) -> bool {
        self.records.values().any(FileRecord::is_open)
    }

    /// Sorted list of file names
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.records.values().map(|r| r.name.clone()).collect();
        names.sort();
        names
    }
}

/// Case-fold and validate a file name against the on-device name field
pub fn fold_name(name: &str) -> Result<String> {
    let folded = name.trim().to_uppercase();
    if folded.is_empty() {
        return Err(FlashError::InvalidFileName(
            "file name cannot be empty".to_string(),
        ));
    }
    if folded.len() > NAME_CAPACITY {
        return Err(FlashError::InvalidFileName(format!(
            "'{}' exceeds {} bytes",
            name, NAME_CAPACITY
        )));
    }
    if folded.chars().any(|c| c.is_control()) {
        return Err(FlashError::InvalidFileName(format!(
            "'{}' contains control characters",
            name.escape_debug()
        )));
    }
    Ok(folded)
}
