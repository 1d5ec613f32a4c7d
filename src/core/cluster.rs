//! On-device cluster format
//!
//! Every cluster starts with a 7-byte common header. The header cluster of a
//! file (block 0) appends the file name and creation time before its data:
//!
//! ```text
//! offset  size  field
//!      0     1  marker
//!      1     2  object id        (LE)
//!      3     2  block id         (LE)
//!      5     2  data length      (LE)
//!      7     1  file name length (block 0 only)
//!      8    16  file name, UTF-8 (block 0 only)
//!     24     8  creation ticks   (block 0 only, LE)
//!  32 / 7     *  data            (block 0 / other blocks)
//! ```
//!
//! Marker values only ever lose bits, so each lifecycle step is a single
//! in-place program of one byte.

pub const MARKER_OFFSET: usize = 0;
pub const OBJECT_ID_OFFSET: usize = 1;
pub const BLOCK_ID_OFFSET: usize = 3;
pub const DATA_LENGTH_OFFSET: usize = 5;
pub const COMMON_HEADER_SIZE: usize = 7;

pub const NAME_LENGTH_OFFSET: usize = 7;
pub const NAME_OFFSET: usize = 8;
pub const NAME_CAPACITY: usize = 16;
pub const CREATION_TIME_OFFSET: usize = 24;
pub const HEADER_CLUSTER_SIZE: usize = 32;

/// Value of an erased flash byte
pub const ERASED_BYTE: u8 = 0xFF;

/// Cluster lifecycle marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Marker {
    /// Never programmed since the last sector erase
    Erased = 0xFF,
    /// First cluster of an erased, usable sector
    FormattedSector = 0x7F,
    /// Image written, not yet committed
    PendingCluster = 0x3F,
    /// Live data referenced by exactly one file record
    AllocatedCluster = 0x1F,
    /// Superseded data, reclaimable by compaction
    OrphanedCluster = 0x0F,
}

impl Marker {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0xFF => Some(Marker::Erased),
            0x7F => Some(Marker::FormattedSector),
            0x3F => Some(Marker::PendingCluster),
            0x1F => Some(Marker::AllocatedCluster),
            0x0F => Some(Marker::OrphanedCluster),
            _ => None,
        }
    }

    /// True when `next` can be programmed over `self` without an erase
    pub fn can_become(self, next: Marker) -> bool {
        (self as u8) & (next as u8) == next as u8
    }

    pub fn is_free(self) -> bool {
        matches!(self, Marker::Erased | Marker::FormattedSector)
    }
}

/// Byte offset of the data region for a given block id
pub fn data_offset(block_id: u16) -> usize {
    if block_id == 0 {
        HEADER_CLUSTER_SIZE
    } else {
        COMMON_HEADER_SIZE
    }
}

/// Fixed-size cluster image with typed field accessors
///
/// Getters never fail: fields that were never read or set decode from
/// erased (`0xFF`) bytes.
#[derive(Debug, Clone)]
pub struct ClusterBuffer {
    bytes: Vec<u8>,
}

impl ClusterBuffer {
    pub fn new(cluster_size: usize) -> Self {
        ClusterBuffer {
            bytes: vec![ERASED_BYTE; cluster_size],
        }
    }

    /// Reset to the erased state
    pub fn clear(&mut self) {
        self.bytes.fill(ERASED_BYTE);
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Raw access for device reads
    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    pub fn common_header_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[..COMMON_HEADER_SIZE]
    }

    fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.bytes[offset], self.bytes[offset + 1]])
    }

    fn write_u16(&mut self, offset: usize, value: u16) {
        self.bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    pub fn marker_byte(&self) -> u8 {
        self.bytes[MARKER_OFFSET]
    }

    pub fn marker(&self) -> Option<Marker> {
        Marker::from_u8(self.marker_byte())
    }

    pub fn set_marker(&mut self, marker: Marker) {
        self.bytes[MARKER_OFFSET] = marker as u8;
    }

    pub fn object_id(&self) -> u16 {
        self.read_u16(OBJECT_ID_OFFSET)
    }

    pub fn set_object_id(&mut self, object_id: u16) {
        self.write_u16(OBJECT_ID_OFFSET, object_id);
    }

    pub fn block_id(&self) -> u16 {
        self.read_u16(BLOCK_ID_OFFSET)
    }

    pub fn set_block_id(&mut self, block_id: u16) {
        self.write_u16(BLOCK_ID_OFFSET, block_id);
    }

    pub fn data_length(&self) -> u16 {
        self.read_u16(DATA_LENGTH_OFFSET)
    }

    pub fn set_data_length(&mut self, length: u16) {
        self.write_u16(DATA_LENGTH_OFFSET, length);
    }

    pub fn is_header_cluster(&self) -> bool {
        self.block_id() == 0
    }

    pub fn file_name(&self) -> String {
        let len = (self.bytes[NAME_LENGTH_OFFSET] as usize).min(NAME_CAPACITY);
        String::from_utf8_lossy(&self.bytes[NAME_OFFSET..NAME_OFFSET + len]).into_owned()
    }

    /// Store a file name; callers validate the length beforehand
    pub fn set_file_name(&mut self, name: &str) {
        let raw = name.as_bytes();
        let len = raw.len().min(NAME_CAPACITY);
        self.bytes[NAME_LENGTH_OFFSET] = len as u8;
        let field = &mut self.bytes[NAME_OFFSET..NAME_OFFSET + NAME_CAPACITY];
        field.fill(0);
        field[..len].copy_from_slice(&raw[..len]);
    }

    pub fn creation_time(&self) -> i64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.bytes[CREATION_TIME_OFFSET..CREATION_TIME_OFFSET + 8]);
        i64::from_le_bytes(raw)
    }

    pub fn set_creation_time(&mut self, ticks: i64) {
        self.bytes[CREATION_TIME_OFFSET..CREATION_TIME_OFFSET + 8]
            .copy_from_slice(&ticks.to_le_bytes());
    }

    pub fn data_offset(&self) -> usize {
        data_offset(self.block_id())
    }

    /// Whole data region, independent of the stored data length
    pub fn data(&self) -> &[u8] {
        let start = self.data_offset();
        &self.bytes[start..]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        let start = self.data_offset();
        &mut self.bytes[start..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markers_only_clear_bits() {
        let lifecycle = [
            Marker::Erased,
            Marker::FormattedSector,
            Marker::PendingCluster,
            Marker::AllocatedCluster,
            Marker::OrphanedCluster,
        ];
        for pair in lifecycle.windows(2) {
            assert!(pair[0].can_become(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
            assert!(!pair[1].can_become(pair[0]));
        }
        assert!(Marker::Erased.can_become(Marker::OrphanedCluster));
    }

    #[test]
    fn test_unknown_marker() {
        assert_eq!(Marker::from_u8(0x00), None);
        assert_eq!(Marker::from_u8(0x1F), Some(Marker::AllocatedCluster));
    }

    #[test]
    fn test_common_header_layout() {
        let mut cluster = ClusterBuffer::new(64);
        cluster.set_marker(Marker::AllocatedCluster);
        cluster.set_object_id(0x1234);
        cluster.set_block_id(2);
        cluster.set_data_length(0x0102);

        let bytes = cluster.as_bytes();
        assert_eq!(&bytes[..7], &[0x1F, 0x34, 0x12, 0x02, 0x00, 0x02, 0x01]);
        assert_eq!(cluster.data_offset(), 7);
        assert_eq!(cluster.data().len(), 57);
    }

    #[test]
    fn test_header_cluster_fields() {
        let mut cluster = ClusterBuffer::new(64);
        cluster.set_block_id(0);
        cluster.set_file_name("REPORT.TXT");
        cluster.set_creation_time(0x0102_0304_0506_0708);

        assert_eq!(cluster.file_name(), "REPORT.TXT");
        assert_eq!(cluster.creation_time(), 0x0102_0304_0506_0708);
        assert_eq!(cluster.as_bytes()[7], 10);
        assert_eq!(&cluster.as_bytes()[24..32], &[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(cluster.data_offset(), 32);
    }

    #[test]
    fn test_unread_fields_decode_erased() {
        let cluster = ClusterBuffer::new(64);
        assert_eq!(cluster.marker(), Some(Marker::Erased));
        assert_eq!(cluster.object_id(), 0xFFFF);
        assert_eq!(cluster.data_length(), 0xFFFF);
        assert_eq!(cluster.file_name(), "\u{FFFD}".repeat(16));
    }
}
