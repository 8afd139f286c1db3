//! MMDB-specific Type Definitions

use crate::error::{GeosError, Result};

/// MMDB metadata marker: "\xAB\xCD\xEFMaxMind.com"
pub const METADATA_MARKER: &[u8] = b"\xAB\xCD\xEFMaxMind.com";

/// Zero bytes between the search tree and the data section
pub const DATA_SECTION_SEPARATOR_SIZE: usize = 16;

/// IP version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    /// IPv4 only
    V4,
    /// IPv6 (may include IPv4-mapped addresses)
    V6,
}

impl IpVersion {
    /// Number of address bits walked by the search tree
    pub fn bit_count(self) -> usize {
        match self {
            IpVersion::V4 => 32,
            IpVersion::V6 => 128,
        }
    }

    /// Create from the metadata `ip_version` field
    pub fn from_metadata(version: u16) -> Result<Self> {
        match version {
            4 => Ok(IpVersion::V4),
            6 => Ok(IpVersion::V6),
            _ => Err(GeosError::Corrupt(format!("invalid IP version: {}", version))),
        }
    }

    /// Value stored in the metadata `ip_version` field
    pub fn as_metadata(self) -> u16 {
        match self {
            IpVersion::V4 => 4,
            IpVersion::V6 => 6,
        }
    }
}

/// Record size in bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSize {
    /// 24-bit records (3 bytes per record, 6 bytes per node)
    Bits24 = 24,
    /// 28-bit records (3.5 bytes per record, 7 bytes per node)
    Bits28 = 28,
    /// 32-bit records (4 bytes per record, 8 bytes per node)
    Bits32 = 32,
}

impl RecordSize {
    /// Get the size of a node (2 records) in bytes
    pub fn node_bytes(self) -> usize {
        match self {
            RecordSize::Bits24 => 6,
            RecordSize::Bits28 => 7,
            RecordSize::Bits32 => 8,
        }
    }

    /// Largest record value representable at this size
    pub fn max_record(self) -> u64 {
        (1u64 << (self as u32)) - 1
    }

    /// Smallest record size able to hold `max_value`
    pub fn fitting(max_value: u64) -> Result<Self> {
        [RecordSize::Bits24, RecordSize::Bits28, RecordSize::Bits32]
            .into_iter()
            .find(|size| max_value <= size.max_record())
            .ok_or_else(|| {
                GeosError::Corrupt(format!(
                    "record value {} exceeds 32-bit record size",
                    max_value
                ))
            })
    }

    /// Create from bit size
    pub fn from_bits(bits: u16) -> Result<Self> {
        match bits {
            24 => Ok(RecordSize::Bits24),
            28 => Ok(RecordSize::Bits28),
            32 => Ok(RecordSize::Bits32),
            _ => Err(GeosError::Corrupt(format!(
                "invalid record size: {} bits",
                bits
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_size_fitting() {
        assert_eq!(RecordSize::fitting(100).unwrap(), RecordSize::Bits24);
        assert_eq!(RecordSize::fitting(1 << 24).unwrap(), RecordSize::Bits28);
        assert_eq!(RecordSize::fitting(1 << 30).unwrap(), RecordSize::Bits32);
        assert!(RecordSize::fitting(1 << 33).is_err());
    }

    #[test]
    fn test_from_bits() {
        assert_eq!(RecordSize::from_bits(28).unwrap().node_bytes(), 7);
        assert!(RecordSize::from_bits(20).is_err());
        assert!(IpVersion::from_metadata(5).is_err());
    }
}
