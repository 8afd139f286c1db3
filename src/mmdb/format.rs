//! MMDB Binary Format Parsing
//!
//! Locates the metadata marker, decodes the metadata map and derives the
//! layout needed for lookups. Everything else stays in the underlying buffer.

use super::types::{IpVersion, RecordSize, DATA_SECTION_SEPARATOR_SIZE, METADATA_MARKER};
use crate::data_section::DataValue;
use crate::decoder::Decoder;
use crate::error::{GeosError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The marker must appear within this many bytes of the end of the file
pub const METADATA_SEARCH_SIZE: usize = 128 * 1024;

/// Decoded MMDB metadata map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub binary_format_major_version: u16,
    pub binary_format_minor_version: u16,
    pub build_epoch: u64,
    pub database_type: String,
    pub ip_version: u16,
    pub languages: Vec<String>,
    pub node_count: u32,
    pub record_size: u16,
    pub description: HashMap<String, String>,
}

impl Metadata {
    /// Metadata for a freshly built database; layout fields are filled at write time
    pub fn new(database_type: impl Into<String>, ip_version: IpVersion) -> Self {
        Self {
            binary_format_major_version: 2,
            binary_format_minor_version: 0,
            build_epoch: 0,
            database_type: database_type.into(),
            ip_version: ip_version.as_metadata(),
            languages: Vec::new(),
            node_count: 0,
            record_size: 24,
            description: HashMap::new(),
        }
    }

    /// Encode as the map stored after the metadata marker
    pub fn to_data_value(&self) -> DataValue {
        let mut map = HashMap::new();
        map.insert(
            "binary_format_major_version".to_string(),
            DataValue::Uint16(self.binary_format_major_version),
        );
        map.insert(
            "binary_format_minor_version".to_string(),
            DataValue::Uint16(self.binary_format_minor_version),
        );
        map.insert("build_epoch".to_string(), DataValue::Uint64(self.build_epoch));
        map.insert(
            "database_type".to_string(),
            DataValue::String(self.database_type.clone()),
        );
        map.insert("ip_version".to_string(), DataValue::Uint16(self.ip_version));
        map.insert(
            "languages".to_string(),
            DataValue::Array(
                self.languages
                    .iter()
                    .map(|l| DataValue::String(l.clone()))
                    .collect(),
            ),
        );
        map.insert("node_count".to_string(), DataValue::Uint32(self.node_count));
        map.insert("record_size".to_string(), DataValue::Uint16(self.record_size));
        map.insert(
            "description".to_string(),
            DataValue::Map(
                self.description
                    .iter()
                    .map(|(k, v)| (k.clone(), DataValue::String(v.clone())))
                    .collect(),
            ),
        );
        DataValue::Map(map)
    }
}

/// Layout derived from the metadata
#[derive(Debug, Clone, Copy)]
pub struct MmdbHeader {
    /// Number of nodes in the search tree
    pub node_count: u32,
    /// Record size in bits (24, 28, or 32)
    pub record_size: RecordSize,
    /// IP version (4 or 6)
    pub ip_version: IpVersion,
    /// Size of the search tree in bytes
    pub tree_size: usize,
    /// Offset of the data section (tree + separator)
    pub data_section_start: usize,
    /// Offset of the metadata marker (end of the data section)
    pub data_section_end: usize,
}

impl MmdbHeader {
    /// Validate metadata against the buffer and compute section offsets
    pub fn from_metadata(metadata: &Metadata, marker_offset: usize) -> Result<Self> {
        let record_size = RecordSize::from_bits(metadata.record_size)?;
        let ip_version = IpVersion::from_metadata(metadata.ip_version)?;

        let tree_size = metadata.node_count as usize * metadata.record_size as usize * 2 / 8;
        let data_section_start = tree_size + DATA_SECTION_SEPARATOR_SIZE;
        if data_section_start > marker_offset {
            return Err(GeosError::Corrupt(format!(
                "search tree of {} nodes overruns the metadata at {}",
                metadata.node_count, marker_offset
            )));
        }

        Ok(MmdbHeader {
            node_count: metadata.node_count,
            record_size,
            ip_version,
            tree_size,
            data_section_start,
            data_section_end: marker_offset,
        })
    }
}

/// Find the metadata marker, scanning from the end of the buffer
///
/// Only the last [`METADATA_SEARCH_SIZE`] bytes are searched. If the marker
/// occurs several times the last one wins.
pub fn find_metadata_marker(data: &[u8]) -> Result<usize> {
    let search_start = data.len().saturating_sub(METADATA_SEARCH_SIZE);
    memchr::memmem::rfind(&data[search_start..], METADATA_MARKER)
        .map(|pos| search_start + pos)
        .ok_or_else(|| GeosError::Corrupt("metadata marker not found".to_string()))
}

/// Locate and decode the metadata; returns it with the marker offset
pub fn read_metadata(data: &[u8]) -> Result<(Metadata, usize)> {
    let marker = find_metadata_marker(data)?;
    let metadata_bytes = &data[marker + METADATA_MARKER.len()..];
    let metadata: Metadata = Decoder::new(metadata_bytes, 0)
        .decode()
        .map_err(|e| GeosError::Corrupt(format!("failed to decode metadata: {}", e)))?;
    Ok((metadata, marker))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_section::DataEncoder;

    fn metadata_tail(metadata: &Metadata) -> Vec<u8> {
        let mut encoder = DataEncoder::new();
        encoder.encode(&metadata.to_data_value());
        let mut out = METADATA_MARKER.to_vec();
        out.extend_from_slice(&encoder.into_bytes());
        out
    }

    #[test]
    fn test_metadata_round_trip() {
        let mut metadata = Metadata::new("GEOS-Test", IpVersion::V6);
        metadata.build_epoch = 1_700_000_000;
        metadata.languages = vec!["en".to_string()];
        metadata
            .description
            .insert("en".to_string(), "test".to_string());

        let mut data = vec![0u8; 64];
        data.extend_from_slice(&metadata_tail(&metadata));

        let (decoded, marker) = read_metadata(&data).unwrap();
        assert_eq!(marker, 64);
        assert_eq!(decoded, metadata);
    }

    #[test]
    fn test_required_keys() {
        for key in ["languages", "description"] {
            let DataValue::Map(mut map) = Metadata::new("GEOS-Test", IpVersion::V6).to_data_value()
            else {
                unreachable!()
            };
            map.remove(key);
            let mut encoder = DataEncoder::new();
            encoder.encode(&DataValue::Map(map));
            let mut data = METADATA_MARKER.to_vec();
            data.extend_from_slice(&encoder.into_bytes());

            assert!(matches!(read_metadata(&data), Err(GeosError::Corrupt(_))), "{}", key);
        }
    }

    #[test]
    fn test_last_marker_wins() {
        let metadata = Metadata::new("GEOS-Test", IpVersion::V4);
        let mut data = METADATA_MARKER.to_vec();
        data.extend_from_slice(b"garbage");
        let second = data.len();
        data.extend_from_slice(&metadata_tail(&metadata));

        assert_eq!(find_metadata_marker(&data).unwrap(), second);
    }

    #[test]
    fn test_metadata_not_found() {
        let data = b"not a valid mmdb file";
        assert!(matches!(
            find_metadata_marker(data),
            Err(GeosError::Corrupt(_))
        ));
    }

    #[test]
    fn test_header_layout() {
        let mut metadata = Metadata::new("GEOS-Test", IpVersion::V6);
        metadata.node_count = 10;
        metadata.record_size = 28;

        let header = MmdbHeader::from_metadata(&metadata, 1000).unwrap();
        assert_eq!(header.tree_size, 70);
        assert_eq!(header.data_section_start, 86);
        assert_eq!(header.ip_version, IpVersion::V6);

        assert!(MmdbHeader::from_metadata(&metadata, 50).is_err());
    }
}
