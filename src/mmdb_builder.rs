//! MMDB Database Builder
//!
//! Assembles a complete MMDB buffer (search tree, separator, data section,
//! metadata) from `(network, value)` records. Used to materialize patch
//! trees and merged dumps; the result can be wrapped in a [`Reader`] directly.

use crate::data_section::{DataEncoder, DataValue};
use crate::error::Result;
use crate::ip_tree_builder::{InsertMode, IpTreeBuilder};
use crate::mmdb::types::{IpVersion, DATA_SECTION_SEPARATOR_SIZE, METADATA_MARKER};
use crate::mmdb::Metadata;
use crate::reader::Reader;
use ipnet::IpNet;
use std::time::{SystemTime, UNIX_EPOCH};

/// In-memory MMDB writer
#[derive(Debug, Clone)]
pub struct MmdbBuilder {
    tree: IpTreeBuilder,
    metadata: Metadata,
    inserted: usize,
}

impl MmdbBuilder {
    /// Create a new builder
    ///
    /// The build epoch defaults to the current time.
    pub fn new(database_type: impl Into<String>, ip_version: IpVersion) -> Self {
        let mut metadata = Metadata::new(database_type, ip_version);
        metadata.build_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        metadata.languages = vec!["en".to_string()];
        Self::with_metadata(metadata)
    }

    /// Create a builder that carries over existing metadata
    ///
    /// Layout fields (`node_count`, `record_size`) are recomputed on build.
    pub fn with_metadata(metadata: Metadata) -> Self {
        let ip_version = if metadata.ip_version == 4 {
            IpVersion::V4
        } else {
            IpVersion::V6
        };
        Self {
            tree: IpTreeBuilder::new(ip_version),
            metadata,
            inserted: 0,
        }
    }

    /// Add a description in a specific language
    ///
    /// Can be called multiple times for different languages.
    pub fn with_description(mut self, language: impl Into<String>, text: impl Into<String>) -> Self {
        self.metadata
            .description
            .insert(language.into(), text.into());
        self
    }

    /// Override the build epoch (seconds since the Unix epoch)
    pub fn with_build_epoch(mut self, build_epoch: u64) -> Self {
        self.metadata.build_epoch = build_epoch;
        self
    }

    /// Insert a network with its value
    pub fn insert(&mut self, network: IpNet, value: DataValue, mode: InsertMode) -> Result<()> {
        self.tree.insert(network, value, mode)?;
        self.inserted += 1;
        Ok(())
    }

    /// Number of successful inserts
    pub fn len(&self) -> usize {
        self.inserted
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Longest-prefix query against the tree built so far
    pub fn lookup(&self, ip: std::net::IpAddr) -> Option<&DataValue> {
        self.tree.lookup(ip)
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// Serialize into MMDB bytes
    pub fn build(self) -> Result<Vec<u8>> {
        let mut metadata = self.metadata;
        let mut data_encoder = DataEncoder::new();
        let serialized = self.tree.build(&mut data_encoder)?;

        metadata.node_count = serialized.node_count;
        metadata.record_size = serialized.record_size as u16;

        let data_section = data_encoder.into_bytes();

        // Metadata has its own pointer space
        let mut meta_encoder = DataEncoder::new();
        meta_encoder.encode(&metadata.to_data_value());
        let metadata_bytes = meta_encoder.into_bytes();

        let mut database = Vec::with_capacity(
            serialized.tree.len()
                + DATA_SECTION_SEPARATOR_SIZE
                + data_section.len()
                + METADATA_MARKER.len()
                + metadata_bytes.len(),
        );
        database.extend_from_slice(&serialized.tree);
        database.extend_from_slice(&[0u8; DATA_SECTION_SEPARATOR_SIZE]);
        database.extend_from_slice(&data_section);
        database.extend_from_slice(METADATA_MARKER);
        database.extend_from_slice(&metadata_bytes);

        Ok(database)
    }

    /// Serialize and open the result as a [`Reader`]
    pub fn build_reader(self) -> Result<Reader> {
        Reader::from_bytes(self.build()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::NetworksOptions;
    use crate::mmdb::RecordSize;

    #[test]
    fn test_empty_database_is_readable() {
        let reader = MmdbBuilder::new("GEOS-Empty", IpVersion::V6)
            .build_reader()
            .unwrap();
        assert!(reader.is_empty());
        assert_eq!(reader.networks(NetworksOptions::default()).count(), 0);
        assert!(reader
            .lookup_record("1.2.3.4".parse().unwrap())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_metadata_carried_over() {
        let mut builder = MmdbBuilder::new("GEOS-City", IpVersion::V6)
            .with_description("en", "City overrides")
            .with_build_epoch(42);
        builder
            .insert(
                "10.0.0.0/8".parse().unwrap(),
                DataValue::Uint32(7),
                InsertMode::Replace,
            )
            .unwrap();
        assert_eq!(builder.len(), 1);

        let reader = builder.build_reader().unwrap();
        let metadata = reader.metadata();
        assert_eq!(metadata.database_type, "GEOS-City");
        assert_eq!(metadata.build_epoch, 42);
        assert_eq!(metadata.description["en"], "City overrides");
        assert_eq!(metadata.record_size, RecordSize::Bits24 as u16);
        assert_eq!(metadata.node_count, reader.header().node_count);

        let (value, network) = reader
            .lookup::<u32>("10.20.30.40".parse().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(network.to_string(), "10.0.0.0/8");
    }

    #[test]
    fn test_ipv6_networks() {
        let mut builder = MmdbBuilder::new("GEOS-Test", IpVersion::V6);
        builder
            .insert(
                "2001:db8::/32".parse().unwrap(),
                DataValue::String("doc".to_string()),
                InsertMode::Replace,
            )
            .unwrap();
        let reader = builder.build_reader().unwrap();

        let (value, network) = reader
            .lookup::<String>("2001:db8::1".parse().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(value, "doc");
        assert_eq!(network.to_string(), "2001:db8::/32");
        assert!(reader
            .lookup_record("2001:db9::1".parse().unwrap())
            .unwrap()
            .is_none());
    }
}
