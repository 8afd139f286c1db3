//! MMDB Reader
//!
//! Opens an MMDB buffer (owned or memory-mapped), answers longest-prefix
//! lookups by walking the search tree and enumerates stored networks.
//! Readers are immutable after construction and safe to share across threads.

use crate::data_section::DataValue;
use crate::database::{Database, NetworksOptions, Record};
use crate::error::{GeosError, Result};
use crate::mmdb::{read_metadata, Metadata, MmdbHeader, SearchTree};
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use memmap2::Mmap;
use serde::Deserialize;
use std::fmt;
use std::fs::File;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

/// Storage for database data - either owned or memory-mapped
enum Storage {
    Owned(Vec<u8>),
    Mmap(Mmap),
}

impl Storage {
    fn as_slice(&self) -> &[u8] {
        match self {
            Storage::Owned(v) => v.as_slice(),
            Storage::Mmap(m) => &m[..],
        }
    }
}

/// Read-only MMDB database
pub struct Reader {
    storage: Storage,
    header: MmdbHeader,
    metadata: Metadata,
    /// Node and depth reached after 96 zero bits (root for IPv4 trees)
    ipv4_start: (u32, usize),
}

impl fmt::Debug for Reader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader")
            .field("database_type", &self.metadata.database_type)
            .field("node_count", &self.header.node_count)
            .field("size", &self.as_bytes().len())
            .finish()
    }
}

impl Reader {
    /// Open a database file using memory mapping
    ///
    /// Replacing the file by rename keeps this mapping valid; the reader
    /// keeps serving the old contents until it is dropped.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        // SAFETY: files are only ever replaced by rename, never written in place
        let mmap = unsafe { Mmap::map(&file) }?;
        Self::from_storage(Storage::Mmap(mmap)).map_err(|e| match e {
            GeosError::Corrupt(msg) => GeosError::Corrupt(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// Create a reader over an owned buffer
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        Self::from_storage(Storage::Owned(data))
    }

    fn from_storage(storage: Storage) -> Result<Self> {
        let data = storage.as_slice();
        let (metadata, marker) = read_metadata(data)?;
        let header = MmdbHeader::from_metadata(&metadata, marker)?;
        let ipv4_start = SearchTree::new(data, &header).find_ipv4_start()?;

        Ok(Self {
            storage,
            header,
            metadata,
            ipv4_start,
        })
    }

    /// The complete database bytes
    pub fn as_bytes(&self) -> &[u8] {
        self.storage.as_slice()
    }

    /// The data section (between the separator and the metadata marker)
    pub fn data_section(&self) -> &[u8] {
        &self.as_bytes()[self.header.data_section_start..self.header.data_section_end]
    }

    pub fn header(&self) -> &MmdbHeader {
        &self.header
    }

    /// Decoded metadata
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    fn tree(&self) -> SearchTree<'_> {
        SearchTree::new(self.as_bytes(), &self.header)
    }

    /// Find the record for the longest stored prefix containing `ip`
    pub fn lookup_record(&self, ip: IpAddr) -> Result<Option<Record<'_>>> {
        let Some(hit) = self.tree().lookup(ip, self.ipv4_start)? else {
            return Ok(None);
        };
        let network = IpNet::new(ip, hit.prefix_len)?.trunc();
        Ok(Some(Record::new(self.data_section(), hit.data_offset, network)))
    }

    /// Look up `ip` and decode the matched record into `T`
    pub fn lookup<'a, T: Deserialize<'a>>(&'a self, ip: IpAddr) -> Result<Option<(T, IpNet)>> {
        match self.lookup_record(ip)? {
            Some(record) => Ok(Some((record.decode()?, record.network()))),
            None => Ok(None),
        }
    }

    /// Enumerate stored networks in ascending tree order
    pub fn networks(&self, options: NetworksOptions) -> Networks<'_> {
        Networks::new(self, options)
    }

    /// True when the data section is empty (no network carries a record)
    pub fn is_empty(&self) -> bool {
        self.header.data_section_end == self.header.data_section_start
    }

    /// Walk every network and decode every record; returns the network count
    pub fn verify(&self) -> Result<usize> {
        let mut count = 0;
        for record in self.networks(NetworksOptions::default()) {
            let record = record?;
            record.decode::<DataValue>()?;
            count += 1;
        }
        Ok(count)
    }
}

impl Database for Reader {
    fn lookup_record(&self, ip: IpAddr) -> Result<Option<Record<'_>>> {
        Reader::lookup_record(self, ip)
    }

    fn networks(&self, options: NetworksOptions) -> Result<Networks<'_>> {
        Ok(Reader::networks(self, options))
    }

    fn metadata(&self) -> Metadata {
        self.metadata.clone()
    }

    fn raw_data(&self) -> Result<&[u8]> {
        Ok(self.as_bytes())
    }

    fn is_empty(&self) -> bool {
        Reader::is_empty(self)
    }
}

struct PendingNode {
    ip: u128,
    depth: usize,
    record: u32,
}

/// Depth-first iterator over the networks of a [`Reader`]
///
/// Items are yielded in ascending address order. Networks under `::/96` of
/// an IPv6 database are reported as IPv4 networks.
pub struct Networks<'a> {
    reader: &'a Reader,
    tree: SearchTree<'a>,
    bit_count: usize,
    skip_aliased: bool,
    stack: Vec<PendingNode>,
}

impl<'a> Networks<'a> {
    fn new(reader: &'a Reader, options: NetworksOptions) -> Self {
        let tree = reader.tree();
        let mut stack = Vec::new();
        if reader.header.node_count > 0 {
            stack.push(PendingNode {
                ip: 0,
                depth: 0,
                record: 0,
            });
        }
        Self {
            reader,
            tree,
            bit_count: reader.header.ip_version.bit_count(),
            skip_aliased: options.skip_aliased_networks,
            stack,
        }
    }

    fn is_alias(&self, ip: u128, depth: usize, record: u32) -> bool {
        let (v4_node, v4_depth) = self.reader.ipv4_start;
        self.skip_aliased
            && self.bit_count == 128
            && v4_depth == 96
            && v4_node != 0
            && record == v4_node
            && !(ip == 0 && depth == 96)
    }

    fn network(&self, ip: u128, depth: usize) -> Result<IpNet> {
        if self.bit_count == 32 {
            return Ok(IpNet::V4(Ipv4Net::new(Ipv4Addr::from(ip as u32), depth as u8)?));
        }
        if depth >= 96 && ip >> 32 == 0 {
            return Ok(IpNet::V4(Ipv4Net::new(
                Ipv4Addr::from(ip as u32),
                (depth - 96) as u8,
            )?));
        }
        Ok(IpNet::V6(Ipv6Net::new(Ipv6Addr::from(ip), depth as u8)?))
    }

    fn advance(&mut self) -> Result<Option<Record<'a>>> {
        let node_count = self.tree.node_count();

        while let Some(PendingNode { ip, depth, record }) = self.stack.pop() {
            if record == node_count {
                continue;
            }
            if record > node_count {
                let offset = self.tree.resolve_data_offset(record)?;
                let network = self.network(ip, depth)?;
                return Ok(Some(Record::new(
                    self.reader.data_section(),
                    offset,
                    network,
                )));
            }
            if depth >= self.bit_count {
                return Err(GeosError::Corrupt(format!(
                    "search tree deeper than {} bits at node {}",
                    self.bit_count, record
                )));
            }
            if depth > 0 && self.is_alias(ip, depth, record) {
                continue;
            }

            let right_bit = 1u128 << (self.bit_count - 1 - depth);
            // Right first so the left branch is popped first
            self.stack.push(PendingNode {
                ip: ip | right_bit,
                depth: depth + 1,
                record: self.tree.read_record(record, 1)?,
            });
            self.stack.push(PendingNode {
                ip,
                depth: depth + 1,
                record: self.tree.read_record(record, 0)?,
            });
        }
        Ok(None)
    }
}

impl<'a> Iterator for Networks<'a> {
    type Item = Result<Record<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.advance() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => {
                self.stack.clear();
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ip_tree_builder::InsertMode;
    use crate::mmdb::IpVersion;
    use crate::mmdb_builder::MmdbBuilder;

    fn scenario_a(ip_version: IpVersion) -> Reader {
        let mut builder = MmdbBuilder::new("GEOS-Test", ip_version);
        for (cidr, value) in [("1.0.0.0/8", "a"), ("1.2.0.0/16", "b"), ("2.0.0.0/8", "c")] {
            builder
                .insert(
                    cidr.parse().unwrap(),
                    DataValue::String(value.to_string()),
                    InsertMode::Replace,
                )
                .unwrap();
        }
        builder.build_reader().unwrap()
    }

    #[test]
    fn test_longest_prefix_lookup() {
        for version in [IpVersion::V4, IpVersion::V6] {
            let reader = scenario_a(version);
            let lookup = |ip: &str| -> Option<(String, IpNet)> {
                reader.lookup::<String>(ip.parse().unwrap()).unwrap()
            };

            let (value, network) = lookup("1.2.3.4").unwrap();
            assert_eq!(value, "b");
            assert_eq!(network.to_string(), "1.2.0.0/16");
            assert_eq!(lookup("1.3.3.4").unwrap().0, "a");
            assert_eq!(lookup("2.2.2.2").unwrap().0, "c");
            assert!(lookup("9.9.9.9").is_none());
        }
    }

    #[test]
    fn test_ipv4_via_aliases() {
        let reader = scenario_a(IpVersion::V6);
        let mapped = reader
            .lookup::<String>("::ffff:1.2.3.4".parse().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(mapped.0, "b");

        // 6to4: 2002:0102:0304::/48 embeds 1.2.3.4
        let six_to_four = reader
            .lookup::<String>("2002:102:304::1".parse().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(six_to_four.0, "b");
    }

    #[test]
    fn test_networks_ascending_and_aliases() {
        let reader = scenario_a(IpVersion::V6);

        let skipped: Vec<(String, String)> = reader
            .networks(NetworksOptions::skip_aliased())
            .map(|r| {
                let r = r.unwrap();
                (r.network().to_string(), r.decode::<String>().unwrap())
            })
            .collect();

        // 1.0.0.0/8 is split around 1.2.0.0/16
        let expected = [
            ("1.0.0.0/15", "a"),
            ("1.2.0.0/16", "b"),
            ("1.3.0.0/16", "a"),
            ("1.4.0.0/14", "a"),
            ("1.8.0.0/13", "a"),
            ("1.16.0.0/12", "a"),
            ("1.32.0.0/11", "a"),
            ("1.64.0.0/10", "a"),
            ("1.128.0.0/9", "a"),
            ("2.0.0.0/8", "c"),
        ];
        let expected: Vec<(String, String)> = expected
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect();
        assert_eq!(skipped, expected);

        let all = reader.networks(NetworksOptions::default()).count();
        assert!(all > skipped.len());
    }

    #[test]
    fn test_metadata_and_verify() {
        let reader = scenario_a(IpVersion::V4);
        assert_eq!(reader.metadata().database_type, "GEOS-Test");
        assert_eq!(reader.metadata().ip_version, 4);
        assert!(reader.verify().unwrap() >= 3);
        assert!(!reader.is_empty());
    }

    #[test]
    fn test_corrupt_buffer() {
        assert!(matches!(
            Reader::from_bytes(b"definitely not an mmdb".to_vec()),
            Err(GeosError::Corrupt(_))
        ));
    }
}
