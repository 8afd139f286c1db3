//! MMDB Search Tree Traversal
//!
//! Implements binary search tree traversal for IP address lookups.
//! The tree uses a compact binary representation where each node contains
//! two records (left and right) that point to either:
//! - Another node (continue traversal)
//! - A data section offset (found)
//! - A "not found" marker (record == node_count)

use super::format::MmdbHeader;
use super::types::{IpVersion, RecordSize, DATA_SECTION_SEPARATOR_SIZE};
use crate::error::{GeosError, Result};
use std::net::IpAddr;

/// Result of an IP lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupResult {
    /// Offset into the data section (relative to data section start)
    pub data_offset: usize,
    /// Network prefix length in the address family of the queried IP
    pub prefix_len: u8,
}

/// Search tree for IP address lookups
#[derive(Clone, Copy)]
pub struct SearchTree<'a> {
    /// The raw file data containing the tree
    data: &'a [u8],
    /// Parsed header information
    header: &'a MmdbHeader,
}

impl<'a> SearchTree<'a> {
    /// Create a new search tree
    pub fn new(data: &'a [u8], header: &'a MmdbHeader) -> Self {
        Self { data, header }
    }

    pub fn node_count(&self) -> u32 {
        self.header.node_count
    }

    /// Look up an IP address
    ///
    /// `ipv4_start` is the node (and depth) reached after 96 zero bits in an
    /// IPv6 tree; see [`SearchTree::find_ipv4_start`].
    pub fn lookup(&self, ip: IpAddr, ipv4_start: (u32, usize)) -> Result<Option<LookupResult>> {
        let bit_count = self.header.ip_version.bit_count();

        let (record, depth, v4_offset) = match ip {
            IpAddr::V4(addr) => {
                let (start, start_depth) = ipv4_start;
                let (record, depth) =
                    self.walk(start, start_depth, u32::from(addr) as u128, bit_count)?;
                (record, depth, bit_count - 32)
            }
            IpAddr::V6(addr) => {
                if self.header.ip_version == IpVersion::V4 {
                    return Err(GeosError::InvalidNetwork(format!(
                        "cannot look up IPv6 address {} in an IPv4-only database",
                        addr
                    )));
                }
                let (record, depth) = self.walk(0, 0, u128::from(addr), bit_count)?;
                (record, depth, 0)
            }
        };

        if record == self.header.node_count {
            return Ok(None);
        }
        if record < self.header.node_count {
            return Err(GeosError::Corrupt(format!(
                "search tree ended at node {} without a data record",
                record
            )));
        }

        Ok(Some(LookupResult {
            data_offset: self.resolve_data_offset(record)?,
            prefix_len: depth.saturating_sub(v4_offset) as u8,
        }))
    }

    /// Walk `ip` bit by bit from `node` until a non-node record or `bit_count` bits
    fn walk(&self, mut node: u32, mut depth: usize, ip: u128, bit_count: usize) -> Result<(u32, usize)> {
        while node < self.header.node_count && depth < bit_count {
            let bit = ((ip >> (bit_count - 1 - depth)) & 1) as u8;
            node = self.read_record(node, bit)?;
            depth += 1;
        }
        Ok((node, depth))
    }

    /// Find the IPv4 start node in an IPv6 tree
    ///
    /// IPv4 addresses live under `::/96`; walk 96 zero bits to reach the
    /// IPv4 subtree. An IPv4 tree starts at the root.
    pub fn find_ipv4_start(&self) -> Result<(u32, usize)> {
        match self.header.ip_version {
            IpVersion::V4 => Ok((0, 0)),
            IpVersion::V6 => self.walk(0, 0, 0, 96),
        }
    }

    /// Read a record from a node
    ///
    /// Each node contains two records. `side` determines which:
    /// - 0 = left record (for IP bit 0)
    /// - 1 = right record (for IP bit 1)
    pub fn read_record(&self, node: u32, side: u8) -> Result<u32> {
        if node >= self.header.node_count {
            return Err(GeosError::Corrupt(format!(
                "node index {} exceeds node count {}",
                node, self.header.node_count
            )));
        }

        let node_bytes = self.header.record_size.node_bytes();
        let offset = node as usize * node_bytes;
        let bytes = self
            .data
            .get(offset..offset + node_bytes)
            .filter(|_| offset + node_bytes <= self.header.tree_size)
            .ok_or_else(|| {
                GeosError::Corrupt(format!(
                    "node offset {} exceeds tree size {}",
                    offset, self.header.tree_size
                ))
            })?;

        let be = |b: &[u8]| b.iter().fold(0u32, |acc, &x| (acc << 8) | x as u32);

        Ok(match (self.header.record_size, side) {
            (RecordSize::Bits24, 0) => be(&bytes[0..3]),
            (RecordSize::Bits24, _) => be(&bytes[3..6]),
            // Middle byte holds the high nibble of each record
            (RecordSize::Bits28, 0) => (((bytes[3] >> 4) as u32) << 24) | be(&bytes[0..3]),
            (RecordSize::Bits28, _) => (((bytes[3] & 0x0F) as u32) << 24) | be(&bytes[4..7]),
            (RecordSize::Bits32, 0) => be(&bytes[0..4]),
            (RecordSize::Bits32, _) => be(&bytes[4..8]),
        })
    }

    /// Calculate data section offset from record value
    ///
    /// `data_offset = record - node_count - 16`; the 16 is the separator.
    pub fn resolve_data_offset(&self, record: u32) -> Result<usize> {
        let offset = (record as usize)
            .checked_sub(self.header.node_count as usize + DATA_SECTION_SEPARATOR_SIZE)
            .ok_or_else(|| {
                GeosError::Corrupt(format!(
                    "record {} points into the separator (node_count = {})",
                    record, self.header.node_count
                ))
            })?;

        let section_len = self.header.data_section_end - self.header.data_section_start;
        if offset >= section_len {
            return Err(GeosError::Corrupt(format!(
                "data offset {} beyond data section of {} bytes",
                offset, section_len
            )));
        }
        Ok(offset)
    }
}
