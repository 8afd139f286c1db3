//! IP Tree Builder for MMDB Format
//!
//! Builds a binary search tree for IP address lookups in the MaxMind DB layout.
//! Supports both IPv4 and IPv6 with CIDR prefixes. IPv4 networks in an IPv6
//! tree live under `::/96`; on serialization `::ffff:0:0/96` and `2002::/16`
//! are aliased to that subtree.

use crate::data_section::{DataEncoder, DataValue};
use crate::error::{GeosError, Result};
use crate::mmdb::types::{IpVersion, RecordSize, DATA_SECTION_SEPARATOR_SIZE};
use ipnet::IpNet;
use std::collections::HashMap;
use std::net::IpAddr;

/// How a value combines with what is already stored under its network
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    /// The new value replaces everything at and below the network
    Replace,
    /// Maps are merged key by key at depth 1; anything else is replaced.
    /// More specific networks below keep their own values, merged with the
    /// new one.
    TopLevelMerge,
}

/// IP tree builder using arena allocation
#[derive(Debug, Clone)]
pub struct IpTreeBuilder {
    /// All nodes in the tree (arena); node 0 is the root
    nodes: Vec<Node>,
    /// Values referenced by `NodePointer::Data`
    values: Vec<DataValue>,
    /// IP version (determines tree depth)
    ip_version: IpVersion,
}

/// A node in the IP tree
#[derive(Debug, Clone)]
struct Node {
    /// Left child (bit 0)
    left: NodePointer,
    /// Right child (bit 1)
    right: NodePointer,
}

/// Node pointer - can point to another node, a value, or be empty
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodePointer {
    /// Points to another node (value is node ID)
    Node(u32),
    /// Points to a value (index into `values`)
    Data(u32),
    /// Empty (not found marker)
    Empty,
}

/// Serialized search tree
#[derive(Debug)]
pub struct SerializedTree {
    pub tree: Vec<u8>,
    pub node_count: u32,
    pub record_size: RecordSize,
}

impl IpTreeBuilder {
    /// Create a new tree builder
    pub fn new(ip_version: IpVersion) -> Self {
        Self {
            nodes: vec![Node::new_empty()],
            values: Vec::new(),
            ip_version,
        }
    }

    pub fn ip_version(&self) -> IpVersion {
        self.ip_version
    }

    /// True when no value has been inserted
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Insert a network with its value
    pub fn insert(&mut self, network: IpNet, value: DataValue, mode: InsertMode) -> Result<()> {
        let (bits, prefix_len) = self.network_bits(network)?;
        let value_id = self.push_value(value);

        match mode {
            InsertMode::Replace => self.set_pointer(bits, prefix_len, NodePointer::Data(value_id)),
            InsertMode::TopLevelMerge => {
                let mut cache = HashMap::new();
                for (node_id, bit) in self.final_edges(bits, prefix_len)? {
                    let current = self.nodes[node_id as usize].child(bit);
                    let merged = self.merge_pointer(current, value_id, &mut cache);
                    self.nodes[node_id as usize].set_child(bit, merged);
                }
                Ok(())
            }
        }
    }

    /// Longest-prefix query against the in-memory tree
    pub fn lookup(&self, ip: IpAddr) -> Option<&DataValue> {
        let (bits, _) = self.network_bits(IpNet::from(ip)).ok()?;

        let mut node_id = 0u32;
        for depth in 0..128u8 {
            let bit = bit_at(bits, depth);
            match self.nodes[node_id as usize].child(bit) {
                NodePointer::Node(child) => node_id = child,
                NodePointer::Data(value_id) => return self.values.get(value_id as usize),
                NodePointer::Empty => return None,
            }
        }
        None
    }

    /// Map a network to 128-bit, MSB-aligned address bits and a tree depth
    fn network_bits(&self, network: IpNet) -> Result<(u128, u8)> {
        match (network, self.ip_version) {
            (IpNet::V4(net), IpVersion::V4) => {
                Ok(((u32::from(net.network()) as u128) << 96, net.prefix_len()))
            }
            (IpNet::V4(net), IpVersion::V6) => {
                Ok((u32::from(net.network()) as u128, 96 + net.prefix_len()))
            }
            (IpNet::V6(net), IpVersion::V6) => Ok((u128::from(net.network()), net.prefix_len())),
            (IpNet::V6(net), IpVersion::V4) => Err(GeosError::InvalidNetwork(format!(
                "cannot insert IPv6 network {} into an IPv4-only tree",
                net
            ))),
        }
    }

    fn push_value(&mut self, value: DataValue) -> u32 {
        self.values.push(value);
        (self.values.len() - 1) as u32
    }

    /// Walk to the parent of the edge for `bits/prefix_len`, creating nodes
    /// and splitting covering data leaves on the way.
    ///
    /// Returns the edges that represent the network: one edge, or both root
    /// edges for a zero-length prefix.
    fn final_edges(&mut self, bits: u128, prefix_len: u8) -> Result<Vec<(u32, u8)>> {
        if prefix_len == 0 {
            return Ok(vec![(0, 0), (0, 1)]);
        }

        let mut node_id = 0u32;
        for depth in 0..prefix_len - 1 {
            let bit = bit_at(bits, depth);
            node_id = match self.nodes[node_id as usize].child(bit) {
                NodePointer::Node(child) => child,
                NodePointer::Empty => {
                    let new_id = self.allocate_node(Node::new_empty())?;
                    self.nodes[node_id as usize].set_child(bit, NodePointer::Node(new_id));
                    new_id
                }
                NodePointer::Data(value_id) => {
                    // Split the covering leaf so siblings keep its value
                    let split = Node {
                        left: NodePointer::Data(value_id),
                        right: NodePointer::Data(value_id),
                    };
                    let new_id = self.allocate_node(split)?;
                    self.nodes[node_id as usize].set_child(bit, NodePointer::Node(new_id));
                    new_id
                }
            };
        }
        Ok(vec![(node_id, bit_at(bits, prefix_len - 1))])
    }

    fn set_pointer(&mut self, bits: u128, prefix_len: u8, pointer: NodePointer) -> Result<()> {
        for (node_id, bit) in self.final_edges(bits, prefix_len)? {
            self.nodes[node_id as usize].set_child(bit, pointer);
        }
        Ok(())
    }

    fn merge_pointer(
        &mut self,
        current: NodePointer,
        value_id: u32,
        cache: &mut HashMap<u32, u32>,
    ) -> NodePointer {
        match current {
            NodePointer::Empty => NodePointer::Data(value_id),
            NodePointer::Data(existing) => {
                if let Some(&merged) = cache.get(&existing) {
                    return NodePointer::Data(merged);
                }
                let merged = self.values[existing as usize].merge_top_level(&self.values[value_id as usize]);
                let merged_id = self.push_value(merged);
                cache.insert(existing, merged_id);
                NodePointer::Data(merged_id)
            }
            NodePointer::Node(child) => {
                for bit in 0..2 {
                    let grandchild = self.nodes[child as usize].child(bit);
                    let merged = self.merge_pointer(grandchild, value_id, cache);
                    self.nodes[child as usize].set_child(bit, merged);
                }
                NodePointer::Node(child)
            }
        }
    }

    /// Allocate a new node and return its ID
    fn allocate_node(&mut self, node: Node) -> Result<u32> {
        let id = u32::try_from(self.nodes.len())
            .map_err(|_| GeosError::Corrupt("search tree exceeds u32 nodes".to_string()))?;
        self.nodes.push(node);
        Ok(id)
    }

    /// Point the IPv4-mapped and 6to4 prefixes at the IPv4 subtree
    fn add_ipv4_aliases(&mut self) -> Result<()> {
        if self.ip_version != IpVersion::V6 {
            return Ok(());
        }

        // Pointer stored on the ::/96 edge, if that edge exists exactly
        let mut node_id = 0u32;
        for _ in 0..95 {
            match self.nodes[node_id as usize].left {
                NodePointer::Node(child) => node_id = child,
                _ => return Ok(()),
            }
        }
        let ipv4_root = self.nodes[node_id as usize].left;
        if ipv4_root == NodePointer::Empty {
            return Ok(());
        }

        const IPV4_MAPPED: u128 = 0xffff_u128 << 32;
        const SIX_TO_FOUR: u128 = 0x2002_u128 << 112;
        self.set_pointer(IPV4_MAPPED, 96, ipv4_root)?;
        self.set_pointer(SIX_TO_FOUR, 16, ipv4_root)
    }

    /// Serialize the tree, encoding referenced values into `encoder`
    ///
    /// Nodes are renumbered breadth-first so only reachable nodes are written
    /// and the record size is the smallest that fits.
    pub fn build(mut self, encoder: &mut DataEncoder) -> Result<SerializedTree> {
        self.add_ipv4_aliases()?;

        // Renumber reachable nodes
        let mut order = vec![0u32];
        let mut new_ids: HashMap<u32, u32> = HashMap::from([(0, 0)]);
        let mut next = 0;
        while next < order.len() {
            let node = &self.nodes[order[next] as usize];
            for pointer in [node.left, node.right] {
                if let NodePointer::Node(child) = pointer {
                    if !new_ids.contains_key(&child) {
                        new_ids.insert(child, order.len() as u32);
                        order.push(child);
                    }
                }
            }
            next += 1;
        }
        let node_count = order.len() as u32;

        // Encode values in tree order
        let mut offsets: HashMap<u32, u32> = HashMap::new();
        for &old_id in &order {
            let node = &self.nodes[old_id as usize];
            for pointer in [node.left, node.right] {
                if let NodePointer::Data(value_id) = pointer {
                    if !offsets.contains_key(&value_id) {
                        let offset = encoder.encode(&self.values[value_id as usize]);
                        offsets.insert(value_id, offset);
                    }
                }
            }
        }

        let max_record =
            node_count as u64 + DATA_SECTION_SEPARATOR_SIZE as u64 + encoder.size() as u64;
        let record_size = RecordSize::fitting(max_record)?;

        let resolve = |pointer: NodePointer| -> u32 {
            match pointer {
                NodePointer::Empty => node_count,
                NodePointer::Node(id) => new_ids[&id],
                NodePointer::Data(value_id) => {
                    node_count + DATA_SECTION_SEPARATOR_SIZE as u32 + offsets[&value_id]
                }
            }
        };

        let node_bytes = record_size.node_bytes();
        let mut tree = vec![0u8; node_count as usize * node_bytes];
        for (new_id, &old_id) in order.iter().enumerate() {
            let node = &self.nodes[old_id as usize];
            let slot = &mut tree[new_id * node_bytes..(new_id + 1) * node_bytes];
            write_node(slot, record_size, resolve(node.left), resolve(node.right));
        }

        Ok(SerializedTree {
            tree,
            node_count,
            record_size,
        })
    }
}

/// Write one node's two records
fn write_node(slot: &mut [u8], record_size: RecordSize, left: u32, right: u32) {
    match record_size {
        RecordSize::Bits24 => {
            slot[0..3].copy_from_slice(&left.to_be_bytes()[1..]);
            slot[3..6].copy_from_slice(&right.to_be_bytes()[1..]);
        }
        RecordSize::Bits28 => {
            // Layout: [Left 24 bits][Middle 8 bits][Right 24 bits]
            slot[0..3].copy_from_slice(&left.to_be_bytes()[1..]);
            slot[3] = ((((left >> 24) & 0x0F) as u8) << 4) | ((right >> 24) & 0x0F) as u8;
            slot[4..7].copy_from_slice(&right.to_be_bytes()[1..]);
        }
        RecordSize::Bits32 => {
            slot[0..4].copy_from_slice(&left.to_be_bytes());
            slot[4..8].copy_from_slice(&right.to_be_bytes());
        }
    }
}

fn bit_at(bits: u128, depth: u8) -> u8 {
    ((bits >> (127 - depth as u32)) & 1) as u8
}

impl Node {
    fn new_empty() -> Self {
        Self {
            left: NodePointer::Empty,
            right: NodePointer::Empty,
        }
    }

    fn child(&self, bit: u8) -> NodePointer {
        if bit == 0 {
            self.left
        } else {
            self.right
        }
    }

    fn set_child(&mut self, bit: u8, pointer: NodePointer) {
        if bit == 0 {
            self.left = pointer;
        } else {
            self.right = pointer;
        }
    }
}
