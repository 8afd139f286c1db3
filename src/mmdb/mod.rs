//! MaxMind DB (MMDB) file structure
//!
//! The MMDB format uses a binary search tree for efficient IP address
//! lookups. Data is stored in the MMDB data section format, handled by
//! [`crate::decoder`] (reading) and [`crate::data_section`] (writing).
//!
//! ## Architecture
//!
//! - **types**: MMDB-specific types and constants
//! - **format**: Metadata marker scan and metadata decoding
//! - **tree**: Search tree traversal for IP lookups

pub mod format;
pub mod tree;
pub mod types;

pub use format::{find_metadata_marker, read_metadata, Metadata, MmdbHeader};
pub use tree::{LookupResult, SearchTree};
pub use types::{IpVersion, RecordSize, DATA_SECTION_SEPARATOR_SIZE, METADATA_MARKER};
