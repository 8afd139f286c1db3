//! Database capability
//!
//! Every queryable IP database, whether an on-disk MMDB, an in-memory patch
//! tree or a stack of layers, exposes the same set of operations through the
//! [`Database`] trait. Callers hold `Arc<dyn Database>` and never need to know
//! which variant answers.
//!
//! # Examples
//!
//! ```no_run
//! use geos::{Database, Reader};
//! use geos::models::City;
//! use std::sync::Arc;
//!
//! let db: Arc<dyn Database> = Arc::new(Reader::open("city.mmdb")?);
//! if let Some((city, network)) = db.lookup::<City>("1.2.3.4".parse()?)? {
//!     println!("{} -> {:?}", network, city.city.names.get("en"));
//! }
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::decoder::Decoder;
use crate::error::Result;
use crate::mmdb::Metadata;
use crate::reader::Networks;
use ipnet::IpNet;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::net::IpAddr;

/// A located record: the matched network and a handle on its encoded value
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    data_section: &'a [u8],
    offset: usize,
    network: IpNet,
}

impl<'a> Record<'a> {
    pub(crate) fn new(data_section: &'a [u8], offset: usize, network: IpNet) -> Self {
        Self {
            data_section,
            offset,
            network,
        }
    }

    /// The stored network containing the looked-up address
    pub fn network(&self) -> IpNet {
        self.network
    }

    /// Offset of the value within the data section
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Decode the value into `T`
    pub fn decode<T: Deserialize<'a>>(&self) -> Result<T> {
        Decoder::new(self.data_section, self.offset).decode()
    }
}

/// Options for [`Database::networks`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetworksOptions {
    /// Skip `::ffff:0:0/96`, `2002::/16` and other aliases of the IPv4 subtree
    pub skip_aliased_networks: bool,
}

impl NetworksOptions {
    /// Options that yield every IPv4 network exactly once
    pub fn skip_aliased() -> Self {
        Self {
            skip_aliased_networks: true,
        }
    }
}

/// Capability shared by on-disk databases, patch trees and patched stacks
pub trait Database: Send + Sync {
    /// Find the record for the longest stored prefix containing `ip`
    fn lookup_record(&self, ip: IpAddr) -> Result<Option<Record<'_>>>;

    /// Enumerate stored networks in ascending tree order
    fn networks(&self, options: NetworksOptions) -> Result<Networks<'_>>;

    /// Decoded metadata, by value
    fn metadata(&self) -> Metadata;

    /// The complete MMDB bytes of this database
    fn raw_data(&self) -> Result<&[u8]>;

    /// True when the database holds no records
    fn is_empty(&self) -> bool;
}

impl dyn Database {
    /// Look up `ip` and decode the matched record into `T`
    pub fn lookup<T: DeserializeOwned>(&self, ip: IpAddr) -> Result<Option<(T, IpNet)>> {
        match self.lookup_record(ip)? {
            Some(record) => Ok(Some((record.decode()?, record.network()))),
            None => Ok(None),
        }
    }
}
