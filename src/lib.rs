//! GEOS - Geolocation Service Core
//!
//! GEOS answers "where is this IP address, and who operates it" from MaxMind
//! DB (MMDB) files, with locally maintained corrections layered on top, and
//! serves the GeoNames catalog of continents, countries, subdivisions and
//! cities.
//!
//! # Quick Start
//!
//! ```rust
//! use geos::{models, DataValue, InsertMode, IpVersion, MmdbBuilder};
//!
//! let mut builder = MmdbBuilder::new("GEOS-City", IpVersion::V6);
//! let record = DataValue::from_json(&serde_json::json!({
//!     "country": {"iso_code": "FR", "names": {"en": "France"}}
//! }))?;
//! builder.insert("81.0.0.0/8".parse()?, record, InsertMode::Replace)?;
//!
//! let reader = builder.build_reader()?;
//! let (city, network): (models::City, _) = reader.lookup("81.2.69.160".parse()?)?.unwrap();
//! assert_eq!(city.country.iso_code, "FR");
//! assert_eq!(network.to_string(), "81.0.0.0/8");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────┐
//! │  Geos service                        │
//! ├──────────────────────────────────────┤
//! │  MmdbSource (City, ISP)              │
//! │    UpdatableFile<MmdbState>          │──▶ remote .mmdb
//! │    PatchesSource                     │──▶ <prefix>_patches.tar.gz
//! │    ArcSwap<PatchedDatabase>          │
//! │  GeonamesSource                      │──▶ countryInfo / admin1 / cities500
//! │    GeonamesIndex (fst + FxHashMap)   │
//! └──────────────────────────────────────┘
//! ```
//!
//! Databases are memory-mapped and swapped atomically on update; readers
//! holding the previous [`PatchedDatabase`] keep using it until they drop
//! their handle.

#![warn(clippy::all)]

/// Cancellation tokens and readiness signals
pub mod cancel;
pub mod config;
/// CSV export of whole databases
pub mod csv_dump;
/// Data section encoding for MMDB records
pub mod data_section;
/// Read-only database abstraction
pub mod database;
/// Serde deserializer over the MMDB data section
pub mod decoder;
/// Error types for GEOS operations
pub mod error;
pub mod geonames;
/// IP search tree builder for MMDB output
pub mod ip_tree_builder;
/// MMDB format internals
pub mod mmdb;
pub mod mmdb_builder;
/// Record shapes served by lookups
pub mod models;
pub mod patch;
pub mod patched;
/// Memory-mapped MMDB reader
pub mod reader;
pub mod repository;
pub mod service;
pub mod sources;
pub mod updatable;

// Re-exports for Rust consumers

pub use crate::cancel::{CancelToken, ReadySignal};
pub use crate::config::GeosConfig;
pub use crate::data_section::DataValue;
pub use crate::database::{Database, NetworksOptions, Record};
pub use crate::error::{GeosError, Result};
pub use crate::geonames::{Catalog, Filter, GeonamesFiles, GeonamesIndex};
pub use crate::ip_tree_builder::InsertMode;
pub use crate::mmdb::{IpVersion, Metadata};
pub use crate::mmdb_builder::MmdbBuilder;
pub use crate::models::MarshalCsv;
pub use crate::patch::{parse_patch, Patch};
pub use crate::patched::PatchedDatabase;
pub use crate::reader::Reader;
pub use crate::repository::Repository;
pub use crate::service::{Geos, UpdateStatuses};
pub use crate::sources::{DbKind, Subject, UpdateStatus};
pub use crate::updatable::{MmdbState, ModTime, UpdatableFile};

/// Library version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
