//! Patched database
//!
//! Layers any number of patches over a base database. Lookups consult the
//! newest layer first and fall back towards the base. Enumeration and raw
//! bytes come from a merged tree, materialized once on first use by a
//! three-stage pipeline (read networks, decode values, insert) connected by
//! bounded channels.

use crate::data_section::DataValue;
use crate::database::{Database, NetworksOptions, Record};
use crate::error::{GeosError, Result};
use crate::ip_tree_builder::InsertMode;
use crate::mmdb::{IpVersion, Metadata};
use crate::mmdb_builder::MmdbBuilder;
use crate::reader::{Networks, Reader};
use crossbeam_channel::bounded;
use ipnet::IpNet;
use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use std::net::IpAddr;
use std::sync::Arc;
use std::thread;

/// Capacity of each queue in the merge pipeline
pub const PIPELINE_CAPACITY: usize = 1000;

/// Suffix appended to the English description of a patched database
pub const PATCHED_DESCRIPTION_SUFFIX: &str = " patched by GEOS service.";

/// Base database plus patches, queried as one
pub struct PatchedDatabase {
    /// `[base, patch1, ..., patchN]`, oldest first
    layers: Vec<Arc<dyn Database>>,
    merged: OnceCell<Reader>,
}

impl std::fmt::Debug for PatchedDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PatchedDatabase")
            .field("layers", &self.layers.len())
            .field("merged", &self.merged.get().is_some())
            .finish()
    }
}

impl PatchedDatabase {
    /// Stack `layers`, oldest (base) first
    pub fn new(layers: Vec<Arc<dyn Database>>) -> Self {
        Self {
            layers,
            merged: OnceCell::new(),
        }
    }

    pub fn layers(&self) -> &[Arc<dyn Database>] {
        &self.layers
    }

    /// Look up `ip`, newest layer first; the first decoded hit wins
    ///
    /// A layer that fails is remembered and the search continues; its error
    /// is returned only when no other layer answers.
    pub fn lookup<T: DeserializeOwned>(&self, ip: IpAddr) -> Result<Option<(T, IpNet)>> {
        if self.layers.is_empty() {
            return Err(GeosError::NotAvailable("no database loaded".to_string()));
        }

        let mut first_error = None;
        for layer in self.layers.iter().rev() {
            let decoded = layer
                .lookup_record(ip)
                .and_then(|hit| hit.map(|r| Ok((r.decode::<T>()?, r.network()))).transpose());
            match decoded {
                Ok(Some(found)) => return Ok(Some(found)),
                Ok(None) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    /// The only non-empty layer, when there is exactly one
    fn single_layer(&self) -> Option<&Arc<dyn Database>> {
        let mut non_empty = self.layers.iter().filter(|l| !l.is_empty());
        match (non_empty.next(), non_empty.next()) {
            (Some(layer), None) => Some(layer),
            (None, _) => self.layers.first(),
            _ => None,
        }
    }

    /// Merged tree, built on first use
    pub fn merged(&self) -> Result<&Reader> {
        self.merged.get_or_try_init(|| self.merge())
    }

    fn merge(&self) -> Result<Reader> {
        let ip_version = if self
            .layers
            .iter()
            .all(|l| l.metadata().ip_version == IpVersion::V4.as_metadata())
        {
            IpVersion::V4
        } else {
            IpVersion::V6
        };
        let mut metadata = Database::metadata(self);
        metadata.ip_version = ip_version.as_metadata();
        let mut builder = MmdbBuilder::with_metadata(metadata);

        let (record_tx, record_rx) = bounded::<Record<'_>>(PIPELINE_CAPACITY);
        let (value_tx, value_rx) = bounded::<(IpNet, DataValue)>(PIPELINE_CAPACITY);

        let (read_result, convert_result, write_result) = thread::scope(|scope| {
            let reader = scope.spawn(move || -> Result<()> {
                for layer in &self.layers {
                    for record in layer.networks(NetworksOptions::skip_aliased())? {
                        if record_tx.send(record?).is_err() {
                            // Downstream stopped; its error is reported instead
                            return Ok(());
                        }
                    }
                }
                Ok(())
            });

            let converter = scope.spawn(move || -> Result<()> {
                for record in record_rx {
                    let value: DataValue = record.decode()?;
                    if value_tx.send((record.network(), value)).is_err() {
                        return Ok(());
                    }
                }
                Ok(())
            });

            let write = || -> Result<()> {
                for (network, value) in value_rx {
                    builder.insert(network, value, InsertMode::Replace)?;
                }
                Ok(())
            };
            let write_result = write();

            (join_stage(reader), join_stage(converter), write_result)
        });

        read_result?;
        convert_result?;
        write_result?;

        log::debug!(
            "Merged {} layer(s) into {} network(s)",
            self.layers.len(),
            builder.len()
        );
        builder.build_reader()
    }
}

fn join_stage(handle: thread::ScopedJoinHandle<'_, Result<()>>) -> Result<()> {
    handle
        .join()
        .unwrap_or_else(|_| Err(GeosError::Corrupt("merge stage panicked".to_string())))
}

impl Database for PatchedDatabase {
    fn lookup_record(&self, ip: IpAddr) -> Result<Option<Record<'_>>> {
        if self.layers.is_empty() {
            return Err(GeosError::NotAvailable("no database loaded".to_string()));
        }

        let mut first_error = None;
        for layer in self.layers.iter().rev() {
            match layer.lookup_record(ip) {
                Ok(Some(record)) => return Ok(Some(record)),
                Ok(None) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(None), Err)
    }

    fn networks(&self, options: NetworksOptions) -> Result<Networks<'_>> {
        if self.layers.is_empty() {
            return Err(GeosError::NotAvailable("no database loaded".to_string()));
        }
        match self.single_layer() {
            Some(layer) => layer.networks(options),
            None => Ok(self.merged()?.networks(options)),
        }
    }

    /// Base metadata; English description marked as patched and the newest
    /// build epoch across layers
    fn metadata(&self) -> Metadata {
        let Some(base) = self.layers.first() else {
            return Metadata::new("", IpVersion::V6);
        };
        let mut metadata = base.metadata();
        metadata.build_epoch = self
            .layers
            .iter()
            .map(|l| l.metadata().build_epoch)
            .max()
            .unwrap_or(metadata.build_epoch);
        let english = metadata.description.entry("en".to_string()).or_default();
        if english.is_empty() {
            english.push_str(PATCHED_DESCRIPTION_SUFFIX.trim_start());
        } else {
            english.push_str(PATCHED_DESCRIPTION_SUFFIX);
        }
        metadata
    }

    fn raw_data(&self) -> Result<&[u8]> {
        if self.layers.is_empty() {
            return Err(GeosError::NotAvailable("no database loaded".to_string()));
        }
        match self.single_layer() {
            Some(layer) => layer.raw_data(),
            None => Ok(self.merged()?.as_bytes()),
        }
    }

    fn is_empty(&self) -> bool {
        self.layers.iter().all(|l| l.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::Patch;
    use std::time::{Duration, UNIX_EPOCH};

    fn base() -> Arc<dyn Database> {
        let mut builder = MmdbBuilder::new("GEOS-Test", IpVersion::V6)
            .with_description("en", "Test base")
            .with_build_epoch(100);
        for (cidr, value) in [("1.0.0.0/8", "a"), ("1.2.0.0/16", "b"), ("2.0.0.0/8", "c")] {
            builder
                .insert(
                    cidr.parse().unwrap(),
                    DataValue::String(value.to_string()),
                    InsertMode::Replace,
                )
                .unwrap();
        }
        Arc::new(builder.build_reader().unwrap())
    }

    fn patch(cidr: &str, value: &str, epoch: u64) -> Arc<dyn Database> {
        Arc::new(
            Patch::from_records(
                vec![(cidr.parse().unwrap(), DataValue::String(value.to_string()))],
                "GEOS-Test",
                UNIX_EPOCH + Duration::from_secs(epoch),
            )
            .unwrap(),
        )
    }

    fn get(db: &PatchedDatabase, ip: &str) -> Option<String> {
        db.lookup::<String>(ip.parse().unwrap())
            .unwrap()
            .map(|(v, _)| v)
    }

    #[test]
    fn test_patch_precedence() {
        let db = PatchedDatabase::new(vec![base(), patch("1.2.3.0/24", "B'", 200)]);
        assert_eq!(get(&db, "1.2.3.4").as_deref(), Some("B'"));
        assert_eq!(get(&db, "1.2.4.4").as_deref(), Some("b"));
        assert_eq!(get(&db, "1.3.3.4").as_deref(), Some("a"));
        assert_eq!(get(&db, "9.9.9.9"), None);
    }

    #[test]
    fn test_newest_patch_wins() {
        let db = PatchedDatabase::new(vec![
            base(),
            patch("1.2.3.0/24", "first", 200),
            patch("1.2.3.0/28", "second", 300),
        ]);
        assert_eq!(get(&db, "1.2.3.4").as_deref(), Some("second"));
        assert_eq!(get(&db, "1.2.3.100").as_deref(), Some("first"));
    }

    #[test]
    fn test_no_layers() {
        let db = PatchedDatabase::new(Vec::new());
        assert!(matches!(
            db.lookup::<String>("1.1.1.1".parse().unwrap()),
            Err(GeosError::NotAvailable(_))
        ));
    }

    #[test]
    fn test_metadata_adjustments() {
        let db = PatchedDatabase::new(vec![base(), patch("1.2.3.0/24", "B'", 500)]);
        let metadata = Database::metadata(&db);
        assert_eq!(metadata.build_epoch, 500);
        assert_eq!(
            metadata.description["en"],
            "Test base patched by GEOS service."
        );
        assert_eq!(metadata.database_type, "GEOS-Test");
    }

    #[test]
    fn test_description_without_base_text() {
        let db = PatchedDatabase::new(vec![patch("1.0.0.0/8", "a", 1), patch("2.0.0.0/8", "b", 2)]);
        let metadata = Database::metadata(&db);
        assert_eq!(metadata.description["en"], "patched by GEOS service.");
    }

    #[test]
    fn test_merged_networks_replace() {
        let db = PatchedDatabase::new(vec![base(), patch("1.2.0.0/15", "P", 200)]);

        let networks: Vec<(String, String)> = Database::networks(&db, NetworksOptions::skip_aliased())
            .unwrap()
            .map(|r| {
                let r = r.unwrap();
                (r.network().to_string(), r.decode::<String>().unwrap())
            })
            .collect();

        assert!(networks.contains(&("1.2.0.0/15".to_string(), "P".to_string())));
        assert!(!networks.iter().any(|(n, _)| n == "1.2.0.0/16"));
        assert!(networks.contains(&("2.0.0.0/8".to_string(), "c".to_string())));

        // Merged bytes answer like the layered lookup
        let merged = Reader::from_bytes(Database::raw_data(&db).unwrap().to_vec()).unwrap();
        for ip in ["1.2.3.4", "1.3.3.3", "1.0.0.1", "2.2.2.2", "9.9.9.9"] {
            let expected = get(&db, ip);
            let actual = merged
                .lookup::<String>(ip.parse().unwrap())
                .unwrap()
                .map(|(v, _)| v);
            assert_eq!(actual, expected, "{}", ip);
        }
    }

    #[test]
    fn test_single_layer_passthrough() {
        let only = base();
        let expected = only.raw_data().unwrap().to_vec();
        let db = PatchedDatabase::new(vec![only]);
        assert_eq!(Database::raw_data(&db).unwrap(), expected.as_slice());
        assert!(db.merged.get().is_none());
    }
}
