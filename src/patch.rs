//! JSON patches
//!
//! A patch is a JSON object mapping CIDR strings to records:
//!
//! ```json
//! {"1.2.3.0/24": {"country": {"iso_code": "FR"}}}
//! ```
//!
//! Each patch is materialized into an in-memory MMDB so it answers lookups
//! exactly like a downloaded database. Patches ship as `<prefix>_patches.tar.gz`
//! bundles whose `.json` members are extracted next to the bundle as
//! `<prefix>_<name>.json`.

use crate::data_section::DataValue;
use crate::database::{Database, NetworksOptions, Record};
use crate::error::{GeosError, Result};
use crate::ip_tree_builder::InsertMode;
use crate::mmdb::{IpVersion, Metadata};
use crate::mmdb_builder::MmdbBuilder;
use crate::reader::{Networks, Reader};
use flate2::read::GzDecoder;
use ipnet::IpNet;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tar::Archive;

/// A loaded patch: queryable tree plus its version
pub struct Patch {
    reader: Reader,
    path: Option<PathBuf>,
    state: SystemTime,
}

impl std::fmt::Debug for Patch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Patch")
            .field("path", &self.path)
            .field("state", &self.state)
            .finish()
    }
}

impl Patch {
    /// Load a patch file; its modification time becomes the patch state
    pub fn load(path: impl AsRef<Path>, database_type: &str) -> Result<Self> {
        let path = path.as_ref();
        let state = fs::metadata(path)?.modified()?;
        let records = parse_patch(BufReader::new(File::open(path)?)).map_err(|e| match e {
            GeosError::InvalidNetwork(msg) => {
                GeosError::InvalidNetwork(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })?;

        let mut patch = Self::from_records(records, database_type, state)?;
        patch.path = Some(path.to_path_buf());
        Ok(patch)
    }

    /// Build a patch from parsed records
    ///
    /// Records are merged (top level) less specific first, so a nested
    /// network always refines its covering one whatever the input order.
    pub fn from_records(
        mut records: Vec<(IpNet, DataValue)>,
        database_type: &str,
        state: SystemTime,
    ) -> Result<Self> {
        records.sort_by_key(|(network, _)| tree_depth(network));

        let epoch = state
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        let mut builder = MmdbBuilder::new(database_type, IpVersion::V6)
            .with_description("en", "GEOS patch")
            .with_build_epoch(epoch);

        for (network, value) in records {
            builder.insert(network, value, InsertMode::TopLevelMerge)?;
        }

        Ok(Self {
            reader: builder.build_reader()?,
            path: None,
            state,
        })
    }

    /// Modification time of the source file
    pub fn state(&self) -> SystemTime {
        self.state
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn reader(&self) -> &Reader {
        &self.reader
    }
}

impl Database for Patch {
    fn lookup_record(&self, ip: IpAddr) -> Result<Option<Record<'_>>> {
        self.reader.lookup_record(ip)
    }

    fn networks(&self, options: NetworksOptions) -> Result<Networks<'_>> {
        Ok(self.reader.networks(options))
    }

    fn metadata(&self) -> Metadata {
        self.reader.metadata().clone()
    }

    fn raw_data(&self) -> Result<&[u8]> {
        Ok(self.reader.as_bytes())
    }

    fn is_empty(&self) -> bool {
        self.reader.is_empty()
    }
}

/// Depth of a network in an IPv6 tree (IPv4 lives under ::/96)
fn tree_depth(network: &IpNet) -> u8 {
    match network {
        IpNet::V4(net) => 96 + net.prefix_len(),
        IpNet::V6(net) => net.prefix_len(),
    }
}

/// Parse a CIDR key; a bare address is a host network
pub fn parse_network(key: &str) -> Result<IpNet> {
    let key = key.trim();
    if let Ok(network) = key.parse::<IpNet>() {
        return Ok(network.trunc());
    }
    key.parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| GeosError::InvalidNetwork(format!("invalid CIDR '{}'", key)))
}

/// Parse a patch document into `(network, record)` pairs
///
/// Any unparseable key or value aborts the whole patch.
pub fn parse_patch(reader: impl Read) -> Result<Vec<(IpNet, DataValue)>> {
    let document: serde_json::Map<String, serde_json::Value> = serde_json::from_reader(reader)?;

    document
        .iter()
        .map(|(key, value)| {
            let network = parse_network(key)?;
            let record = DataValue::from_json(value)
                .map_err(|e| GeosError::Decode(format!("record for {}: {}", key, e)))?;
            Ok((network, record))
        })
        .collect()
}

/// Name of the bundle mirrored for `prefix`
pub fn bundle_file_name(prefix: &str) -> String {
    format!("{}_patches.tar.gz", prefix)
}

/// Extract the `.json` members of a `.tar.gz` bundle into `dest_dir`
///
/// Members land as `<prefix>_<name>.json`. Previously extracted patch files
/// that are no longer in the bundle are removed. Members with any other
/// extension are logged and skipped.
pub fn extract_bundle(archive: &Path, dest_dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    let file = File::open(archive)?;
    let mut tar = Archive::new(GzDecoder::new(BufReader::new(file)));

    let mut extracted = Vec::new();
    for entry in tar.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.into_owned();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if !file_name.ends_with(".json") {
            let err = GeosError::UnknownFormat(file_name.to_string());
            log::warn!("Skipping patch bundle member in {}: {}", archive.display(), err);
            continue;
        }

        let target_name = if file_name.starts_with(&format!("{}_", prefix)) {
            file_name.to_string()
        } else {
            format!("{}_{}", prefix, file_name)
        };
        let target = dest_dir.join(&target_name);
        let tmp = dest_dir.join(format!("{}.tmp", target_name));

        // the member's mtime is the patch version
        let modified = UNIX_EPOCH + Duration::from_secs(entry.header().mtime()?);
        let mut out = File::create(&tmp)?;
        let written = io::copy(&mut entry, &mut out)
            .and_then(|_| out.set_modified(modified))
            .and_then(|_| out.sync_all());
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        fs::rename(&tmp, &target)?;
        extracted.push(target);
    }

    let keep: HashSet<&PathBuf> = extracted.iter().collect();
    for stale in list_patch_files(dest_dir, prefix)? {
        if !keep.contains(&stale) {
            log::info!("Removing patch {} no longer in bundle", stale.display());
            fs::remove_file(&stale)?;
        }
    }

    log::info!(
        "Extracted {} patch file(s) from {}",
        extracted.len(),
        archive.display()
    );
    Ok(extracted)
}

/// `<prefix>_*.json` files in `dir`, sorted by name
pub fn list_patch_files(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    let wanted = format!("{}_", prefix);
    let mut files = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let path = entry?.path();
        let matches = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.starts_with(&wanted) && n.ends_with(".json"))
            .unwrap_or(false);
        if matches && path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Load every patch for `prefix`, oldest first (ties by name)
///
/// Files that fail to parse are logged and skipped.
pub fn load_patches(dir: &Path, prefix: &str, database_type: &str) -> Result<Vec<Patch>> {
    let mut patches = Vec::new();
    for path in list_patch_files(dir, prefix)? {
        match Patch::load(&path, database_type) {
            Ok(patch) => {
                log::debug!("Loaded patch {}", path.display());
                patches.push(patch);
            }
            Err(e) => log::warn!("Skipping patch {}: {}", path.display(), e),
        }
    }
    patches.sort_by(|a, b| (a.state, &a.path).cmp(&(b.state, &b.path)));
    Ok(patches)
}
