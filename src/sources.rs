//! Concrete update sources
//!
//! - [`MmdbSource`]: one MMDB kind (City or ISP) plus its patch bundle,
//!   served as an atomically swapped [`PatchedDatabase`]
//! - [`PatchesSource`]: a `<prefix>_patches.tar.gz` bundle and its extracted
//!   JSON members
//! - [`GeonamesSource`]: the three GeoNames dumps feeding a [`GeonamesIndex`]

use crate::cancel::CancelToken;
use crate::config::{join_url, GeosConfig};
use crate::database::Database;
use crate::error::{GeosError, Result};
use crate::geonames::{
    GeonamesFiles, GeonamesIndex, ADMIN1_CODES_FILE, CITIES_FILE, COUNTRY_INFO_FILE,
};
use crate::patch::{bundle_file_name, extract_bundle, list_patch_files, load_patches, Patch};
use crate::patched::PatchedDatabase;
use crate::reader::Reader;
use crate::repository::for_location;
use crate::updatable::{MmdbState, ModTime, UpdatableFile};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// An updatable data set, as reported in the status map
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Subject {
    City,
    Isp,
    Geonames,
    CityPatches,
    IspPatches,
}

impl Subject {
    pub const ALL: [Subject; 5] = [
        Subject::City,
        Subject::Isp,
        Subject::Geonames,
        Subject::CityPatches,
        Subject::IspPatches,
    ];
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Subject::City => "City",
            Subject::Isp => "ISP",
            Subject::Geonames => "Geonames",
            Subject::CityPatches => "City patches",
            Subject::IspPatches => "ISP patches",
        })
    }
}

impl FromStr for Subject {
    type Err = GeosError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().replace('_', "-").as_str() {
            "city" => Ok(Subject::City),
            "isp" => Ok(Subject::Isp),
            "geonames" => Ok(Subject::Geonames),
            "city-patches" => Ok(Subject::CityPatches),
            "isp-patches" => Ok(Subject::IspPatches),
            other => Err(GeosError::NotAvailable(format!("unknown subject '{}'", other))),
        }
    }
}

/// Per-subject outcome of an update check or update
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateStatus {
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UpdateStatus {
    pub fn from_result(result: Result<bool>) -> Self {
        match result {
            Ok(available) => Self {
                available,
                error: None,
            },
            Err(e) => Self {
                available: false,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Kind of IP database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbKind {
    City,
    Isp,
}

impl DbKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DbKind::City => "city",
            DbKind::Isp => "isp",
        }
    }

    /// Local file name, also the patch prefix with `.mmdb` appended
    pub fn file_name(self) -> String {
        format!("{}.mmdb", self.as_str())
    }

    pub fn database_type(self) -> &'static str {
        match self {
            DbKind::City => "GEOS-City",
            DbKind::Isp => "GEOS-ISP",
        }
    }

    pub fn subject(self) -> Subject {
        match self {
            DbKind::City => Subject::City,
            DbKind::Isp => Subject::Isp,
        }
    }

    pub fn patches_subject(self) -> Subject {
        match self {
            DbKind::City => Subject::CityPatches,
            DbKind::Isp => Subject::IspPatches,
        }
    }
}

impl fmt::Display for DbKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DbKind {
    type Err = GeosError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "city" => Ok(DbKind::City),
            "isp" => Ok(DbKind::Isp),
            other => Err(GeosError::NotAvailable(format!(
                "unknown database kind '{}'",
                other
            ))),
        }
    }
}

/// Patch bundle mirrored from a remote location
#[derive(Debug)]
pub struct PatchesSource {
    prefix: String,
    dir: PathBuf,
    bundle: UpdatableFile<ModTime>,
}

impl PatchesSource {
    pub fn new(prefix: &str, dir: &Path, base_url: &str, timeout: Duration) -> Self {
        let name = bundle_file_name(prefix);
        let location = join_url(base_url, &name);
        let repository = for_location(&location, timeout);
        Self {
            prefix: prefix.to_string(),
            dir: dir.to_path_buf(),
            bundle: UpdatableFile::new(dir.join(&name), location, repository),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn bundle(&self) -> &UpdatableFile<ModTime> {
        &self.bundle
    }

    pub fn check_updates(&self, cancel: &CancelToken) -> Result<bool> {
        if !self.bundle.is_enabled() {
            return Err(GeosError::Disabled(format!("{} patches", self.prefix)));
        }
        Ok(self.bundle.check_updates(cancel)?.is_update_available())
    }

    /// Download a newer bundle and extract it
    pub fn update(&self, force: bool, cancel: &CancelToken) -> Result<bool> {
        let updated = self.bundle.update(force, cancel)?;
        if updated {
            extract_bundle(self.bundle.local_path(), &self.dir, &self.prefix)?;
        }
        Ok(updated)
    }

    pub fn recover(&self, interval: Duration, cancel: &CancelToken) -> Result<bool> {
        let recovered = self.bundle.recover(interval, cancel)?;
        if recovered && self.bundle.exists() {
            extract_bundle(self.bundle.local_path(), &self.dir, &self.prefix)?;
        }
        Ok(recovered)
    }

    /// Extract the downloaded bundle if nothing has been extracted yet
    pub fn ensure_extracted(&self) -> Result<()> {
        if self.bundle.exists() && list_patch_files(&self.dir, &self.prefix)?.is_empty() {
            extract_bundle(self.bundle.local_path(), &self.dir, &self.prefix)?;
        }
        Ok(())
    }

    /// Load every extracted patch; unreadable ones are skipped
    pub fn load(&self, database_type: &str) -> Result<Vec<Patch>> {
        load_patches(&self.dir, &self.prefix, database_type)
    }
}

/// One MMDB kind with its patches, served as a [`PatchedDatabase`]
pub struct MmdbSource {
    kind: DbKind,
    file: UpdatableFile<MmdbState>,
    patches: PatchesSource,
    database: ArcSwap<PatchedDatabase>,
}

impl fmt::Debug for MmdbSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmdbSource")
            .field("kind", &self.kind)
            .field("file", &self.file)
            .field("layers", &self.database.load().layers().len())
            .finish()
    }
}

impl MmdbSource {
    /// Source for `kind` as laid out by `config`; nothing is loaded yet
    pub fn new(kind: DbKind, config: &GeosConfig) -> Self {
        let location = match kind {
            DbKind::City => config.city_url.clone(),
            DbKind::Isp => config.isp_url.clone(),
        };
        let repository = for_location(&location, config.http_timeout());
        Self {
            kind,
            file: UpdatableFile::new(config.data_dir.join(kind.file_name()), location, repository),
            patches: PatchesSource::new(
                kind.as_str(),
                &config.patches_dir(),
                &config.patches_url,
                config.http_timeout(),
            ),
            database: ArcSwap::from_pointee(PatchedDatabase::new(Vec::new())),
        }
    }

    pub fn kind(&self) -> DbKind {
        self.kind
    }

    pub fn file(&self) -> &UpdatableFile<MmdbState> {
        &self.file
    }

    pub fn patches(&self) -> &PatchesSource {
        &self.patches
    }

    /// Current database; holding the `Arc` pins this version across swaps
    pub fn database(&self) -> Arc<PatchedDatabase> {
        self.database.load_full()
    }

    /// Reopen the local file and patches, then swap the served database
    pub fn reload(&self) -> Result<()> {
        let mut layers: Vec<Arc<dyn Database>> = Vec::new();
        if self.file.exists() {
            layers.push(Arc::new(Reader::open(self.file.local_path())?));
        }

        self.patches.ensure_extracted()?;
        let patches = self.patches.load(self.kind.database_type())?;
        let patch_count = patches.len();
        layers.extend(patches.into_iter().map(|p| Arc::new(p) as Arc<dyn Database>));

        let layer_count = layers.len();
        self.database.store(Arc::new(PatchedDatabase::new(layers)));
        log::info!(
            "Serving {} database: {} layer(s), {} patch(es)",
            self.kind,
            layer_count,
            patch_count
        );
        Ok(())
    }

    pub fn check_updates(&self, cancel: &CancelToken) -> Result<bool> {
        if !self.file.is_enabled() {
            return Err(GeosError::Disabled(format!("{} database", self.kind)));
        }
        Ok(self.file.check_updates(cancel)?.is_update_available())
    }

    /// Update the MMDB file; reloads when it changed
    pub fn update(&self, force: bool, cancel: &CancelToken) -> Result<bool> {
        let updated = self.file.update(force, cancel)?;
        if updated {
            self.reload()?;
        }
        Ok(updated)
    }

    /// Update the patch bundle; reloads when it changed
    pub fn update_patches(&self, force: bool, cancel: &CancelToken) -> Result<bool> {
        let updated = self.patches.update(force, cancel)?;
        if updated {
            self.reload()?;
        }
        Ok(updated)
    }

    /// Recover interrupted downloads of the file and the bundle
    pub fn recover(&self, interval: Duration, cancel: &CancelToken) -> Result<bool> {
        let file = self.file.recover(interval, cancel)?;
        let patches = self.patches.recover(interval, cancel)?;
        if file || patches {
            self.reload()?;
        }
        Ok(file || patches)
    }
}

/// The three GeoNames dumps and the index they feed
pub struct GeonamesSource {
    files: [UpdatableFile<ModTime>; 3],
    paths: GeonamesFiles,
    index: Arc<GeonamesIndex>,
}

impl fmt::Debug for GeonamesSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeonamesSource")
            .field("paths", &self.paths)
            .field("index", &self.index)
            .finish()
    }
}

/// Run `op` on every file concurrently; one result per file
fn fan_out<T, F>(files: &[UpdatableFile<ModTime>; 3], op: F) -> Vec<Result<T>>
where
    T: Send,
    F: Fn(&UpdatableFile<ModTime>) -> Result<T> + Sync,
{
    thread::scope(|scope| {
        let handles: Vec<_> = files.iter().map(|file| scope.spawn(|| op(file))).collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(GeosError::Corrupt("GeoNames worker panicked".to_string())))
            })
            .collect()
    })
}

impl GeonamesSource {
    pub fn new(config: &GeosConfig, index: Arc<GeonamesIndex>) -> Self {
        let dir = config.geonames_dir();
        let file = |name: &str| {
            let location = join_url(&config.geonames_url, name);
            let repository = for_location(&location, config.http_timeout());
            UpdatableFile::new(dir.join(name), location, repository)
        };
        Self {
            files: [
                file(COUNTRY_INFO_FILE),
                file(ADMIN1_CODES_FILE),
                file(CITIES_FILE),
            ],
            paths: GeonamesFiles::in_dir(&dir),
            index,
        }
    }

    pub fn files(&self) -> &[UpdatableFile<ModTime>] {
        &self.files
    }

    pub fn paths(&self) -> &GeonamesFiles {
        &self.paths
    }

    pub fn index(&self) -> &Arc<GeonamesIndex> {
        &self.index
    }

    pub fn is_enabled(&self) -> bool {
        self.files.iter().all(UpdatableFile::is_enabled)
    }

    /// Newer remote version of any of the three files
    pub fn check_updates(&self, cancel: &CancelToken) -> Result<bool> {
        if !self.is_enabled() {
            return Err(GeosError::Disabled("GeoNames".to_string()));
        }
        let checks = fan_out(&self.files, |f| f.check_updates(cancel))
            .into_iter()
            .collect::<Result<Vec<_>>>()?;
        Ok(checks.iter().any(|c| c.is_update_available()))
    }

    /// Update the files concurrently; reloads the index when any changed
    ///
    /// Files swapped on disk are loaded even when a sibling failed; the
    /// first failure is still returned.
    pub fn update(&self, force: bool, cancel: &CancelToken) -> Result<bool> {
        self.reload_after(fan_out(&self.files, |f| f.update(force, cancel)))
    }

    /// Recover interrupted downloads; the caller loads the index afterwards
    pub fn recover(&self, interval: Duration, cancel: &CancelToken) -> Result<bool> {
        let recovered = fan_out(&self.files, |f| f.recover(interval, cancel))
            .into_iter()
            .collect::<Result<Vec<_>>>()?;
        Ok(recovered.iter().any(|&r| r))
    }

    fn reload_after(&self, results: Vec<Result<bool>>) -> Result<bool> {
        let changed = results.iter().any(|r| matches!(r, Ok(true)));
        if changed && self.files.iter().all(UpdatableFile::exists) {
            self.index.load(&self.paths)?;
        }
        for result in results {
            result?;
        }
        Ok(changed)
    }

    /// Load the index, downloading missing files first, retrying until done
    pub fn load_with_retry(&self, interval: Duration, cancel: &CancelToken) -> Result<()> {
        if self.is_enabled() {
            let missing = self.files.iter().filter(|f| !f.exists()).count();
            if missing > 0 {
                if let Err(e) = self.update(false, cancel) {
                    log::warn!("Initial GeoNames download failed: {}", e);
                }
            }
        }
        self.index.load_with_retry(&self.paths, interval, cancel)
    }
}
