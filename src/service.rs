//! The GEOS service
//!
//! [`Geos`] owns one patched database per MMDB kind and the GeoNames index,
//! keeps them current in background threads and exposes the query API used
//! by front-ends: IP lookups at three granularities, filtered GeoNames
//! listings, update checks and triggers, CSV and MMDB dumps.

use crate::cancel::CancelToken;
use crate::config::GeosConfig;
use crate::csv_dump;
use crate::database::Database;
use crate::error::{GeosError, Result};
use crate::geonames::{
    Catalog, City, Continent, Country, Filter, GeoEntity, GeonamesIndex, Index, Subdivision,
};
use crate::mmdb::Metadata;
use crate::models::{self, MarshalCsv};
use crate::sources::{DbKind, GeonamesSource, MmdbSource, Subject, UpdateStatus};
use crate::updatable::run_ticker;
use flate2::write::GzEncoder;
use flate2::Compression;
use ipnet::IpNet;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::io::Write;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

/// Per-subject statuses, in subject order
pub type UpdateStatuses = BTreeMap<Subject, UpdateStatus>;

/// Geolocation service
pub struct Geos {
    config: GeosConfig,
    city: MmdbSource,
    isp: MmdbSource,
    geonames: GeonamesSource,
    cancel: CancelToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    geonames_loader: AtomicBool,
}

impl std::fmt::Debug for Geos {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Geos")
            .field("city", &self.city)
            .field("isp", &self.isp)
            .field("geonames", &self.geonames)
            .finish()
    }
}

impl Geos {
    /// Create the service; nothing is loaded until [`start`](Self::start)
    pub fn new(config: GeosConfig) -> Self {
        let index = Arc::new(GeonamesIndex::new());
        Self {
            city: MmdbSource::new(DbKind::City, &config),
            isp: MmdbSource::new(DbKind::Isp, &config),
            geonames: GeonamesSource::new(&config, index),
            config,
            cancel: CancelToken::new(),
            workers: Mutex::new(Vec::new()),
            geonames_loader: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &GeosConfig {
        &self.config
    }

    /// Token cancelled by [`shutdown`](Self::shutdown)
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn source(&self, kind: DbKind) -> &MmdbSource {
        match kind {
            DbKind::City => &self.city,
            DbKind::Isp => &self.isp,
        }
    }

    pub fn geonames_index(&self) -> &Arc<GeonamesIndex> {
        self.geonames.index()
    }

    /// Load the local databases without starting background work
    pub fn load(&self) {
        for kind in [DbKind::City, DbKind::Isp] {
            if let Err(e) = self.source(kind).reload() {
                log::warn!("Could not load {} database: {}", kind, e);
            }
        }
    }

    /// Load GeoNames from the local dumps, once
    pub fn load_geonames(&self) -> Result<()> {
        self.geonames.index().load(self.geonames.paths())
    }

    /// Load local databases, then start background work
    ///
    /// Spawns crash recovery for every source, the GeoNames loader when
    /// GeoNames is configured, and the auto-updaters when a period is set.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.load();

        let interval = self.config.recovery_interval();
        for kind in [DbKind::City, DbKind::Isp] {
            let source = self.source(kind);
            if source.file().has_stale_tmp() || source.patches().bundle().has_stale_tmp() {
                self.spawn(&format!("recover-{}", kind), move |geos, cancel| {
                    if let Err(e) = geos.source(kind).recover(interval, cancel) {
                        log::warn!("Recovery of {} stopped: {}", kind, e);
                    }
                })?;
            }
        }

        let has_geonames = !self.config.geonames_url.is_empty()
            || self.geonames.files().iter().all(|f| f.exists());
        if has_geonames {
            let retry = self.config.geonames_retry();
            self.geonames_loader.store(true, Ordering::SeqCst);
            let spawned = self.spawn("geonames-loader", move |geos, cancel| {
                if let Err(e) = geos.geonames.recover(interval, cancel) {
                    log::warn!("GeoNames recovery stopped: {}", e);
                }
                if let Err(e) = geos.geonames.load_with_retry(retry, cancel) {
                    log::warn!("GeoNames loader stopped: {}", e);
                }
            });
            if spawned.is_err() {
                self.geonames_loader.store(false, Ordering::SeqCst);
            }
            spawned?;
        }

        if let Some(period) = self.config.auto_update_period() {
            self.spawn("auto-update", move |geos, cancel| {
                run_ticker("all sources", period, cancel, || {
                    let subjects: Vec<Subject> = Subject::ALL
                        .iter()
                        .copied()
                        .filter(|&s| geos.is_enabled(s))
                        .collect();
                    if subjects.is_empty() {
                        return Ok(());
                    }
                    for (subject, status) in geos.update(&subjects, false, cancel) {
                        if let Some(error) = status.error {
                            log::warn!("{} update failed: {}", subject, error);
                        }
                    }
                    Ok(())
                });
            })?;
        }
        Ok(())
    }

    /// Whether `subject` has a remote location configured
    pub fn is_enabled(&self, subject: Subject) -> bool {
        match subject {
            Subject::City => self.city.file().is_enabled(),
            Subject::Isp => self.isp.file().is_enabled(),
            Subject::Geonames => self.geonames.is_enabled(),
            Subject::CityPatches => self.city.patches().bundle().is_enabled(),
            Subject::IspPatches => self.isp.patches().bundle().is_enabled(),
        }
    }

    fn spawn<F>(self: &Arc<Self>, name: &str, work: F) -> Result<()>
    where
        F: FnOnce(&Geos, &CancelToken) + Send + 'static,
    {
        let geos = Arc::clone(self);
        let cancel = self.cancel.clone();
        let handle = thread::Builder::new()
            .name(format!("geos-{}", name))
            .spawn(move || work(&geos, &cancel))?;
        self.workers
            .lock()
            .map_err(|_| GeosError::Corrupt("worker registry poisoned".to_string()))?
            .push(handle);
        Ok(())
    }

    /// Cancel background work and wait for it to finish
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let workers = match self.workers.lock() {
            Ok(mut workers) => std::mem::take(&mut *workers),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for worker in workers {
            if worker.join().is_err() {
                log::warn!("Background worker panicked");
            }
        }
        log::info!("GEOS service stopped");
    }

    /// Look up `ip` in the `kind` database, decoding into `T`
    pub fn lookup<T: DeserializeOwned>(&self, kind: DbKind, ip: IpAddr) -> Result<(T, IpNet)> {
        self.source(kind)
            .database()
            .lookup(ip)?
            .ok_or(GeosError::NotFound)
    }

    pub fn country(&self, ip: IpAddr) -> Result<(models::Country, IpNet)> {
        self.lookup(DbKind::City, ip)
    }

    pub fn city(&self, ip: IpAddr) -> Result<(models::City, IpNet)> {
        self.lookup(DbKind::City, ip)
    }

    pub fn city_lite(&self, ip: IpAddr) -> Result<(models::CityLite, IpNet)> {
        self.lookup(DbKind::City, ip)
    }

    pub fn isp(&self, ip: IpAddr) -> Result<(models::Isp, IpNet)> {
        self.lookup(DbKind::Isp, ip)
    }

    /// Metadata of the served `kind` database
    pub fn metadata(&self, kind: DbKind) -> Metadata {
        Database::metadata(self.source(kind).database().as_ref())
    }

    /// Current GeoNames catalog
    ///
    /// Waits for the background loader when one is running. Without a loader
    /// this is `Disabled` when GeoNames has no source and `NotReady` when
    /// nothing has been loaded yet.
    pub fn geonames_catalog(&self, cancel: &CancelToken) -> Result<Arc<Catalog>> {
        let index = self.geonames.index();
        if index.ready().is_set() {
            return index.catalog();
        }
        if self.geonames_loader.load(Ordering::SeqCst) {
            return index.wait(cancel);
        }
        if !self.geonames.is_enabled() {
            return Err(GeosError::Disabled("GeoNames".to_string()));
        }
        index.catalog()
    }

    fn select<T, F>(&self, filter: &Filter, cancel: &CancelToken, index: F) -> Result<Vec<T>>
    where
        T: Clone + GeoEntity,
        F: Fn(&Catalog) -> &Index<T>,
    {
        let catalog = self.geonames_catalog(cancel)?;
        Ok(index(&catalog)
            .filtered(filter)
            .into_iter()
            .cloned()
            .collect())
    }

    pub fn continents(&self, filter: &Filter, cancel: &CancelToken) -> Result<Vec<Continent>> {
        self.select(filter, cancel, |c| &c.continents)
    }

    pub fn countries(&self, filter: &Filter, cancel: &CancelToken) -> Result<Vec<Country>> {
        self.select(filter, cancel, |c| &c.countries)
    }

    pub fn subdivisions(&self, filter: &Filter, cancel: &CancelToken) -> Result<Vec<Subdivision>> {
        self.select(filter, cancel, |c| &c.subdivisions)
    }

    pub fn cities(&self, filter: &Filter, cancel: &CancelToken) -> Result<Vec<City>> {
        self.select(filter, cancel, |c| &c.cities)
    }

    fn check_subject(&self, subject: Subject, cancel: &CancelToken) -> Result<bool> {
        match subject {
            Subject::City => self.city.check_updates(cancel),
            Subject::Isp => self.isp.check_updates(cancel),
            Subject::Geonames => self.geonames.check_updates(cancel),
            Subject::CityPatches => self.city.patches().check_updates(cancel),
            Subject::IspPatches => self.isp.patches().check_updates(cancel),
        }
    }

    fn update_subject(&self, subject: Subject, force: bool, cancel: &CancelToken) -> Result<bool> {
        match subject {
            Subject::City => self.city.update(force, cancel),
            Subject::Isp => self.isp.update(force, cancel),
            Subject::Geonames => self.geonames.update(force, cancel),
            Subject::CityPatches => self.city.update_patches(force, cancel),
            Subject::IspPatches => self.isp.update_patches(force, cancel),
        }
    }

    /// Whether each subject has a newer remote version
    pub fn check_updates(&self, cancel: &CancelToken) -> UpdateStatuses {
        Subject::ALL
            .iter()
            .map(|&s| (s, UpdateStatus::from_result(self.check_subject(s, cancel))))
            .collect()
    }

    /// Update `subjects` (all when empty); `available` reports a swap
    pub fn update(&self, subjects: &[Subject], force: bool, cancel: &CancelToken) -> UpdateStatuses {
        let subjects = if subjects.is_empty() {
            &Subject::ALL[..]
        } else {
            subjects
        };
        subjects
            .iter()
            .map(|&s| {
                let result = self.update_subject(s, force, cancel);
                if let Ok(true) = result {
                    log::info!("{} updated", s);
                }
                (s, UpdateStatus::from_result(result))
            })
            .collect()
    }

    /// Stream the `kind` database as CSV rows of `T`
    pub fn write_csv<T, W>(&self, kind: DbKind, sink: W) -> Result<usize>
    where
        T: DeserializeOwned + MarshalCsv,
        W: Write,
    {
        let database = self.source(kind).database();
        csv_dump::write_csv::<T, W>(database.as_ref(), sink)
    }

    /// The `kind` database as CSV rows of `T`, optionally gzip-compressed
    pub fn csv_dump<T>(&self, kind: DbKind, gzip: bool) -> Result<Vec<u8>>
    where
        T: DeserializeOwned + MarshalCsv,
    {
        let database = self.source(kind).database();
        csv_dump::dump_csv::<T>(database.as_ref(), gzip)
    }

    /// Merged MMDB bytes of the `kind` database, optionally gzip-compressed
    pub fn mmdb_dump(&self, kind: DbKind, gzip: bool) -> Result<Vec<u8>> {
        let database = self.source(kind).database();
        let raw = Database::raw_data(database.as_ref())?;
        if !gzip {
            return Ok(raw.to_vec());
        }
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(raw)?;
        Ok(encoder.finish()?)
    }
}

impl Drop for Geos {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
