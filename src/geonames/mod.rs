//! GeoNames reference catalog
//!
//! Continents, countries, first-level subdivisions and cities loaded from the
//! GeoNames dumps and served from an in-memory [`Catalog`]. On first load the
//! catalog is published as soon as it is indexed; a second, enriched catalog
//! replaces it when the derived name fields have been joined in. Once an
//! enriched catalog is out, only enriched catalogs are published.

pub mod entities;
pub mod index;
pub mod parser;

pub use entities::{City, Continent, Country, GeoEntity, Subdivision};
pub use index::{Catalog, Filter, Index};

use crate::cancel::{CancelToken, ReadySignal};
use crate::error::{GeosError, Result};
use arc_swap::ArcSwapOption;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const COUNTRY_INFO_FILE: &str = "countryInfo.txt";
pub const ADMIN1_CODES_FILE: &str = "admin1CodesASCII.txt";
pub const CITIES_FILE: &str = "cities500.zip";

/// Locations of the three GeoNames dumps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeonamesFiles {
    pub countries: PathBuf,
    pub subdivisions: PathBuf,
    pub cities: PathBuf,
}

impl GeonamesFiles {
    /// Standard file names inside `dir`
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            countries: dir.join(COUNTRY_INFO_FILE),
            subdivisions: dir.join(ADMIN1_CODES_FILE),
            cities: dir.join(CITIES_FILE),
        }
    }

    /// Parse all three files in parallel and index them
    pub fn load(&self) -> Result<Catalog> {
        let (countries, (subdivisions, cities)) = rayon::join(
            || parser::load_countries(&self.countries),
            || {
                rayon::join(
                    || parser::load_subdivisions(&self.subdivisions),
                    || parser::load_cities(&self.cities),
                )
            },
        );
        Catalog::build(countries?, subdivisions?, cities?)
    }
}

/// Shared handle on the current catalog
#[derive(Default)]
pub struct GeonamesIndex {
    catalog: ArcSwapOption<Catalog>,
    ready: ReadySignal,
    enriched: ReadySignal,
}

impl std::fmt::Debug for GeonamesIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeonamesIndex")
            .field("ready", &self.ready.is_set())
            .field("enriched", &self.enriched.is_set())
            .finish()
    }
}

impl GeonamesIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set once a catalog has been published
    pub fn ready(&self) -> &ReadySignal {
        &self.ready
    }

    /// Set once an enriched catalog has been published
    pub fn enriched(&self) -> &ReadySignal {
        &self.enriched
    }

    /// Replace the current catalog
    ///
    /// A plain catalog is dropped once an enriched one has been published.
    pub fn publish(&self, catalog: Catalog, enriched: bool) {
        if !enriched && self.enriched.is_set() {
            log::debug!("Enriched GeoNames catalog already published, keeping it");
            return;
        }
        self.store(Arc::new(catalog), enriched);
    }

    fn store(&self, catalog: Arc<Catalog>, enriched: bool) {
        log::info!(
            "Published GeoNames catalog: {} countries, {} subdivisions, {} cities{}",
            catalog.countries.len(),
            catalog.subdivisions.len(),
            catalog.cities.len(),
            if enriched { " (enriched)" } else { "" }
        );
        self.catalog.store(Some(catalog));
        self.ready.set();
        if enriched {
            self.enriched.set();
        }
    }

    /// Load `files` and publish them
    ///
    /// The first load publishes the plain catalog before enriching it. Later
    /// loads keep serving the current enriched catalog until the new one is
    /// enriched too.
    pub fn load(&self, files: &GeonamesFiles) -> Result<()> {
        let catalog = files.load()?;
        if self.enriched.is_set() {
            self.publish(catalog.enriched()?, true);
            return Ok(());
        }

        let catalog = Arc::new(catalog);
        self.store(Arc::clone(&catalog), false);
        let enriched = catalog.enriched()?;
        self.publish(enriched, true);
        Ok(())
    }

    /// [`load`](Self::load), retried every `interval` until it succeeds
    pub fn load_with_retry(
        &self,
        files: &GeonamesFiles,
        interval: Duration,
        cancel: &CancelToken,
    ) -> Result<()> {
        loop {
            cancel.check()?;
            match self.load(files) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!("Loading GeoNames failed, retrying in {:?}: {}", interval, e);
                    cancel.sleep(interval)?;
                }
            }
        }
    }

    /// Current catalog, or `NotReady` before the first load
    pub fn catalog(&self) -> Result<Arc<Catalog>> {
        self.catalog.load_full().ok_or(GeosError::NotReady)
    }

    /// Block until a catalog is published or `cancel` fires
    pub fn wait(&self, cancel: &CancelToken) -> Result<Arc<Catalog>> {
        self.ready.wait(cancel)?;
        self.catalog()
    }

    /// Block until the enriched catalog is published or `cancel` fires
    pub fn wait_enriched(&self, cancel: &CancelToken) -> Result<Arc<Catalog>> {
        self.enriched.wait(cancel)?;
        self.catalog()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{self, File};
    use std::io::Write;
    use std::thread;
    use tempfile::TempDir;

    fn write_dumps(dir: &Path) {
        fs::write(
            dir.join(COUNTRY_INFO_FILE),
            "#ISO\tISO3\n\
             FR\tFRA\t250\tFR\tFrance\tParis\t547030\t66987244\tEU\t.fr\tEUR\tEuro\t33\t\t\tfr-FR\t3017382\t\t\n",
        )
        .unwrap();
        fs::write(
            dir.join(ADMIN1_CODES_FILE),
            "FR.11\tÎle-de-France\tIle-de-France\t3012874\n",
        )
        .unwrap();

        let mut zip = zip::ZipWriter::new(File::create(dir.join(CITIES_FILE)).unwrap());
        zip.start_file(parser::CITIES_MEMBER, zip::write::FileOptions::default())
            .unwrap();
        zip.write_all(
            b"2988507\tParis\tParis\t\t48.85341\t2.3488\tP\tPPLC\tFR\t\t11\t75\t751\t75056\t2138551\t\t42\tEurope/Paris\t2023-09-05\n",
        )
        .unwrap();
        zip.finish().unwrap();
    }

    #[test]
    fn test_not_ready_until_loaded() {
        let index = GeonamesIndex::new();
        assert!(matches!(index.catalog(), Err(GeosError::NotReady)));

        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(index.wait(&cancel), Err(GeosError::Cancelled)));
    }

    #[test]
    fn test_load_publishes_enriched() {
        let dir = TempDir::new().unwrap();
        write_dumps(dir.path());
        let index = GeonamesIndex::new();
        index.load(&GeonamesFiles::in_dir(dir.path())).unwrap();

        assert!(index.ready().is_set());
        let catalog = index.wait_enriched(&CancelToken::new()).unwrap();
        let paris = catalog.cities.get(2988507).unwrap();
        assert_eq!(paris.subdivision_name, "Île-de-France");
        assert_eq!(paris.continent_name, "Europe");
    }

    #[test]
    fn test_plain_catalog_ignored_after_enrichment() {
        let dir = TempDir::new().unwrap();
        write_dumps(dir.path());
        let files = GeonamesFiles::in_dir(dir.path());
        let index = GeonamesIndex::new();
        index.load(&files).unwrap();

        index.publish(files.load().unwrap(), false);
        let catalog = index.catalog().unwrap();
        assert_eq!(
            catalog.cities.get(2988507).unwrap().subdivision_name,
            "Île-de-France"
        );
    }

    #[test]
    fn test_reload_keeps_enriched_catalog_visible() {
        let dir = TempDir::new().unwrap();
        write_dumps(dir.path());
        let files = GeonamesFiles::in_dir(dir.path());
        let index = Arc::new(GeonamesIndex::new());
        index.load(&files).unwrap();

        let cancel = CancelToken::new();
        let watcher = {
            let (index, cancel) = (Arc::clone(&index), cancel.clone());
            thread::spawn(move || {
                let mut seen = 0;
                loop {
                    let catalog = index.wait_enriched(&CancelToken::new()).unwrap();
                    let paris = catalog.cities.get(2988507).unwrap();
                    assert_eq!(paris.subdivision_name, "Île-de-France");
                    assert_eq!(paris.continent_name, "Europe");
                    seen += 1;
                    if cancel.is_cancelled() {
                        return seen;
                    }
                }
            })
        };

        for _ in 0..20 {
            index.load(&files).unwrap();
        }
        cancel.cancel();
        assert!(watcher.join().unwrap() > 0);
    }

    #[test]
    fn test_retry_until_files_appear() {
        let dir = TempDir::new().unwrap();
        let files = GeonamesFiles::in_dir(dir.path());
        let index = Arc::new(GeonamesIndex::new());
        let cancel = CancelToken::new();

        let loader = {
            let (index, files, cancel) = (Arc::clone(&index), files.clone(), cancel.clone());
            thread::spawn(move || index.load_with_retry(&files, Duration::from_millis(10), &cancel))
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!index.ready().is_set());
        write_dumps(dir.path());

        let catalog = index.wait(&CancelToken::new()).unwrap();
        assert_eq!(catalog.countries.len(), 1);
        loader.join().unwrap().unwrap();
    }
}
