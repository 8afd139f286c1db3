//! Versioned local mirrors of remote artifacts
//!
//! An [`UpdatableFile`] keeps `local_path` in sync with a remote location.
//! Downloads go to a sibling `<local_path>.tmp`, created exclusively so it
//! doubles as a lock between updaters, then are renamed over the live file.
//! The live path therefore only ever holds a complete artifact; a crash can
//! leave a `.tmp` behind, which [`UpdatableFile::recover`] cleans up.

use crate::cancel::CancelToken;
use crate::error::{GeosError, Result};
use crate::mmdb::format::{read_metadata, METADATA_SEARCH_SIZE};
use crate::repository::Repository;
use std::ffi::OsString;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Totally ordered artifact version
pub trait Version: Ord + Clone + fmt::Debug + fmt::Display + Send + Sync + 'static {
    /// Version of the local file, `None` when it does not exist
    fn local(path: &Path) -> Result<Option<Self>>;

    /// Version of the remote artifact
    fn remote(repository: &dyn Repository, location: &str, cancel: &CancelToken) -> Result<Self>;
}

/// File modification time
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ModTime(pub SystemTime);

impl fmt::Display for ModTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let time: chrono::DateTime<chrono::Utc> = self.0.into();
        write!(f, "{}", time.to_rfc3339())
    }
}

impl Version for ModTime {
    fn local(path: &Path) -> Result<Option<Self>> {
        match fs::metadata(path) {
            Ok(meta) => Ok(Some(ModTime(meta.modified()?))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remote(repository: &dyn Repository, location: &str, cancel: &CancelToken) -> Result<Self> {
        repository.last_modified(location, cancel).map(ModTime)
    }
}

/// MMDB format version and build epoch, compared in that order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MmdbState {
    pub major: u16,
    pub minor: u16,
    pub build_epoch: u64,
}

impl MmdbState {
    /// State from the trailing bytes of an MMDB file
    pub fn from_tail(tail: &[u8]) -> Result<Self> {
        let (metadata, _) = read_metadata(tail)?;
        Ok(Self {
            major: metadata.binary_format_major_version,
            minor: metadata.binary_format_minor_version,
            build_epoch: metadata.build_epoch,
        })
    }
}

impl fmt::Display for MmdbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}@{}", self.major, self.minor, self.build_epoch)
    }
}

impl Version for MmdbState {
    fn local(path: &Path) -> Result<Option<Self>> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let size = file.metadata()?.len();
        file.seek(SeekFrom::Start(size.saturating_sub(METADATA_SEARCH_SIZE as u64)))?;
        let mut tail = Vec::new();
        file.read_to_end(&mut tail)?;
        Self::from_tail(&tail).map(Some)
    }

    fn remote(repository: &dyn Repository, location: &str, cancel: &CancelToken) -> Result<Self> {
        let tail = repository.read_tail(location, METADATA_SEARCH_SIZE as u64, cancel)?;
        Self::from_tail(&tail)
    }
}

/// Outcome of a version check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionCheck<V> {
    /// `None` when nothing is downloaded yet
    pub current: Option<V>,
    /// `None` when the source is disabled
    pub remote: Option<V>,
}

impl<V: Ord> VersionCheck<V> {
    pub fn is_update_available(&self) -> bool {
        self.remote.is_some() && self.remote > self.current
    }
}

/// Removes the temporary download unless disarmed
struct TmpGuard<'a> {
    path: &'a Path,
    armed: bool,
}

impl Drop for TmpGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = fs::remove_file(self.path) {
                log::warn!("Failed to remove {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Local mirror of a remote artifact, versioned by `V`
pub struct UpdatableFile<V> {
    local_path: PathBuf,
    tmp_path: PathBuf,
    location: String,
    repository: Arc<dyn Repository>,
    version: PhantomData<fn() -> V>,
}

impl<V> fmt::Debug for UpdatableFile<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdatableFile")
            .field("local_path", &self.local_path)
            .field("location", &self.location)
            .finish()
    }
}

impl<V: Version> UpdatableFile<V> {
    pub fn new(
        local_path: impl Into<PathBuf>,
        location: impl Into<String>,
        repository: Arc<dyn Repository>,
    ) -> Self {
        let local_path = local_path.into();
        let mut tmp_name = local_path
            .file_name()
            .map(OsString::from)
            .unwrap_or_default();
        tmp_name.push(".tmp");
        let tmp_path = local_path.with_file_name(tmp_name);
        Self {
            local_path,
            tmp_path,
            location: location.into(),
            repository,
            version: PhantomData,
        }
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn tmp_path(&self) -> &Path {
        &self.tmp_path
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    /// False when configured with an empty location
    pub fn is_enabled(&self) -> bool {
        !self.location.is_empty()
    }

    pub fn exists(&self) -> bool {
        self.local_path.is_file()
    }

    /// A `.tmp` left by an interrupted download
    pub fn has_stale_tmp(&self) -> bool {
        self.tmp_path.exists()
    }

    pub fn local_version(&self) -> Result<Option<V>> {
        V::local(&self.local_path)
    }

    /// Compare the local version with the remote one
    pub fn check_updates(&self, cancel: &CancelToken) -> Result<VersionCheck<V>> {
        let current = self.local_version()?;
        if !self.is_enabled() {
            return Ok(VersionCheck {
                current,
                remote: None,
            });
        }
        let remote = V::remote(self.repository.as_ref(), &self.location, cancel)?;
        log::debug!(
            "{}: local {}, remote {}",
            self.local_path.display(),
            current
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "none".to_string()),
            remote
        );
        Ok(VersionCheck {
            current,
            remote: Some(remote),
        })
    }

    /// Download when the remote is newer, or unconditionally with `force`
    ///
    /// Returns whether the live file was replaced.
    pub fn update(&self, force: bool, cancel: &CancelToken) -> Result<bool> {
        if !self.is_enabled() {
            return Err(GeosError::Disabled(self.local_path.display().to_string()));
        }
        if !force && !self.check_updates(cancel)?.is_update_available() {
            return Ok(false);
        }
        if force {
            self.remove_tmp()?;
        }
        self.download(cancel)?;
        Ok(true)
    }

    /// Fetch the remote artifact into `.tmp` and rename it into place
    pub fn download(&self, cancel: &CancelToken) -> Result<()> {
        if let Some(parent) = self.local_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.tmp_path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(GeosError::UpdateInProgress(self.tmp_path.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        let mut guard = TmpGuard {
            path: &self.tmp_path,
            armed: true,
        };

        let mut writer = BufWriter::new(file);
        let bytes = self
            .repository
            .copy_to(&self.location, &mut writer, cancel)?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&self.tmp_path, &self.local_path)?;
        guard.armed = false;

        log::info!(
            "Downloaded {} ({} bytes) from {}",
            self.local_path.display(),
            bytes,
            self.location
        );
        Ok(())
    }

    fn remove_tmp(&self) -> Result<()> {
        match fs::remove_file(&self.tmp_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Clean up an interrupted download and fetch the artifact again
    ///
    /// Returns `Ok(false)` when there was nothing to recover. Failed downloads
    /// are retried every `interval` until one succeeds or `cancel` fires.
    pub fn recover(&self, interval: Duration, cancel: &CancelToken) -> Result<bool> {
        if !self.has_stale_tmp() {
            return Ok(false);
        }
        log::warn!(
            "Found interrupted download {}, recovering",
            self.tmp_path.display()
        );
        self.remove_tmp()?;
        if !self.is_enabled() {
            return Ok(true);
        }

        loop {
            match self.download(cancel) {
                Ok(()) => return Ok(true),
                Err(GeosError::Cancelled) => return Err(GeosError::Cancelled),
                Err(e) => {
                    log::warn!(
                        "Recovery of {} failed, retrying in {:?}: {}",
                        self.local_path.display(),
                        interval,
                        e
                    );
                    cancel.sleep(interval)?;
                }
            }
        }
    }
}

/// Call `tick` every `period` until `cancel` fires
///
/// Errors from `tick` are logged and the loop carries on.
pub fn run_ticker<F>(name: &str, period: Duration, cancel: &CancelToken, mut tick: F)
where
    F: FnMut() -> Result<()>,
{
    log::info!("Auto-update of {} every {:?}", name, period);
    while cancel.sleep(period).is_ok() {
        if let Err(e) = tick() {
            log::warn!("Auto-update of {} failed: {}", name, e);
        }
    }
    log::debug!("Auto-update of {} stopped", name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_section::DataValue;
    use crate::ip_tree_builder::InsertMode;
    use crate::mmdb::IpVersion;
    use crate::mmdb_builder::MmdbBuilder;
    use crate::repository::LocalRepository;
    use crossbeam_channel::{bounded, Receiver, Sender};
    use std::io::Write;
    use std::sync::Mutex;
    use std::thread;
    use tempfile::TempDir;

    fn mmdb_bytes(epoch: u64, value: &str) -> Vec<u8> {
        let mut builder = MmdbBuilder::new("GEOS-Test", IpVersion::V6).with_build_epoch(epoch);
        builder
            .insert(
                "1.0.0.0/8".parse().unwrap(),
                DataValue::String(value.to_string()),
                InsertMode::Replace,
            )
            .unwrap();
        builder.build().unwrap()
    }

    fn mirror<V: Version>(dir: &TempDir, remote: &Path) -> UpdatableFile<V> {
        UpdatableFile::new(
            dir.path().join("local").join("db.mmdb"),
            remote.to_str().unwrap(),
            Arc::new(LocalRepository),
        )
    }

    #[test]
    fn test_mmdb_state_ordering() {
        let a = MmdbState { major: 2, minor: 0, build_epoch: 900 };
        let b = MmdbState { major: 2, minor: 0, build_epoch: 1000 };
        let c = MmdbState { major: 3, minor: 0, build_epoch: 1 };
        assert!(a < b);
        assert!(b < c);
        assert_eq!(b.to_string(), "v2.0@1000");
    }

    #[test]
    fn test_update_downloads_newer_only() {
        let dir = TempDir::new().unwrap();
        let remote = dir.path().join("remote.mmdb");
        fs::write(&remote, mmdb_bytes(200, "new")).unwrap();
        let file: UpdatableFile<MmdbState> = mirror(&dir, &remote);
        let cancel = CancelToken::new();

        let check = file.check_updates(&cancel).unwrap();
        assert_eq!(check.current, None);
        assert!(check.is_update_available());

        assert!(file.update(false, &cancel).unwrap());
        assert_eq!(file.local_version().unwrap().unwrap().build_epoch, 200);
        assert!(!file.has_stale_tmp());

        // Same version: no-op unless forced
        assert!(!file.update(false, &cancel).unwrap());
        assert!(file.update(true, &cancel).unwrap());

        // Older remote is ignored
        fs::write(&remote, mmdb_bytes(100, "old")).unwrap();
        assert!(!file.update(false, &cancel).unwrap());
        assert_eq!(file.local_version().unwrap().unwrap().build_epoch, 200);
    }

    #[test]
    fn test_disabled_source() {
        let dir = TempDir::new().unwrap();
        let file: UpdatableFile<ModTime> =
            UpdatableFile::new(dir.path().join("x"), "", Arc::new(LocalRepository));
        let check = file.check_updates(&CancelToken::new()).unwrap();
        assert!(!check.is_update_available());
        assert!(matches!(
            file.update(false, &CancelToken::new()),
            Err(GeosError::Disabled(_))
        ));
    }

    #[test]
    fn test_failed_download_keeps_live_file() {
        let dir = TempDir::new().unwrap();
        let remote = dir.path().join("remote.mmdb");
        fs::write(&remote, mmdb_bytes(200, "live")).unwrap();
        let file: UpdatableFile<MmdbState> = mirror(&dir, &remote);
        let cancel = CancelToken::new();
        file.update(false, &cancel).unwrap();
        let live = fs::read(file.local_path()).unwrap();

        fs::remove_file(&remote).unwrap();
        assert!(file.update(true, &cancel).is_err());
        assert_eq!(fs::read(file.local_path()).unwrap(), live);
        assert!(!file.has_stale_tmp());
    }

    /// Repository whose downloads block until released
    struct GatedRepository {
        entered: Sender<()>,
        release: Mutex<Receiver<()>>,
    }

    impl Repository for GatedRepository {
        fn last_modified(&self, _: &str, _: &CancelToken) -> Result<SystemTime> {
            Ok(SystemTime::now())
        }

        fn read_tail(&self, _: &str, _: u64, _: &CancelToken) -> Result<Vec<u8>> {
            Ok(Vec::new())
        }

        fn copy_to(&self, _: &str, sink: &mut dyn Write, _: &CancelToken) -> Result<u64> {
            self.entered.send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
            sink.write_all(b"payload")?;
            Ok(7)
        }
    }

    #[test]
    fn test_exclusive_update() {
        let dir = TempDir::new().unwrap();
        let (entered_tx, entered_rx) = bounded(2);
        let (release_tx, release_rx) = bounded(2);
        let file: Arc<UpdatableFile<ModTime>> = Arc::new(UpdatableFile::new(
            dir.path().join("artifact"),
            "remote",
            Arc::new(GatedRepository {
                entered: entered_tx,
                release: Mutex::new(release_rx),
            }),
        ));

        let first = {
            let file = Arc::clone(&file);
            thread::spawn(move || file.download(&CancelToken::new()))
        };
        entered_rx.recv().unwrap();

        // The first download holds the .tmp lock
        assert!(matches!(
            file.download(&CancelToken::new()),
            Err(GeosError::UpdateInProgress(_))
        ));
        assert!(entered_rx.try_recv().is_err());

        release_tx.send(()).unwrap();
        first.join().unwrap().unwrap();
        assert_eq!(fs::read(file.local_path()).unwrap(), b"payload");
    }

    #[test]
    fn test_recover_removes_stale_tmp() {
        let dir = TempDir::new().unwrap();
        let remote = dir.path().join("remote.mmdb");
        fs::write(&remote, mmdb_bytes(300, "fresh")).unwrap();
        let file: UpdatableFile<MmdbState> = mirror(&dir, &remote);

        fs::create_dir_all(file.local_path().parent().unwrap()).unwrap();
        fs::write(file.tmp_path(), b"0123456789").unwrap();
        assert!(file.has_stale_tmp());

        assert!(file
            .recover(Duration::from_millis(10), &CancelToken::new())
            .unwrap());
        assert!(!file.has_stale_tmp());
        assert_eq!(file.local_version().unwrap().unwrap().build_epoch, 300);

        // Nothing left to recover
        assert!(!file
            .recover(Duration::from_millis(10), &CancelToken::new())
            .unwrap());
    }

    #[test]
    fn test_recover_retries_until_cancelled() {
        let dir = TempDir::new().unwrap();
        let file: UpdatableFile<MmdbState> = mirror(&dir, &dir.path().join("missing.mmdb"));
        fs::create_dir_all(file.local_path().parent().unwrap()).unwrap();
        fs::write(file.tmp_path(), b"junk").unwrap();

        let cancel = CancelToken::new();
        let canceller = {
            let cancel = cancel.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                cancel.cancel();
            })
        };
        let result = file.recover(Duration::from_millis(5), &cancel);
        canceller.join().unwrap();

        assert!(matches!(result, Err(GeosError::Cancelled)));
        assert!(!file.has_stale_tmp());
        assert!(!file.exists());
    }

    #[test]
    fn test_ticker_stops_on_cancel() {
        let cancel = CancelToken::new();
        let ticks = Arc::new(Mutex::new(0));
        let worker = {
            let (cancel, ticks) = (cancel.clone(), Arc::clone(&ticks));
            thread::spawn(move || {
                run_ticker("test", Duration::from_millis(2), &cancel, || {
                    *ticks.lock().unwrap() += 1;
                    Err(GeosError::NotReady)
                })
            })
        };
        thread::sleep(Duration::from_millis(40));
        cancel.cancel();
        worker.join().unwrap();
        assert!(*ticks.lock().unwrap() > 0);
    }
}
