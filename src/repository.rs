//! Remote artifact repositories
//!
//! A [`Repository`] answers three questions about a remote artifact: when it
//! last changed, what its trailing bytes are, and what its full body is.
//! HTTP(S) locations go through [`HttpRepository`]; anything else is treated
//! as a filesystem path by [`LocalRepository`].

use crate::cancel::CancelToken;
use crate::error::{GeosError, Result};
use chrono::DateTime;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

const COPY_CHUNK: usize = 64 * 1024;

/// Source of downloadable artifacts
pub trait Repository: Send + Sync {
    /// Modification time of the artifact
    fn last_modified(&self, location: &str, cancel: &CancelToken) -> Result<SystemTime>;

    /// At most the last `len` bytes of the artifact
    fn read_tail(&self, location: &str, len: u64, cancel: &CancelToken) -> Result<Vec<u8>>;

    /// Stream the full artifact into `sink`; returns the bytes written
    fn copy_to(&self, location: &str, sink: &mut dyn Write, cancel: &CancelToken) -> Result<u64>;
}

/// Pick the repository for `location` by its scheme
pub fn for_location(location: &str, timeout: Duration) -> Arc<dyn Repository> {
    if location.starts_with("http://") || location.starts_with("https://") {
        Arc::new(HttpRepository::new(timeout))
    } else {
        Arc::new(LocalRepository)
    }
}

/// Copy `reader` into `sink` in chunks, checking `cancel` between them
pub fn copy_cancellable(
    reader: &mut dyn Read,
    sink: &mut dyn Write,
    cancel: &CancelToken,
) -> Result<u64> {
    let mut buf = vec![0u8; COPY_CHUNK];
    let mut total = 0u64;
    loop {
        cancel.check()?;
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        sink.write_all(&buf[..n])?;
        total += n as u64;
    }
    Ok(total)
}

/// HTTP(S) repository backed by a blocking `ureq` agent
#[derive(Clone)]
pub struct HttpRepository {
    agent: ureq::Agent,
}

impl std::fmt::Debug for HttpRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRepository").finish_non_exhaustive()
    }
}

impl HttpRepository {
    pub fn new(timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout)
            .timeout_read(timeout)
            .user_agent(concat!("geos/", env!("CARGO_PKG_VERSION")))
            .build();
        Self { agent }
    }
}

impl Repository for HttpRepository {
    fn last_modified(&self, location: &str, cancel: &CancelToken) -> Result<SystemTime> {
        cancel.check()?;
        let response = self.agent.head(location).call()?;
        let header = response.header("Last-Modified").ok_or_else(|| {
            GeosError::Transport(format!("no Last-Modified header from {}", location))
        })?;
        let parsed = DateTime::parse_from_rfc2822(header).map_err(|e| {
            GeosError::Transport(format!("bad Last-Modified '{}' from {}: {}", header, location, e))
        })?;
        log::debug!("{} last modified {}", location, parsed);
        Ok(SystemTime::from(parsed))
    }

    fn read_tail(&self, location: &str, len: u64, cancel: &CancelToken) -> Result<Vec<u8>> {
        cancel.check()?;
        let response = self
            .agent
            .get(location)
            .set("Range", &format!("bytes=-{}", len))
            .call()?;
        if response.status() != 206 {
            return Err(GeosError::Transport(format!(
                "expected 206 Partial Content from {}, got {}",
                location,
                response.status()
            )));
        }

        let mut tail = Vec::new();
        let mut body = response.into_reader().take(len);
        copy_cancellable(&mut body, &mut tail, cancel)?;
        Ok(tail)
    }

    fn copy_to(&self, location: &str, sink: &mut dyn Write, cancel: &CancelToken) -> Result<u64> {
        cancel.check()?;
        let response = self.agent.get(location).call()?;
        let mut body = response.into_reader();
        copy_cancellable(&mut body, sink, cancel)
    }
}

/// Filesystem repository; locations are paths, optionally `file://` prefixed
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalRepository;

fn local_path(location: &str) -> &Path {
    Path::new(location.strip_prefix("file://").unwrap_or(location))
}

impl Repository for LocalRepository {
    fn last_modified(&self, location: &str, cancel: &CancelToken) -> Result<SystemTime> {
        cancel.check()?;
        Ok(fs::metadata(local_path(location))?.modified()?)
    }

    fn read_tail(&self, location: &str, len: u64, cancel: &CancelToken) -> Result<Vec<u8>> {
        cancel.check()?;
        let mut file = File::open(local_path(location))?;
        let size = file.metadata()?.len();
        let start = size.saturating_sub(len);
        file.seek(SeekFrom::Start(start))?;

        let mut tail = Vec::with_capacity((size - start) as usize);
        file.read_to_end(&mut tail)?;
        Ok(tail)
    }

    fn copy_to(&self, location: &str, sink: &mut dyn Write, cancel: &CancelToken) -> Result<u64> {
        let mut file = File::open(local_path(location))?;
        copy_cancellable(&mut file, sink, cancel)
    }
}
