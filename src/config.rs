//! Service configuration

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Settings for a [`Geos`](crate::service::Geos) service
///
/// Loaded from an optional JSON file; every field has a default. An empty
/// URL disables the corresponding source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeosConfig {
    /// Directory holding databases, GeoNames dumps and patches
    pub data_dir: PathBuf,
    /// Location of the City MMDB
    pub city_url: String,
    /// Location of the ISP MMDB
    pub isp_url: String,
    /// Base location of the three GeoNames dumps
    pub geonames_url: String,
    /// Base location of the `<prefix>_patches.tar.gz` bundles
    pub patches_url: String,
    /// Auto-update period; 0 disables auto-update
    pub auto_update_period_secs: u64,
    pub recovery_interval_secs: u64,
    pub geonames_retry_secs: u64,
    pub http_timeout_secs: u64,
}

impl Default for GeosConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            city_url: String::new(),
            isp_url: String::new(),
            geonames_url: String::new(),
            patches_url: String::new(),
            auto_update_period_secs: 0,
            recovery_interval_secs: 60,
            geonames_retry_secs: 60,
            http_timeout_secs: 30,
        }
    }
}

impl GeosConfig {
    /// Read a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Auto-update period, `None` when disabled
    pub fn auto_update_period(&self) -> Option<Duration> {
        (self.auto_update_period_secs > 0).then(|| Duration::from_secs(self.auto_update_period_secs))
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_secs(self.recovery_interval_secs.max(1))
    }

    pub fn geonames_retry(&self) -> Duration {
        Duration::from_secs(self.geonames_retry_secs.max(1))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }

    pub fn geonames_dir(&self) -> PathBuf {
        self.data_dir.join("geonames")
    }

    pub fn patches_dir(&self) -> PathBuf {
        self.data_dir.join("patches")
    }
}

/// `base/name`, or empty when `base` is empty
pub fn join_url(base: &str, name: &str) -> String {
    if base.is_empty() {
        String::new()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), name)
    }
}
