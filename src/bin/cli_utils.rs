use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, ValueEnum};
use geos::{DbKind, GeosConfig, UpdateStatuses};
use std::path::{Path, PathBuf};

/// Record shape of a lookup or CSV dump
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Granularity {
    Country,
    City,
    CityLite,
    Isp,
}

impl Granularity {
    pub fn kind(self) -> DbKind {
        match self {
            Granularity::Isp => DbKind::Isp,
            _ => DbKind::City,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Kind {
    City,
    Isp,
}

impl From<Kind> for DbKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::City => DbKind::City,
            Kind::Isp => DbKind::Isp,
        }
    }
}

/// GeoNames collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Entity {
    Continents,
    Countries,
    Subdivisions,
    Cities,
}

/// Settings that take precedence over the configuration file
#[derive(Debug, Default, Args)]
pub struct ConfigOverrides {
    /// Data directory
    #[arg(long, global = true, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,

    /// Location of the City database (empty disables it)
    #[arg(long, global = true, value_name = "URL")]
    pub city_url: Option<String>,

    /// Location of the ISP database (empty disables it)
    #[arg(long, global = true, value_name = "URL")]
    pub isp_url: Option<String>,

    /// Base location of the GeoNames dumps
    #[arg(long, global = true, value_name = "URL")]
    pub geonames_url: Option<String>,

    /// Base location of the patch bundles
    #[arg(long, global = true, value_name = "URL")]
    pub patches_url: Option<String>,

    /// Auto-update period in seconds (0 = disabled)
    #[arg(long, global = true, value_name = "SECS")]
    pub auto_update_secs: Option<u64>,
}

/// Configuration file (or defaults) with command-line overrides applied
pub fn load_config(path: Option<&Path>, overrides: ConfigOverrides) -> Result<GeosConfig> {
    let mut config = match path {
        Some(path) => GeosConfig::load(path)
            .with_context(|| format!("Failed to load configuration: {}", path.display()))?,
        None => GeosConfig::default(),
    };

    if let Some(dir) = overrides.data_dir {
        config.data_dir = dir;
    }
    if let Some(url) = overrides.city_url {
        config.city_url = url;
    }
    if let Some(url) = overrides.isp_url {
        config.isp_url = url;
    }
    if let Some(url) = overrides.geonames_url {
        config.geonames_url = url;
    }
    if let Some(url) = overrides.patches_url {
        config.patches_url = url;
    }
    if let Some(secs) = overrides.auto_update_secs {
        config.auto_update_period_secs = secs;
    }
    Ok(config)
}

/// Format Unix timestamp as human-readable date
pub fn format_unix_timestamp(epoch: u64) -> String {
    i64::try_from(epoch)
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("{} (out of range)", epoch))
}

/// Print a status map, one line per subject or as JSON
pub fn print_statuses(statuses: &UpdateStatuses, json: bool) -> Result<()> {
    if json {
        let mut map = serde_json::Map::new();
        for (subject, status) in statuses {
            map.insert(subject.to_string(), serde_json::to_value(status)?);
        }
        println!("{}", serde_json::to_string_pretty(&map)?);
        return Ok(());
    }

    for (subject, status) in statuses {
        match &status.error {
            Some(error) => println!("{:<14} error: {}", subject, error),
            None if status.available => println!("{:<14} update available", subject),
            None => println!("{:<14} up to date", subject),
        }
    }
    Ok(())
}
