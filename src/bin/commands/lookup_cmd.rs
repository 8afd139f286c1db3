use anyhow::{Context, Result};
use geos::{Geos, GeosConfig};
use ipnet::IpNet;
use serde::Serialize;
use serde_json::json;
use std::net::IpAddr;

use crate::cli_utils::Granularity;

fn found<T: Serialize>(result: geos::Result<(T, IpNet)>) -> Result<Option<serde_json::Value>> {
    match result {
        Ok((record, network)) => Ok(Some(json!({
            "network": network.to_string(),
            "record": record,
        }))),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub fn cmd_lookup(config: GeosConfig, ip: IpAddr, granularity: Granularity, quiet: bool) -> Result<()> {
    let geos = Geos::new(config);
    geos.load();

    let result = match granularity {
        Granularity::Country => found(geos.country(ip)),
        Granularity::City => found(geos.city(ip)),
        Granularity::CityLite => found(geos.city_lite(ip)),
        Granularity::Isp => found(geos.isp(ip)),
    }
    .with_context(|| format!("Lookup failed for: {}", ip))?;

    if !quiet {
        match &result {
            Some(value) => println!("{}", serde_json::to_string_pretty(value)?),
            None => println!("null"),
        }
    }

    // Exit code reports whether the address matched
    std::process::exit(if result.is_some() { 0 } else { 1 });
}
