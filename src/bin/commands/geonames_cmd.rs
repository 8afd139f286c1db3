use anyhow::{Context, Result};
use geos::{CancelToken, Filter, Geos, GeosConfig};
use serde::Serialize;

use crate::cli_utils::Entity;

fn print_items<T: Serialize>(items: geos::Result<Vec<T>>) -> Result<()> {
    let items = items.context("GeoNames query failed")?;
    println!("{}", serde_json::to_string_pretty(&items)?);
    Ok(())
}

pub fn cmd_geonames(
    config: GeosConfig,
    entity: Entity,
    geoname_ids: Vec<u32>,
    country_codes: Vec<String>,
    name_prefix: String,
    limit: usize,
) -> Result<()> {
    let dir = config.geonames_dir();
    let geos = Geos::new(config);
    geos.load_geonames()
        .with_context(|| format!("Failed to load GeoNames dumps from {}", dir.display()))?;

    let filter = Filter {
        geoname_ids,
        country_codes,
        name_prefix,
        limit,
    };
    let cancel = CancelToken::new();
    match entity {
        Entity::Continents => print_items(geos.continents(&filter, &cancel)),
        Entity::Countries => print_items(geos.countries(&filter, &cancel)),
        Entity::Subdivisions => print_items(geos.subdivisions(&filter, &cancel)),
        Entity::Cities => print_items(geos.cities(&filter, &cancel)),
    }
}
