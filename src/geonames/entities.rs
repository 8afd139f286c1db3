//! GeoNames entity kinds
//!
//! Countries, first-level subdivisions and cities come from the GeoNames text
//! dumps; continents are a fixed set. Fields suffixed by enrichment
//! (`continent_name`, `country_name`, `subdivision_name`) start empty and are
//! filled once every collection is loaded.

use serde::Serialize;

/// Capabilities shared by every indexed entity
pub trait GeoEntity: Send + Sync + 'static {
    fn geoname_id(&self) -> u32;

    fn name(&self) -> &str;

    /// ISO 3166 alpha-2 code; empty for continents
    fn country_code(&self) -> &str;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Continent {
    pub geoname_id: u32,
    pub code: String,
    pub name: String,
}

/// The seven GeoNames continents
pub fn continents() -> Vec<Continent> {
    [
        (6255146, "AF", "Africa"),
        (6255152, "AN", "Antarctica"),
        (6255147, "AS", "Asia"),
        (6255148, "EU", "Europe"),
        (6255149, "NA", "North America"),
        (6255151, "OC", "Oceania"),
        (6255150, "SA", "South America"),
    ]
    .into_iter()
    .map(|(geoname_id, code, name)| Continent {
        geoname_id,
        code: code.to_string(),
        name: name.to_string(),
    })
    .collect()
}

/// Row of `countryInfo.txt`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Country {
    pub geoname_id: u32,
    pub iso_code: String,
    pub iso3_code: String,
    pub iso_numeric: u16,
    pub fips_code: String,
    pub name: String,
    pub capital: String,
    pub area_km2: f64,
    pub population: u64,
    pub continent_code: String,
    pub tld: String,
    pub currency_code: String,
    pub currency_name: String,
    pub phone: String,
    pub postal_code_format: String,
    pub postal_code_regex: String,
    pub languages: Vec<String>,
    pub neighbours: Vec<String>,
    pub continent_name: String,
}

/// Row of `admin1CodesASCII.txt`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Subdivision {
    pub geoname_id: u32,
    /// Composite `CC.ADMIN1` key, e.g. `FR.11`
    pub code: String,
    pub country_code: String,
    pub admin1_code: String,
    pub name: String,
    pub ascii_name: String,
    pub continent_code: String,
    pub continent_name: String,
    pub country_name: String,
}

/// Row of the GeoNames main table (`cities500.txt`)
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct City {
    pub geoname_id: u32,
    pub name: String,
    pub ascii_name: String,
    pub alternate_names: Vec<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub feature_class: String,
    pub feature_code: String,
    pub country_code: String,
    pub admin1_code: String,
    pub admin2_code: String,
    pub population: u64,
    pub elevation: Option<i32>,
    pub timezone: String,
    pub modification_date: String,
    pub continent_code: String,
    pub continent_name: String,
    pub country_name: String,
    pub subdivision_name: String,
}

impl City {
    /// Key of the subdivision this city belongs to
    pub fn subdivision_code(&self) -> String {
        format!("{}.{}", self.country_code, self.admin1_code)
    }
}

impl GeoEntity for Continent {
    fn geoname_id(&self) -> u32 {
        self.geoname_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn country_code(&self) -> &str {
        ""
    }
}

impl GeoEntity for Country {
    fn geoname_id(&self) -> u32 {
        self.geoname_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn country_code(&self) -> &str {
        &self.iso_code
    }
}

impl GeoEntity for Subdivision {
    fn geoname_id(&self) -> u32 {
        self.geoname_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn country_code(&self) -> &str {
        &self.country_code
    }
}

impl GeoEntity for City {
    fn geoname_id(&self) -> u32 {
        self.geoname_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn country_code(&self) -> &str {
        &self.country_code
    }
}
