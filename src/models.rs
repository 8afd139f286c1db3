//! IP record models
//!
//! Typed views over City and ISP database records. Every field is optional
//! in the data; a missing field decodes to its zero value. Records also know
//! how to flatten themselves into CSV rows for dumps.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Localized names keyed by language code
pub type Names = BTreeMap<String, String>;

fn english(names: &Names) -> &str {
    names.get("en").map(String::as_str).unwrap_or_default()
}

/// Flattening of a record into CSV columns
pub trait MarshalCsv {
    /// Column names, excluding the leading `network` column
    fn csv_columns() -> &'static [&'static str];

    /// One value per column, in column order
    fn csv_row(&self) -> Vec<String>;
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Continent {
    pub code: String,
    pub geoname_id: u32,
    pub names: Names,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CountryInfo {
    pub geoname_id: u32,
    pub is_in_european_union: bool,
    pub iso_code: String,
    pub names: Names,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Subdivision {
    pub geoname_id: u32,
    pub iso_code: String,
    pub names: Names,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CityInfo {
    pub geoname_id: u32,
    pub names: Names,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Location {
    pub accuracy_radius: u16,
    pub latitude: f64,
    pub longitude: f64,
    pub metro_code: u16,
    pub time_zone: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Postal {
    pub code: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Traits {
    pub is_anonymous_proxy: bool,
    pub is_anycast: bool,
    pub is_satellite_provider: bool,
}

/// Country-level answer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Country {
    pub continent: Continent,
    pub country: CountryInfo,
    pub registered_country: CountryInfo,
    pub traits: Traits,
}

/// Full City database record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct City {
    pub city: CityInfo,
    pub continent: Continent,
    pub country: CountryInfo,
    pub location: Location,
    pub postal: Postal,
    pub registered_country: CountryInfo,
    /// Ordered from largest to smallest subdivision
    pub subdivisions: Vec<Subdivision>,
    pub traits: Traits,
}

impl From<City> for Country {
    fn from(city: City) -> Self {
        Country {
            continent: city.continent,
            country: city.country,
            registered_country: city.registered_country,
            traits: city.traits,
        }
    }
}

/// Compact City answer with English names only
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "City")]
pub struct CityLite {
    pub continent_code: String,
    pub country_iso_code: String,
    pub country_name: String,
    pub subdivision_iso_code: String,
    pub subdivision_name: String,
    pub city_geoname_id: u32,
    pub city_name: String,
    pub latitude: f64,
    pub longitude: f64,
    pub time_zone: String,
}

impl From<City> for CityLite {
    fn from(city: City) -> Self {
        let subdivision = city.subdivisions.first();
        CityLite {
            continent_code: city.continent.code,
            country_iso_code: city.country.iso_code.clone(),
            country_name: english(&city.country.names).to_string(),
            subdivision_iso_code: subdivision.map(|s| s.iso_code.clone()).unwrap_or_default(),
            subdivision_name: subdivision
                .map(|s| english(&s.names).to_string())
                .unwrap_or_default(),
            city_geoname_id: city.city.geoname_id,
            city_name: english(&city.city.names).to_string(),
            latitude: city.location.latitude,
            longitude: city.location.longitude,
            time_zone: city.location.time_zone,
        }
    }
}

/// ISP database record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Isp {
    pub autonomous_system_number: u32,
    pub autonomous_system_organization: String,
    pub isp: String,
    pub organization: String,
    pub mobile_country_code: String,
    pub mobile_network_code: String,
}

fn country_row(
    continent: &Continent,
    country: &CountryInfo,
    registered: &CountryInfo,
    traits: &Traits,
) -> Vec<String> {
    vec![
        continent.code.clone(),
        english(&continent.names).to_string(),
        country.iso_code.clone(),
        english(&country.names).to_string(),
        country.is_in_european_union.to_string(),
        registered.iso_code.clone(),
        traits.is_anonymous_proxy.to_string(),
        traits.is_satellite_provider.to_string(),
    ]
}

const COUNTRY_COLUMNS: &[&str] = &[
    "continent_code",
    "continent_name",
    "country_iso_code",
    "country_name",
    "is_in_european_union",
    "registered_country_iso_code",
    "is_anonymous_proxy",
    "is_satellite_provider",
];

impl MarshalCsv for Country {
    fn csv_columns() -> &'static [&'static str] {
        COUNTRY_COLUMNS
    }

    fn csv_row(&self) -> Vec<String> {
        country_row(
            &self.continent,
            &self.country,
            &self.registered_country,
            &self.traits,
        )
    }
}

impl MarshalCsv for City {
    fn csv_columns() -> &'static [&'static str] {
        &[
            "continent_code",
            "continent_name",
            "country_iso_code",
            "country_name",
            "is_in_european_union",
            "registered_country_iso_code",
            "is_anonymous_proxy",
            "is_satellite_provider",
            "subdivision_1_iso_code",
            "subdivision_1_name",
            "subdivision_2_iso_code",
            "subdivision_2_name",
            "city_geoname_id",
            "city_name",
            "postal_code",
            "latitude",
            "longitude",
            "accuracy_radius",
            "time_zone",
            "metro_code",
        ]
    }

    fn csv_row(&self) -> Vec<String> {
        let mut row = country_row(
            &self.continent,
            &self.country,
            &self.registered_country,
            &self.traits,
        );
        for i in 0..2 {
            match self.subdivisions.get(i) {
                Some(s) => {
                    row.push(s.iso_code.clone());
                    row.push(english(&s.names).to_string());
                }
                None => row.extend([String::new(), String::new()]),
            }
        }
        row.extend([
            self.city.geoname_id.to_string(),
            english(&self.city.names).to_string(),
            self.postal.code.clone(),
            self.location.latitude.to_string(),
            self.location.longitude.to_string(),
            self.location.accuracy_radius.to_string(),
            self.location.time_zone.clone(),
            self.location.metro_code.to_string(),
        ]);
        row
    }
}

impl MarshalCsv for CityLite {
    fn csv_columns() -> &'static [&'static str] {
        &[
            "continent_code",
            "country_iso_code",
            "country_name",
            "subdivision_iso_code",
            "subdivision_name",
            "city_geoname_id",
            "city_name",
            "latitude",
            "longitude",
            "time_zone",
        ]
    }

    fn csv_row(&self) -> Vec<String> {
        vec![
            self.continent_code.clone(),
            self.country_iso_code.clone(),
            self.country_name.clone(),
            self.subdivision_iso_code.clone(),
            self.subdivision_name.clone(),
            self.city_geoname_id.to_string(),
            self.city_name.clone(),
            self.latitude.to_string(),
            self.longitude.to_string(),
            self.time_zone.clone(),
        ]
    }
}

impl MarshalCsv for Isp {
    fn csv_columns() -> &'static [&'static str] {
        &[
            "autonomous_system_number",
            "autonomous_system_organization",
            "isp",
            "organization",
            "mobile_country_code",
            "mobile_network_code",
        ]
    }

    fn csv_row(&self) -> Vec<String> {
        vec![
            self.autonomous_system_number.to_string(),
            self.autonomous_system_organization.clone(),
            self.isp.clone(),
            self.organization.clone(),
            self.mobile_country_code.clone(),
            self.mobile_network_code.clone(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_section::{DataEncoder, DataValue};
    use crate::decoder::Decoder;

    fn encode(json: serde_json::Value) -> (Vec<u8>, usize) {
        let mut encoder = DataEncoder::new();
        let offset = encoder.encode(&DataValue::from_json(&json).unwrap());
        (encoder.into_bytes(), offset as usize)
    }

    fn paris() -> serde_json::Value {
        serde_json::json!({
            "city": {"geoname_id": 2988507, "names": {"en": "Paris", "fr": "Paris"}},
            "continent": {"code": "EU", "geoname_id": 6255148, "names": {"en": "Europe"}},
            "country": {"geoname_id": 3017382, "is_in_european_union": true, "iso_code": "FR",
                        "names": {"en": "France"}},
            "location": {"accuracy_radius": 20, "latitude": 48.8534, "longitude": 2.3488,
                         "time_zone": "Europe/Paris"},
            "postal": {"code": "75001"},
            "subdivisions": [{"geoname_id": 3012874, "iso_code": "IDF",
                              "names": {"en": "Île-de-France"}}],
            "unknown_section": {"ignored": [1, 2, 3]}
        })
    }

    #[test]
    fn test_decode_city() {
        let (bytes, offset) = encode(paris());
        let city: City = Decoder::new(&bytes, offset).decode().unwrap();

        assert_eq!(city.city.geoname_id, 2988507);
        assert_eq!(city.country.iso_code, "FR");
        assert!(city.country.is_in_european_union);
        assert_eq!(city.location.accuracy_radius, 20);
        assert_eq!(city.subdivisions[0].iso_code, "IDF");
        // absent sections decode to zero values
        assert_eq!(city.registered_country, CountryInfo::default());
        assert_eq!(city.location.metro_code, 0);
    }

    #[test]
    fn test_decode_projections() {
        let (bytes, offset) = encode(paris());

        let country: Country = Decoder::new(&bytes, offset).decode().unwrap();
        assert_eq!(country.continent.code, "EU");

        let lite: CityLite = Decoder::new(&bytes, offset).decode().unwrap();
        assert_eq!(lite.city_name, "Paris");
        assert_eq!(lite.subdivision_name, "Île-de-France");
        assert_eq!(lite.time_zone, "Europe/Paris");
    }

    #[test]
    fn test_csv_rows_match_columns() {
        let (bytes, offset) = encode(paris());
        let city: City = Decoder::new(&bytes, offset).decode().unwrap();

        assert_eq!(city.csv_row().len(), City::csv_columns().len());
        assert_eq!(
            CityLite::from(city.clone()).csv_row().len(),
            CityLite::csv_columns().len()
        );
        assert_eq!(
            Country::from(city).csv_row().len(),
            Country::csv_columns().len()
        );
        assert_eq!(Isp::default().csv_row().len(), Isp::csv_columns().len());
    }

    #[test]
    fn test_decode_isp() {
        let (bytes, offset) = encode(serde_json::json!({
            "autonomous_system_number": 15169,
            "autonomous_system_organization": "Google LLC",
            "isp": "Google"
        }));
        let isp: Isp = Decoder::new(&bytes, offset).decode().unwrap();
        assert_eq!(isp.autonomous_system_number, 15169);
        assert_eq!(isp.organization, "");
    }
}
