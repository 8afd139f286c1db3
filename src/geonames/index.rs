//! In-memory GeoNames indexes
//!
//! An [`Index`] owns one entity collection, grouped by country code, and
//! three lookup structures over it:
//!
//! - `geoname_id -> position` hash map
//! - an `fst::Set` of `lowercase(name) 0x00 position` keys for prefix search
//! - `country_code -> [begin, end)` ranges over the grouped collection
//!
//! A [`Catalog`] bundles the four entity kinds.

use super::entities::{continents, City, Continent, Country, GeoEntity, Subdivision};
use crate::error::{GeosError, Result};
use fst::automaton::{Automaton, Str};
use fst::{IntoStreamer, Set, Streamer};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Selection over an entity collection
///
/// Empty fields are unset. See [`Index::filtered`] for precedence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Filter {
    pub geoname_ids: Vec<u32>,
    pub country_codes: Vec<String>,
    pub name_prefix: String,
    /// Maximum number of results; 0 means unlimited
    pub limit: usize,
}

fn name_key(name: &str, position: usize) -> Vec<u8> {
    let mut key = name.to_ascii_lowercase().into_bytes();
    key.push(0);
    key.extend_from_slice(&(position as u32).to_be_bytes());
    key
}

fn key_position(key: &[u8]) -> Option<usize> {
    let tail: [u8; 4] = key.get(key.len().checked_sub(4)?..)?.try_into().ok()?;
    Some(u32::from_be_bytes(tail) as usize)
}

/// Indexed collection of one entity kind
pub struct Index<T> {
    items: Vec<T>,
    by_id: FxHashMap<u32, usize>,
    names: Set<Vec<u8>>,
    countries: FxHashMap<String, Range<usize>>,
}

impl<T> std::fmt::Debug for Index<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("items", &self.items.len())
            .field("countries", &self.countries.len())
            .finish()
    }
}

impl<T: GeoEntity> Index<T> {
    /// Index `items`
    ///
    /// Items are grouped by country code with a stable sort, so input that
    /// is already country-sorted keeps its order.
    pub fn new(mut items: Vec<T>) -> Result<Self> {
        if u32::try_from(items.len()).is_err() {
            return Err(GeosError::Corrupt(format!(
                "{} entities exceed index capacity",
                items.len()
            )));
        }
        items.sort_by(|a, b| a.country_code().cmp(b.country_code()));

        let mut by_id = FxHashMap::with_capacity_and_hasher(items.len(), Default::default());
        let mut countries: FxHashMap<String, Range<usize>> = FxHashMap::default();
        let mut keys = Vec::with_capacity(items.len());

        for (position, item) in items.iter().enumerate() {
            by_id.insert(item.geoname_id(), position);
            keys.push(name_key(item.name(), position));

            let code = item.country_code();
            match countries.get_mut(code) {
                Some(range) => range.end = position + 1,
                None => {
                    countries.insert(code.to_string(), position..position + 1);
                }
            }
        }

        // FST requires lexicographically sorted input
        keys.sort_unstable();
        let names = Set::from_iter(keys)
            .map_err(|e| GeosError::Corrupt(format!("failed to build name index: {}", e)))?;

        Ok(Self {
            items,
            by_id,
            names,
            countries,
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// The whole collection, grouped by country
    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn get(&self, geoname_id: u32) -> Option<&T> {
        self.by_id.get(&geoname_id).map(|&i| &self.items[i])
    }

    /// Positions whose lowercase name starts with lowercase `prefix`,
    /// in name order
    pub fn search_prefix(&self, prefix: &str) -> Vec<usize> {
        let prefix = prefix.to_ascii_lowercase();
        let mut stream = self.names.search(Str::new(&prefix).starts_with()).into_stream();
        let mut positions = Vec::new();
        while let Some(key) = stream.next() {
            if let Some(position) = key_position(key) {
                positions.push(position);
            }
        }
        positions
    }

    /// Range of positions holding entities of `country_code`
    pub fn country_range(&self, country_code: &str) -> Option<Range<usize>> {
        self.countries.get(country_code).cloned()
    }

    /// Select entities by `filter`
    ///
    /// Precedence: ids (in filter order, unknown ids skipped); else
    /// prefix matches restricted to the countries; else the countries'
    /// entities; else prefix matches; else everything. A positive limit
    /// truncates the selection.
    pub fn filtered(&self, filter: &Filter) -> Vec<&T> {
        let codes: Vec<String> = filter
            .country_codes
            .iter()
            .map(|c| c.trim().to_ascii_uppercase())
            .filter(|c| !c.is_empty())
            .collect();
        let prefix = filter.name_prefix.as_str();

        let mut selected: Vec<&T> = if !filter.geoname_ids.is_empty() {
            filter
                .geoname_ids
                .iter()
                .filter_map(|&id| self.get(id))
                .collect()
        } else if !codes.is_empty() && !prefix.is_empty() {
            let ranges: Vec<Range<usize>> =
                codes.iter().filter_map(|c| self.country_range(c)).collect();
            self.search_prefix(prefix)
                .into_iter()
                .filter(|p| ranges.iter().any(|r| r.contains(p)))
                .map(|p| &self.items[p])
                .collect()
        } else if !codes.is_empty() {
            codes
                .iter()
                .filter_map(|c| self.country_range(c))
                .flat_map(|r| self.items[r].iter())
                .collect()
        } else if !prefix.is_empty() {
            self.search_prefix(prefix)
                .into_iter()
                .map(|p| &self.items[p])
                .collect()
        } else {
            self.items.iter().collect()
        };

        if filter.limit > 0 {
            selected.truncate(filter.limit);
        }
        selected
    }
}

/// All GeoNames collections, indexed
#[derive(Debug)]
pub struct Catalog {
    pub continents: Index<Continent>,
    pub countries: Index<Country>,
    pub subdivisions: Index<Subdivision>,
    pub cities: Index<City>,
}

impl Catalog {
    /// Index the loaded collections, in parallel
    pub fn build(
        countries: Vec<Country>,
        subdivisions: Vec<Subdivision>,
        cities: Vec<City>,
    ) -> Result<Self> {
        let ((continents, countries), (subdivisions, cities)) = rayon::join(
            || rayon::join(|| Index::new(continents()), || Index::new(countries)),
            || rayon::join(|| Index::new(subdivisions), || Index::new(cities)),
        );
        Ok(Self {
            continents: continents?,
            countries: countries?,
            subdivisions: subdivisions?,
            cities: cities?,
        })
    }

    /// Copy of this catalog with the derived name fields filled in
    pub fn enriched(&self) -> Result<Self> {
        let mut countries = self.countries.items().to_vec();
        let mut subdivisions = self.subdivisions.items().to_vec();
        let mut cities = self.cities.items().to_vec();
        enrich(
            self.continents.items(),
            &mut countries,
            &mut subdivisions,
            &mut cities,
        );
        Self::build(countries, subdivisions, cities)
    }

    pub fn len(&self) -> usize {
        self.continents.len() + self.countries.len() + self.subdivisions.len() + self.cities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Fill derived names by joining on country code and `CC.ADMIN1`
pub fn enrich(
    continents: &[Continent],
    countries: &mut [Country],
    subdivisions: &mut [Subdivision],
    cities: &mut [City],
) {
    let continent_names: FxHashMap<&str, &str> = continents
        .iter()
        .map(|c| (c.code.as_str(), c.name.as_str()))
        .collect();

    for country in countries.iter_mut() {
        if let Some(name) = continent_names.get(country.continent_code.as_str()) {
            country.continent_name = name.to_string();
        }
    }

    let country_info: FxHashMap<&str, (&str, &str, &str)> = countries
        .iter()
        .map(|c| {
            (
                c.iso_code.as_str(),
                (
                    c.name.as_str(),
                    c.continent_code.as_str(),
                    c.continent_name.as_str(),
                ),
            )
        })
        .collect();

    for subdivision in subdivisions.iter_mut() {
        if let Some((name, continent_code, continent_name)) =
            country_info.get(subdivision.country_code.as_str())
        {
            subdivision.country_name = name.to_string();
            subdivision.continent_code = continent_code.to_string();
            subdivision.continent_name = continent_name.to_string();
        }
    }

    let subdivision_names: FxHashMap<&str, &str> = subdivisions
        .iter()
        .map(|s| (s.code.as_str(), s.name.as_str()))
        .collect();

    for city in cities.iter_mut() {
        if let Some((name, continent_code, continent_name)) =
            country_info.get(city.country_code.as_str())
        {
            city.country_name = name.to_string();
            city.continent_code = continent_code.to_string();
            city.continent_name = continent_name.to_string();
        }
        if let Some(name) = subdivision_names.get(city.subdivision_code().as_str()) {
            city.subdivision_name = name.to_string();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn city(id: u32, name: &str, country: &str) -> City {
        City {
            geoname_id: id,
            name: name.to_string(),
            country_code: country.to_string(),
            admin1_code: "01".to_string(),
            ..Default::default()
        }
    }

    fn cities() -> Index<City> {
        Index::new(vec![
            city(1, "Paris", "FR"),
            city(2, "Parma", "IT"),
            city(3, "Paramaribo", "SR"),
            city(4, "Lyon", "FR"),
            city(5, "paris", "US"),
        ])
        .unwrap()
    }

    fn names(found: Vec<&City>) -> Vec<(&str, &str)> {
        found
            .into_iter()
            .map(|c| (c.name.as_str(), c.country_code.as_str()))
            .collect()
    }

    #[test]
    fn test_prefix_and_countries() {
        let index = cities();
        let filter = Filter {
            name_prefix: "Par".to_string(),
            country_codes: vec!["IT".to_string(), "FR".to_string()],
            ..Default::default()
        };
        assert_eq!(
            names(index.filtered(&filter)),
            vec![("Paris", "FR"), ("Parma", "IT")]
        );
    }

    #[test]
    fn test_ids_take_precedence() {
        let index = cities();
        let filter = Filter {
            geoname_ids: vec![4, 99, 2],
            name_prefix: "zzz".to_string(),
            ..Default::default()
        };
        assert_eq!(
            names(index.filtered(&filter)),
            vec![("Lyon", "FR"), ("Parma", "IT")]
        );
    }

    #[test]
    fn test_countries_only() {
        let index = cities();
        let filter = Filter {
            country_codes: vec!["sr".to_string(), "FR".to_string(), "XX".to_string()],
            ..Default::default()
        };
        assert_eq!(
            names(index.filtered(&filter)),
            vec![("Paramaribo", "SR"), ("Paris", "FR"), ("Lyon", "FR")]
        );
    }

    #[test]
    fn test_prefix_case_folded() {
        let index = cities();
        let filter = Filter {
            name_prefix: "PARI".to_string(),
            ..Default::default()
        };
        let found = names(index.filtered(&filter));
        assert_eq!(found.len(), 2);
        assert!(found.contains(&("Paris", "FR")));
        assert!(found.contains(&("paris", "US")));
    }

    #[test]
    fn test_everything_with_limit() {
        let index = cities();
        assert_eq!(index.filtered(&Filter::default()).len(), 5);
        let limited = Filter {
            limit: 2,
            ..Default::default()
        };
        assert_eq!(index.filtered(&limited).len(), 2);
    }

    #[test]
    fn test_get_and_ranges() {
        let index = cities();
        assert_eq!(index.get(3).unwrap().name, "Paramaribo");
        assert!(index.get(42).is_none());
        assert_eq!(index.country_range("FR").map(|r| r.len()), Some(2));
        assert_eq!(index.country_range("DE"), None);
    }

    #[test]
    fn test_enrichment() {
        let countries = vec![Country {
            geoname_id: 3017382,
            iso_code: "FR".to_string(),
            name: "France".to_string(),
            continent_code: "EU".to_string(),
            ..Default::default()
        }];
        let subdivisions = vec![Subdivision {
            geoname_id: 3012874,
            code: "FR.01".to_string(),
            country_code: "FR".to_string(),
            admin1_code: "01".to_string(),
            name: "Île-de-France".to_string(),
            ..Default::default()
        }];
        let catalog = Catalog::build(countries, subdivisions, vec![city(1, "Paris", "FR")]).unwrap();
        assert_eq!(catalog.continents.len(), 7);
        assert_eq!(catalog.cities.get(1).unwrap().country_name, "");

        let enriched = catalog.enriched().unwrap();
        assert_eq!(enriched.countries.get(3017382).unwrap().continent_name, "Europe");
        let subdivision = enriched.subdivisions.get(3012874).unwrap();
        assert_eq!(subdivision.country_name, "France");
        assert_eq!(subdivision.continent_code, "EU");
        let paris = enriched.cities.get(1).unwrap();
        assert_eq!(paris.country_name, "France");
        assert_eq!(paris.continent_name, "Europe");
        assert_eq!(paris.subdivision_name, "Île-de-France");
        assert_eq!(enriched.len(), catalog.len());
    }
}
