//! Parsers for the GeoNames tab-separated dumps
//!
//! All three files are headerless, tab-separated and unquoted; lines starting
//! with `#` are comments. Empty numeric fields read as zero.

use super::entities::{City, Country, Subdivision};
use crate::error::{GeosError, Result};
use csv::{ReaderBuilder, StringRecord};
use std::fs::File;
use std::io::{BufReader, Read, Seek};
use std::path::Path;
use std::str::FromStr;

/// Member of `cities500.zip` holding the table
pub const CITIES_MEMBER: &str = "cities500.txt";

fn tsv_reader<R: Read>(input: R) -> csv::Reader<R> {
    ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .comment(Some(b'#'))
        .flexible(true)
        .quoting(false)
        .from_reader(input)
}

fn text<'r>(record: &'r StringRecord, column: usize) -> &'r str {
    record.get(column).unwrap_or_default().trim()
}

fn number<T: FromStr + Default>(record: &StringRecord, column: usize) -> Result<T> {
    let value = text(record, column);
    if value.is_empty() {
        return Ok(T::default());
    }
    value.parse().map_err(|_| {
        let line = record.position().map(|p| p.line()).unwrap_or_default();
        GeosError::Decode(format!(
            "line {}, column {}: '{}' is not a number",
            line, column, value
        ))
    })
}

fn list(record: &StringRecord, column: usize) -> Vec<String> {
    text(record, column)
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn require_columns(record: &StringRecord, columns: usize, file: &str) -> Result<()> {
    if record.len() < columns {
        let line = record.position().map(|p| p.line()).unwrap_or_default();
        return Err(GeosError::Decode(format!(
            "{} line {}: expected {} columns, found {}",
            file,
            line,
            columns,
            record.len()
        )));
    }
    Ok(())
}

/// Parse `countryInfo.txt`
pub fn parse_countries<R: Read>(input: R) -> Result<Vec<Country>> {
    let mut countries = Vec::new();
    for record in tsv_reader(input).records() {
        let record = record?;
        require_columns(&record, 17, "countryInfo.txt")?;
        countries.push(Country {
            iso_code: text(&record, 0).to_string(),
            iso3_code: text(&record, 1).to_string(),
            iso_numeric: number(&record, 2)?,
            fips_code: text(&record, 3).to_string(),
            name: text(&record, 4).to_string(),
            capital: text(&record, 5).to_string(),
            area_km2: number(&record, 6)?,
            population: number(&record, 7)?,
            continent_code: text(&record, 8).to_string(),
            tld: text(&record, 9).to_string(),
            currency_code: text(&record, 10).to_string(),
            currency_name: text(&record, 11).to_string(),
            phone: text(&record, 12).to_string(),
            postal_code_format: text(&record, 13).to_string(),
            postal_code_regex: text(&record, 14).to_string(),
            languages: list(&record, 15),
            geoname_id: number(&record, 16)?,
            neighbours: list(&record, 17),
            continent_name: String::new(),
        });
    }
    Ok(countries)
}

/// Parse `admin1CodesASCII.txt`
pub fn parse_subdivisions<R: Read>(input: R) -> Result<Vec<Subdivision>> {
    let mut subdivisions = Vec::new();
    for record in tsv_reader(input).records() {
        let record = record?;
        require_columns(&record, 4, "admin1CodesASCII.txt")?;
        let code = text(&record, 0);
        let (country_code, admin1_code) = code.split_once('.').unwrap_or((code, ""));
        subdivisions.push(Subdivision {
            geoname_id: number(&record, 3)?,
            code: code.to_string(),
            country_code: country_code.to_string(),
            admin1_code: admin1_code.to_string(),
            name: text(&record, 1).to_string(),
            ascii_name: text(&record, 2).to_string(),
            ..Default::default()
        });
    }
    Ok(subdivisions)
}

/// Parse the GeoNames main table
pub fn parse_cities<R: Read>(input: R) -> Result<Vec<City>> {
    let mut cities = Vec::new();
    for record in tsv_reader(input).records() {
        let record = record?;
        require_columns(&record, 19, CITIES_MEMBER)?;
        let elevation = text(&record, 15);
        cities.push(City {
            geoname_id: number(&record, 0)?,
            name: text(&record, 1).to_string(),
            ascii_name: text(&record, 2).to_string(),
            alternate_names: list(&record, 3),
            latitude: number(&record, 4)?,
            longitude: number(&record, 5)?,
            feature_class: text(&record, 6).to_string(),
            feature_code: text(&record, 7).to_string(),
            country_code: text(&record, 8).to_string(),
            admin1_code: text(&record, 10).to_string(),
            admin2_code: text(&record, 11).to_string(),
            population: number(&record, 14)?,
            elevation: if elevation.is_empty() {
                None
            } else {
                Some(number(&record, 15)?)
            },
            timezone: text(&record, 17).to_string(),
            modification_date: text(&record, 18).to_string(),
            ..Default::default()
        });
    }
    Ok(cities)
}

/// Parse the cities table out of a `cities500.zip` archive
pub fn parse_cities_zip<R: Read + Seek>(archive: R) -> Result<Vec<City>> {
    let mut zip = zip::ZipArchive::new(archive)?;
    let member = zip.by_name(CITIES_MEMBER)?;
    parse_cities(BufReader::new(member))
}

pub fn load_countries(path: &Path) -> Result<Vec<Country>> {
    parse_countries(BufReader::new(File::open(path)?))
}

pub fn load_subdivisions(path: &Path) -> Result<Vec<Subdivision>> {
    parse_subdivisions(BufReader::new(File::open(path)?))
}

pub fn load_cities(path: &Path) -> Result<Vec<City>> {
    parse_cities_zip(BufReader::new(File::open(path)?))
}
