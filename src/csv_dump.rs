//! CSV dumps of IP databases
//!
//! Streams every network of a database as one CSV row: the CIDR string in a
//! leading `network` column, then the record's own columns.

use crate::database::{Database, NetworksOptions};
use crate::error::Result;
use crate::models::MarshalCsv;
use csv::Writer;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use std::io::Write;

/// Write `db` as CSV to `sink`, decoding each record as `T`
///
/// Returns the number of data rows written. The sink is flushed before
/// returning.
pub fn write_csv<T, W>(db: &dyn Database, sink: W) -> Result<usize>
where
    T: DeserializeOwned + MarshalCsv,
    W: Write,
{
    let mut writer = Writer::from_writer(sink);

    let mut header = Vec::with_capacity(T::csv_columns().len() + 1);
    header.push("network");
    header.extend_from_slice(T::csv_columns());
    writer.write_record(&header)?;

    let mut rows = 0;
    for record in db.networks(NetworksOptions::skip_aliased())? {
        let record = record?;
        let value: T = record.decode()?;

        let mut row = Vec::with_capacity(header.len());
        row.push(record.network().to_string());
        row.extend(value.csv_row());
        writer.write_record(&row)?;
        rows += 1;
    }

    writer.flush()?;
    log::debug!("Wrote {} CSV row(s)", rows);
    Ok(rows)
}

/// Dump `db` as CSV into memory, gzip-compressed when `gzip` is set
pub fn dump_csv<T>(db: &dyn Database, gzip: bool) -> Result<Vec<u8>>
where
    T: DeserializeOwned + MarshalCsv,
{
    if gzip {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        write_csv::<T, _>(db, &mut encoder)?;
        Ok(encoder.finish()?)
    } else {
        let mut buffer = Vec::new();
        write_csv::<T, _>(db, &mut buffer)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_section::DataValue;
    use crate::ip_tree_builder::InsertMode;
    use crate::mmdb::IpVersion;
    use crate::mmdb_builder::MmdbBuilder;
    use crate::models::{City, Isp};
    use crate::reader::Reader;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn isp_db() -> Reader {
        let mut builder = MmdbBuilder::new("GEOS-ISP", IpVersion::V6);
        for (cidr, asn, name) in [
            ("8.8.8.0/24", 15169, "Google"),
            ("2001:4860::/32", 15169, "Google"),
            ("1.1.1.0/24", 13335, "Cloudflare, Inc."),
        ] {
            let value = DataValue::from_json(&serde_json::json!({
                "autonomous_system_number": asn,
                "isp": name,
            }))
            .unwrap();
            builder
                .insert(cidr.parse().unwrap(), value, InsertMode::Replace)
                .unwrap();
        }
        builder.build_reader().unwrap()
    }

    #[test]
    fn test_header_and_rows() {
        let db = isp_db();
        let mut out = Vec::new();
        let rows = write_csv::<Isp, _>(&db, &mut out).unwrap();
        assert_eq!(rows, 3);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(
            lines[0],
            "network,autonomous_system_number,autonomous_system_organization,isp,organization,mobile_country_code,mobile_network_code"
        );
        assert_eq!(lines[1], "1.1.1.0/24,13335,,\"Cloudflare, Inc.\",,,");
        assert_eq!(lines[2], "8.8.8.0/24,15169,,Google,,,");
        assert!(lines[3].starts_with("2001:4860::/32,"));
    }

    #[test]
    fn test_gzip_roundtrip() {
        let db = isp_db();
        let plain = dump_csv::<Isp>(&db, false).unwrap();
        let compressed = dump_csv::<Isp>(&db, true).unwrap();

        let mut inflated = Vec::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_end(&mut inflated)
            .unwrap();
        assert_eq!(inflated, plain);
    }

    #[test]
    fn test_empty_database_has_header_only() {
        let db = MmdbBuilder::new("GEOS-City", IpVersion::V6)
            .build_reader()
            .unwrap();
        let out = dump_csv::<City>(&db, false).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 1);
        assert!(text.starts_with("network,continent_code,"));
    }

    #[test]
    fn test_decode_error_surfaces() {
        // String records cannot decode as Isp maps
        let mut builder = MmdbBuilder::new("GEOS-ISP", IpVersion::V4);
        builder
            .insert(
                "10.0.0.0/8".parse().unwrap(),
                DataValue::String("not a map".to_string()),
                InsertMode::Replace,
            )
            .unwrap();
        let db = builder.build_reader().unwrap();
        assert!(write_csv::<Isp, _>(&db, Vec::new()).is_err());
    }
}
