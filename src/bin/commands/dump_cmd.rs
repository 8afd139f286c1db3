use anyhow::{Context, Result};
use flate2::write::GzEncoder;
use flate2::Compression;
use geos::{models, DbKind, Geos, GeosConfig, MarshalCsv};
use serde::de::DeserializeOwned;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;

use crate::cli_utils::{Granularity, Kind};

fn write_rows<T, W>(geos: &Geos, granularity: Granularity, sink: W, gzip: bool) -> Result<usize>
where
    T: DeserializeOwned + MarshalCsv,
    W: Write,
{
    let kind = granularity.kind();
    let rows = if gzip {
        let mut encoder = GzEncoder::new(sink, Compression::default());
        let rows = geos.write_csv::<T, _>(kind, &mut encoder)?;
        encoder.finish()?.flush()?;
        rows
    } else {
        geos.write_csv::<T, _>(kind, sink)?
    };
    Ok(rows)
}

pub fn cmd_dump_csv(
    config: GeosConfig,
    granularity: Granularity,
    output: Option<PathBuf>,
    gzip: bool,
) -> Result<()> {
    let geos = Geos::new(config);
    geos.load();

    let sink: Box<dyn Write> = match &output {
        Some(path) => Box::new(BufWriter::new(
            File::create(path)
                .with_context(|| format!("Failed to create output file: {}", path.display()))?,
        )),
        None => Box::new(BufWriter::new(io::stdout().lock())),
    };

    let rows = match granularity {
        Granularity::Country => write_rows::<models::Country, _>(&geos, granularity, sink, gzip),
        Granularity::City => write_rows::<models::City, _>(&geos, granularity, sink, gzip),
        Granularity::CityLite => write_rows::<models::CityLite, _>(&geos, granularity, sink, gzip),
        Granularity::Isp => write_rows::<models::Isp, _>(&geos, granularity, sink, gzip),
    }
    .with_context(|| format!("Failed to dump {} database", granularity.kind()))?;

    if output.is_some() {
        eprintln!("Wrote {} rows", rows);
    }
    Ok(())
}

pub fn cmd_dump_mmdb(config: GeosConfig, kind: Kind, output: PathBuf, gzip: bool) -> Result<()> {
    let geos = Geos::new(config);
    geos.load();

    let bytes = geos
        .mmdb_dump(kind.into(), gzip)
        .with_context(|| format!("Failed to dump {} database", DbKind::from(kind)))?;
    std::fs::write(&output, &bytes)
        .with_context(|| format!("Failed to write output file: {}", output.display()))?;

    eprintln!("Wrote {} bytes to {}", bytes.len(), output.display());
    Ok(())
}
