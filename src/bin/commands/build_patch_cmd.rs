use anyhow::{Context, Result};
use geos::{parse_patch, DbKind, Patch};
use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::time::SystemTime;

use crate::cli_utils::Kind;

pub fn cmd_build_patch(input: PathBuf, output: PathBuf, kind: Kind) -> Result<()> {
    let file = File::open(&input)
        .with_context(|| format!("Failed to open patch file: {}", input.display()))?;
    let records = parse_patch(BufReader::new(file))
        .with_context(|| format!("Failed to parse patch file: {}", input.display()))?;
    let count = records.len();

    let patch = Patch::from_records(records, DbKind::from(kind).database_type(), SystemTime::now())
        .context("Failed to build patch tree")?;
    std::fs::write(&output, patch.reader().as_bytes())
        .with_context(|| format!("Failed to write output file: {}", output.display()))?;

    eprintln!(
        "Built {} networks into {} ({} bytes)",
        count,
        output.display(),
        patch.reader().as_bytes().len()
    );
    Ok(())
}
