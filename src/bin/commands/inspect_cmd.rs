use anyhow::{Context, Result};
use geos::Reader;
use serde_json::json;
use std::path::PathBuf;

use crate::cli_utils::format_unix_timestamp;

pub fn cmd_inspect(database: PathBuf, json_output: bool, verify: bool) -> Result<()> {
    let reader = Reader::open(&database)
        .with_context(|| format!("Failed to load database: {}", database.display()))?;
    let metadata = reader.metadata();

    let verified = if verify {
        Some(
            reader
                .verify()
                .with_context(|| format!("Verification failed: {}", database.display()))?,
        )
    } else {
        None
    };

    if json_output {
        let mut output = json!({
            "file": database.display().to_string(),
            "size": reader.as_bytes().len(),
            "empty": reader.is_empty(),
            "metadata": metadata,
        });
        if let Some(networks) = verified {
            output["verified_networks"] = json!(networks);
        }
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Database:    {}", database.display());
    println!("Type:        {}", metadata.database_type);
    println!(
        "Format:      v{}.{}",
        metadata.binary_format_major_version, metadata.binary_format_minor_version
    );
    println!(
        "Built:       {}",
        format_unix_timestamp(metadata.build_epoch)
    );
    println!("IP version:  {}", metadata.ip_version);
    println!("Nodes:       {}", metadata.node_count);
    println!("Record size: {} bits", metadata.record_size);
    if !metadata.languages.is_empty() {
        println!("Languages:   {}", metadata.languages.join(", "));
    }

    let mut descriptions: Vec<_> = metadata.description.iter().collect();
    descriptions.sort();
    for (language, text) in descriptions {
        println!("Description: [{}] {}", language, text);
    }

    if let Some(networks) = verified {
        println!();
        println!("Verified:    ✓ {} networks decoded", networks);
    }
    Ok(())
}
