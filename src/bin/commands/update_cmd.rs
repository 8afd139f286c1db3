use anyhow::{Context, Result};
use geos::{CancelToken, Geos, GeosConfig, Subject};

use crate::cli_utils::print_statuses;

pub fn cmd_check_updates(config: GeosConfig, json: bool) -> Result<()> {
    let geos = Geos::new(config);
    let statuses = geos.check_updates(&CancelToken::new());
    print_statuses(&statuses, json)
}

pub fn cmd_update(config: GeosConfig, subjects: Vec<String>, force: bool, json: bool) -> Result<()> {
    let subjects = subjects
        .iter()
        .map(|s| s.parse::<Subject>())
        .collect::<geos::Result<Vec<_>>>()
        .context("Invalid subject")?;

    let geos = Geos::new(config);
    geos.load();

    let cancel = CancelToken::new();
    let handler_cancel = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("\n[INFO] Cancelling update...");
        handler_cancel.cancel();
    })
    .context("Failed to set Ctrl+C handler")?;

    let statuses = geos.update(&subjects, force, &cancel);
    print_statuses(&statuses, json)?;

    if statuses.values().any(|s| s.error.is_some()) {
        anyhow::bail!("Some updates failed");
    }
    Ok(())
}
