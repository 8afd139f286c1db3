use anyhow::{Context, Result};
use geos::{DbKind, Geos, GeosConfig};
use std::sync::Arc;
use std::time::Duration;

pub fn cmd_watch(config: GeosConfig) -> Result<()> {
    let geos = Arc::new(Geos::new(config));
    geos.start().context("Failed to start service")?;

    let cancel = geos.cancel_token().clone();
    ctrlc::set_handler(move || {
        eprintln!("\n[INFO] Shutting down...");
        cancel.cancel();
    })
    .context("Failed to set Ctrl+C handler")?;

    for kind in [DbKind::City, DbKind::Isp] {
        let metadata = geos.metadata(kind);
        log::info!(
            "Serving {} database: {} (build {})",
            kind,
            metadata.database_type,
            metadata.build_epoch
        );
    }

    let cancel = geos.cancel_token().clone();
    while cancel.sleep(Duration::from_secs(60)).is_ok() {}

    geos.shutdown();
    Ok(())
}
