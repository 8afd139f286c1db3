mod cli_utils;
mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

use cli_utils::{ConfigOverrides, Entity, Granularity, Kind};
use commands::{
    cmd_build_patch, cmd_check_updates, cmd_dump_csv, cmd_dump_mmdb, cmd_geonames, cmd_inspect,
    cmd_lookup, cmd_update, cmd_watch,
};

#[derive(Parser)]
#[command(name = "geos")]
#[command(
    about = "Geolocation service: IP lookups over patched MMDB files and a GeoNames catalog",
    long_about = "geos - IP geolocation and ISP lookups backed by MaxMind DB files\n\n\
    Serves City and ISP databases with locally applied JSON patches, keeps them\n\
    current from remote locations, and indexes the GeoNames dumps.\n\n\
    Examples:\n\
      geos lookup 81.2.69.160\n\
      geos lookup 1.1.1.1 --granularity isp\n\
      geos geonames cities --country FR --prefix par --limit 5\n\
      geos dump-csv city-lite -o city.csv.gz --gzip\n\
      geos --config geos.json update city isp\n\
      geos inspect data/city.mmdb --verify"
)]
#[command(version)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(flatten)]
    overrides: ConfigOverrides,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Look up an IP address
    Lookup {
        /// IPv4 or IPv6 address
        #[arg(value_name = "IP")]
        ip: IpAddr,

        /// Record shape to return
        #[arg(short, long, value_enum, default_value_t = Granularity::City)]
        granularity: Granularity,

        /// No output, exit code only (0 = found, 1 = not found)
        #[arg(short, long)]
        quiet: bool,
    },

    /// Write every network of a database as CSV
    DumpCsv {
        /// Record shape of the rows
        #[arg(value_enum)]
        granularity: Granularity,

        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Gzip-compress the output
        #[arg(long)]
        gzip: bool,
    },

    /// Write the patched database as a single MMDB file
    DumpMmdb {
        /// Database kind
        #[arg(value_enum)]
        kind: Kind,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,

        /// Gzip-compress the output
        #[arg(long)]
        gzip: bool,
    },

    /// List GeoNames entities
    Geonames {
        /// Entity collection to list
        #[arg(value_enum)]
        entity: Entity,

        /// GeoNames IDs (comma-separated); overrides every other filter
        #[arg(long, value_delimiter = ',')]
        id: Vec<u32>,

        /// ISO country codes (comma-separated)
        #[arg(long, value_delimiter = ',')]
        country: Vec<String>,

        /// Case-insensitive name prefix
        #[arg(long, default_value = "")]
        prefix: String,

        /// Maximum number of results (0 = unlimited)
        #[arg(long, default_value = "0")]
        limit: usize,
    },

    /// Check every source for a newer remote version
    CheckUpdates {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Download newer versions of the given subjects
    Update {
        /// Subjects: city, isp, geonames, city-patches, isp-patches (all when omitted)
        #[arg(value_name = "SUBJECT")]
        subjects: Vec<String>,

        /// Download even when the local copy looks current
        #[arg(short, long)]
        force: bool,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Compile a JSON patch file into an MMDB patch tree
    BuildPatch {
        /// JSON patch file (object of network -> record)
        #[arg(value_name = "INPUT")]
        input: PathBuf,

        /// Output MMDB file
        #[arg(short, long)]
        output: PathBuf,

        /// Database kind the patch applies to
        #[arg(short, long, value_enum, default_value_t = Kind::City)]
        kind: Kind,
    },

    /// Show metadata of an MMDB file
    Inspect {
        /// MMDB file
        #[arg(value_name = "DATABASE")]
        database: PathBuf,

        /// Output as JSON
        #[arg(short, long)]
        json: bool,

        /// Walk and decode every record
        #[arg(long)]
        verify: bool,
    },

    /// Run the service with background recovery and auto-update until Ctrl+C
    Watch,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = cli_utils::load_config(cli.config.as_deref(), cli.overrides)?;

    match cli.command {
        Commands::Lookup {
            ip,
            granularity,
            quiet,
        } => cmd_lookup(config, ip, granularity, quiet),
        Commands::DumpCsv {
            granularity,
            output,
            gzip,
        } => cmd_dump_csv(config, granularity, output, gzip),
        Commands::DumpMmdb { kind, output, gzip } => cmd_dump_mmdb(config, kind, output, gzip),
        Commands::Geonames {
            entity,
            id,
            country,
            prefix,
            limit,
        } => cmd_geonames(config, entity, id, country, prefix, limit),
        Commands::CheckUpdates { json } => cmd_check_updates(config, json),
        Commands::Update {
            subjects,
            force,
            json,
        } => cmd_update(config, subjects, force, json),
        Commands::BuildPatch {
            input,
            output,
            kind,
        } => cmd_build_patch(input, output, kind),
        Commands::Inspect {
            database,
            json,
            verify,
        } => cmd_inspect(database, json, verify),
        Commands::Watch => cmd_watch(config),
    }
}
