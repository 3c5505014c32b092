//! One-shot catalog and manifest maintenance.
//!
//! Usage:
//!   brief-check --mode scan --dir /path/to/catalog
//!   brief-check --mode status
//!   brief-check --mode refresh
//!   brief-check --mode repair
//!
//! Prints a JSON report to stdout. `status` exits 2 when drift is non-zero
//! so cron jobs and smoke tests can alert on it without parsing.

use anyhow::Result;
use briefkeeper::{
    CatalogStore, ManifestManager, SharedClock, SystemClock, resolve_catalog_dir,
};
use clap::Parser;
use serde_json::json;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "brief-check")]
#[command(about = "Scan the catalog or check/refresh/repair its integrity manifest")]
struct Cli {
    /// What to do: scan, status, refresh, or repair.
    #[arg(long, value_parser = ["scan", "status", "refresh", "repair"])]
    mode: String,
    /// Catalog directory; falls back to BRIEF_CATALOG_DIR.
    #[arg(long)]
    dir: Option<PathBuf>,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let dir = resolve_catalog_dir(cli.dir)?;
    let clock: SharedClock = Arc::new(SystemClock);
    let mut store = CatalogStore::new(dir, clock.clone());
    let mut manifest = ManifestManager::new(&store, clock);

    let (report, code) = match cli.mode.as_str() {
        "scan" => {
            let summary = store.reload()?;
            let aggregate = store.aggregate_hash()?;
            (
                json!({
                    "summary": summary,
                    "aggregateHash": aggregate,
                    "dir": store.dir_report(),
                }),
                0,
            )
        }
        "status" => {
            let report = manifest.status(&mut store)?;
            let code = if report.drift > 0 { 2 } else { 0 };
            (serde_json::to_value(&report)?, code)
        }
        "refresh" => {
            let refreshed = manifest.refresh(&mut store)?;
            (
                json!({
                    "count": refreshed.count,
                    "generatedAt": refreshed.generated_at,
                }),
                0,
            )
        }
        "repair" => (serde_json::to_value(manifest.repair(&mut store)?)?, 0),
        other => unreachable!("clap restricts mode values, got {other}"),
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(code)
}
