//! Serve the instruction catalog over stdin/stdout.
//!
//! One JSON request per line in (`{id, method, params}`), one JSON response
//! per line out (`{id, result}` or `{id, error}`). The single method
//! `instructions` nests the dispatcher's `{action, ...}` protocol; framing
//! problems are reported as protocol-level errors and never kill the loop.
//! Logging goes to stderr so stdout stays clean for responses.

use anyhow::{Context, Result};
use briefkeeper::dispatch::error::CODE_INVALID_REQUEST;
use briefkeeper::ring::AppendLog;
use briefkeeper::{
    CatalogStore, Dispatcher, EventLog, ManifestManager, MutationGate, RetryPolicy, SharedClock,
    SystemClock, VisibilityCoordinator, resolve_catalog_dir,
};
use clap::Parser;
use serde_json::{Value, json};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Outer method name wrapping the action protocol.
const METHOD: &str = "instructions";

/// Event history file, kept inside the catalog directory; the leading dot
/// keeps it out of entry scans.
const EVENTS_FILE: &str = ".events.ndjson";

const EVENT_CAPACITY: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "brief-serve")]
#[command(about = "Serve the instruction catalog over newline-delimited JSON on stdio")]
struct Cli {
    /// Catalog directory; falls back to BRIEF_CATALOG_DIR.
    #[arg(long)]
    dir: Option<PathBuf>,
    /// Do not persist the integrity manifest to disk.
    #[arg(long)]
    no_manifest: bool,
    /// Keep diagnostic events in memory only (no append log).
    #[arg(long)]
    memory_events: bool,
    /// Keep mutations gated; queries work, mutating actions report
    /// mutation_blocked until the operator restarts without this flag.
    #[arg(long)]
    hold_mutations: bool,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let dir = resolve_catalog_dir(cli.dir)?;
    let clock: SharedClock = Arc::new(SystemClock);

    let mut store = CatalogStore::new(dir.clone(), clock.clone());
    let summary = store.reload()?;
    info!(
        dir = %dir.display(),
        accepted = summary.accepted,
        skipped = summary.skipped,
        "catalog loaded"
    );

    let manifest = ManifestManager::new(&store, clock.clone()).with_persistence(!cli.no_manifest);
    let events = if cli.memory_events {
        EventLog::in_memory(EVENT_CAPACITY, clock.clone())?
    } else {
        EventLog::with_sink(
            EVENT_CAPACITY,
            AppendLog::new(dir.join(EVENTS_FILE)),
            clock.clone(),
        )?
    };
    let coordinator = VisibilityCoordinator::new(RetryPolicy::default(), clock.clone());
    let mut dispatcher = Dispatcher::new(store, manifest, coordinator, events, clock)?;
    if cli.hold_mutations {
        dispatcher.set_gate(MutationGate::awaiting_bootstrap());
    }

    serve(&mut dispatcher, io::stdin().lock(), io::stdout().lock())
}

fn serve(
    dispatcher: &mut Dispatcher,
    reader: impl BufRead,
    mut writer: impl Write,
) -> Result<()> {
    for line in reader.lines() {
        let line = line.context("reading request line")?;
        if line.trim().is_empty() {
            continue;
        }
        let response = respond(dispatcher, &line);
        serde_json::to_writer(&mut writer, &response).context("writing response")?;
        writeln!(&mut writer).context("writing response delimiter")?;
        writer.flush().context("flushing response")?;
    }
    Ok(())
}

fn respond(dispatcher: &mut Dispatcher, line: &str) -> Value {
    let request: Value = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(err) => {
            return json!({
                "id": Value::Null,
                "error": {
                    "code": CODE_INVALID_REQUEST,
                    "message": format!("unparsable request: {err}"),
                },
            });
        }
    };
    let id = request.get("id").cloned().unwrap_or(Value::Null);

    match request.get("method").and_then(Value::as_str) {
        Some(METHOD) => {}
        Some(other) => {
            return json!({
                "id": id,
                "error": {
                    "code": CODE_INVALID_REQUEST,
                    "message": format!("unknown method '{other}'"),
                },
            });
        }
        None => {
            return json!({
                "id": id,
                "error": {
                    "code": CODE_INVALID_REQUEST,
                    "message": "request is missing a 'method' string",
                },
            });
        }
    }

    let params = request.get("params").cloned().unwrap_or(Value::Null);
    match dispatcher.dispatch(&params) {
        Ok(result) => json!({ "id": id, "result": result }),
        Err(err) => json!({ "id": id, "error": err.to_value() }),
    }
}
