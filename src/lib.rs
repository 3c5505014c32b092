//! briefkeeper: a shared, file-backed instruction catalog.
//!
//! Multiple independent client processes read and write one catalog
//! directory through a request/response protocol. The library is the
//! consistency core behind that protocol: file-per-entry storage with
//! atomic writes, read-after-write visibility confirmation, a lightweight
//! integrity manifest, a gated command dispatcher, and a bounded ring
//! buffer for durable diagnostic history. The transport shell
//! (`brief-serve`) only frames newline-delimited JSON around the
//! dispatcher.

pub mod catalog;
pub mod clock;
pub mod dispatch;
pub mod events;
pub mod manifest;
pub mod ring;
pub mod visibility;

pub use catalog::{
    AddOutcome, Audience, CatalogStore, EntryDraft, InstructionEntry, ListFilter, LoadSummary,
    Requirement,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use dispatch::{Action, DispatchError, Dispatcher, MutationGate};
pub use events::{DiagnosticEvent, EventKind, EventLog};
pub use manifest::{Manifest, ManifestManager};
pub use ring::{AppendLog, BufferRing, OverflowStrategy, RingConfig};
pub use visibility::{RetryPolicy, VisibilityCoordinator, VisibilityReport};

use anyhow::{Result, bail};
use std::env;
use std::path::PathBuf;

/// Environment variable naming the catalog directory.
pub const ENV_CATALOG_DIR: &str = "BRIEF_CATALOG_DIR";

/// Resolve the catalog directory: an explicit flag wins, then the
/// environment. There is no implicit default; two processes silently
/// agreeing on different directories is worse than an error.
pub fn resolve_catalog_dir(flag: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(dir) = flag {
        return Ok(dir);
    }
    if let Ok(dir) = env::var(ENV_CATALOG_DIR) {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    bail!(
        "No catalog directory configured. Pass --dir or set {ENV_CATALOG_DIR} to the shared catalog directory."
    );
}
