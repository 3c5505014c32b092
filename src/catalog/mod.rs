//! Instruction catalog wiring.
//!
//! This module owns the on-disk shape of the catalog (one JSON file per
//! entry), the canonicalization and hash contracts, and the authoritative
//! in-memory store. Callers mutate through `CatalogStore` directly or, when
//! they need read-after-write confirmation, through the visibility
//! coordinator.

pub mod canon;
pub mod entry;
pub mod schema;
pub mod store;

pub use entry::{
    Audience, ENTRY_SCHEMA_VERSION, EntryDraft, InstructionEntry, Requirement,
};
pub use store::{
    AddOutcome, CatalogStore, DirReport, ListFilter, LoadSummary, MANIFEST_FILE_NAME,
    RemoveOutcome, UsageTick,
};
