#![allow(dead_code)]

// Shared fixtures: temp catalog directories, sample drafts, and a way to
// write entry files behind a store's back (simulating a second process).

use anyhow::Result;
use briefkeeper::events::DEFAULT_EVENT_CAPACITY;
use briefkeeper::{
    CatalogStore, Dispatcher, EntryDraft, EventLog, ManifestManager, ManualClock, RetryPolicy,
    SharedClock, VisibilityCoordinator,
};
use chrono::Utc;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

pub fn manual_clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::starting_at(Utc::now()))
}

pub fn sample_draft(id: &str, body: &str) -> EntryDraft {
    let mut draft = EntryDraft::new(id, body);
    draft.title = format!("Title for {id}");
    draft
}

pub fn store_at(dir: &Path, clock: SharedClock) -> CatalogStore {
    CatalogStore::new(dir.to_path_buf(), clock)
}

pub fn dispatcher_at(dir: &Path, clock: SharedClock) -> Result<Dispatcher> {
    let store = store_at(dir, clock.clone());
    let manifest = ManifestManager::new(&store, clock.clone());
    let coordinator = VisibilityCoordinator::new(RetryPolicy::default(), clock.clone());
    let events = EventLog::in_memory(DEFAULT_EVENT_CAPACITY, clock.clone())?;
    Dispatcher::new(store, manifest, coordinator, events, clock)
}

/// Write a complete entry file directly, the way another process's store
/// would, without going through this test's store.
pub fn write_foreign_entry(dir: &Path, id: &str, body: &str) -> Result<()> {
    let clock = manual_clock();
    let mut other = store_at(dir, clock);
    other.add(sample_draft(id, body), false, false)?;
    Ok(())
}

pub fn temp_catalog() -> Result<TempDir> {
    Ok(TempDir::new()?)
}

pub fn read_json(path: &Path) -> Result<serde_json::Value> {
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}
