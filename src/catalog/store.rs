//! File-backed instruction store.
//!
//! One JSON file per entry in a single directory; this store is the
//! authoritative id-to-entry map for the process. Scans are forgiving
//! (malformed or vanishing files are counted and skipped, never fatal)
//! because other processes may be writing the same directory mid-scan.
//! Writes are strict: every durable write goes through a temp file in the
//! catalog directory followed by an atomic rename, so a concurrent reader
//! never observes a torn entry.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::catalog::canon;
use crate::catalog::entry::{Audience, EntryDraft, InstructionEntry, Requirement};
use crate::catalog::schema;
use crate::clock::SharedClock;

/// Manifest file name; excluded from entry scans.
pub const MANIFEST_FILE_NAME: &str = "catalog.manifest.json";

const DEFAULT_USAGE_DEBOUNCE: Duration = Duration::from_secs(60);

/// Outcome of a directory scan.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadSummary {
    pub scanned: usize,
    pub accepted: usize,
    pub skipped: usize,
    /// Skip counts keyed by cause (`unreadable`, `invalid_json`,
    /// `invalid_entry`, `duplicate_id`).
    pub reasons: BTreeMap<String, usize>,
}

impl LoadSummary {
    fn skip(&mut self, reason: &str) {
        self.skipped += 1;
        *self.reasons.entry(reason.to_string()).or_insert(0) += 1;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddOutcome {
    Created,
    Overwritten { previous_hash: String },
    /// Id exists with the same source hash and overwrite was not requested;
    /// no disk write happened.
    Skipped,
}

impl AddOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddOutcome::Created => "created",
            AddOutcome::Overwritten { .. } => "overwritten",
            AddOutcome::Skipped => "skipped",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveOutcome {
    pub removed: Vec<String>,
    pub missing: Vec<String>,
}

#[derive(Clone, Debug, Default)]
pub struct ListFilter {
    pub audience: Option<Audience>,
    pub requirement: Option<Requirement>,
    pub category: Option<String>,
    /// Numeric cap: keep entries with `priority <= max_priority`.
    pub max_priority: Option<u8>,
}

impl ListFilter {
    fn matches(&self, entry: &InstructionEntry) -> bool {
        if let Some(audience) = self.audience {
            if entry.audience != audience {
                return false;
            }
        }
        if let Some(requirement) = self.requirement {
            if entry.requirement != requirement {
                return false;
            }
        }
        if let Some(category) = &self.category {
            if !entry.categories.contains(category) {
                return false;
            }
        }
        if let Some(max) = self.max_priority {
            if entry.priority > max {
                return false;
            }
        }
        true
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirReport {
    pub path: String,
    pub exists: bool,
    pub writable: bool,
    pub entry_files: usize,
}

/// Reported back from `increment_usage` so callers can record the event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsageTick {
    pub usage_count: u64,
    pub persisted: bool,
}

pub struct CatalogStore {
    dir: PathBuf,
    clock: SharedClock,
    entries: BTreeMap<String, InstructionEntry>,
    aggregate_hash: String,
    summary: LoadSummary,
    loaded: bool,
    usage_debounce: Duration,
    usage_flushed_at: BTreeMap<String, DateTime<Utc>>,
    usage_dirty: BTreeSet<String>,
}

impl CatalogStore {
    pub fn new(dir: PathBuf, clock: SharedClock) -> Self {
        Self {
            dir,
            clock,
            entries: BTreeMap::new(),
            aggregate_hash: canon::aggregate_hash(std::iter::empty()),
            summary: LoadSummary::default(),
            loaded: false,
            usage_debounce: DEFAULT_USAGE_DEBOUNCE,
            usage_flushed_at: BTreeMap::new(),
            usage_dirty: BTreeSet::new(),
        }
    }

    pub fn with_usage_debounce(mut self, debounce: Duration) -> Self {
        self.usage_debounce = debounce;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn entry_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    /// Lazy load: scan on first touch, then serve from memory until an
    /// explicit `reload`.
    pub fn ensure_loaded(&mut self) -> Result<()> {
        if !self.loaded {
            self.reload()?;
        }
        Ok(())
    }

    /// Full rescan of the catalog directory. A missing directory loads as an
    /// empty catalog; per-file problems are skips with a recorded cause.
    pub fn reload(&mut self) -> Result<LoadSummary> {
        let mut summary = LoadSummary::default();
        let mut entries: BTreeMap<String, InstructionEntry> = BTreeMap::new();

        let read_dir = match fs::read_dir(&self.dir) {
            Ok(read_dir) => Some(read_dir),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("scanning catalog directory {}", self.dir.display()));
            }
        };

        if let Some(read_dir) = read_dir {
            for dir_entry in read_dir {
                let Ok(dir_entry) = dir_entry else {
                    summary.skip("unreadable");
                    continue;
                };
                let path = dir_entry.path();
                let name = dir_entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') || name == MANIFEST_FILE_NAME {
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                summary.scanned += 1;

                // The file may vanish between the listing and the read when
                // another process removes it; that is a skip, not a failure.
                let raw = match fs::read_to_string(&path) {
                    Ok(raw) => raw,
                    Err(_) => {
                        summary.skip("unreadable");
                        continue;
                    }
                };
                let mut parsed: InstructionEntry = match serde_json::from_str(&raw) {
                    Ok(parsed) => parsed,
                    Err(err) => {
                        debug!(file = %path.display(), "entry file failed to parse: {err}");
                        summary.skip("invalid_json");
                        continue;
                    }
                };
                if crate::catalog::entry::validate_id(&parsed.id).is_err()
                    || canon::canonicalize(&parsed.body).is_empty()
                {
                    summary.skip("invalid_entry");
                    continue;
                }

                let expected = canon::source_hash(&parsed.body);
                if parsed.source_hash != expected {
                    warn!(
                        id = %parsed.id,
                        "entry sourceHash did not match its body; repaired in memory"
                    );
                    parsed.source_hash = expected;
                }

                if entries.insert(parsed.id.clone(), parsed).is_some() {
                    warn!(file = %path.display(), "duplicate entry id; last file wins");
                    summary.skip("duplicate_id");
                }
            }
        }

        summary.accepted = entries.len();
        self.entries = entries;
        self.recompute_aggregate();
        self.summary = summary.clone();
        self.loaded = true;
        Ok(summary)
    }

    pub fn load_summary(&self) -> &LoadSummary {
        &self.summary
    }

    pub fn aggregate_hash(&mut self) -> Result<String> {
        self.ensure_loaded()?;
        Ok(self.aggregate_hash.clone())
    }

    /// In-memory membership probe; the first link of the visibility chain.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn get(&mut self, id: &str) -> Result<Option<&InstructionEntry>> {
        self.ensure_loaded()?;
        Ok(self.entries.get(id))
    }

    /// Entries matching the filter, most important first (priority, then id).
    pub fn list(&mut self, filter: &ListFilter) -> Result<Vec<&InstructionEntry>> {
        self.ensure_loaded()?;
        let mut matched: Vec<&InstructionEntry> =
            self.entries.values().filter(|e| filter.matches(e)).collect();
        matched.sort_by(|a, b| (a.priority, &a.id).cmp(&(b.priority, &b.id)));
        Ok(matched)
    }

    /// Case-insensitive substring match over id, title, and body. No
    /// ranking; callers that need ordering get the list order.
    pub fn search(&mut self, needle: &str) -> Result<Vec<&InstructionEntry>> {
        self.ensure_loaded()?;
        let needle = needle.to_lowercase();
        let mut matched: Vec<&InstructionEntry> = self
            .entries
            .values()
            .filter(|e| {
                e.id.to_lowercase().contains(&needle)
                    || e.title.to_lowercase().contains(&needle)
                    || e.body.to_lowercase().contains(&needle)
            })
            .collect();
        matched.sort_by(|a, b| (a.priority, &a.id).cmp(&(b.priority, &b.id)));
        Ok(matched)
    }

    pub fn categories(&mut self) -> Result<BTreeMap<String, usize>> {
        self.ensure_loaded()?;
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for entry in self.entries.values() {
            for category in &entry.categories {
                *counts.entry(category.clone()).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }

    /// Add or replace an entry.
    ///
    /// When the id already exists with an identical source hash and
    /// `overwrite` is false, the call is a skip and touches no disk. In every
    /// other case the entry is written atomically and the in-memory map and
    /// aggregate hash are updated without a rescan. `lax` drops the strict
    /// field rules and the schema check but never the id/body requirement.
    pub fn add(&mut self, draft: EntryDraft, overwrite: bool, lax: bool) -> Result<AddOutcome> {
        self.ensure_loaded()?;
        if lax {
            draft.validate_required()?;
        } else {
            draft.validate_strict()?;
        }

        let new_hash = canon::source_hash(&draft.body);
        let existing = self.entries.get(&draft.id).cloned();
        if let Some(existing) = &existing {
            if !overwrite && existing.source_hash == new_hash {
                return Ok(AddOutcome::Skipped);
            }
        }

        let now = self.clock.now();
        let created_at = existing.as_ref().map(|e| e.created_at).unwrap_or(now);
        let mut entry = draft.into_entry(created_at, now);
        if let Some(previous) = &existing {
            // Usage history and review state belong to the id, not the body
            // revision; governance fields omitted from the draft carry over.
            entry.usage_count = previous.usage_count;
            entry.last_used_at = previous.last_used_at;
            entry.last_reviewed_at = previous.last_reviewed_at;
            entry.owner = entry.owner.or_else(|| previous.owner.clone());
            entry.status = entry.status.or_else(|| previous.status.clone());
            entry.version = entry.version.or_else(|| previous.version.clone());
            entry.priority_tier = entry
                .priority_tier
                .or_else(|| previous.priority_tier.clone());
        }

        if !lax {
            let value = serde_json::to_value(&entry).context("serializing entry")?;
            schema::validate_entry_value(&value)?;
        }

        self.write_entry(&entry)?;
        let id = entry.id.clone();
        self.entries.insert(id, entry);
        self.recompute_aggregate();

        Ok(match existing {
            Some(previous) => AddOutcome::Overwritten {
                previous_hash: previous.source_hash,
            },
            None => AddOutcome::Created,
        })
    }

    /// Replace a stored entry wholesale (governance updates). The caller is
    /// responsible for having mutated a copy obtained from `get`.
    pub fn put(&mut self, mut entry: InstructionEntry) -> Result<()> {
        entry.updated_at = self.clock.now();
        self.write_entry(&entry)?;
        self.entries.insert(entry.id.clone(), entry);
        self.recompute_aggregate();
        Ok(())
    }

    /// Remove entries by id. Unknown ids are reported, not errors.
    pub fn remove(&mut self, ids: &[String]) -> Result<RemoveOutcome> {
        self.ensure_loaded()?;
        let mut outcome = RemoveOutcome::default();
        for id in ids {
            if self.entries.remove(id).is_none() {
                outcome.missing.push(id.clone());
                continue;
            }
            let path = self.entry_path(id);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("removing entry file {}", path.display()));
                }
            }
            self.usage_flushed_at.remove(id);
            self.usage_dirty.remove(id);
            outcome.removed.push(id.clone());
        }
        if !outcome.removed.is_empty() {
            self.recompute_aggregate();
        }
        Ok(outcome)
    }

    /// Best-effort usage counter. The in-memory count always moves; the disk
    /// write is debounced per entry to avoid write amplification under hot
    /// lookups.
    pub fn increment_usage(&mut self, id: &str) -> Result<Option<UsageTick>> {
        self.ensure_loaded()?;
        let now = self.clock.now();
        let Some(entry) = self.entries.get_mut(id) else {
            return Ok(None);
        };
        entry.usage_count += 1;
        entry.last_used_at = Some(now);
        let usage_count = entry.usage_count;

        let due = match self.usage_flushed_at.get(id) {
            Some(last) => {
                let elapsed = (now - *last).to_std().unwrap_or(Duration::ZERO);
                elapsed >= self.usage_debounce
            }
            None => true,
        };

        if due {
            let entry = entry.clone();
            self.write_entry(&entry)?;
            self.usage_flushed_at.insert(id.to_string(), now);
            self.usage_dirty.remove(id);
            Ok(Some(UsageTick {
                usage_count,
                persisted: true,
            }))
        } else {
            self.usage_dirty.insert(id.to_string());
            Ok(Some(UsageTick {
                usage_count,
                persisted: false,
            }))
        }
    }

    /// Force pending debounced usage counts to disk.
    pub fn flush_usage(&mut self) -> Result<usize> {
        let dirty: Vec<String> = self.usage_dirty.iter().cloned().collect();
        let now = self.clock.now();
        let mut flushed = 0;
        for id in dirty {
            if let Some(entry) = self.entries.get(&id).cloned() {
                self.write_entry(&entry)?;
                self.usage_flushed_at.insert(id.clone(), now);
                flushed += 1;
            }
            self.usage_dirty.remove(&id);
        }
        Ok(flushed)
    }

    pub fn dir_report(&self) -> DirReport {
        let exists = self.dir.is_dir();
        let writable = exists && NamedTempFile::new_in(&self.dir).is_ok();
        let entry_files = if exists {
            fs::read_dir(&self.dir)
                .map(|read_dir| {
                    read_dir
                        .filter_map(|e| e.ok())
                        .filter(|e| {
                            let name = e.file_name().to_string_lossy().to_string();
                            !name.starts_with('.')
                                && name != MANIFEST_FILE_NAME
                                && name.ends_with(".json")
                        })
                        .count()
                })
                .unwrap_or(0)
        } else {
            0
        };
        DirReport {
            path: self.dir.display().to_string(),
            exists,
            writable,
            entry_files,
        }
    }

    /// Iterate the live entries (id order).
    pub fn entries(&mut self) -> Result<impl Iterator<Item = &InstructionEntry>> {
        self.ensure_loaded()?;
        Ok(self.entries.values())
    }

    pub fn len(&mut self) -> Result<usize> {
        self.ensure_loaded()?;
        Ok(self.entries.len())
    }

    pub fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn recompute_aggregate(&mut self) {
        self.aggregate_hash = canon::aggregate_hash(
            self.entries
                .iter()
                .map(|(id, entry)| (id.as_str(), entry.source_hash.as_str())),
        );
    }

    fn write_entry(&self, entry: &InstructionEntry) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("creating catalog directory {}", self.dir.display()))?;
        let mut tmp = NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("creating temp entry file in {}", self.dir.display()))?;
        serde_json::to_writer_pretty(&mut tmp, entry)
            .with_context(|| format!("serializing entry {}", entry.id))?;
        tmp.persist(self.entry_path(&entry.id))
            .with_context(|| format!("persisting entry {}", entry.id))?;
        Ok(())
    }
}
