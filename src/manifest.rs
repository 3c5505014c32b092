//! Integrity manifest: a derived, disk-persisted projection of the catalog
//! used for cheap drift detection.
//!
//! The manifest records `(id, sourceHash, bodyHash)` per entry so a status
//! check can classify discrepancies without rescanning bodies. It is always
//! regenerated from the live store, never hand-edited; an unparsable
//! manifest is treated as absent for `status` and simply overwritten by
//! `repair`.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tempfile::NamedTempFile;
use tracing::{info, warn};

use crate::catalog::canon;
use crate::catalog::store::MANIFEST_FILE_NAME;
use crate::catalog::CatalogStore;
use crate::clock::SharedClock;

pub const MANIFEST_VERSION: &str = "catalog_manifest_v1";

/// Cap on the discrepancy detail list; the drift count is always exact.
pub const DEFAULT_DETAIL_CAP: usize = 25;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub id: String,
    pub source_hash: String,
    pub body_hash: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: String,
    pub generated_at: DateTime<Utc>,
    pub count: usize,
    pub entries: Vec<ManifestEntry>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DriftKind {
    /// Live entry missing from the manifest.
    Added,
    /// Manifest entry missing from the live catalog.
    Removed,
    /// Present on both sides with different hashes.
    HashMismatch,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Discrepancy {
    pub id: String,
    pub kind: DriftKind,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftReport {
    pub drift: usize,
    pub detail: Vec<Discrepancy>,
    pub manifest_present: bool,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairOutcome {
    pub wrote: bool,
    pub drift_before: usize,
}

pub struct ManifestManager {
    path: PathBuf,
    persist: bool,
    detail_cap: usize,
    clock: SharedClock,
    /// Last generated manifest; the comparison baseline when persistence is
    /// disabled.
    cached: Option<Manifest>,
}

impl ManifestManager {
    pub fn new(store: &CatalogStore, clock: SharedClock) -> Self {
        Self {
            path: store.dir().join(MANIFEST_FILE_NAME),
            persist: true,
            detail_cap: DEFAULT_DETAIL_CAP,
            clock,
            cached: None,
        }
    }

    /// Disable on-disk persistence: status/refresh still compute, against an
    /// in-memory baseline, but never touch the manifest file.
    pub fn with_persistence(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn with_detail_cap(mut self, cap: usize) -> Self {
        self.detail_cap = cap;
        self
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Non-mutating drift check of the manifest against the live catalog.
    pub fn status(&self, store: &mut CatalogStore) -> Result<DriftReport> {
        let (baseline, present) = self.baseline();
        let mut discrepancies: Vec<Discrepancy> = Vec::new();

        let live = snapshot_entries(store)?;
        let base = baseline.as_ref().map(|m| m.entries.as_slice()).unwrap_or(&[]);

        // Both sides are sorted by id; merge-walk them with two cursors.
        let (mut i, mut j) = (0, 0);
        while i < live.len() && j < base.len() {
            let (l, b) = (&live[i], &base[j]);
            match l.id.cmp(&b.id) {
                std::cmp::Ordering::Equal => {
                    if l.source_hash != b.source_hash || l.body_hash != b.body_hash {
                        discrepancies.push(Discrepancy {
                            id: l.id.clone(),
                            kind: DriftKind::HashMismatch,
                        });
                    }
                    i += 1;
                    j += 1;
                }
                std::cmp::Ordering::Less => {
                    discrepancies.push(Discrepancy {
                        id: l.id.clone(),
                        kind: DriftKind::Added,
                    });
                    i += 1;
                }
                std::cmp::Ordering::Greater => {
                    discrepancies.push(Discrepancy {
                        id: b.id.clone(),
                        kind: DriftKind::Removed,
                    });
                    j += 1;
                }
            }
        }
        for l in &live[i..] {
            discrepancies.push(Discrepancy {
                id: l.id.clone(),
                kind: DriftKind::Added,
            });
        }
        for b in &base[j..] {
            discrepancies.push(Discrepancy {
                id: b.id.clone(),
                kind: DriftKind::Removed,
            });
        }

        let drift = discrepancies.len();
        discrepancies.truncate(self.detail_cap);
        Ok(DriftReport {
            drift,
            detail: discrepancies,
            manifest_present: present,
        })
    }

    /// Unconditionally regenerate the manifest from the live catalog.
    pub fn refresh(&mut self, store: &mut CatalogStore) -> Result<Manifest> {
        let manifest = Manifest {
            version: MANIFEST_VERSION.to_string(),
            generated_at: self.clock.now(),
            count: store.len()?,
            entries: snapshot_entries(store)?,
        };
        if self.persist {
            self.write(&manifest)?;
        }
        self.cached = Some(manifest.clone());
        Ok(manifest)
    }

    /// Rewrite only when drift is non-zero, to avoid needless disk churn.
    pub fn repair(&mut self, store: &mut CatalogStore) -> Result<RepairOutcome> {
        let drift_before = self.status(store)?.drift;
        if drift_before == 0 {
            return Ok(RepairOutcome {
                wrote: false,
                drift_before,
            });
        }
        self.refresh(store)?;
        info!(drift_before, "manifest repaired");
        Ok(RepairOutcome {
            wrote: self.persist,
            drift_before,
        })
    }

    /// The comparison baseline: the on-disk manifest when persisting, the
    /// cached one otherwise. Corruption reads as absence.
    fn baseline(&self) -> (Option<Manifest>, bool) {
        if !self.persist {
            return (self.cached.clone(), self.cached.is_some());
        }
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return (None, false),
        };
        match serde_json::from_str::<Manifest>(&raw) {
            Ok(mut manifest) if manifest.version == MANIFEST_VERSION => {
                // The walk in `status` needs id order; do not trust a file
                // another writer may have produced unsorted.
                manifest.entries.sort_by(|a, b| a.id.cmp(&b.id));
                (Some(manifest), true)
            }
            Ok(manifest) => {
                warn!(
                    version = %manifest.version,
                    "manifest version not recognized; treating as absent"
                );
                (None, false)
            }
            Err(err) => {
                warn!("manifest unparsable; treating as absent: {err}");
                (None, false)
            }
        }
    }

    fn write(&self, manifest: &Manifest) -> Result<()> {
        let dir = self
            .path
            .parent()
            .context("manifest path has no parent directory")?;
        fs::create_dir_all(dir)
            .with_context(|| format!("creating catalog directory {}", dir.display()))?;
        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("creating temp manifest in {}", dir.display()))?;
        serde_json::to_writer_pretty(&mut tmp, manifest).context("serializing manifest")?;
        tmp.persist(&self.path)
            .with_context(|| format!("persisting manifest {}", self.path.display()))?;
        Ok(())
    }
}

fn snapshot_entries(store: &mut CatalogStore) -> Result<Vec<ManifestEntry>> {
    // BTreeMap iteration gives id order, which the walk in `status` relies on.
    Ok(store
        .entries()?
        .map(|entry| ManifestEntry {
            id: entry.id.clone(),
            source_hash: entry.source_hash.clone(),
            body_hash: canon::body_hash(&entry.body),
        })
        .collect())
}
