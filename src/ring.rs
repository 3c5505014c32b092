//! Bounded ring buffer with pluggable overflow handling and durable
//! persistence.
//!
//! The ring is deliberately unsynchronized: the owning call site is
//! single-threaded and serializes access. Two persistence shapes are
//! supported. A snapshot serializes the whole buffer plus stats behind a
//! checksum and lands via temp-file-then-rename; an append log writes one
//! `{t, i, v}` line per accepted record and replays only a capacity-bounded
//! tail on load. Snapshots pay write amplification for a trivial read path;
//! the append log pays unbounded file growth for a trivial write path.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::warn;

use crate::catalog::canon::sha256_hex;

/// Version marker for ring snapshot files.
pub const RING_SNAPSHOT_VERSION: &str = "ring_snapshot_v1";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowStrategy {
    /// Evict the oldest record and accept the new one.
    DropOldest,
    /// Reject the incoming record.
    DropNewest,
    /// Double the capacity and keep everything.
    Resize,
    /// Reject the incoming record; callers treat this as an overflow signal.
    Error,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RingConfig {
    pub capacity: usize,
    pub overflow: OverflowStrategy,
}

impl RingConfig {
    pub fn drop_oldest(capacity: usize) -> Self {
        Self {
            capacity,
            overflow: OverflowStrategy::DropOldest,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RingRecord<T> {
    pub seq: u64,
    pub at: DateTime<Utc>,
    pub payload: T,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RingStats {
    pub count: usize,
    pub total_added: u64,
    pub total_dropped: u64,
    pub resize_count: u64,
    pub utilization: f64,
}

/// Append-mode record: `{t, i, v}`, one per line.
#[derive(Serialize, Deserialize)]
struct AppendRecord<T> {
    t: DateTime<Utc>,
    i: u64,
    v: T,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot<T> {
    version: String,
    config: RingConfig,
    entries: Vec<RingRecord<T>>,
    stats: RingStats,
    created_at: DateTime<Utc>,
    last_saved: Option<DateTime<Utc>>,
    checksum: String,
}

#[derive(Debug)]
pub struct BufferRing<T> {
    capacity: usize,
    overflow: OverflowStrategy,
    entries: VecDeque<RingRecord<T>>,
    next_seq: u64,
    total_added: u64,
    total_dropped: u64,
    resize_count: u64,
    created_at: DateTime<Utc>,
    last_saved: Option<DateTime<Utc>>,
}

impl<T> BufferRing<T> {
    pub fn new(config: RingConfig, created_at: DateTime<Utc>) -> Result<Self> {
        if config.capacity == 0 {
            bail!("ring capacity must be non-zero");
        }
        Ok(Self {
            capacity: config.capacity,
            overflow: config.overflow,
            entries: VecDeque::with_capacity(config.capacity),
            next_seq: 0,
            total_added: 0,
            total_dropped: 0,
            resize_count: 0,
            created_at,
            last_saved: None,
        })
    }

    /// Rebuild a ring from replayed records (append-mode load). Records in
    /// excess of capacity are dropped oldest-first and counted.
    pub fn from_records(
        config: RingConfig,
        records: Vec<RingRecord<T>>,
        created_at: DateTime<Utc>,
    ) -> Result<Self> {
        let mut ring = Self::new(config, created_at)?;
        ring.total_added = records.len() as u64;
        ring.next_seq = records.iter().map(|r| r.seq + 1).max().unwrap_or(0);
        let mut entries: VecDeque<RingRecord<T>> = records.into();
        while entries.len() > ring.capacity {
            entries.pop_front();
            ring.total_dropped += 1;
        }
        ring.entries = entries;
        Ok(ring)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Accept one record. Returns false when the overflow strategy rejects
    /// it (`DropNewest` and `Error`).
    pub fn add(&mut self, payload: T, at: DateTime<Utc>) -> bool {
        if self.entries.len() >= self.capacity {
            match self.overflow {
                OverflowStrategy::DropOldest => {
                    self.entries.pop_front();
                    self.total_dropped += 1;
                }
                OverflowStrategy::Resize => {
                    self.capacity *= 2;
                    self.resize_count += 1;
                }
                OverflowStrategy::DropNewest | OverflowStrategy::Error => {
                    self.total_dropped += 1;
                    return false;
                }
            }
        }
        let record = RingRecord {
            seq: self.next_seq,
            at,
            payload,
        };
        self.next_seq += 1;
        self.total_added += 1;
        self.entries.push_back(record);
        true
    }

    pub fn get_all(&self) -> Vec<&RingRecord<T>> {
        self.entries.iter().collect()
    }

    pub fn get_last(&self, n: usize) -> Vec<&RingRecord<T>> {
        let skip = self.entries.len().saturating_sub(n);
        self.entries.iter().skip(skip).collect()
    }

    pub fn get_first(&self, n: usize) -> Vec<&RingRecord<T>> {
        self.entries.iter().take(n).collect()
    }

    pub fn get_range(&self, offset: usize, len: usize) -> Vec<&RingRecord<T>> {
        self.entries.iter().skip(offset).take(len).collect()
    }

    pub fn filter(&self, pred: impl Fn(&RingRecord<T>) -> bool) -> Vec<&RingRecord<T>> {
        self.entries.iter().filter(|r| pred(r)).collect()
    }

    pub fn find(&self, pred: impl Fn(&RingRecord<T>) -> bool) -> Option<&RingRecord<T>> {
        self.entries.iter().find(|r| pred(r))
    }

    pub fn last(&self) -> Option<&RingRecord<T>> {
        self.entries.back()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Change capacity in place; shrinking evicts oldest-first.
    pub fn resize(&mut self, capacity: usize) -> Result<()> {
        if capacity == 0 {
            bail!("ring capacity must be non-zero");
        }
        while self.entries.len() > capacity {
            self.entries.pop_front();
            self.total_dropped += 1;
        }
        self.capacity = capacity;
        self.resize_count += 1;
        Ok(())
    }

    pub fn stats(&self) -> RingStats {
        RingStats {
            count: self.entries.len(),
            total_added: self.total_added,
            total_dropped: self.total_dropped,
            resize_count: self.resize_count,
            utilization: self.entries.len() as f64 / self.capacity as f64,
        }
    }

    fn config(&self) -> RingConfig {
        RingConfig {
            capacity: self.capacity,
            overflow: self.overflow,
        }
    }
}

impl<T: Serialize + DeserializeOwned + Clone> BufferRing<T> {
    /// Serialize the whole buffer behind a checksum and land it atomically.
    pub fn save_to_disk(&mut self, path: &Path, saved_at: DateTime<Utc>) -> Result<()> {
        self.last_saved = Some(saved_at);
        let snapshot = Snapshot {
            version: RING_SNAPSHOT_VERSION.to_string(),
            config: self.config(),
            entries: self.entries.iter().cloned().collect(),
            stats: self.stats(),
            created_at: self.created_at,
            last_saved: self.last_saved,
            checksum: String::new(),
        };
        let mut value = serde_json::to_value(&snapshot).context("serializing ring snapshot")?;
        let checksum = snapshot_checksum(&value)?;
        value["checksum"] = Value::String(checksum);

        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)
            .with_context(|| format!("creating snapshot directory {}", dir.display()))?;
        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("creating temp snapshot in {}", dir.display()))?;
        serde_json::to_writer_pretty(&mut tmp, &value).context("writing ring snapshot")?;
        tmp.persist(path)
            .with_context(|| format!("persisting ring snapshot {}", path.display()))?;
        Ok(())
    }

    /// Load a snapshot. A checksum mismatch is a load failure; the caller
    /// decides the fallback (commonly: start empty).
    pub fn load_from_disk(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading ring snapshot {}", path.display()))?;
        let mut value: Value = serde_json::from_str(&raw)
            .with_context(|| format!("parsing ring snapshot {}", path.display()))?;
        if !value.is_object() {
            bail!("ring snapshot {} is not a JSON object", path.display());
        }

        let stored = value
            .get("checksum")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_default();
        value["checksum"] = Value::String(String::new());
        let expected = snapshot_checksum(&value)?;
        if stored != expected {
            bail!(
                "ring snapshot {} checksum mismatch (stored {stored}, computed {expected})",
                path.display()
            );
        }

        let snapshot: Snapshot<T> =
            serde_json::from_value(value).context("decoding ring snapshot")?;
        if snapshot.version != RING_SNAPSHOT_VERSION {
            bail!(
                "unsupported ring snapshot version '{}', expected {RING_SNAPSHOT_VERSION}",
                snapshot.version
            );
        }

        let mut ring = Self::new(snapshot.config, snapshot.created_at)?;
        ring.total_added = snapshot.stats.total_added;
        ring.total_dropped = snapshot.stats.total_dropped;
        ring.resize_count = snapshot.stats.resize_count;
        ring.last_saved = snapshot.last_saved;
        ring.next_seq = snapshot.entries.iter().map(|r| r.seq + 1).max().unwrap_or(0);
        let mut entries: VecDeque<RingRecord<T>> = snapshot.entries.into();
        while entries.len() > ring.capacity {
            entries.pop_front();
            ring.total_dropped += 1;
        }
        ring.entries = entries;
        Ok(ring)
    }
}

/// Checksum over the canonical (sorted-key) serialization with the
/// `checksum` field blanked. serde_json's default map keeps keys sorted, so
/// serializing the `Value` is already canonical.
fn snapshot_checksum(value: &Value) -> Result<String> {
    let mut scrubbed = value.clone();
    if let Some(object) = scrubbed.as_object_mut() {
        object.insert("checksum".to_string(), Value::String(String::new()));
    }
    let canonical = serde_json::to_string(&scrubbed).context("canonicalizing ring snapshot")?;
    Ok(sha256_hex(canonical.as_bytes()))
}

/// Append-only sibling of the snapshot: one record per line, tail-replayed.
#[derive(Clone, Debug)]
pub struct AppendLog {
    path: PathBuf,
}

impl AppendLog {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append<T: Serialize + Clone>(&self, record: &RingRecord<T>) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating event log directory {}", dir.display()))?;
        }
        let line = serde_json::to_string(&AppendRecord {
            t: record.at,
            i: record.seq,
            v: record.payload.clone(),
        })
        .context("serializing append record")?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening event log {}", self.path.display()))?;
        writeln!(file, "{line}")
            .with_context(|| format!("appending to event log {}", self.path.display()))?;
        Ok(())
    }

    /// Replay at most `capacity` records from the end of the log. Malformed
    /// lines are skipped with a warning; a missing file replays empty.
    pub fn replay_tail<T: DeserializeOwned>(&self, capacity: usize) -> Result<Vec<RingRecord<T>>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("reading event log {}", self.path.display()));
            }
        };

        let mut records = Vec::new();
        let mut skipped = 0usize;
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<AppendRecord<T>>(line) {
                Ok(record) => records.push(RingRecord {
                    seq: record.i,
                    at: record.t,
                    payload: record.v,
                }),
                Err(_) => skipped += 1,
            }
        }
        if skipped > 0 {
            warn!(
                path = %self.path.display(),
                skipped,
                "skipped malformed event log lines during replay"
            );
        }
        let drop = records.len().saturating_sub(capacity);
        Ok(records.split_off(drop))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn ring(capacity: usize, overflow: OverflowStrategy) -> BufferRing<u32> {
        BufferRing::new(
            RingConfig {
                capacity,
                overflow,
            },
            Utc::now(),
        )
        .expect("ring builds")
    }

    fn fill(ring: &mut BufferRing<u32>, values: impl IntoIterator<Item = u32>) -> Vec<bool> {
        let now = Utc::now();
        values.into_iter().map(|v| ring.add(v, now)).collect()
    }

    #[test]
    fn drop_oldest_keeps_most_recent_capacity() {
        let mut ring = ring(3, OverflowStrategy::DropOldest);
        fill(&mut ring, 0..7);

        let payloads: Vec<u32> = ring.get_all().iter().map(|r| r.payload).collect();
        assert_eq!(payloads, vec![4, 5, 6]);
        let stats = ring.stats();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.total_added, 7);
        assert_eq!(stats.total_dropped, 4);
    }

    #[test]
    fn drop_newest_rejects_and_counts() {
        let mut ring = ring(2, OverflowStrategy::DropNewest);
        let accepted = fill(&mut ring, 0..4);
        assert_eq!(accepted, vec![true, true, false, false]);
        let payloads: Vec<u32> = ring.get_all().iter().map(|r| r.payload).collect();
        assert_eq!(payloads, vec![0, 1]);
        assert_eq!(ring.stats().total_dropped, 2);
        assert_eq!(ring.stats().total_added, 2);
    }

    #[test]
    fn resize_strategy_doubles_and_keeps_everything() {
        let mut ring = ring(2, OverflowStrategy::Resize);
        fill(&mut ring, 0..5);
        assert_eq!(ring.capacity(), 8);
        assert_eq!(ring.len(), 5);
        assert_eq!(ring.stats().resize_count, 2);
        assert_eq!(ring.stats().total_dropped, 0);
    }

    #[test]
    fn explicit_shrink_evicts_oldest() {
        let mut ring = ring(5, OverflowStrategy::DropOldest);
        fill(&mut ring, 0..5);
        ring.resize(2).expect("shrink");
        let payloads: Vec<u32> = ring.get_all().iter().map(|r| r.payload).collect();
        assert_eq!(payloads, vec![3, 4]);
        assert!(ring.resize(0).is_err());
    }

    #[test]
    fn accessors_slice_in_insertion_order() {
        let mut ring = ring(10, OverflowStrategy::DropOldest);
        fill(&mut ring, 0..6);
        let first: Vec<u32> = ring.get_first(2).iter().map(|r| r.payload).collect();
        let last: Vec<u32> = ring.get_last(2).iter().map(|r| r.payload).collect();
        let mid: Vec<u32> = ring.get_range(2, 2).iter().map(|r| r.payload).collect();
        assert_eq!(first, vec![0, 1]);
        assert_eq!(last, vec![4, 5]);
        assert_eq!(mid, vec![2, 3]);
        assert_eq!(ring.filter(|r| r.payload % 2 == 0).len(), 3);
        assert_eq!(ring.find(|r| r.payload == 3).map(|r| r.seq), Some(3));
    }

    #[test]
    fn snapshot_round_trips_entries_and_stats() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("ring.snapshot.json");
        let mut ring = ring(3, OverflowStrategy::DropOldest);
        fill(&mut ring, 0..5);
        ring.save_to_disk(&path, Utc::now())?;

        let loaded: BufferRing<u32> = BufferRing::load_from_disk(&path)?;
        let payloads: Vec<u32> = loaded.get_all().iter().map(|r| r.payload).collect();
        assert_eq!(payloads, vec![2, 3, 4]);
        assert_eq!(loaded.stats().total_added, 5);
        assert_eq!(loaded.stats().total_dropped, 2);
        Ok(())
    }

    #[test]
    fn tampered_snapshot_fails_checksum() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("ring.snapshot.json");
        let mut ring = ring(3, OverflowStrategy::DropOldest);
        fill(&mut ring, 0..3);
        ring.save_to_disk(&path, Utc::now())?;

        let tampered = fs::read_to_string(&path)?.replace("\"payload\": 1", "\"payload\": 9");
        fs::write(&path, tampered)?;
        let result: Result<BufferRing<u32>> = BufferRing::load_from_disk(&path);
        assert!(result.is_err());
        assert!(format!("{:#}", result.unwrap_err()).contains("checksum mismatch"));
        Ok(())
    }

    #[test]
    fn append_log_replays_only_the_tail() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let log = AppendLog::new(dir.path().join("events.ndjson"));
        let now = Utc::now();
        for seq in 0..10u64 {
            log.append(&RingRecord {
                seq,
                at: now,
                payload: seq,
            })?;
        }

        let tail: Vec<RingRecord<u64>> = log.replay_tail(4)?;
        let seqs: Vec<u64> = tail.iter().map(|r| r.seq).collect();
        assert_eq!(seqs, vec![6, 7, 8, 9]);

        let ring = BufferRing::from_records(RingConfig::drop_oldest(4), tail, now)?;
        assert_eq!(ring.len(), 4);
        assert_eq!(ring.stats().total_added, 4);
        Ok(())
    }

    #[test]
    fn append_log_skips_malformed_lines() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("events.ndjson");
        let log = AppendLog::new(path.clone());
        let now = Utc::now();
        log.append(&RingRecord {
            seq: 0,
            at: now,
            payload: 7u32,
        })?;
        let mut raw = fs::read_to_string(&path)?;
        raw.push_str("not json\n");
        fs::write(&path, raw)?;
        log.append(&RingRecord {
            seq: 1,
            at: now,
            payload: 8u32,
        })?;

        let tail: Vec<RingRecord<u32>> = log.replay_tail(10)?;
        let payloads: Vec<u32> = tail.iter().map(|r| r.payload).collect();
        assert_eq!(payloads, vec![7, 8]);
        Ok(())
    }

    #[test]
    fn missing_append_log_replays_empty() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let log = AppendLog::new(dir.path().join("absent.ndjson"));
        let tail: Vec<RingRecord<u32>> = log.replay_tail(5)?;
        assert!(tail.is_empty());
        Ok(())
    }
}
