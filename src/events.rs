//! Diagnostic event stream.
//!
//! One writer, two projections: every recorded event lands in an in-memory
//! ring (for the `events` query) and, when configured, in an append-mode disk
//! sink (for offline trend analysis). Routing both through `EventLog::record`
//! keeps the projections from diverging.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::clock::SharedClock;
use crate::ring::{AppendLog, BufferRing, RingConfig, RingRecord, RingStats};

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// One visibility verification attempt (pass or fail).
    VisibilityAttempt,
    /// A skip outcome immediately followed by a failed lookup; tracked as an
    /// anomaly pattern for offline analysis.
    SkipThenMissing,
    Usage,
    Load,
    Mutation,
    Manifest,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::VisibilityAttempt => "visibility_attempt",
            EventKind::SkipThenMissing => "skip_then_missing",
            EventKind::Usage => "usage",
            EventKind::Load => "load",
            EventKind::Mutation => "mutation",
            EventKind::Manifest => "manifest",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEvent {
    pub kind: EventKind,
    pub detail: Value,
}

pub struct EventLog {
    ring: BufferRing<DiagnosticEvent>,
    sink: Option<AppendLog>,
    clock: SharedClock,
}

impl EventLog {
    /// Memory-only log; events are lost on exit.
    pub fn in_memory(capacity: usize, clock: SharedClock) -> Result<Self> {
        let ring = BufferRing::new(RingConfig::drop_oldest(capacity), clock.now())?;
        Ok(Self {
            ring,
            sink: None,
            clock,
        })
    }

    /// Durable log: the ring is seeded from the sink's tail so restarts keep
    /// recent history visible.
    pub fn with_sink(capacity: usize, sink: AppendLog, clock: SharedClock) -> Result<Self> {
        let replayed = sink.replay_tail::<DiagnosticEvent>(capacity)?;
        let ring = BufferRing::from_records(RingConfig::drop_oldest(capacity), replayed, clock.now())?;
        Ok(Self {
            ring,
            sink: Some(sink),
            clock,
        })
    }

    /// Record one event into both projections. Sink failures are logged and
    /// swallowed; diagnostics must never fail the operation they describe.
    pub fn record(&mut self, kind: EventKind, detail: Value) {
        let accepted = self.ring.add(DiagnosticEvent { kind, detail }, self.clock.now());
        if !accepted {
            return;
        }
        if let (Some(sink), Some(record)) = (&self.sink, self.ring.last()) {
            if let Err(err) = sink.append(record) {
                warn!(kind = kind.as_str(), "failed to append diagnostic event: {err:#}");
            }
        }
    }

    pub fn recent(&self, n: usize) -> Vec<RingRecord<DiagnosticEvent>> {
        self.ring.get_last(n).into_iter().cloned().collect()
    }

    pub fn stats(&self) -> RingStats {
        self.ring.stats()
    }
}
