//! Read-after-write visibility across process boundaries.
//!
//! Plain-file storage gives no cross-process transaction: another instance
//! scanning the same directory can race this one's writes, and this one's
//! lazily-loaded view can be stale for its own. The coordinator is the
//! correctness seam that substitutes for a transaction boundary: after every
//! mutation it confirms the entry is actually observable (map, then `get`,
//! then `list`), re-reading from disk between bounded, backed-off attempts.
//!
//! A failed confirmation never unwinds the mutation. The write already
//! landed; the caller should retry the read, not the write.

use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, warn};

use crate::catalog::store::ListFilter;
use crate::catalog::{AddOutcome, CatalogStore, EntryDraft, InstructionEntry};
use crate::clock::SharedClock;
use crate::events::{EventKind, EventLog};

/// Bounded retry schedule: `max_attempts` checks with exponential backoff
/// between them.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    /// Delay before the given (zero-based) retry attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.min(16))
    }
}

/// Confirmation state machine: attempts either converge on `Confirmed` or
/// run the schedule dry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum VerifyState {
    Attempting(u32),
    Confirmed,
    Exhausted,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisibilityReport {
    pub ok: bool,
    pub attempts: u32,
    /// True when the entry only became visible after the final forced
    /// reload (late materialization).
    pub repaired: bool,
}

#[derive(Clone, Debug)]
pub struct VerifiedAdd {
    pub outcome: AddOutcome,
    pub visibility: VisibilityReport,
}

pub struct VisibilityCoordinator {
    policy: RetryPolicy,
    clock: SharedClock,
}

impl VisibilityCoordinator {
    pub fn new(policy: RetryPolicy, clock: SharedClock) -> Self {
        Self { policy, clock }
    }

    /// `CatalogStore::add` plus confirmation. Skip outcomes are verified
    /// too: a skip only proves some writer landed the content, not that this
    /// process's view can see it yet.
    pub fn add_verified(
        &self,
        store: &mut CatalogStore,
        events: &mut EventLog,
        draft: EntryDraft,
        overwrite: bool,
        lax: bool,
    ) -> Result<VerifiedAdd> {
        let id = draft.id.clone();
        let outcome = store.add(draft, overwrite, lax)?;
        if matches!(outcome, AddOutcome::Skipped) {
            // The skip decision came from this process's possibly-stale view;
            // only the directory itself can confirm the content is really
            // there. Re-read before the first check.
            store.reload()?;
        }
        let visibility = self.verify_visibility(store, events, &id)?;

        if matches!(outcome, AddOutcome::Skipped) && !visibility.ok {
            // Anomaly pattern for offline trend analysis: the store skipped
            // because the content hash matched, yet the entry is not
            // observable from this view.
            warn!(id = %id, "skip outcome for an entry that is not visible");
            events.record(
                EventKind::SkipThenMissing,
                json!({"id": id, "attempts": visibility.attempts}),
            );
        }

        Ok(VerifiedAdd {
            outcome,
            visibility,
        })
    }

    /// Confirm that `id` is observable: in-memory map, then `get`, then
    /// `list`. Failed attempts reload from disk and back off; the last
    /// resort is one late materialization (a forced full reload).
    pub fn verify_visibility(
        &self,
        store: &mut CatalogStore,
        events: &mut EventLog,
        id: &str,
    ) -> Result<VisibilityReport> {
        let mut state = VerifyState::Attempting(0);
        let mut attempts = 0;

        while let VerifyState::Attempting(attempt) = state {
            attempts = attempt + 1;
            let visible = entry_observable(store, id)?;
            events.record(
                EventKind::VisibilityAttempt,
                json!({"id": id, "attempt": attempts, "visible": visible}),
            );
            if visible {
                state = VerifyState::Confirmed;
                break;
            }
            if attempts >= self.policy.max_attempts {
                state = VerifyState::Exhausted;
                break;
            }
            let delay = self.policy.delay(attempt);
            debug!(id, attempt = attempts, ?delay, "entry not yet visible; backing off");
            self.clock.sleep(delay);
            store.reload()?;
            state = VerifyState::Attempting(attempt + 1);
        }

        match state {
            VerifyState::Confirmed => Ok(VisibilityReport {
                ok: true,
                attempts,
                repaired: false,
            }),
            VerifyState::Exhausted => {
                // Late materialization: one forced full load, one final check.
                store.reload()?;
                attempts += 1;
                let visible = entry_observable(store, id)?;
                events.record(
                    EventKind::VisibilityAttempt,
                    json!({"id": id, "attempt": attempts, "visible": visible, "materialized": true}),
                );
                if !visible {
                    warn!(id, attempts, "visibility not confirmed after late materialization");
                }
                Ok(VisibilityReport {
                    ok: visible,
                    attempts,
                    repaired: visible,
                })
            }
            VerifyState::Attempting(_) => unreachable!("loop exits via confirmed or exhausted"),
        }
    }

    /// Lookup that masks transient staleness without masking genuine
    /// absence: a miss triggers exactly one forced reload before reporting
    /// not-found.
    pub fn get_or_materialize<'s>(
        &self,
        store: &'s mut CatalogStore,
        id: &str,
    ) -> Result<Option<&'s InstructionEntry>> {
        let present = store.get(id)?.is_some();
        if !present {
            debug!(id, "lookup miss; forcing one reload");
            store.reload()?;
        }
        store.get(id)
    }
}

/// The full visibility chain: map membership, direct lookup, list scan.
fn entry_observable(store: &mut CatalogStore, id: &str) -> Result<bool> {
    if !store.contains(id) {
        return Ok(false);
    }
    if store.get(id)?.is_none() {
        return Ok(false);
    }
    let listed = store
        .list(&ListFilter::default())?
        .iter()
        .any(|entry| entry.id == id);
    Ok(listed)
}
