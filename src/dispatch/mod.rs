//! Command dispatcher: the single entry point translating `{action, ...}`
//! requests into catalog queries and gated mutations.
//!
//! The supported actions form a closed set: `Action` is the exhaustive enum
//! and `ACTION_SPECS` is the registry row per action carrying its mutation
//! flag. `capabilities` and the gate both read the registry, so the
//! advertised surface and the enforced surface cannot drift. The registry is
//! validated once at construction; a variant missing a row surfaces as the
//! distinct "unknown handler" error code rather than "unknown action".

pub mod error;

use anyhow::{Result, bail};
use serde_json::{Value, json};
use tracing::info;

use crate::catalog::store::ListFilter;
use crate::catalog::{AddOutcome, Audience, CatalogStore, EntryDraft, Requirement, canon};
use crate::clock::SharedClock;
use crate::events::{EventKind, EventLog};
use crate::manifest::ManifestManager;
use crate::visibility::VisibilityCoordinator;

pub use error::{
    CODE_INTERNAL, CODE_INVALID_REQUEST, CODE_MUTATION_BLOCKED, CODE_UNKNOWN_ACTION,
    CODE_UNKNOWN_HANDLER, DispatchError, DispatchResult,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    Capabilities,
    Batch,
    Get,
    List,
    Search,
    Query,
    Categories,
    Dir,
    Status,
    Verify,
    Events,
    Stats,
    Add,
    Import,
    Remove,
    Reload,
    Groom,
    Repair,
    Enrich,
    Review,
}

pub const ALL_ACTIONS: &[Action] = &[
    Action::Capabilities,
    Action::Batch,
    Action::Get,
    Action::List,
    Action::Search,
    Action::Query,
    Action::Categories,
    Action::Dir,
    Action::Status,
    Action::Verify,
    Action::Events,
    Action::Stats,
    Action::Add,
    Action::Import,
    Action::Remove,
    Action::Reload,
    Action::Groom,
    Action::Repair,
    Action::Enrich,
    Action::Review,
];

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Capabilities => "capabilities",
            Action::Batch => "batch",
            Action::Get => "get",
            Action::List => "list",
            Action::Search => "search",
            Action::Query => "query",
            Action::Categories => "categories",
            Action::Dir => "dir",
            Action::Status => "status",
            Action::Verify => "verify",
            Action::Events => "events",
            Action::Stats => "stats",
            Action::Add => "add",
            Action::Import => "import",
            Action::Remove => "remove",
            Action::Reload => "reload",
            Action::Groom => "groom",
            Action::Repair => "repair",
            Action::Enrich => "enrich",
            Action::Review => "review",
        }
    }

    /// Membership in the closed command set. Deliberately independent of
    /// `ACTION_SPECS` so an unregistered handler is distinguishable from an
    /// unknown action.
    pub fn parse(name: &str) -> Option<Action> {
        ALL_ACTIONS
            .iter()
            .copied()
            .find(|action| action.as_str() == name)
    }

    /// Registry row for this action.
    pub fn spec(&self) -> Option<&'static ActionSpec> {
        ACTION_SPECS.iter().find(|spec| spec.action == *self)
    }
}

pub struct ActionSpec {
    pub action: Action,
    pub mutating: bool,
}

pub const ACTION_SPECS: &[ActionSpec] = &[
    ActionSpec { action: Action::Capabilities, mutating: false },
    ActionSpec { action: Action::Batch, mutating: false },
    ActionSpec { action: Action::Get, mutating: false },
    ActionSpec { action: Action::List, mutating: false },
    ActionSpec { action: Action::Search, mutating: false },
    ActionSpec { action: Action::Query, mutating: false },
    ActionSpec { action: Action::Categories, mutating: false },
    ActionSpec { action: Action::Dir, mutating: false },
    ActionSpec { action: Action::Status, mutating: false },
    ActionSpec { action: Action::Verify, mutating: false },
    ActionSpec { action: Action::Events, mutating: false },
    ActionSpec { action: Action::Stats, mutating: false },
    ActionSpec { action: Action::Add, mutating: true },
    ActionSpec { action: Action::Import, mutating: true },
    ActionSpec { action: Action::Remove, mutating: true },
    ActionSpec { action: Action::Reload, mutating: true },
    ActionSpec { action: Action::Groom, mutating: true },
    ActionSpec { action: Action::Repair, mutating: true },
    ActionSpec { action: Action::Enrich, mutating: true },
    ActionSpec { action: Action::Review, mutating: true },
];

/// Startup check: every action in the closed set has exactly one registry
/// row.
pub fn validate_registry() -> Result<()> {
    for action in ALL_ACTIONS {
        let rows = ACTION_SPECS
            .iter()
            .filter(|spec| spec.action == *action)
            .count();
        if rows != 1 {
            bail!(
                "action '{}' has {rows} registry rows, expected exactly one",
                action.as_str()
            );
        }
    }
    Ok(())
}

/// Advisory bootstrap gate for mutating actions. Per-call, no distributed
/// lock; a blocked mutation is a soft result so batches continue.
#[derive(Clone, Debug)]
pub enum MutationGate {
    Open,
    Blocked { reason: String },
}

impl MutationGate {
    pub fn awaiting_bootstrap() -> Self {
        MutationGate::Blocked {
            reason: "awaiting bootstrap confirmation".to_string(),
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, MutationGate::Open)
    }
}

pub struct Dispatcher {
    store: CatalogStore,
    manifest: ManifestManager,
    coordinator: VisibilityCoordinator,
    events: EventLog,
    clock: SharedClock,
    gate: MutationGate,
}

impl Dispatcher {
    pub fn new(
        store: CatalogStore,
        manifest: ManifestManager,
        coordinator: VisibilityCoordinator,
        events: EventLog,
        clock: SharedClock,
    ) -> Result<Self> {
        validate_registry()?;
        Ok(Self {
            store,
            manifest,
            coordinator,
            events,
            clock,
            gate: MutationGate::Open,
        })
    }

    pub fn set_gate(&mut self, gate: MutationGate) {
        self.gate = gate;
    }

    pub fn gate(&self) -> &MutationGate {
        &self.gate
    }

    pub fn store_mut(&mut self) -> &mut CatalogStore {
        &mut self.store
    }

    /// Route one `{action, ...}` request. Failures are structured
    /// `{code, message, data}` objects; soft conditions (not-found, gated
    /// mutation) are success values with indicative fields.
    pub fn dispatch(&mut self, request: &Value) -> DispatchResult {
        let Some(name) = request.get("action").and_then(Value::as_str) else {
            return Err(DispatchError::invalid_request(
                "request is missing an 'action' string",
            ));
        };
        let Some(action) = Action::parse(name) else {
            return Err(DispatchError::unknown_action(name));
        };
        if action == Action::Batch {
            return self.handle_batch(request);
        }
        let Some(spec) = action.spec() else {
            return Err(DispatchError::unknown_handler(name));
        };
        if spec.mutating {
            if let MutationGate::Blocked { reason } = &self.gate {
                info!(action = name, reason = %reason, "mutation blocked by gate");
                return Ok(error::mutation_blocked(reason));
            }
        }

        match action {
            Action::Capabilities => self.handle_capabilities(),
            Action::Batch => unreachable!("batch handled above"),
            Action::Get => self.handle_get(request),
            Action::List => self.handle_list(request),
            Action::Search => self.handle_search(request),
            Action::Query => self.handle_query(request),
            Action::Categories => self.handle_categories(),
            Action::Dir => Ok(serde_json::to_value(self.store.dir_report())
                .map_err(|err| DispatchError::internal(&err.into()))?),
            Action::Status => self.handle_status(),
            Action::Verify => self.handle_verify(request),
            Action::Events => self.handle_events(request),
            Action::Stats => self.handle_stats(),
            Action::Add => self.handle_add(request),
            Action::Import => self.handle_import(request),
            Action::Remove => self.handle_remove(request),
            Action::Reload => self.handle_reload(),
            Action::Groom => self.handle_groom(),
            Action::Repair => self.handle_repair(),
            Action::Enrich => self.handle_enrich(request),
            Action::Review => self.handle_review(request),
        }
    }

    fn handle_capabilities(&self) -> DispatchResult {
        let actions: Vec<Value> = ACTION_SPECS
            .iter()
            .map(|spec| {
                json!({
                    "action": spec.action.as_str(),
                    "mutating": spec.mutating,
                })
            })
            .collect();
        Ok(json!({
            "actions": actions,
            "mutationsEnabled": self.gate.is_open(),
        }))
    }

    /// Sequential sub-dispatch with per-item isolation: one failing item
    /// becomes a structured error in its slot and the rest still run.
    fn handle_batch(&mut self, request: &Value) -> DispatchResult {
        let Some(items) = request.get("items").and_then(Value::as_array) else {
            return Err(DispatchError::invalid_request(
                "batch requires an 'items' array",
            ));
        };
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            let result = if item.is_object() {
                match self.dispatch(item) {
                    Ok(value) => value,
                    Err(err) => err.to_value(),
                }
            } else {
                DispatchError::invalid_request("batch items must be objects").to_value()
            };
            results.push(result);
        }
        let count = results.len();
        Ok(json!({
            "results": results,
            "count": count,
        }))
    }

    fn handle_get(&mut self, request: &Value) -> DispatchResult {
        let id = required_str(request, "id")?;
        let present = self
            .coordinator
            .get_or_materialize(&mut self.store, id)
            .map_err(|err| DispatchError::internal(&err))?
            .is_some();
        if !present {
            return Ok(json!({ "found": false, "id": id }));
        }

        if let Some(tick) = self
            .store
            .increment_usage(id)
            .map_err(|err| DispatchError::internal(&err))?
        {
            self.events.record(
                EventKind::Usage,
                json!({
                    "id": id,
                    "usageCount": tick.usage_count,
                    "persisted": tick.persisted,
                }),
            );
        }

        let entry = self
            .store
            .get(id)
            .map_err(|err| DispatchError::internal(&err))?
            .cloned()
            .ok_or_else(|| {
                DispatchError::internal(&anyhow::anyhow!("entry '{id}' vanished mid-request"))
            })?;
        Ok(json!({
            "found": true,
            "entry": to_value(&entry)?,
        }))
    }

    fn handle_list(&mut self, request: &Value) -> DispatchResult {
        let filter = parse_filter(request)?;
        let entries = self
            .store
            .list(&filter)
            .map_err(|err| DispatchError::internal(&err))?;
        entries_value(&entries)
    }

    fn handle_search(&mut self, request: &Value) -> DispatchResult {
        let needle = required_str(request, "q")?;
        let entries = self
            .store
            .search(needle)
            .map_err(|err| DispatchError::internal(&err))?;
        entries_value(&entries)
    }

    /// Filtered list with an optional substring refinement; the superset of
    /// `list` and `search` for clients that want one shape.
    fn handle_query(&mut self, request: &Value) -> DispatchResult {
        let filter = parse_filter(request)?;
        let needle = request
            .get("q")
            .and_then(Value::as_str)
            .map(str::to_lowercase);
        let entries = self
            .store
            .list(&filter)
            .map_err(|err| DispatchError::internal(&err))?;
        let refined: Vec<_> = entries
            .into_iter()
            .filter(|entry| match &needle {
                Some(needle) => {
                    entry.id.to_lowercase().contains(needle)
                        || entry.title.to_lowercase().contains(needle)
                        || entry.body.to_lowercase().contains(needle)
                }
                None => true,
            })
            .collect();
        entries_value(&refined)
    }

    fn handle_categories(&mut self) -> DispatchResult {
        let categories = self
            .store
            .categories()
            .map_err(|err| DispatchError::internal(&err))?;
        Ok(json!({
            "count": categories.len(),
            "categories": categories,
        }))
    }

    fn handle_status(&mut self) -> DispatchResult {
        let report = self
            .manifest
            .status(&mut self.store)
            .map_err(|err| DispatchError::internal(&err))?;
        to_value(&report)
    }

    fn handle_verify(&mut self, request: &Value) -> DispatchResult {
        let id = required_str(request, "id")?;
        let report = self
            .coordinator
            .verify_visibility(&mut self.store, &mut self.events, id)
            .map_err(|err| DispatchError::internal(&err))?;
        to_value(&report)
    }

    fn handle_events(&mut self, request: &Value) -> DispatchResult {
        let limit = match request.get("limit") {
            None => 50,
            Some(value) => value.as_u64().ok_or_else(|| {
                DispatchError::invalid_request("'limit' must be a non-negative integer")
            })? as usize,
        };
        let records = self.events.recent(limit);
        Ok(json!({
            "count": records.len(),
            "events": to_value(&records)?,
        }))
    }

    fn handle_stats(&mut self) -> DispatchResult {
        to_value(&self.events.stats())
    }

    fn handle_add(&mut self, request: &Value) -> DispatchResult {
        let result = self.add_one(request)?;
        Ok(result)
    }

    fn handle_import(&mut self, request: &Value) -> DispatchResult {
        let Some(items) = request.get("entries").and_then(Value::as_array) else {
            return Err(DispatchError::invalid_request(
                "import requires an 'entries' array",
            ));
        };
        let overwrite = flag(request, "overwrite");
        let lax = flag(request, "lax");
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            let mut item = item.clone();
            // Item-level flags win over import-level defaults.
            if let Some(object) = item.as_object_mut() {
                object
                    .entry("overwrite")
                    .or_insert_with(|| Value::Bool(overwrite));
                object.entry("lax").or_insert_with(|| Value::Bool(lax));
            }
            let result = match self.add_one(&item) {
                Ok(value) => value,
                Err(err) => err.to_value(),
            };
            results.push(result);
        }
        let count = results.len();
        Ok(json!({
            "results": results,
            "count": count,
        }))
    }

    /// Shared by `add` and each `import` item.
    fn add_one(&mut self, request: &Value) -> DispatchResult {
        let draft: EntryDraft = serde_json::from_value(request.clone())
            .map_err(|err| DispatchError::invalid_request(format!("bad entry fields: {err}")))?;
        let overwrite = flag(request, "overwrite");
        let lax = flag(request, "lax");

        let validation = if lax {
            draft.validate_required()
        } else {
            draft.validate_strict()
        };
        if let Err(err) = validation {
            return Err(DispatchError::invalid_request(format!("{err:#}")));
        }

        let id = draft.id.clone();
        let source_hash = canon::source_hash(&draft.body);
        let verified = self
            .coordinator
            .add_verified(&mut self.store, &mut self.events, draft, overwrite, lax)
            .map_err(|err| DispatchError::internal(&err))?;

        self.events.record(
            EventKind::Mutation,
            json!({
                "action": "add",
                "id": id,
                "outcome": verified.outcome.as_str(),
                "verified": verified.visibility.ok,
            }),
        );

        let aggregate = self
            .store
            .aggregate_hash()
            .map_err(|err| DispatchError::internal(&err))?;
        let mut result = json!({
            "id": id,
            "sourceHash": source_hash,
            "aggregateHash": aggregate,
            "verified": verified.visibility.ok,
            "attempts": verified.visibility.attempts,
        });
        result[verified.outcome.as_str()] = Value::Bool(true);
        if let AddOutcome::Overwritten { previous_hash } = &verified.outcome {
            result["previousHash"] = Value::String(previous_hash.clone());
        }
        Ok(result)
    }

    fn handle_remove(&mut self, request: &Value) -> DispatchResult {
        // Convenience coercion: a single `id` becomes a one-element list.
        let ids: Vec<String> = if let Some(ids) = request.get("ids") {
            let Some(ids) = ids.as_array() else {
                return Err(DispatchError::invalid_request("'ids' must be an array"));
            };
            ids.iter()
                .map(|value| {
                    value
                        .as_str()
                        .map(str::to_string)
                        .ok_or_else(|| DispatchError::invalid_request("'ids' must contain strings"))
                })
                .collect::<Result<_, _>>()?
        } else if let Some(id) = request.get("id").and_then(Value::as_str) {
            vec![id.to_string()]
        } else {
            return Err(DispatchError::invalid_request(
                "remove requires 'ids' or 'id'",
            ));
        };

        let outcome = self
            .store
            .remove(&ids)
            .map_err(|err| DispatchError::internal(&err))?;
        self.events.record(
            EventKind::Mutation,
            json!({
                "action": "remove",
                "removed": outcome.removed.clone(),
                "missing": outcome.missing.clone(),
            }),
        );
        let aggregate = self
            .store
            .aggregate_hash()
            .map_err(|err| DispatchError::internal(&err))?;
        let mut value = to_value(&outcome)?;
        value["aggregateHash"] = Value::String(aggregate);
        Ok(value)
    }

    fn handle_reload(&mut self) -> DispatchResult {
        let summary = self
            .store
            .reload()
            .map_err(|err| DispatchError::internal(&err))?;
        self.events.record(
            EventKind::Load,
            json!({
                "scanned": summary.scanned,
                "accepted": summary.accepted,
                "skipped": summary.skipped,
            }),
        );
        let aggregate = self
            .store
            .aggregate_hash()
            .map_err(|err| DispatchError::internal(&err))?;
        Ok(json!({
            "summary": to_value(&summary)?,
            "aggregateHash": aggregate,
        }))
    }

    /// Housekeeping: flush debounced usage counts, then refresh the
    /// manifest so the snapshot matches what just hit disk.
    fn handle_groom(&mut self) -> DispatchResult {
        let flushed = self
            .store
            .flush_usage()
            .map_err(|err| DispatchError::internal(&err))?;
        let manifest = self
            .manifest
            .refresh(&mut self.store)
            .map_err(|err| DispatchError::internal(&err))?;
        self.events.record(
            EventKind::Manifest,
            json!({"action": "groom", "usageFlushed": flushed, "count": manifest.count}),
        );
        Ok(json!({
            "usageFlushed": flushed,
            "manifestCount": manifest.count,
        }))
    }

    fn handle_repair(&mut self) -> DispatchResult {
        let outcome = self
            .manifest
            .repair(&mut self.store)
            .map_err(|err| DispatchError::internal(&err))?;
        self.events.record(
            EventKind::Manifest,
            json!({"action": "repair", "wrote": outcome.wrote, "driftBefore": outcome.drift_before}),
        );
        to_value(&outcome)
    }

    fn handle_enrich(&mut self, request: &Value) -> DispatchResult {
        let id = required_str(request, "id")?;
        let owner = optional_str(request, "owner")?;
        let status = optional_str(request, "status")?;
        let version = optional_str(request, "version")?;
        let priority_tier = optional_str(request, "priorityTier")?;
        if owner.is_none() && status.is_none() && version.is_none() && priority_tier.is_none() {
            return Err(DispatchError::invalid_request(
                "enrich requires at least one governance field",
            ));
        }

        let Some(mut entry) = self
            .store
            .get(id)
            .map_err(|err| DispatchError::internal(&err))?
            .cloned()
        else {
            return Ok(json!({ "found": false, "id": id }));
        };
        if let Some(owner) = owner {
            entry.owner = Some(owner);
        }
        if let Some(status) = status {
            entry.status = Some(status);
        }
        if let Some(version) = version {
            entry.version = Some(version);
        }
        if let Some(priority_tier) = priority_tier {
            entry.priority_tier = Some(priority_tier);
        }
        self.store
            .put(entry)
            .map_err(|err| DispatchError::internal(&err))?;
        self.events.record(
            EventKind::Mutation,
            json!({"action": "enrich", "id": id}),
        );

        let entry = self
            .store
            .get(id)
            .map_err(|err| DispatchError::internal(&err))?
            .cloned()
            .ok_or_else(|| {
                DispatchError::internal(&anyhow::anyhow!("entry '{id}' vanished mid-request"))
            })?;
        Ok(json!({ "found": true, "entry": to_value(&entry)? }))
    }

    fn handle_review(&mut self, request: &Value) -> DispatchResult {
        let id = required_str(request, "id")?;
        let status = optional_str(request, "status")?;

        let Some(mut entry) = self
            .store
            .get(id)
            .map_err(|err| DispatchError::internal(&err))?
            .cloned()
        else {
            return Ok(json!({ "found": false, "id": id }));
        };
        entry.last_reviewed_at = Some(self.clock.now());
        if let Some(status) = status {
            entry.status = Some(status);
        }
        self.store
            .put(entry)
            .map_err(|err| DispatchError::internal(&err))?;
        self.events.record(
            EventKind::Mutation,
            json!({"action": "review", "id": id}),
        );

        let entry = self
            .store
            .get(id)
            .map_err(|err| DispatchError::internal(&err))?
            .cloned()
            .ok_or_else(|| {
                DispatchError::internal(&anyhow::anyhow!("entry '{id}' vanished mid-request"))
            })?;
        Ok(json!({ "found": true, "entry": to_value(&entry)? }))
    }
}

fn required_str<'a>(request: &'a Value, key: &str) -> Result<&'a str, DispatchError> {
    request
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| DispatchError::invalid_request(format!("'{key}' must be a string")))
}

fn optional_str(request: &Value, key: &str) -> Result<Option<String>, DispatchError> {
    match request.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(DispatchError::invalid_request(format!(
            "'{key}' must be a string"
        ))),
    }
}

fn flag(request: &Value, key: &str) -> bool {
    request.get(key).and_then(Value::as_bool).unwrap_or(false)
}

fn parse_filter(request: &Value) -> Result<ListFilter, DispatchError> {
    let mut filter = ListFilter::default();
    if let Some(audience) = request.get("audience").and_then(Value::as_str) {
        filter.audience = Some(
            Audience::try_from(audience)
                .map_err(|err| DispatchError::invalid_request(format!("{err:#}")))?,
        );
    }
    if let Some(requirement) = request.get("requirement").and_then(Value::as_str) {
        filter.requirement = Some(
            Requirement::try_from(requirement)
                .map_err(|err| DispatchError::invalid_request(format!("{err:#}")))?,
        );
    }
    if let Some(category) = request.get("category").and_then(Value::as_str) {
        filter.category = Some(category.to_string());
    }
    if let Some(max) = request.get("maxPriority") {
        let max = max
            .as_u64()
            .filter(|m| (1..=100).contains(m))
            .ok_or_else(|| {
                DispatchError::invalid_request("'maxPriority' must be an integer in 1..=100")
            })?;
        filter.max_priority = Some(max as u8);
    }
    Ok(filter)
}

fn entries_value(entries: &[&crate::catalog::InstructionEntry]) -> DispatchResult {
    let serialized: Result<Vec<Value>, DispatchError> =
        entries.iter().map(|entry| to_value(entry)).collect();
    let serialized = serialized?;
    Ok(json!({
        "count": serialized.len(),
        "entries": serialized,
    }))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, DispatchError> {
    serde_json::to_value(value).map_err(|err| DispatchError::internal(&err.into()))
}
