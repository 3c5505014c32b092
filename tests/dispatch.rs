// Dispatcher contract: action routing, structured error codes, batching
// isolation, and mutation gating.

#[path = "support/common.rs"]
mod common;

use anyhow::Result;
use briefkeeper::dispatch::{
    CODE_INVALID_REQUEST, CODE_MUTATION_BLOCKED, CODE_UNKNOWN_ACTION,
};
use briefkeeper::MutationGate;
use common::{dispatcher_at, manual_clock, temp_catalog, write_foreign_entry};
use serde_json::json;

#[test]
fn capabilities_lists_every_action_with_its_mutation_flag() -> Result<()> {
    let dir = temp_catalog()?;
    let mut dispatcher = dispatcher_at(dir.path(), manual_clock())?;

    let result = dispatcher.dispatch(&json!({"action": "capabilities"})).expect("ok");
    let actions = result["actions"].as_array().expect("array");
    assert!(actions.iter().any(|a| a["action"] == "add" && a["mutating"] == true));
    assert!(actions.iter().any(|a| a["action"] == "list" && a["mutating"] == false));
    assert_eq!(result["mutationsEnabled"], true);
    Ok(())
}

#[test]
fn add_get_overwrite_remove_through_the_dispatcher() -> Result<()> {
    let dir = temp_catalog()?;
    let mut dispatcher = dispatcher_at(dir.path(), manual_clock())?;

    let created = dispatcher
        .dispatch(&json!({
            "action": "add", "id": "x", "title": "X", "body": "A",
        }))
        .expect("ok");
    assert_eq!(created["created"], true);
    assert_eq!(created["verified"], true);

    let skipped = dispatcher
        .dispatch(&json!({
            "action": "add", "id": "x", "title": "X", "body": "A",
        }))
        .expect("ok");
    assert_eq!(skipped["skipped"], true);
    assert_eq!(
        skipped["aggregateHash"], created["aggregateHash"],
        "idempotent add leaves the catalog hash alone"
    );

    let fetched = dispatcher.dispatch(&json!({"action": "get", "id": "x"})).expect("ok");
    assert_eq!(fetched["found"], true);
    assert_eq!(fetched["entry"]["body"], "A");

    let overwritten = dispatcher
        .dispatch(&json!({
            "action": "add", "id": "x", "title": "X", "body": "B", "overwrite": true,
        }))
        .expect("ok");
    assert_eq!(overwritten["overwritten"], true);
    assert_ne!(overwritten["sourceHash"], created["sourceHash"]);

    let removed = dispatcher
        .dispatch(&json!({"action": "remove", "id": "x"}))
        .expect("ok");
    assert_eq!(removed["removed"][0], "x");

    let listed = dispatcher.dispatch(&json!({"action": "list"})).expect("ok");
    assert_eq!(listed["count"], 0);
    Ok(())
}

#[test]
fn batch_isolates_failures_and_preserves_order() -> Result<()> {
    let dir = temp_catalog()?;
    let mut dispatcher = dispatcher_at(dir.path(), manual_clock())?;

    let result = dispatcher
        .dispatch(&json!({
            "action": "batch",
            "items": [
                {"action": "add", "id": "a", "title": "A", "body": "first"},
                {"action": "bogus"},
                {"action": "get", "id": "a"},
            ],
        }))
        .expect("batch itself succeeds");

    let results = result["results"].as_array().expect("array");
    assert_eq!(results.len(), 3);
    assert_eq!(results[0]["created"], true);
    assert_eq!(results[1]["code"], CODE_UNKNOWN_ACTION);
    assert_eq!(results[1]["data"]["action"], "bogus");
    assert_eq!(results[2]["found"], true);
    Ok(())
}

#[test]
fn gated_mutations_report_softly_and_batches_continue() -> Result<()> {
    let dir = temp_catalog()?;
    let mut dispatcher = dispatcher_at(dir.path(), manual_clock())?;
    dispatcher.set_gate(MutationGate::awaiting_bootstrap());

    let blocked = dispatcher
        .dispatch(&json!({"action": "add", "id": "a", "title": "A", "body": "text"}))
        .expect("soft result, not an error");
    assert_eq!(blocked["error"], "mutation_blocked");
    assert_eq!(blocked["code"], CODE_MUTATION_BLOCKED);
    assert!(blocked["reason"].as_str().expect("reason").contains("bootstrap"));

    let result = dispatcher
        .dispatch(&json!({
            "action": "batch",
            "items": [
                {"action": "add", "id": "a", "title": "A", "body": "text"},
                {"action": "capabilities"},
            ],
        }))
        .expect("ok");
    let results = result["results"].as_array().expect("array");
    assert_eq!(results[0]["error"], "mutation_blocked");
    assert_eq!(results[1]["mutationsEnabled"], false);

    // Queries pass the gate.
    assert!(dispatcher.dispatch(&json!({"action": "list"})).is_ok());
    Ok(())
}

#[test]
fn error_codes_distinguish_failure_shapes() -> Result<()> {
    let dir = temp_catalog()?;
    let mut dispatcher = dispatcher_at(dir.path(), manual_clock())?;

    let missing = dispatcher.dispatch(&json!({})).expect_err("no action");
    assert_eq!(missing.code, CODE_INVALID_REQUEST);

    let unknown = dispatcher
        .dispatch(&json!({"action": "definitely-not-real"}))
        .expect_err("unknown action");
    assert_eq!(unknown.code, CODE_UNKNOWN_ACTION);

    let bad_params = dispatcher
        .dispatch(&json!({"action": "get"}))
        .expect_err("missing id");
    assert_eq!(bad_params.code, CODE_INVALID_REQUEST);

    let bad_entry = dispatcher
        .dispatch(&json!({"action": "add", "id": "bad id!", "title": "t", "body": "b"}))
        .expect_err("invalid id");
    assert_eq!(bad_entry.code, CODE_INVALID_REQUEST);
    Ok(())
}

#[test]
fn get_masks_staleness_with_one_late_lookup() -> Result<()> {
    let dir = temp_catalog()?;
    let mut dispatcher = dispatcher_at(dir.path(), manual_clock())?;
    dispatcher.dispatch(&json!({"action": "list"})).expect("prime the view");

    write_foreign_entry(dir.path(), "late-arrival", "from another process")?;

    let fetched = dispatcher
        .dispatch(&json!({"action": "get", "id": "late-arrival"}))
        .expect("ok");
    assert_eq!(fetched["found"], true);

    let absent = dispatcher
        .dispatch(&json!({"action": "get", "id": "never-written"}))
        .expect("soft not-found");
    assert_eq!(absent["found"], false);
    Ok(())
}

#[test]
fn import_reports_per_item_outcomes() -> Result<()> {
    let dir = temp_catalog()?;
    let mut dispatcher = dispatcher_at(dir.path(), manual_clock())?;

    let result = dispatcher
        .dispatch(&json!({
            "action": "import",
            "entries": [
                {"id": "one", "title": "One", "body": "first"},
                {"id": "bad id!", "title": "Nope", "body": "second"},
                {"id": "two", "title": "Two", "body": "third"},
            ],
        }))
        .expect("ok");
    let results = result["results"].as_array().expect("array");
    assert_eq!(results[0]["created"], true);
    assert_eq!(results[1]["code"], CODE_INVALID_REQUEST);
    assert_eq!(results[2]["created"], true);

    let listed = dispatcher.dispatch(&json!({"action": "list"})).expect("ok");
    assert_eq!(listed["count"], 2);
    Ok(())
}

#[test]
fn governance_updates_flow_through_enrich_and_review() -> Result<()> {
    let dir = temp_catalog()?;
    let mut dispatcher = dispatcher_at(dir.path(), manual_clock())?;
    dispatcher
        .dispatch(&json!({"action": "add", "id": "gov", "title": "Gov", "body": "ruled"}))
        .expect("ok");

    let enriched = dispatcher
        .dispatch(&json!({"action": "enrich", "id": "gov", "owner": "platform-team", "priorityTier": "tier-1"}))
        .expect("ok");
    assert_eq!(enriched["entry"]["owner"], "platform-team");
    assert_eq!(enriched["entry"]["priorityTier"], "tier-1");

    let reviewed = dispatcher
        .dispatch(&json!({"action": "review", "id": "gov", "status": "active"}))
        .expect("ok");
    assert_eq!(reviewed["entry"]["status"], "active");
    assert!(reviewed["entry"]["lastReviewedAt"].is_string());

    let ghost = dispatcher
        .dispatch(&json!({"action": "enrich", "id": "ghost", "owner": "nobody"}))
        .expect("soft not-found");
    assert_eq!(ghost["found"], false);
    Ok(())
}

#[test]
fn maintenance_actions_cover_status_groom_repair() -> Result<()> {
    let dir = temp_catalog()?;
    let mut dispatcher = dispatcher_at(dir.path(), manual_clock())?;
    dispatcher
        .dispatch(&json!({"action": "add", "id": "m", "title": "M", "body": "content"}))
        .expect("ok");

    let status = dispatcher.dispatch(&json!({"action": "status"})).expect("ok");
    assert_eq!(status["drift"], 1, "nothing refreshed yet");

    let groomed = dispatcher.dispatch(&json!({"action": "groom"})).expect("ok");
    assert_eq!(groomed["manifestCount"], 1);

    let status = dispatcher.dispatch(&json!({"action": "status"})).expect("ok");
    assert_eq!(status["drift"], 0);

    let repaired = dispatcher.dispatch(&json!({"action": "repair"})).expect("ok");
    assert_eq!(repaired["wrote"], false, "no drift, no write");

    let events = dispatcher.dispatch(&json!({"action": "events"})).expect("ok");
    assert!(events["count"].as_u64().expect("count") > 0);

    let stats = dispatcher.dispatch(&json!({"action": "stats"})).expect("ok");
    assert!(stats["totalAdded"].as_u64().expect("added") > 0);

    let dir_report = dispatcher.dispatch(&json!({"action": "dir"})).expect("ok");
    assert_eq!(dir_report["exists"], true);
    assert_eq!(dir_report["writable"], true);
    Ok(())
}
