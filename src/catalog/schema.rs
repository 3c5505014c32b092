//! Compiled JSON Schema for strict entry validation.
//!
//! The schema ships inside the binary so strict validation needs no files
//! beyond the catalog itself. Compilation happens once; the compiled schema
//! borrows the document for its lifetime, so the document is leaked into a
//! `'static` allocation the way a bundled schema can afford to be.

use anyhow::{Context, Result, bail};
use jsonschema::JSONSchema;
use serde_json::Value;
use std::sync::OnceLock;

const ENTRY_SCHEMA_JSON: &str = include_str!("../../schema/instruction_entry.schema.json");

static COMPILED: OnceLock<JSONSchema> = OnceLock::new();

fn compiled() -> Result<&'static JSONSchema> {
    if let Some(schema) = COMPILED.get() {
        return Ok(schema);
    }
    let document: Value =
        serde_json::from_str(ENTRY_SCHEMA_JSON).context("parsing bundled entry schema")?;
    let document: &'static Value = Box::leak(Box::new(document));
    let schema = JSONSchema::compile(document).context("compiling bundled entry schema")?;
    Ok(COMPILED.get_or_init(|| schema))
}

/// Validate a serialized entry against the bundled schema.
pub fn validate_entry_value(value: &Value) -> Result<()> {
    let schema = compiled()?;
    if let Err(errors) = schema.validate(value) {
        let details = errors
            .map(|err| err.to_string())
            .collect::<Vec<_>>()
            .join("; ");
        bail!("entry failed schema validation: {details}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::entry::EntryDraft;
    use chrono::Utc;

    #[test]
    fn well_formed_entry_passes() {
        let now = Utc::now();
        let mut draft = EntryDraft::new("schema-ok", "body text");
        draft.title = "Schema ok".to_string();
        let entry = draft.into_entry(now, now);
        let value = serde_json::to_value(&entry).expect("serializes");
        validate_entry_value(&value).expect("validates");
    }

    #[test]
    fn schema_rejects_bad_priority_and_unknown_fields() {
        let now = Utc::now();
        let mut draft = EntryDraft::new("schema-bad", "body text");
        draft.title = "Schema bad".to_string();
        let entry = draft.into_entry(now, now);
        let mut value = serde_json::to_value(&entry).expect("serializes");

        value["priority"] = serde_json::json!(0);
        assert!(validate_entry_value(&value).is_err());

        value["priority"] = serde_json::json!(10);
        value["surprise"] = serde_json::json!(true);
        assert!(validate_entry_value(&value).is_err());
    }
}
