//! Instruction entry model and draft validation.
//!
//! Entries are strict about their identity fields and forgiving about the
//! governance extras. Validation is intentionally split: `lax` mode only
//! enforces the id/body requirement so operators can import half-governed
//! documents, while strict mode additionally runs the bundled JSON Schema
//! over the serialized entry.

use crate::catalog::canon;
use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Version marker written into every entry file.
pub const ENTRY_SCHEMA_VERSION: &str = "instruction_entry_v1";

pub const PRIORITY_MIN: u8 = 1;
pub const PRIORITY_MAX: u8 = 100;
pub const PRIORITY_DEFAULT: u8 = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    Individual,
    Group,
    All,
}

impl Audience {
    pub fn as_str(&self) -> &'static str {
        match self {
            Audience::Individual => "individual",
            Audience::Group => "group",
            Audience::All => "all",
        }
    }
}

impl TryFrom<&str> for Audience {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "individual" => Ok(Audience::Individual),
            "group" => Ok(Audience::Group),
            "all" => Ok(Audience::All),
            other => bail!("Unknown audience: {other}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Requirement {
    Mandatory,
    Critical,
    Recommended,
    Optional,
    Deprecated,
}

impl Requirement {
    pub fn as_str(&self) -> &'static str {
        match self {
            Requirement::Mandatory => "mandatory",
            Requirement::Critical => "critical",
            Requirement::Recommended => "recommended",
            Requirement::Optional => "optional",
            Requirement::Deprecated => "deprecated",
        }
    }
}

impl TryFrom<&str> for Requirement {
    type Error = anyhow::Error;

    fn try_from(value: &str) -> Result<Self> {
        match value {
            "mandatory" => Ok(Requirement::Mandatory),
            "critical" => Ok(Requirement::Critical),
            "recommended" => Ok(Requirement::Recommended),
            "optional" => Ok(Requirement::Optional),
            "deprecated" => Ok(Requirement::Deprecated),
            other => bail!("Unknown requirement: {other}"),
        }
    }
}

/// One versioned document in the catalog. Serialized camelCase, one file per
/// entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstructionEntry {
    pub id: String,
    pub title: String,
    pub body: String,
    /// SHA-256 of the canonicalized body; see `canon`.
    pub source_hash: String,
    pub schema_version: String,
    pub priority: u8,
    pub audience: Audience,
    pub requirement: Requirement,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub categories: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority_tier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reviewed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Incoming entry fields, before hashing and timestamps are applied.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryDraft {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub priority: Option<u8>,
    #[serde(default)]
    pub audience: Option<Audience>,
    #[serde(default)]
    pub requirement: Option<Requirement>,
    #[serde(default)]
    pub categories: BTreeSet<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub priority_tier: Option<String>,
}

impl EntryDraft {
    pub fn new(id: &str, body: &str) -> Self {
        Self {
            id: id.to_string(),
            body: body.to_string(),
            ..Self::default()
        }
    }

    /// The id/body requirement; enforced in both strict and lax modes.
    pub fn validate_required(&self) -> Result<()> {
        validate_id(&self.id)?;
        if canon::canonicalize(&self.body).is_empty() {
            bail!("entry {} has an empty body", self.id);
        }
        Ok(())
    }

    /// Field-level rules beyond id/body; skipped in lax mode.
    pub fn validate_strict(&self) -> Result<()> {
        self.validate_required()?;
        if self.title.trim().is_empty() {
            bail!("entry {} has an empty title", self.id);
        }
        if let Some(priority) = self.priority {
            validate_priority(priority)?;
        }
        if self.categories.iter().any(|c| c.trim().is_empty()) {
            bail!("entry {} has an empty category", self.id);
        }
        Ok(())
    }

    /// Materialize a full entry. `created_at` is carried over when the draft
    /// replaces an existing entry.
    pub fn into_entry(self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> InstructionEntry {
        let source_hash = canon::source_hash(&self.body);
        InstructionEntry {
            id: self.id,
            title: self.title,
            body: self.body,
            source_hash,
            schema_version: ENTRY_SCHEMA_VERSION.to_string(),
            priority: self.priority.unwrap_or(PRIORITY_DEFAULT),
            audience: self.audience.unwrap_or(Audience::All),
            requirement: self.requirement.unwrap_or(Requirement::Recommended),
            categories: self.categories,
            owner: self.owner,
            status: self.status,
            version: self.version,
            priority_tier: self.priority_tier,
            last_reviewed_at: None,
            usage_count: 0,
            last_used_at: None,
            created_at,
            updated_at: now,
        }
    }
}

pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        bail!("entry id must not be empty");
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        bail!("entry id must match ^[A-Za-z0-9_.-]+$, got {id}");
    }
    Ok(())
}

pub fn validate_priority(priority: u8) -> Result<()> {
    if !(PRIORITY_MIN..=PRIORITY_MAX).contains(&priority) {
        bail!("priority must be in {PRIORITY_MIN}..={PRIORITY_MAX}, got {priority}");
    }
    Ok(())
}
