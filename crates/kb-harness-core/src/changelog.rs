//! Change-log entries, boundary validation, and the [`ChangeSource`] trait.
//!
//! Rows from the external change log are loosely typed: every field may be
//! missing, and `new_value` may be an object of fields or a bare scalar.
//! [`ChangeLogEntry`] accepts anything shaped like a row; [`ChangeLogEntry::validate`]
//! turns it into a strict [`ValidatedChange`] or rejects that one row.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ChangeSourceError, ValidationError};
use crate::models::{ChangeKind, ChunkContent, ChunkPatch, SourceVersion, DEFAULT_CATEGORY};

/// One raw row of the change log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeLogEntry {
    #[serde(default)]
    pub change_id: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default, alias = "sheet_name")]
    pub sheet: Option<String>,
    #[serde(default)]
    pub chunk_id: String,
    #[serde(default)]
    pub change_type: String,
    #[serde(default, alias = "field_changed")]
    pub field: Option<String>,
    #[serde(default)]
    pub old_value: Option<Value>,
    #[serde(default)]
    pub new_value: Option<Value>,
    #[serde(default)]
    pub version: Option<SourceVersion>,
    /// Set when the row could not be read at all. Such rows stay in the batch
    /// so they are audited in order, and always fail validation.
    #[serde(skip)]
    pub malformed: Option<String>,
}

/// The action a validated entry asks for.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeAction {
    Create(ChunkContent),
    Update(ChunkPatch),
    Delete,
}

impl ChangeAction {
    pub fn kind(&self) -> ChangeKind {
        match self {
            ChangeAction::Create(_) => ChangeKind::Create,
            ChangeAction::Update(_) => ChangeKind::Update,
            ChangeAction::Delete => ChangeKind::Delete,
        }
    }
}

/// A change entry that passed boundary validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedChange {
    pub change_id: String,
    pub chunk_id: String,
    pub version: SourceVersion,
    pub action: ChangeAction,
}

impl ChangeLogEntry {
    /// Reads one row, filling a missing `change_id` with
    /// `<version>#<position>`, where the version is the row's own or else the
    /// batch version. A missing row version stays missing. Unreadable rows
    /// become malformed entries that keep whatever version they carry.
    pub fn from_row(row: Value, position: usize, batch_version: &SourceVersion) -> Self {
        let mut entry = match serde_json::from_value::<ChangeLogEntry>(row.clone()) {
            Ok(entry) => entry,
            Err(e) => {
                debug!(position, error = %e, "unreadable change-log row");
                ChangeLogEntry {
                    chunk_id: row
                        .get("chunk_id")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    version: row
                        .get("version")
                        .cloned()
                        .and_then(|v| serde_json::from_value(v).ok()),
                    malformed: Some(e.to_string()),
                    ..Default::default()
                }
            }
        };
        entry.chunk_id = entry.chunk_id.trim().to_string();
        if entry.version.as_ref().is_some_and(SourceVersion::is_empty) {
            entry.version = None;
        }
        if entry.change_id.trim().is_empty() {
            let version = entry.version.as_ref().unwrap_or(batch_version);
            entry.change_id = format!("{version}#{position}");
        }
        entry
    }

    /// Version of this row, empty when the row carries none.
    pub fn version(&self) -> SourceVersion {
        self.version.clone().unwrap_or_default()
    }

    /// Change type normalized for the audit trail.
    pub fn change_type_label(&self) -> String {
        match self.change_type.parse::<ChangeKind>() {
            Ok(kind) => kind.as_str().to_string(),
            Err(_) if self.change_type.trim().is_empty() => "unknown".to_string(),
            Err(_) => self.change_type.trim().to_ascii_lowercase(),
        }
    }

    /// Validates the row into a strict record. Existence of the referenced
    /// chunk is checked later against the store.
    pub fn validate(&self) -> Result<ValidatedChange, ValidationError> {
        if let Some(reason) = &self.malformed {
            return Err(ValidationError::Malformed(reason.clone()));
        }
        if self.chunk_id.is_empty() {
            return Err(ValidationError::MissingField("chunk_id"));
        }
        if self.change_type.trim().is_empty() {
            return Err(ValidationError::MissingField("change_type"));
        }
        if self.version.is_none() {
            return Err(ValidationError::MissingField("version"));
        }
        let kind: ChangeKind = self.change_type.parse()?;
        let action = match kind {
            ChangeKind::Create => ChangeAction::Create(self.create_content()?),
            ChangeKind::Update => {
                let patch = self.patch()?;
                if patch.is_empty() {
                    return Err(ValidationError::EmptyPatch(self.chunk_id.clone()));
                }
                ChangeAction::Update(patch)
            }
            ChangeKind::Delete => ChangeAction::Delete,
        };
        Ok(ValidatedChange {
            change_id: self.change_id.clone(),
            chunk_id: self.chunk_id.clone(),
            version: self.version(),
            action,
        })
    }

    fn create_content(&self) -> Result<ChunkContent, ValidationError> {
        match (&self.new_value, self.field.as_deref()) {
            // A bare answer with no target field: the question is derived.
            (Some(Value::String(answer)), None) => {
                let content = ChunkContent {
                    category: self
                        .sheet
                        .clone()
                        .filter(|s| !s.trim().is_empty())
                        .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
                    subcategory: DEFAULT_CATEGORY.to_string(),
                    question: format!("Information about {}", self.chunk_id),
                    answer: answer.trim().to_string(),
                    tags: Vec::new(),
                    location: None,
                };
                content.validate()?;
                Ok(content)
            }
            (None, _) | (Some(Value::Null), _) => Err(ValidationError::MissingField("new_value")),
            _ => {
                let mut patch = self.patch()?;
                if patch.category.is_none() {
                    patch.category = self.sheet.clone().filter(|s| !s.trim().is_empty());
                }
                patch.into_content()
            }
        }
    }

    fn patch(&self) -> Result<ChunkPatch, ValidationError> {
        let mut patch = ChunkPatch::default();
        match &self.new_value {
            None | Some(Value::Null) => {}
            Some(Value::Object(fields)) => {
                for (name, value) in fields {
                    set_field(&mut patch, name, value)?;
                }
            }
            Some(scalar) => {
                let field = self
                    .field
                    .as_deref()
                    .filter(|f| !f.trim().is_empty())
                    .ok_or(ValidationError::MissingField("field"))?;
                set_field(&mut patch, field, scalar)?;
            }
        }
        Ok(patch)
    }
}

const IGNORED_FIELDS: &[&str] = &["id", "chunk_id"];

fn set_field(patch: &mut ChunkPatch, name: &str, value: &Value) -> Result<(), ValidationError> {
    let name = name.trim().to_ascii_lowercase();
    match name.as_str() {
        "category" => patch.category = Some(text_field(&name, value)?),
        "subcategory" => patch.subcategory = Some(text_field(&name, value)?),
        "question" => patch.question = Some(text_field(&name, value)?),
        "answer" => patch.answer = Some(text_field(&name, value)?),
        "tags" => patch.tags = Some(tags_field(value)?),
        "location" => patch.location = Some(text_field(&name, value)?),
        n if IGNORED_FIELDS.contains(&n) => {}
        _ => {
            return Err(ValidationError::InvalidField {
                field: name,
                reason: "not a chunk field".to_string(),
            })
        }
    }
    Ok(())
}

fn text_field(name: &str, value: &Value) -> Result<String, ValidationError> {
    let text = match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => {
            return Err(ValidationError::InvalidField {
                field: name.to_string(),
                reason: "expected text".to_string(),
            })
        }
    };
    if text.is_empty() {
        return Err(ValidationError::InvalidField {
            field: name.to_string(),
            reason: "must not be empty".to_string(),
        });
    }
    Ok(text)
}

fn tags_field(value: &Value) -> Result<Vec<String>, ValidationError> {
    let invalid = || ValidationError::InvalidField {
        field: "tags".to_string(),
        reason: "expected a list of strings or a comma-separated string".to_string(),
    };
    let tags: Vec<String> = match value {
        Value::String(s) => s.split(',').map(str::to_string).collect(),
        Value::Array(items) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string).ok_or_else(invalid))
            .collect::<Result<_, _>>()?,
        _ => return Err(invalid()),
    };
    Ok(tags
        .into_iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect())
}

/// Reader for the external change log.
///
/// The version marker is readable on its own so an unchanged log can be
/// detected without reading any rows.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Human-readable location for logs.
    fn describe(&self) -> String;

    async fn current_version(&self) -> Result<SourceVersion, ChangeSourceError>;

    /// All rows in source order. `since` is a hint; filtering happens in
    /// [`read_pending`].
    async fn read_entries(
        &self,
        since: Option<&SourceVersion>,
        current: &SourceVersion,
    ) -> Result<Vec<ChangeLogEntry>, ChangeSourceError>;
}

/// Result of [`read_pending`].
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChanges {
    pub current_version: SourceVersion,
    pub entries: Vec<ChangeLogEntry>,
}

impl PendingChanges {
    pub fn is_up_to_date(&self, since: Option<&SourceVersion>) -> bool {
        since == Some(&self.current_version)
    }
}

/// Reads the entries newer than `since`, in source order.
///
/// Returns no entries without reading rows when `since` equals the current
/// version. With `since = None` every row is returned. Otherwise rows
/// without a version cannot be placed after `since` and are left out, so a
/// row is never replayed by a later version bump.
pub async fn read_pending(
    source: &dyn ChangeSource,
    since: Option<&SourceVersion>,
) -> Result<PendingChanges, ChangeSourceError> {
    let current_version = source.current_version().await?;
    if since == Some(&current_version) {
        return Ok(PendingChanges {
            current_version,
            entries: Vec::new(),
        });
    }
    let rows = source.read_entries(since, &current_version).await?;
    let Some(since) = since else {
        return Ok(PendingChanges {
            current_version,
            entries: rows,
        });
    };
    let total = rows.len();
    let mut unversioned = 0;
    let entries: Vec<ChangeLogEntry> = rows
        .into_iter()
        .filter(|e| match &e.version {
            Some(v) => v > since,
            None => {
                unversioned += 1;
                false
            }
        })
        .collect();
    if unversioned > 0 {
        warn!(
            unversioned,
            total, "change-log rows without a version ignored; re-run with --force to audit them"
        );
    }
    Ok(PendingChanges {
        current_version,
        entries,
    })
}

/// Converts a JSON array of rows into entries, keeping non-object rows as
/// malformed entries in their original position.
pub fn entries_from_rows(rows: Vec<Value>, batch_version: &SourceVersion) -> Vec<ChangeLogEntry> {
    rows.into_iter()
        .enumerate()
        .map(|(i, row)| ChangeLogEntry::from_row(row, i + 1, batch_version))
        .collect()
}
