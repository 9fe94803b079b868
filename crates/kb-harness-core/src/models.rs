//! Core data models for the knowledge base.
//!
//! A [`KnowledgeChunk`] is one question/answer pair together with its
//! embedding and provenance. [`SyncState`] and [`SyncHistoryEntry`] record
//! how far the store has caught up with the external change log and what
//! happened to every change that was processed.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ValidationError;

pub const DEFAULT_CATEGORY: &str = "General";

/// Version marker of the external change log.
///
/// Versions are compared segment by segment on `.`: numeric segments
/// compare as numbers, anything else compares as text. This orders both
/// dotted release numbers (`1.9 < 1.10`) and ISO timestamps correctly.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct SourceVersion(String);

impl<'de> Deserialize<'de> for SourceVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Spreadsheet-backed logs often emit versions as bare numbers.
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Int(u64),
            Float(f64),
        }
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Text(s) => SourceVersion::new(s),
            Raw::Int(n) => SourceVersion::new(n.to_string()),
            Raw::Float(f) => SourceVersion::new(f.to_string()),
        })
    }
}

impl SourceVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceVersion {
    fn from(s: &str) -> Self {
        SourceVersion::new(s)
    }
}

impl Ord for SourceVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let mut left = self.0.split('.');
        let mut right = other.0.split('.');
        loop {
            match (left.next(), right.next()) {
                (None, None) => return Ordering::Equal,
                (None, Some(_)) => return Ordering::Less,
                (Some(_), None) => return Ordering::Greater,
                (Some(a), Some(b)) => {
                    let ord = match (a.parse::<u64>(), b.parse::<u64>()) {
                        (Ok(x), Ok(y)) => x.cmp(&y),
                        _ => a.cmp(b),
                    };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
            }
        }
    }
}

impl PartialOrd for SourceVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for SourceVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SourceVersion {}

/// The human-authored content of a chunk, without embedding or provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkContent {
    pub category: String,
    pub subcategory: String,
    pub question: String,
    pub answer: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Venue the answer applies to, when it is venue specific.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

impl ChunkContent {
    /// The text that is embedded for semantic retrieval.
    pub fn embed_text(&self) -> String {
        format!("{}\n{}", self.question, self.answer)
    }

    /// SHA-256 over every content field. Two contents with the same hash are
    /// interchangeable for storage purposes. An absent location leaves the
    /// digest as it was before locations were stored.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            &self.category,
            &self.subcategory,
            &self.question,
            &self.answer,
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0u8]);
        }
        for tag in &self.tags {
            hasher.update(tag.as_bytes());
            hasher.update([0x1f]);
        }
        if let Some(location) = &self.location {
            hasher.update([0x1e]);
            hasher.update(location.as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    /// Rejects content that cannot be stored.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.question.trim().is_empty() {
            return Err(ValidationError::MissingField("question"));
        }
        if self.answer.trim().is_empty() {
            return Err(ValidationError::MissingField("answer"));
        }
        Ok(())
    }
}

/// One retrievable question/answer unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeChunk {
    pub chunk_id: String,
    pub category: String,
    pub subcategory: String,
    pub question: String,
    pub answer: String,
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub embedding: Vec<f32>,
    pub embedding_dim: usize,
    pub embedding_model: String,
    pub content_hash: String,
    pub updated_at: DateTime<Utc>,
    pub source_version: SourceVersion,
}

impl KnowledgeChunk {
    /// Builds a chunk from validated content and a freshly computed vector.
    pub fn new(
        chunk_id: impl Into<String>,
        content: ChunkContent,
        embedding: Vec<f32>,
        embedding_model: impl Into<String>,
        source_version: SourceVersion,
    ) -> Self {
        let content_hash = content.content_hash();
        let ChunkContent {
            category,
            subcategory,
            question,
            answer,
            tags,
            location,
        } = content;
        Self {
            chunk_id: chunk_id.into(),
            category,
            subcategory,
            question,
            answer,
            tags,
            location,
            embedding_dim: embedding.len(),
            embedding,
            embedding_model: embedding_model.into(),
            content_hash,
            updated_at: Utc::now(),
            source_version,
        }
    }

    pub fn content(&self) -> ChunkContent {
        ChunkContent {
            category: self.category.clone(),
            subcategory: self.subcategory.clone(),
            question: self.question.clone(),
            answer: self.answer.clone(),
            tags: self.tags.clone(),
            location: self.location.clone(),
        }
    }

    pub fn embed_text(&self) -> String {
        format!("{}\n{}", self.question, self.answer)
    }

    /// Text scanned by keyword scoring: question, answer and tags.
    pub fn keyword_text(&self) -> String {
        format!("{}\n{}\n{}", self.question, self.answer, self.tags.join(" "))
    }

    /// Whether writing `other` over `self` would change nothing observable.
    pub fn same_stored_state(&self, other: &KnowledgeChunk) -> bool {
        self.content_hash == other.content_hash
            && self.embedding_dim == other.embedding_dim
            && self.embedding_model == other.embedding_model
    }
}

/// Partial field update carried by an `update` change entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkPatch {
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub question: Option<String>,
    pub answer: Option<String>,
    pub tags: Option<Vec<String>>,
    pub location: Option<String>,
}

impl ChunkPatch {
    pub fn is_empty(&self) -> bool {
        self.category.is_none()
            && self.subcategory.is_none()
            && self.question.is_none()
            && self.answer.is_none()
            && self.tags.is_none()
            && self.location.is_none()
    }

    /// Overlays the patch on existing content.
    pub fn apply(&self, base: &ChunkContent) -> ChunkContent {
        ChunkContent {
            category: self.category.clone().unwrap_or_else(|| base.category.clone()),
            subcategory: self
                .subcategory
                .clone()
                .unwrap_or_else(|| base.subcategory.clone()),
            question: self.question.clone().unwrap_or_else(|| base.question.clone()),
            answer: self.answer.clone().unwrap_or_else(|| base.answer.clone()),
            tags: self.tags.clone().unwrap_or_else(|| base.tags.clone()),
            location: self.location.clone().or_else(|| base.location.clone()),
        }
    }

    /// Turns a patch into full content for a `create` entry.
    pub fn into_content(self) -> Result<ChunkContent, ValidationError> {
        let content = ChunkContent {
            category: self.category.unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
            subcategory: self
                .subcategory
                .unwrap_or_else(|| DEFAULT_CATEGORY.to_string()),
            question: self.question.unwrap_or_default(),
            answer: self.answer.unwrap_or_default(),
            tags: self.tags.unwrap_or_default(),
            location: self.location,
        };
        content.validate()?;
        Ok(content)
    }
}

/// One ranked answer returned by search.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub score: f64,
    pub semantic_score: f64,
    pub keyword_score: f64,
    pub question: String,
    pub answer: String,
    pub category: String,
    pub subcategory: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// Progress marker against the external change log.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    pub last_synced_version: Option<SourceVersion>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Create => "create",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" | "add" => Ok(ChangeKind::Create),
            "update" | "modify" => Ok(ChangeKind::Update),
            "delete" | "remove" => Ok(ChangeKind::Delete),
            _ => Err(ValidationError::UnknownChangeType(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncOutcome {
    Applied,
    RolledBack,
    Skipped,
}

impl SyncOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOutcome::Applied => "applied",
            SyncOutcome::RolledBack => "rolled-back",
            SyncOutcome::Skipped => "skipped",
        }
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "applied" => Ok(SyncOutcome::Applied),
            "rolled-back" => Ok(SyncOutcome::RolledBack),
            "skipped" => Ok(SyncOutcome::Skipped),
            other => Err(format!("unknown sync outcome `{other}`")),
        }
    }
}

/// Append-only audit record for one processed change entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncHistoryEntry {
    pub change_id: String,
    pub chunk_id: String,
    /// Lowercased change type as read from the log, kept verbatim even when
    /// it was not a recognised kind.
    pub change_type: String,
    pub applied_at: DateTime<Utc>,
    pub outcome: SyncOutcome,
    pub detail: Option<String>,
    pub version: SourceVersion,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn content() -> ChunkContent {
        ChunkContent {
            category: "Pricing".into(),
            subcategory: "Jump Passes".into(),
            question: "How much does a jump pass cost?".into(),
            answer: "A 60-minute jump pass is $15.".into(),
            tags: vec!["pricing".into()],
            location: None,
        }
    }

    #[test]
    fn version_ordering_is_numeric_per_segment() {
        assert!(SourceVersion::new("1.9") < SourceVersion::new("1.10"));
        assert!(SourceVersion::new("2") > SourceVersion::new("1.99"));
        assert!(SourceVersion::new("1.2") < SourceVersion::new("1.2.1"));
        assert_eq!(SourceVersion::new("1.0"), SourceVersion::new("1.00"));
        assert!(
            SourceVersion::new("2026-01-02T10:00:00Z") > SourceVersion::new("2026-01-01T23:00:00Z")
        );
    }

    #[test]
    fn version_deserializes_from_numbers() {
        let v: SourceVersion = serde_json::from_str("12").unwrap();
        assert_eq!(v, SourceVersion::new("12"));
        let v: SourceVersion = serde_json::from_str("\"1.4\"").unwrap();
        assert_eq!(v.as_str(), "1.4");
    }

    #[test]
    fn content_hash_changes_with_any_field() {
        let base = content();
        let mut tagged = base.clone();
        tagged.tags.push("party".into());
        let mut moved = base.clone();
        moved.category = "Events".into();
        assert_eq!(base.content_hash(), content().content_hash());
        assert_ne!(base.content_hash(), tagged.content_hash());
        assert_ne!(base.content_hash(), moved.content_hash());
    }

    #[test]
    fn location_is_part_of_the_content() {
        let base = content();
        let mut located = base.clone();
        located.location = Some("Scarborough".into());
        assert_ne!(base.content_hash(), located.content_hash());

        let patch = ChunkPatch {
            answer: Some("A 60-minute jump pass is $17.".into()),
            ..Default::default()
        };
        assert_eq!(patch.apply(&located).location.as_deref(), Some("Scarborough"));

        let chunk = KnowledgeChunk::new("c1", located.clone(), vec![1.0], "m", SourceVersion::new("1"));
        assert_eq!(chunk.content(), located);
        assert_eq!(chunk.content_hash, located.content_hash());
    }

    #[test]
    fn patch_overlays_only_present_fields() {
        let patch = ChunkPatch {
            answer: Some("A 60-minute jump pass is $17.".into()),
            ..Default::default()
        };
        let merged = patch.apply(&content());
        assert_eq!(merged.answer, "A 60-minute jump pass is $17.");
        assert_eq!(merged.question, content().question);
        assert_eq!(merged.tags, content().tags);
    }

    #[test]
    fn create_patch_requires_question_and_answer() {
        let patch = ChunkPatch {
            question: Some("Where are you?".into()),
            ..Default::default()
        };
        assert_eq!(
            patch.into_content(),
            Err(ValidationError::MissingField("answer"))
        );
    }

    #[test]
    fn change_kind_accepts_aliases() {
        assert_eq!("ADD".parse::<ChangeKind>(), Ok(ChangeKind::Create));
        assert_eq!(" Update ".parse::<ChangeKind>(), Ok(ChangeKind::Update));
        assert!("rename".parse::<ChangeKind>().is_err());
    }

    #[test]
    fn new_chunk_records_dimension_and_hash() {
        let chunk = KnowledgeChunk::new(
            "scb_pricing_001",
            content(),
            vec![0.0; 8],
            "fnv1a-8",
            SourceVersion::new("1"),
        );
        assert_eq!(chunk.embedding_dim, 8);
        assert_eq!(chunk.content_hash, content().content_hash());
        assert_eq!(chunk.embed_text(), content().embed_text());
    }
}
