//! Bulk load of the initial corpus.
//!
//! Reads a corpus file of the form
//!
//! ```json
//! { "metadata": { "total_chunks": 2 },
//!   "chunks": [ { "id": "scb_faq_141", "category": "FAQ", "subcategory": "Pricing",
//!                 "question": "...", "answer": "...", "tags": ["pricing"] } ] }
//! ```
//!
//! Each record is validated on its own; bad records are reported and left
//! out. Valid records are embedded in `batch_size` batches and written with
//! the idempotent [`KnowledgeStore::upsert`], so loading the same file twice
//! changes nothing the second time.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

use kb_harness_core::embedding::{EmbedPurpose, EmbeddingProvider};
use kb_harness_core::error::ValidationError;
use kb_harness_core::models::{ChunkContent, ChunkPatch, KnowledgeChunk};
use kb_harness_core::store::{check_dimensions, KnowledgeStore, WriteEffect};

use crate::kb::KnowledgeBase;

#[derive(Debug, Deserialize)]
struct CorpusFile {
    #[serde(default)]
    metadata: CorpusMetadata,
    #[serde(default)]
    chunks: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
struct CorpusMetadata {
    #[serde(default)]
    total_chunks: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct CorpusRecord {
    id: String,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    subcategory: Option<String>,
    #[serde(default)]
    question: String,
    #[serde(default)]
    answer: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    location: Option<Value>,
}

/// A record that failed validation.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRecord {
    /// 1-based position in the `chunks` array.
    pub position: usize,
    pub id: Option<String>,
    pub reason: String,
}

/// A corpus file split into valid and rejected records.
#[derive(Debug, Clone, Default)]
pub struct ParsedCorpus {
    pub declared: Option<usize>,
    pub records: Vec<(String, ChunkContent)>,
    pub rejected: Vec<RejectedRecord>,
}

impl ParsedCorpus {
    pub fn found(&self) -> usize {
        self.records.len() + self.rejected.len()
    }
}

/// Counts reported by [`load_corpus`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Records rejected while writing (retired ids).
    pub rejected: Vec<(String, String)>,
    /// Records whose embedding or write failed.
    pub failed: usize,
}

pub fn parse_corpus(content: &str) -> Result<ParsedCorpus> {
    let file: CorpusFile = serde_json::from_str(content).context("corpus is not valid JSON")?;
    let mut parsed = ParsedCorpus {
        declared: file.metadata.total_chunks,
        ..Default::default()
    };
    let mut seen = HashSet::new();

    for (i, raw) in file.chunks.into_iter().enumerate() {
        let position = i + 1;
        let id_hint = raw.get("id").and_then(Value::as_str).map(str::to_string);
        match validate_record(raw) {
            Ok((id, content)) => {
                if !seen.insert(id.clone()) {
                    parsed.rejected.push(RejectedRecord {
                        position,
                        id: Some(id),
                        reason: "duplicate id in corpus".to_string(),
                    });
                    continue;
                }
                parsed.records.push((id, content));
            }
            Err(e) => parsed.rejected.push(RejectedRecord {
                position,
                id: id_hint,
                reason: e.to_string(),
            }),
        }
    }

    if let Some(declared) = parsed.declared {
        if declared != parsed.found() {
            warn!(declared, found = parsed.found(), "corpus metadata count disagrees with records");
        }
    }
    Ok(parsed)
}

fn validate_record(raw: Value) -> Result<(String, ChunkContent), ValidationError> {
    let record: CorpusRecord =
        serde_json::from_value(raw).map_err(|e| ValidationError::Malformed(e.to_string()))?;
    let id = record.id.trim().to_string();
    if id.is_empty() {
        return Err(ValidationError::MissingField("id"));
    }
    let non_empty = |s: Option<String>| s.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    let content = ChunkPatch {
        category: non_empty(record.category),
        subcategory: non_empty(record.subcategory),
        question: Some(record.question.trim().to_string()),
        answer: Some(record.answer.trim().to_string()),
        tags: Some(
            record
                .tags
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
        ),
        location: record.location.and_then(location_text),
    }
    .into_content()?;
    Ok((id, content))
}

/// Plain strings are kept as written; structured locations (sheet and row
/// references) are stored as compact JSON.
fn location_text(value: Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        other => other.to_string(),
    };
    (!text.is_empty()).then_some(text)
}

/// Embeds and writes every valid record.
///
/// Existing vectors are reused when a chunk's embedded text, dimension and
/// model are unchanged. A failed embedding batch fails only its records.
pub async fn load_corpus(
    store: &dyn KnowledgeStore,
    provider: &dyn EmbeddingProvider,
    records: Vec<(String, ChunkContent)>,
    batch_size: usize,
) -> Result<LoadReport> {
    if !provider.is_enabled() {
        bail!("Embedding provider is disabled. Set [embedding] provider in config.");
    }
    check_dimensions(&store.dimension_census().await?, provider.dims())
        .context("stored vectors do not match the configured provider; run `kb embed rebuild`")?;

    let version = store
        .sync_state()
        .await?
        .last_synced_version
        .unwrap_or_default();
    let model = provider.model_name().to_string();
    let mut report = LoadReport::default();

    let mut pending = Vec::new();
    for (id, content) in records {
        if store.is_retired(&id).await? {
            report
                .rejected
                .push((id.clone(), ValidationError::RetiredChunkId(id).to_string()));
            continue;
        }
        let existing = store.get(&id).await?;
        let reusable = existing.filter(|c| {
            c.embed_text() == content.embed_text()
                && c.embedding_dim == provider.dims()
                && c.embedding_model == model
        });
        pending.push((id, content, reusable.map(|c| c.embedding)));
    }

    for batch in pending.chunks(batch_size.max(1)) {
        let to_embed: Vec<String> = batch
            .iter()
            .filter(|(_, _, vector)| vector.is_none())
            .map(|(_, content, _)| content.embed_text())
            .collect();
        let fresh = if to_embed.is_empty() {
            Vec::new()
        } else {
            match provider.embed_batch(&to_embed, EmbedPurpose::Document).await {
                Ok(vectors) => vectors,
                Err(e) => {
                    warn!(error = %e, records = batch.len(), "embedding batch failed");
                    report.failed += batch.len();
                    continue;
                }
            }
        };
        let mut fresh = fresh.into_iter();

        for (id, content, reused) in batch {
            let embedding = match reused {
                Some(v) => v.clone(),
                None => match fresh.next() {
                    Some(v) => v,
                    None => {
                        report.failed += 1;
                        continue;
                    }
                },
            };
            let chunk =
                KnowledgeChunk::new(id.clone(), content.clone(), embedding, &model, version.clone());
            match store.upsert(&chunk).await {
                Ok(WriteEffect::Inserted) => report.inserted += 1,
                Ok(WriteEffect::Updated) => report.updated += 1,
                Ok(_) => report.unchanged += 1,
                Err(e) => {
                    warn!(chunk_id = %id, error = %e, "failed to write chunk");
                    report.failed += 1;
                }
            }
        }
    }

    info!(
        inserted = report.inserted,
        updated = report.updated,
        unchanged = report.unchanged,
        failed = report.failed,
        "bulk load finished"
    );
    Ok(report)
}

/// `kb load`: validates a corpus file and, unless `dry_run`, loads it.
pub async fn run_load(kb: &KnowledgeBase, path: Option<&Path>, dry_run: bool) -> Result<()> {
    let path = match path.or(kb.config().load.path.as_deref()) {
        Some(p) => p.to_path_buf(),
        None => bail!("No corpus file given. Pass --path or set [load] path in config."),
    };
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read corpus file: {}", path.display()))?;
    let parsed = parse_corpus(&content)
        .with_context(|| format!("Failed to parse corpus file: {}", path.display()))?;

    if dry_run {
        println!("load {} (dry-run)", path.display());
    } else {
        println!("load {}", path.display());
    }
    if let Some(declared) = parsed.declared {
        println!("  declared: {}", declared);
    }
    println!("  found: {}", parsed.found());
    println!("  valid: {}", parsed.records.len());
    println!("  invalid: {}", parsed.rejected.len());
    for r in &parsed.rejected {
        println!(
            "    #{} {}: {}",
            r.position,
            r.id.as_deref().unwrap_or("<no id>"),
            r.reason
        );
    }

    if dry_run {
        println!("ok");
        return Ok(());
    }

    let report = load_corpus(
        kb.store(),
        kb.provider(),
        parsed.records,
        kb.config().embedding.batch_size,
    )
    .await?;

    println!("  inserted: {}", report.inserted);
    println!("  updated: {}", report.updated);
    println!("  unchanged: {}", report.unchanged);
    println!("  failed: {}", report.failed);
    for (id, reason) in &report.rejected {
        println!("    {}: {}", id, reason);
    }
    println!("ok");
    Ok(())
}
