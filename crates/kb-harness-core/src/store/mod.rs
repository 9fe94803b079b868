//! Storage abstraction for the knowledge base.
//!
//! The [`KnowledgeStore`] trait defines every storage operation needed by
//! bulk load, sync, and search, so the SQLite backend and the in-memory
//! backend are interchangeable.
//!
//! Implementations must be `Send + Sync` to work with async runtimes.

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::error::StoreError;
use crate::models::{KnowledgeChunk, SourceVersion, SyncHistoryEntry, SyncState};

/// A candidate chunk returned from keyword or vector search.
///
/// Carries everything needed to build a [`SearchResult`](crate::models::SearchResult)
/// without another round-trip.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkCandidate {
    pub chunk_id: String,
    /// Cosine similarity for vector candidates, term overlap for keyword ones.
    pub raw_score: f64,
    pub question: String,
    pub answer: String,
    pub category: String,
    pub subcategory: String,
    pub location: Option<String>,
}

impl ChunkCandidate {
    pub fn from_chunk(chunk: &KnowledgeChunk, raw_score: f64) -> Self {
        Self {
            chunk_id: chunk.chunk_id.clone(),
            raw_score,
            question: chunk.question.clone(),
            answer: chunk.answer.clone(),
            category: chunk.category.clone(),
            subcategory: chunk.subcategory.clone(),
            location: chunk.location.clone(),
        }
    }
}

/// Number of stored vectors per embedding dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DimensionCount {
    pub dims: usize,
    pub chunks: usize,
}

/// Checks that every stored vector has the configured dimension.
pub fn check_dimensions(census: &[DimensionCount], configured: usize) -> Result<(), StoreError> {
    if census.iter().all(|c| c.dims == configured) {
        Ok(())
    } else {
        Err(StoreError::DimensionMismatch {
            configured,
            stored: census.iter().map(|c| c.dims).collect(),
        })
    }
}

/// A single chunk mutation applied by the sync engine.
#[derive(Debug, Clone, PartialEq)]
pub enum ChunkWrite {
    Upsert(KnowledgeChunk),
    Delete {
        chunk_id: String,
        version: SourceVersion,
    },
}

impl ChunkWrite {
    pub fn chunk_id(&self) -> &str {
        match self {
            ChunkWrite::Upsert(chunk) => &chunk.chunk_id,
            ChunkWrite::Delete { chunk_id, .. } => chunk_id,
        }
    }
}

/// What a write actually did to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteEffect {
    Inserted,
    Updated,
    /// Content, dimension and model were identical; nothing was written.
    Unchanged,
    Deleted,
    /// Delete of a chunk that does not exist.
    Missing,
}

impl WriteEffect {
    pub fn changed(&self) -> bool {
        matches!(
            self,
            WriteEffect::Inserted | WriteEffect::Updated | WriteEffect::Deleted
        )
    }
}

/// Result of trying to take the sync lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired,
    Held {
        holder: String,
        since: DateTime<Utc>,
    },
}

/// Abstract storage backend for knowledge chunks, sync state and history.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | `get` / `list_chunks` / `count` | Read chunks |
/// | `upsert` / `delete` | Idempotent writes used by bulk load |
/// | `apply_change` | Chunk write plus history row in one transaction |
/// | `top_k_by_similarity` / `keyword_match` | Candidate retrieval |
/// | `dimension_census` | Vector dimensions present in the store |
/// | `sync_state` / `finalize_sync` | Progress against the change log |
/// | `try_lock_sync` / `unlock_sync` | Single-writer sync lock |
#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn get(&self, chunk_id: &str) -> Result<Option<KnowledgeChunk>, StoreError>;

    /// All live chunks ordered by `chunk_id`.
    async fn list_chunks(&self) -> Result<Vec<KnowledgeChunk>, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;

    /// Whether the id was deleted and may not be reused.
    async fn is_retired(&self, chunk_id: &str) -> Result<bool, StoreError>;

    async fn retired_ids(&self) -> Result<Vec<String>, StoreError>;

    /// Inserts or replaces a chunk. Writing identical content, dimension and
    /// model again returns [`WriteEffect::Unchanged`] and touches nothing.
    /// Fails with [`StoreError::Retired`] for a retired id.
    async fn upsert(&self, chunk: &KnowledgeChunk) -> Result<WriteEffect, StoreError>;

    /// Removes a chunk and retires its id.
    async fn delete(&self, chunk_id: &str, version: &SourceVersion)
        -> Result<WriteEffect, StoreError>;

    /// Applies `write` and appends `history` atomically. Either both land or
    /// neither does. No history row is written when the effect is
    /// [`WriteEffect::Unchanged`] or [`WriteEffect::Missing`].
    async fn apply_change(
        &self,
        write: &ChunkWrite,
        history: &SyncHistoryEntry,
    ) -> Result<WriteEffect, StoreError>;

    /// Appends a history row on its own (rolled-back and skipped entries).
    async fn record_history(&self, entry: &SyncHistoryEntry) -> Result<(), StoreError>;

    /// Most recent history rows first.
    async fn history(&self, limit: usize) -> Result<Vec<SyncHistoryEntry>, StoreError>;

    /// The `k` chunks with the highest cosine similarity to `query`.
    ///
    /// Fails with [`StoreError::DimensionMismatch`] if any stored vector has
    /// a different length than `query`.
    async fn top_k_by_similarity(
        &self,
        query: &[f32],
        k: usize,
        category: Option<&str>,
    ) -> Result<Vec<ChunkCandidate>, StoreError>;

    /// Up to `limit` chunks with a nonzero overlap score for `terms`, best
    /// first. `raw_score` is [`overlap_score`](crate::keyword::overlap_score).
    async fn keyword_match(
        &self,
        terms: &[String],
        limit: usize,
        category: Option<&str>,
    ) -> Result<Vec<ChunkCandidate>, StoreError>;

    async fn dimension_census(&self) -> Result<Vec<DimensionCount>, StoreError>;

    async fn sync_state(&self) -> Result<SyncState, StoreError>;

    /// Records that everything up to `version` has been processed.
    async fn finalize_sync(
        &self,
        version: &SourceVersion,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Takes the sync lock unless another holder has it and it is younger
    /// than `ttl`. Stale locks are taken over.
    async fn try_lock_sync(
        &self,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<LockAttempt, StoreError>;

    /// Releases the lock if `holder` owns it.
    async fn unlock_sync(&self, holder: &str) -> Result<(), StoreError>;
}

/// Sorts candidates best first, breaking ties by `chunk_id`.
pub fn rank_candidates(candidates: &mut Vec<ChunkCandidate>, limit: usize) {
    candidates.sort_by(|a, b| {
        b.raw_score
            .partial_cmp(&a.raw_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk_id.cmp(&b.chunk_id))
    });
    candidates.truncate(limit);
}
