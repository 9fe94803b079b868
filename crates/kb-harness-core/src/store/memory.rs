//! In-memory [`KnowledgeStore`] implementation for tests and dry runs.
//!
//! All state sits behind one `std::sync::RwLock`, so every write (including
//! the chunk write plus history row of [`apply_change`](KnowledgeStore::apply_change))
//! is atomic with respect to readers. Vector search is brute-force cosine
//! similarity over all stored vectors.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::embedding::cosine_similarity;
use crate::error::StoreError;
use crate::keyword::overlap_score;
use crate::models::{KnowledgeChunk, SourceVersion, SyncHistoryEntry, SyncState};

use super::{
    rank_candidates, ChunkCandidate, ChunkWrite, DimensionCount, KnowledgeStore, LockAttempt,
    WriteEffect,
};

#[derive(Default)]
struct State {
    chunks: BTreeMap<String, KnowledgeChunk>,
    retired: HashMap<String, SourceVersion>,
    history: Vec<SyncHistoryEntry>,
    sync: SyncState,
    lock: Option<(String, DateTime<Utc>)>,
}

impl State {
    fn upsert(&mut self, chunk: &KnowledgeChunk) -> Result<WriteEffect, StoreError> {
        if self.retired.contains_key(&chunk.chunk_id) {
            return Err(StoreError::Retired(chunk.chunk_id.clone()));
        }
        let effect = match self.chunks.get(&chunk.chunk_id) {
            Some(existing) if existing.same_stored_state(chunk) => return Ok(WriteEffect::Unchanged),
            Some(_) => WriteEffect::Updated,
            None => WriteEffect::Inserted,
        };
        self.chunks.insert(chunk.chunk_id.clone(), chunk.clone());
        Ok(effect)
    }

    fn delete(&mut self, chunk_id: &str, version: &SourceVersion) -> WriteEffect {
        match self.chunks.remove(chunk_id) {
            Some(_) => {
                self.retired.insert(chunk_id.to_string(), version.clone());
                WriteEffect::Deleted
            }
            None => WriteEffect::Missing,
        }
    }
}

/// In-memory store for tests and dry-run simulation.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copies chunks and retired ids from another store. Used to simulate a
    /// sync run without touching the real store.
    pub async fn snapshot_of(store: &dyn KnowledgeStore) -> Result<Self, StoreError> {
        let mut state = State::default();
        for chunk in store.list_chunks().await? {
            state.chunks.insert(chunk.chunk_id.clone(), chunk);
        }
        for chunk_id in store.retired_ids().await? {
            state.retired.insert(chunk_id, SourceVersion::default());
        }
        state.sync = store.sync_state().await?;
        Ok(Self {
            state: RwLock::new(state),
        })
    }

    /// Marks ids as retired without storing a chunk first.
    pub fn retire(&self, chunk_id: &str, version: &SourceVersion) -> Result<(), StoreError> {
        self.write()?
            .retired
            .insert(chunk_id.to_string(), version.clone());
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Unavailable("in-memory store lock poisoned".into()))
    }
}

fn in_category(chunk: &KnowledgeChunk, category: Option<&str>) -> bool {
    category.map_or(true, |c| chunk.category.eq_ignore_ascii_case(c))
}

#[async_trait]
impl KnowledgeStore for InMemoryStore {
    async fn get(&self, chunk_id: &str) -> Result<Option<KnowledgeChunk>, StoreError> {
        Ok(self.read()?.chunks.get(chunk_id).cloned())
    }

    async fn list_chunks(&self) -> Result<Vec<KnowledgeChunk>, StoreError> {
        Ok(self.read()?.chunks.values().cloned().collect())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.read()?.chunks.len())
    }

    async fn is_retired(&self, chunk_id: &str) -> Result<bool, StoreError> {
        Ok(self.read()?.retired.contains_key(chunk_id))
    }

    async fn retired_ids(&self) -> Result<Vec<String>, StoreError> {
        let mut ids: Vec<String> = self.read()?.retired.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    async fn upsert(&self, chunk: &KnowledgeChunk) -> Result<WriteEffect, StoreError> {
        self.write()?.upsert(chunk)
    }

    async fn delete(
        &self,
        chunk_id: &str,
        version: &SourceVersion,
    ) -> Result<WriteEffect, StoreError> {
        Ok(self.write()?.delete(chunk_id, version))
    }

    async fn apply_change(
        &self,
        write: &ChunkWrite,
        history: &SyncHistoryEntry,
    ) -> Result<WriteEffect, StoreError> {
        let mut state = self.write()?;
        let effect = match write {
            ChunkWrite::Upsert(chunk) => state.upsert(chunk)?,
            ChunkWrite::Delete { chunk_id, version } => state.delete(chunk_id, version),
        };
        if effect.changed() {
            state.history.push(history.clone());
        }
        Ok(effect)
    }

    async fn record_history(&self, entry: &SyncHistoryEntry) -> Result<(), StoreError> {
        self.write()?.history.push(entry.clone());
        Ok(())
    }

    async fn history(&self, limit: usize) -> Result<Vec<SyncHistoryEntry>, StoreError> {
        Ok(self.read()?.history.iter().rev().take(limit).cloned().collect())
    }

    async fn top_k_by_similarity(
        &self,
        query: &[f32],
        k: usize,
        category: Option<&str>,
    ) -> Result<Vec<ChunkCandidate>, StoreError> {
        let state = self.read()?;
        let mut candidates = Vec::new();
        for chunk in state.chunks.values() {
            if chunk.embedding.len() != query.len() {
                return Err(StoreError::DimensionMismatch {
                    configured: query.len(),
                    stored: vec![chunk.embedding.len()],
                });
            }
            if !in_category(chunk, category) {
                continue;
            }
            let sim = cosine_similarity(query, &chunk.embedding) as f64;
            candidates.push(ChunkCandidate::from_chunk(chunk, sim));
        }
        rank_candidates(&mut candidates, k);
        Ok(candidates)
    }

    async fn keyword_match(
        &self,
        terms: &[String],
        limit: usize,
        category: Option<&str>,
    ) -> Result<Vec<ChunkCandidate>, StoreError> {
        let state = self.read()?;
        let mut candidates: Vec<ChunkCandidate> = state
            .chunks
            .values()
            .filter(|c| in_category(c, category))
            .filter_map(|c| {
                let score = overlap_score(terms, &c.keyword_text());
                (score > 0.0).then(|| ChunkCandidate::from_chunk(c, score))
            })
            .collect();
        rank_candidates(&mut candidates, limit);
        Ok(candidates)
    }

    async fn dimension_census(&self) -> Result<Vec<DimensionCount>, StoreError> {
        let state = self.read()?;
        let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
        for chunk in state.chunks.values() {
            *counts.entry(chunk.embedding_dim).or_default() += 1;
        }
        Ok(counts
            .into_iter()
            .map(|(dims, chunks)| DimensionCount { dims, chunks })
            .collect())
    }

    async fn sync_state(&self) -> Result<SyncState, StoreError> {
        Ok(self.read()?.sync.clone())
    }

    async fn finalize_sync(
        &self,
        version: &SourceVersion,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.write()?;
        state.sync = SyncState {
            last_synced_version: Some(version.clone()),
            last_synced_at: Some(at),
        };
        Ok(())
    }

    async fn try_lock_sync(
        &self,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<LockAttempt, StoreError> {
        let mut state = self.write()?;
        if let Some((current, since)) = &state.lock {
            if current != holder && now - *since < ttl {
                return Ok(LockAttempt::Held {
                    holder: current.clone(),
                    since: *since,
                });
            }
        }
        state.lock = Some((holder.to_string(), now));
        Ok(LockAttempt::Acquired)
    }

    async fn unlock_sync(&self, holder: &str) -> Result<(), StoreError> {
        let mut state = self.write()?;
        if state.lock.as_ref().is_some_and(|(h, _)| h == holder) {
            state.lock = None;
        }
        Ok(())
    }
}
