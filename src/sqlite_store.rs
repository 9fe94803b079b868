//! SQLite-backed [`KnowledgeStore`] implementation.
//!
//! Chunks live in `knowledge_chunks` with their vector stored as a
//! little-endian `f32` BLOB. `chunks_fts` (FTS5) is used as a keyword
//! prefilter; candidates are then scored with the same term-overlap measure
//! as the in-memory store so both backends rank identically. Vector ranking
//! is an exact cosine scan.
//!
//! Every sync change runs in its own transaction: the chunk row, its FTS row,
//! the tombstone (for deletes) and the history row commit together.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use kb_harness_core::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use kb_harness_core::error::StoreError;
use kb_harness_core::keyword::overlap_score;
use kb_harness_core::models::{
    KnowledgeChunk, SourceVersion, SyncHistoryEntry, SyncOutcome, SyncState,
};
use kb_harness_core::store::{
    rank_candidates, ChunkCandidate, ChunkWrite, DimensionCount, KnowledgeStore, LockAttempt,
    WriteEffect,
};

/// SQLite implementation of the [`KnowledgeStore`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn unavailable(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

fn tx_failed(e: sqlx::Error) -> StoreError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(e.to_string())
        }
        other => StoreError::Transaction(other.to_string()),
    }
}

fn from_ts(ts: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp(ts, 0)
        .ok_or_else(|| StoreError::Corrupt(format!("invalid timestamp {ts}")))
}

const CHUNK_COLUMNS: &str = "chunk_id, category, subcategory, question, answer, tags_json, \
     location, embedding, embedding_dim, embedding_model, content_hash, updated_at, source_version";

fn chunk_from_row(row: &SqliteRow) -> Result<KnowledgeChunk, StoreError> {
    let chunk_id: String = row.get("chunk_id");
    let tags_json: String = row.get("tags_json");
    let tags: Vec<String> = serde_json::from_str(&tags_json)
        .map_err(|e| StoreError::Corrupt(format!("tags of `{chunk_id}`: {e}")))?;
    let blob: Vec<u8> = row.get("embedding");
    let dim: i64 = row.get("embedding_dim");
    let embedding = blob_to_vec(&blob);
    if embedding.len() as i64 != dim {
        return Err(StoreError::Corrupt(format!(
            "`{chunk_id}` declares {dim} dims but stores {}",
            embedding.len()
        )));
    }
    let version: String = row.get("source_version");
    Ok(KnowledgeChunk {
        category: row.get("category"),
        subcategory: row.get("subcategory"),
        question: row.get("question"),
        answer: row.get("answer"),
        tags,
        location: row.get("location"),
        embedding_dim: embedding.len(),
        embedding,
        embedding_model: row.get("embedding_model"),
        content_hash: row.get("content_hash"),
        updated_at: from_ts(row.get("updated_at"))?,
        source_version: SourceVersion::new(version),
        chunk_id,
    })
}

fn history_from_row(row: &SqliteRow) -> Result<SyncHistoryEntry, StoreError> {
    let outcome: String = row.get("outcome");
    let version: String = row.get("version");
    Ok(SyncHistoryEntry {
        change_id: row.get("change_id"),
        chunk_id: row.get("chunk_id"),
        change_type: row.get("change_type"),
        applied_at: from_ts(row.get("applied_at"))?,
        outcome: outcome.parse::<SyncOutcome>().map_err(StoreError::Corrupt)?,
        detail: row.get("detail"),
        version: SourceVersion::new(version),
    })
}

/// FTS5 expression matching any term as a prefix (so `hour` finds `hours`).
fn fts_query(terms: &[String]) -> String {
    terms
        .iter()
        .map(|t| format!("\"{}\"*", t.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" OR ")
}

async fn is_retired_in(conn: &mut SqliteConnection, chunk_id: &str) -> Result<bool, sqlx::Error> {
    let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM retired_chunks WHERE chunk_id = ?")
        .bind(chunk_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(found.is_some())
}

async fn write_chunk(
    conn: &mut SqliteConnection,
    chunk: &KnowledgeChunk,
) -> Result<WriteEffect, StoreError> {
    if is_retired_in(conn, &chunk.chunk_id).await.map_err(tx_failed)? {
        return Err(StoreError::Retired(chunk.chunk_id.clone()));
    }

    let existing = sqlx::query(
        "SELECT content_hash, embedding_dim, embedding_model FROM knowledge_chunks WHERE chunk_id = ?",
    )
    .bind(&chunk.chunk_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(tx_failed)?;

    let effect = match existing {
        Some(row) => {
            let hash: String = row.get("content_hash");
            let dim: i64 = row.get("embedding_dim");
            let model: String = row.get("embedding_model");
            if hash == chunk.content_hash
                && dim == chunk.embedding_dim as i64
                && model == chunk.embedding_model
            {
                return Ok(WriteEffect::Unchanged);
            }
            WriteEffect::Updated
        }
        None => WriteEffect::Inserted,
    };

    let tags_json = serde_json::to_string(&chunk.tags)
        .map_err(|e| StoreError::Transaction(format!("encode tags: {e}")))?;

    sqlx::query(
        r#"
        INSERT INTO knowledge_chunks (chunk_id, category, subcategory, question, answer,
                                      tags_json, location, embedding, embedding_dim,
                                      embedding_model, content_hash, updated_at, source_version)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(chunk_id) DO UPDATE SET
            category = excluded.category,
            subcategory = excluded.subcategory,
            question = excluded.question,
            answer = excluded.answer,
            tags_json = excluded.tags_json,
            location = excluded.location,
            embedding = excluded.embedding,
            embedding_dim = excluded.embedding_dim,
            embedding_model = excluded.embedding_model,
            content_hash = excluded.content_hash,
            updated_at = excluded.updated_at,
            source_version = excluded.source_version
        "#,
    )
    .bind(&chunk.chunk_id)
    .bind(&chunk.category)
    .bind(&chunk.subcategory)
    .bind(&chunk.question)
    .bind(&chunk.answer)
    .bind(&tags_json)
    .bind(&chunk.location)
    .bind(vec_to_blob(&chunk.embedding))
    .bind(chunk.embedding_dim as i64)
    .bind(&chunk.embedding_model)
    .bind(&chunk.content_hash)
    .bind(chunk.updated_at.timestamp())
    .bind(chunk.source_version.as_str())
    .execute(&mut *conn)
    .await
    .map_err(tx_failed)?;

    sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
        .bind(&chunk.chunk_id)
        .execute(&mut *conn)
        .await
        .map_err(tx_failed)?;
    sqlx::query("INSERT INTO chunks_fts (chunk_id, text) VALUES (?, ?)")
        .bind(&chunk.chunk_id)
        .bind(chunk.keyword_text())
        .execute(&mut *conn)
        .await
        .map_err(tx_failed)?;

    Ok(effect)
}

async fn delete_chunk(
    conn: &mut SqliteConnection,
    chunk_id: &str,
    version: &SourceVersion,
) -> Result<WriteEffect, StoreError> {
    let result = sqlx::query("DELETE FROM knowledge_chunks WHERE chunk_id = ?")
        .bind(chunk_id)
        .execute(&mut *conn)
        .await
        .map_err(tx_failed)?;
    if result.rows_affected() == 0 {
        return Ok(WriteEffect::Missing);
    }

    sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
        .bind(chunk_id)
        .execute(&mut *conn)
        .await
        .map_err(tx_failed)?;
    sqlx::query(
        "INSERT OR REPLACE INTO retired_chunks (chunk_id, retired_at, version) VALUES (?, ?, ?)",
    )
    .bind(chunk_id)
    .bind(Utc::now().timestamp())
    .bind(version.as_str())
    .execute(&mut *conn)
    .await
    .map_err(tx_failed)?;

    Ok(WriteEffect::Deleted)
}

async fn insert_history(
    conn: &mut SqliteConnection,
    entry: &SyncHistoryEntry,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO sync_history (change_id, chunk_id, change_type, applied_at, outcome, detail, version)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&entry.change_id)
    .bind(&entry.chunk_id)
    .bind(&entry.change_type)
    .bind(entry.applied_at.timestamp())
    .bind(entry.outcome.as_str())
    .bind(&entry.detail)
    .bind(entry.version.as_str())
    .execute(&mut *conn)
    .await
    .map_err(tx_failed)?;
    Ok(())
}

#[async_trait]
impl KnowledgeStore for SqliteStore {
    async fn get(&self, chunk_id: &str) -> Result<Option<KnowledgeChunk>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM knowledge_chunks WHERE chunk_id = ?"
        ))
        .bind(chunk_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(unavailable)?;
        row.as_ref().map(chunk_from_row).transpose()
    }

    async fn list_chunks(&self) -> Result<Vec<KnowledgeChunk>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM knowledge_chunks ORDER BY chunk_id ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        rows.iter().map(chunk_from_row).collect()
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM knowledge_chunks")
            .fetch_one(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(n as usize)
    }

    async fn is_retired(&self, chunk_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.pool.acquire().await.map_err(unavailable)?;
        is_retired_in(&mut conn, chunk_id).await.map_err(unavailable)
    }

    async fn retired_ids(&self) -> Result<Vec<String>, StoreError> {
        sqlx::query_scalar("SELECT chunk_id FROM retired_chunks ORDER BY chunk_id ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)
    }

    async fn upsert(&self, chunk: &KnowledgeChunk) -> Result<WriteEffect, StoreError> {
        let mut tx = self.pool.begin().await.map_err(tx_failed)?;
        let effect = write_chunk(&mut tx, chunk).await?;
        tx.commit().await.map_err(tx_failed)?;
        Ok(effect)
    }

    async fn delete(
        &self,
        chunk_id: &str,
        version: &SourceVersion,
    ) -> Result<WriteEffect, StoreError> {
        let mut tx = self.pool.begin().await.map_err(tx_failed)?;
        let effect = delete_chunk(&mut tx, chunk_id, version).await?;
        tx.commit().await.map_err(tx_failed)?;
        Ok(effect)
    }

    async fn apply_change(
        &self,
        write: &ChunkWrite,
        history: &SyncHistoryEntry,
    ) -> Result<WriteEffect, StoreError> {
        // Dropping `tx` on any early return rolls the whole change back.
        let mut tx = self.pool.begin().await.map_err(tx_failed)?;
        let effect = match write {
            ChunkWrite::Upsert(chunk) => write_chunk(&mut tx, chunk).await?,
            ChunkWrite::Delete { chunk_id, version } => {
                delete_chunk(&mut tx, chunk_id, version).await?
            }
        };
        if effect.changed() {
            insert_history(&mut tx, history).await?;
        }
        tx.commit().await.map_err(tx_failed)?;
        Ok(effect)
    }

    async fn record_history(&self, entry: &SyncHistoryEntry) -> Result<(), StoreError> {
        let mut conn = self.pool.acquire().await.map_err(unavailable)?;
        insert_history(&mut conn, entry).await
    }

    async fn history(&self, limit: usize) -> Result<Vec<SyncHistoryEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT change_id, chunk_id, change_type, applied_at, outcome, detail, version
            FROM sync_history
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        rows.iter().map(history_from_row).collect()
    }

    async fn top_k_by_similarity(
        &self,
        query: &[f32],
        k: usize,
        category: Option<&str>,
    ) -> Result<Vec<ChunkCandidate>, StoreError> {
        let rows = sqlx::query(
            "SELECT chunk_id, category, subcategory, question, answer, location, embedding \
             FROM knowledge_chunks",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("embedding");
            let vec = blob_to_vec(&blob);
            if vec.len() != query.len() {
                return Err(StoreError::DimensionMismatch {
                    configured: query.len(),
                    stored: vec![vec.len()],
                });
            }
            let chunk_category: String = row.get("category");
            if let Some(c) = category {
                if !chunk_category.eq_ignore_ascii_case(c) {
                    continue;
                }
            }
            candidates.push(ChunkCandidate {
                chunk_id: row.get("chunk_id"),
                raw_score: cosine_similarity(query, &vec) as f64,
                question: row.get("question"),
                answer: row.get("answer"),
                category: chunk_category,
                subcategory: row.get("subcategory"),
                location: row.get("location"),
            });
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
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT k.chunk_id, k.category, k.subcategory, k.question, k.answer, k.tags_json,
                   k.location
            FROM chunks_fts f
            JOIN knowledge_chunks k ON k.chunk_id = f.chunk_id
            WHERE chunks_fts MATCH ?
              AND (? IS NULL OR k.category = ? COLLATE NOCASE)
            "#,
        )
        .bind(fts_query(terms))
        .bind(category)
        .bind(category)
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        let mut candidates = Vec::with_capacity(rows.len());
        for row in &rows {
            let question: String = row.get("question");
            let answer: String = row.get("answer");
            let tags_json: String = row.get("tags_json");
            let tags: Vec<String> = serde_json::from_str(&tags_json)
                .map_err(|e| StoreError::Corrupt(format!("tags: {e}")))?;
            let text = format!("{question}\n{answer}\n{}", tags.join(" "));
            let score = overlap_score(terms, &text);
            if score <= 0.0 {
                continue;
            }
            candidates.push(ChunkCandidate {
                chunk_id: row.get("chunk_id"),
                raw_score: score,
                question,
                answer,
                category: row.get("category"),
                subcategory: row.get("subcategory"),
                location: row.get("location"),
            });
        }

        rank_candidates(&mut candidates, limit);
        Ok(candidates)
    }

    async fn dimension_census(&self) -> Result<Vec<DimensionCount>, StoreError> {
        let rows = sqlx::query(
            "SELECT embedding_dim, COUNT(*) AS n FROM knowledge_chunks GROUP BY embedding_dim ORDER BY embedding_dim",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(rows
            .iter()
            .map(|r| {
                let dims: i64 = r.get("embedding_dim");
                let n: i64 = r.get("n");
                DimensionCount {
                    dims: dims as usize,
                    chunks: n as usize,
                }
            })
            .collect())
    }

    async fn sync_state(&self) -> Result<SyncState, StoreError> {
        let row = sqlx::query("SELECT last_synced_version, last_synced_at FROM sync_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;
        let Some(row) = row else {
            return Ok(SyncState::default());
        };
        let version: Option<String> = row.get("last_synced_version");
        let at: Option<i64> = row.get("last_synced_at");
        Ok(SyncState {
            last_synced_version: version.map(SourceVersion::new),
            last_synced_at: at.map(from_ts).transpose()?,
        })
    }

    async fn finalize_sync(
        &self,
        version: &SourceVersion,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (id, last_synced_version, last_synced_at) VALUES (1, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                last_synced_version = excluded.last_synced_version,
                last_synced_at = excluded.last_synced_at
            "#,
        )
        .bind(version.as_str())
        .bind(at.timestamp())
        .execute(&self.pool)
        .await
        .map_err(tx_failed)?;
        Ok(())
    }

    async fn try_lock_sync(
        &self,
        holder: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<LockAttempt, StoreError> {
        let stale_before = (now - ttl).timestamp();
        let result = sqlx::query(
            r#"
            UPDATE sync_state SET lock_holder = ?, lock_acquired_at = ?
            WHERE id = 1
              AND (lock_holder IS NULL OR lock_holder = ? OR lock_acquired_at <= ?)
            "#,
        )
        .bind(holder)
        .bind(now.timestamp())
        .bind(holder)
        .bind(stale_before)
        .execute(&self.pool)
        .await
        .map_err(tx_failed)?;

        if result.rows_affected() == 1 {
            return Ok(LockAttempt::Acquired);
        }

        let row = sqlx::query("SELECT lock_holder, lock_acquired_at FROM sync_state WHERE id = 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?
            .ok_or_else(|| StoreError::Corrupt("sync_state row missing; run `kb init`".into()))?;
        let holder: Option<String> = row.get("lock_holder");
        let since: Option<i64> = row.get("lock_acquired_at");
        Ok(LockAttempt::Held {
            holder: holder.unwrap_or_default(),
            since: from_ts(since.unwrap_or_default())?,
        })
    }

    async fn unlock_sync(&self, holder: &str) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE sync_state SET lock_holder = NULL, lock_acquired_at = NULL WHERE id = 1 AND lock_holder = ?",
        )
        .bind(holder)
        .execute(&self.pool)
        .await
        .map_err(tx_failed)?;
        Ok(())
    }
}
