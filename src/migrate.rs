use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Creates every table and index. Safe to run repeatedly.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Live chunks. Timestamps are unix seconds.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS knowledge_chunks (
            chunk_id TEXT PRIMARY KEY,
            category TEXT NOT NULL,
            subcategory TEXT NOT NULL,
            question TEXT NOT NULL,
            answer TEXT NOT NULL,
            tags_json TEXT NOT NULL DEFAULT '[]',
            location TEXT,
            embedding BLOB NOT NULL,
            embedding_dim INTEGER NOT NULL,
            embedding_model TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            source_version TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Databases created before locations were stored lack the column
    let has_location: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM pragma_table_info('knowledge_chunks') WHERE name = 'location'",
    )
    .fetch_one(pool)
    .await?;
    if !has_location {
        sqlx::query("ALTER TABLE knowledge_chunks ADD COLUMN location TEXT")
            .execute(pool)
            .await?;
    }

    // Deleted ids; never reused
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS retired_chunks (
            chunk_id TEXT PRIMARY KEY,
            retired_at INTEGER NOT NULL,
            version TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Singleton progress marker plus the advisory sync lock
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_state (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            last_synced_version TEXT,
            last_synced_at INTEGER,
            lock_holder TEXT,
            lock_acquired_at INTEGER
        )
        "#,
    )
    .execute(pool)
    .await?;
    sqlx::query("INSERT OR IGNORE INTO sync_state (id) VALUES (1)")
        .execute(pool)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sync_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            change_id TEXT NOT NULL,
            chunk_id TEXT NOT NULL,
            change_type TEXT NOT NULL,
            applied_at INTEGER NOT NULL,
            outcome TEXT NOT NULL,
            detail TEXT,
            version TEXT NOT NULL DEFAULT ''
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_knowledge_chunks_category ON knowledge_chunks(category)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_knowledge_chunks_dim ON knowledge_chunks(embedding_dim)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_sync_history_chunk ON sync_history(chunk_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
