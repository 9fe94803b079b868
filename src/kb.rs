//! Explicit resource handle for one knowledge base.
//!
//! [`KnowledgeBase::open`] builds the connection pool, the SQLite store and
//! the embedding provider from a [`Config`]; [`KnowledgeBase::close`] tears
//! the pool down. The change source is built on demand, since only sync
//! needs it and an HTTP source may require credentials.

use anyhow::Result;
use std::sync::Arc;

use kb_harness_core::changelog::ChangeSource;
use kb_harness_core::embedding::EmbeddingProvider;
use kb_harness_core::search::{self, SearchOutcome, SearchRequest};

use crate::changelog;
use crate::config::Config;
use crate::db;
use crate::embedding;
use crate::migrate;
use crate::sqlite_store::SqliteStore;
use crate::sync::{SyncEngine, SyncOptions, SyncRunSummary};

pub struct KnowledgeBase {
    config: Config,
    store: SqliteStore,
    provider: Arc<dyn EmbeddingProvider>,
}

impl KnowledgeBase {
    /// Opens the database (creating the schema if needed) and the provider.
    pub async fn open(config: &Config) -> Result<Self> {
        let provider = embedding::create_provider(&config.embedding)?;
        let pool = db::connect(config).await?;
        migrate::migrate_pool(&pool).await?;
        Ok(Self {
            config: config.clone(),
            store: SqliteStore::new(pool),
            provider,
        })
    }

    /// Same as [`open`](Self::open) with a caller-chosen provider.
    pub async fn open_with_provider(
        config: &Config,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self> {
        let pool = db::connect(config).await?;
        migrate::migrate_pool(&pool).await?;
        Ok(Self {
            config: config.clone(),
            store: SqliteStore::new(pool),
            provider,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &SqliteStore {
        &self.store
    }

    pub fn provider(&self) -> &dyn EmbeddingProvider {
        self.provider.as_ref()
    }

    pub fn change_source(&self) -> Result<Arc<dyn ChangeSource>> {
        changelog::create_source(&self.config.sync)
    }

    /// Hybrid search with the configured weights.
    pub async fn search(&self, query: &str, k: usize) -> Result<SearchOutcome> {
        self.search_with(&SearchRequest::new(query, k)).await
    }

    pub async fn search_with(&self, request: &SearchRequest<'_>) -> Result<SearchOutcome> {
        let params = self.config.retrieval.search_params()?;
        Ok(search::search(&self.store, self.provider(), request, &params).await)
    }

    /// Runs one sync pass against the configured change source.
    pub async fn trigger_sync(&self, force: bool) -> Result<SyncRunSummary> {
        self.sync_with(self.sync_options(force, false)?).await
    }

    /// Sync options from `[sync]` with the given run flags.
    pub fn sync_options(&self, force: bool, dry_run: bool) -> Result<SyncOptions> {
        Ok(SyncOptions::from_config(&self.config.sync, force, dry_run)?)
    }

    pub async fn sync_with(&self, options: SyncOptions) -> Result<SyncRunSummary> {
        let source = self.change_source()?;
        let engine = SyncEngine::new(&self.store, self.provider(), source.as_ref(), options);
        Ok(engine.run().await?)
    }

    pub async fn close(self) {
        self.store.pool().close().await;
    }
}
