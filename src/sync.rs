//! Sync engine.
//!
//! Applies pending change-log entries to a [`KnowledgeStore`] one at a time,
//! in source order:
//!
//! ```text
//! Idle → CheckVersion → UpToDate ──────────────────────→ Idle
//!                     └→ Applying → Finalizing ────────→ Idle
//!                          │            │
//!                          └────────────┴→ Failed (SyncError)
//! ```
//!
//! Each entry is its own transaction: the chunk write and its `applied`
//! history row land together or not at all. A failing entry is recorded as
//! `rolled-back` and the run continues. Once every entry has been processed
//! the version marker advances, even if every entry rolled back: rolled-back
//! entries are terminal for their version and need a new upstream entry.
//! Only a failure of the run itself (unreachable source, lost audit row,
//! store outage) leaves the marker where it was.
//!
//! Only one run may hold the store's sync lock at a time. Dry runs take no
//! lock and replay the batch against an in-memory copy of the store without
//! calling the embedding provider.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use kb_harness_core::changelog::{
    read_pending, ChangeAction, ChangeLogEntry, ChangeSource, ValidatedChange,
};
use kb_harness_core::embedding::{EmbedPurpose, EmbeddingProvider};
use kb_harness_core::error::{
    ConfigError, EmbeddingError, StoreError, SyncError, ValidationError,
};
use kb_harness_core::models::{
    ChunkContent, KnowledgeChunk, SourceVersion, SyncHistoryEntry, SyncOutcome,
};
use kb_harness_core::store::memory::InMemoryStore;
use kb_harness_core::store::{check_dimensions, ChunkWrite, KnowledgeStore, LockAttempt, WriteEffect};

use crate::config::SyncConfig;

/// Knobs for one sync run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Re-read every entry regardless of the stored version marker.
    pub force: bool,
    pub dry_run: bool,
    /// Attempts per entry for retryable failures.
    pub max_attempts: u32,
    pub lock_ttl: chrono::Duration,
    /// Delay before the second attempt; doubled for each one after.
    pub retry_delay: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            force: false,
            dry_run: false,
            max_attempts: 3,
            lock_ttl: chrono::Duration::hours(1),
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// Upper bound for `sync.lock_ttl_secs` (one year).
pub const MAX_LOCK_TTL_SECS: u64 = 366 * 24 * 60 * 60;

/// Converts a configured lock TTL, rejecting zero and anything past
/// [`MAX_LOCK_TTL_SECS`].
pub fn lock_ttl(secs: u64) -> Result<chrono::Duration, ConfigError> {
    if secs == 0 || secs > MAX_LOCK_TTL_SECS {
        return Err(ConfigError::LockTtlOutOfRange {
            secs,
            max: MAX_LOCK_TTL_SECS,
        });
    }
    let secs = i64::try_from(secs).map_err(|_| ConfigError::LockTtlOutOfRange {
        secs,
        max: MAX_LOCK_TTL_SECS,
    })?;
    Ok(chrono::Duration::seconds(secs))
}

impl SyncOptions {
    pub fn from_config(
        config: &SyncConfig,
        force: bool,
        dry_run: bool,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            force,
            dry_run,
            max_attempts: config.max_attempts.max(1),
            lock_ttl: lock_ttl(config.lock_ttl_secs)?,
            ..Default::default()
        })
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    /// Source version equals the stored marker; nothing was read or written.
    UpToDate,
    /// Entries processed and the version marker advanced.
    Synced,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::UpToDate => "up-to-date",
            RunStatus::Synced => "synced",
        }
    }
}

/// What happened to one change entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntryOutcome {
    Applied,
    /// Identical state already stored. No write, no history row.
    Unchanged,
    /// Older than the chunk's recorded version.
    Skipped,
    RolledBack,
}

#[derive(Debug, Clone, Serialize)]
pub struct EntryReport {
    pub change_id: String,
    pub chunk_id: String,
    pub change_type: String,
    pub outcome: EntryOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Result of one sync run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    /// Change source the run read from.
    pub source: String,
    pub status: RunStatus,
    pub applied_count: usize,
    pub rolled_back_count: usize,
    pub skipped_count: usize,
    pub unchanged_count: usize,
    /// Version marker stored after the run.
    pub final_version: Option<SourceVersion>,
    /// Version observed at the source.
    pub source_version: SourceVersion,
    pub dry_run: bool,
    pub outcomes: Vec<EntryReport>,
}

impl SyncRunSummary {
    fn new(source: String, source_version: SourceVersion, dry_run: bool) -> Self {
        Self {
            source,
            status: RunStatus::Synced,
            applied_count: 0,
            rolled_back_count: 0,
            skipped_count: 0,
            unchanged_count: 0,
            final_version: None,
            source_version,
            dry_run,
            outcomes: Vec::new(),
        }
    }

    fn record(&mut self, report: EntryReport) {
        match report.outcome {
            EntryOutcome::Applied => self.applied_count += 1,
            EntryOutcome::Unchanged => self.unchanged_count += 1,
            EntryOutcome::Skipped => self.skipped_count += 1,
            EntryOutcome::RolledBack => self.rolled_back_count += 1,
        }
        self.outcomes.push(report);
    }
}

/// Per-entry failure. Converted into a `rolled-back` audit row.
#[derive(Debug)]
enum ApplyError {
    Invalid(ValidationError),
    Embedding(EmbeddingError),
    Store(StoreError),
}

impl ApplyError {
    fn is_retryable(&self) -> bool {
        match self {
            ApplyError::Invalid(_) => false,
            ApplyError::Embedding(e) => e.is_transient(),
            ApplyError::Store(e) => e.is_retryable(),
        }
    }

    fn detail(&self) -> String {
        match self {
            ApplyError::Invalid(e) => e.to_string(),
            ApplyError::Embedding(e) => e.to_string(),
            ApplyError::Store(StoreError::Retired(id)) => {
                ValidationError::RetiredChunkId(id.clone()).to_string()
            }
            ApplyError::Store(e) => e.to_string(),
        }
    }
}

impl From<ValidationError> for ApplyError {
    fn from(e: ValidationError) -> Self {
        ApplyError::Invalid(e)
    }
}

impl From<StoreError> for ApplyError {
    fn from(e: StoreError) -> Self {
        ApplyError::Store(e)
    }
}

/// Non-failure results of [`SyncEngine::try_apply`].
enum Applied {
    Written(WriteEffect),
    Stale { stored: SourceVersion },
}

/// Reconciles a store with a change source.
pub struct SyncEngine<'a> {
    store: &'a dyn KnowledgeStore,
    provider: &'a dyn EmbeddingProvider,
    source: &'a dyn ChangeSource,
    options: SyncOptions,
}

impl<'a> SyncEngine<'a> {
    pub fn new(
        store: &'a dyn KnowledgeStore,
        provider: &'a dyn EmbeddingProvider,
        source: &'a dyn ChangeSource,
        options: SyncOptions,
    ) -> Self {
        Self {
            store,
            provider,
            source,
            options,
        }
    }

    /// Runs one sync pass.
    ///
    /// Fails as a whole only when the lock is held, the provider is disabled
    /// or mismatched, the change source cannot be read, or the final marker
    /// write fails. Per-entry failures land in the summary.
    pub async fn run(&self) -> Result<SyncRunSummary, SyncError> {
        if self.options.dry_run {
            let overlay = InMemoryStore::snapshot_of(self.store).await?;
            return self.run_unlocked(&overlay).await;
        }

        let holder = format!("sync-{}", Uuid::new_v4());
        match self
            .store
            .try_lock_sync(&holder, Utc::now(), self.options.lock_ttl)
            .await?
        {
            LockAttempt::Acquired => debug!(%holder, "sync lock acquired"),
            LockAttempt::Held { holder, since } => {
                warn!(%holder, %since, "sync already running");
                return Err(SyncError::AlreadyRunning { holder });
            }
        }

        let result = self.run_unlocked(self.store).await;

        if let Err(e) = self.store.unlock_sync(&holder).await {
            error!(%holder, error = %e, "failed to release sync lock");
        }
        result
    }

    async fn run_unlocked(&self, store: &dyn KnowledgeStore) -> Result<SyncRunSummary, SyncError> {
        if !self.provider.is_enabled() {
            return Err(SyncError::ProviderUnavailable(
                "embedding provider is disabled; configure [embedding] to sync".to_string(),
            ));
        }
        check_dimensions(&store.dimension_census().await?, self.provider.dims())?;

        // CheckVersion
        let state = store.sync_state().await?;
        let since = if self.options.force {
            None
        } else {
            state.last_synced_version.as_ref()
        };
        let pending = read_pending(self.source, since).await.map_err(|e| {
            error!(source = %self.source.describe(), error = %e, "change source unreachable");
            SyncError::from(e)
        })?;

        let mut summary = SyncRunSummary::new(
            self.source.describe(),
            pending.current_version.clone(),
            self.options.dry_run,
        );
        if pending.is_up_to_date(since) {
            info!(version = %pending.current_version, "knowledge base up to date");
            summary.status = RunStatus::UpToDate;
            summary.final_version = state.last_synced_version;
            return Ok(summary);
        }

        info!(
            since = since.map(|v| v.as_str()).unwrap_or("<none>"),
            version = %pending.current_version,
            entries = pending.entries.len(),
            dry_run = self.options.dry_run,
            "applying change log"
        );

        // Applying
        for entry in &pending.entries {
            let report = self.apply_entry(store, entry).await?;
            summary.record(report);
        }

        // Finalizing
        if summary.rolled_back_count > 0 && summary.rolled_back_count == summary.outcomes.len() {
            warn!(
                version = %pending.current_version,
                rolled_back = summary.rolled_back_count,
                "every entry rolled back"
            );
        }
        if !self.options.dry_run {
            store
                .finalize_sync(&pending.current_version, Utc::now())
                .await?;
        }
        summary.final_version = Some(pending.current_version.clone());

        info!(
            applied = summary.applied_count,
            rolled_back = summary.rolled_back_count,
            skipped = summary.skipped_count,
            unchanged = summary.unchanged_count,
            "sync run finished"
        );
        Ok(summary)
    }

    /// Validates and applies one entry, retrying retryable failures.
    ///
    /// Errs only when the audit row for an entry that was not applied cannot
    /// be written.
    async fn apply_entry(
        &self,
        store: &dyn KnowledgeStore,
        entry: &ChangeLogEntry,
    ) -> Result<EntryReport, StoreError> {
        let mut report = EntryReport {
            change_id: entry.change_id.clone(),
            chunk_id: entry.chunk_id.clone(),
            change_type: entry.change_type_label(),
            outcome: EntryOutcome::RolledBack,
            detail: None,
        };

        let change = match entry.validate() {
            Ok(change) => change,
            Err(e) => {
                return self
                    .finish(store, report, entry.version(), Err(ApplyError::Invalid(e)))
                    .await
            }
        };

        let mut attempt = 1;
        let result = loop {
            match self.try_apply(store, &change).await {
                Err(e) if e.is_retryable() && attempt < self.options.max_attempts => {
                    let delay = self.options.retry_delay * 2u32.saturating_pow(attempt - 1);
                    warn!(
                        change_id = %change.change_id,
                        attempt,
                        error = %e.detail(),
                        "retrying change in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => break other,
            }
        };
        self.finish(store, report, change.version, result).await
    }

    /// Turns an apply result into a report, writing the audit row for
    /// skipped and rolled-back entries.
    async fn finish(
        &self,
        store: &dyn KnowledgeStore,
        mut report: EntryReport,
        version: SourceVersion,
        result: Result<Applied, ApplyError>,
    ) -> Result<EntryReport, StoreError> {
        let outcome = match result {
            Ok(Applied::Written(effect)) => {
                report.outcome = if effect.changed() {
                    EntryOutcome::Applied
                } else {
                    EntryOutcome::Unchanged
                };
                debug!(
                    change_id = %report.change_id,
                    chunk_id = %report.chunk_id,
                    outcome = ?report.outcome,
                    "change processed"
                );
                return Ok(report);
            }
            Ok(Applied::Stale { stored }) => {
                report.outcome = EntryOutcome::Skipped;
                report.detail = Some(format!(
                    "entry version {version} is older than stored version {stored}"
                ));
                SyncOutcome::Skipped
            }
            Err(e) => {
                report.outcome = EntryOutcome::RolledBack;
                report.detail = Some(e.detail());
                SyncOutcome::RolledBack
            }
        };

        warn!(
            change_id = %report.change_id,
            chunk_id = %report.chunk_id,
            outcome = outcome.as_str(),
            detail = report.detail.as_deref().unwrap_or(""),
            "change not applied"
        );
        let history = SyncHistoryEntry {
            change_id: report.change_id.clone(),
            chunk_id: report.chunk_id.clone(),
            change_type: report.change_type.clone(),
            applied_at: Utc::now(),
            outcome,
            detail: report.detail.clone(),
            version,
        };
        if let Err(e) = store.record_history(&history).await {
            error!(change_id = %report.change_id, error = %e, "failed to record history");
            return Err(e);
        }
        Ok(report)
    }

    /// One attempt at a validated change, as a single store transaction.
    async fn try_apply(
        &self,
        store: &dyn KnowledgeStore,
        change: &ValidatedChange,
    ) -> Result<Applied, ApplyError> {
        let existing = store.get(&change.chunk_id).await?;
        if let Some(current) = &existing {
            if change.version < current.source_version {
                return Ok(Applied::Stale {
                    stored: current.source_version.clone(),
                });
            }
        }

        let write = match &change.action {
            ChangeAction::Create(content) => {
                if existing.is_none() && store.is_retired(&change.chunk_id).await? {
                    return Err(ValidationError::RetiredChunkId(change.chunk_id.clone()).into());
                }
                let chunk = self
                    .build_chunk(change, content.clone(), existing.as_ref())
                    .await?;
                ChunkWrite::Upsert(chunk)
            }
            ChangeAction::Update(patch) => {
                let current = existing
                    .as_ref()
                    .ok_or_else(|| ValidationError::ChunkNotFound(change.chunk_id.clone()))?;
                let content = patch.apply(&current.content());
                content.validate()?;
                let chunk = self.build_chunk(change, content, Some(current)).await?;
                ChunkWrite::Upsert(chunk)
            }
            ChangeAction::Delete => {
                if existing.is_none() {
                    if store.is_retired(&change.chunk_id).await? {
                        return Ok(Applied::Written(WriteEffect::Unchanged));
                    }
                    return Err(ValidationError::ChunkNotFound(change.chunk_id.clone()).into());
                }
                ChunkWrite::Delete {
                    chunk_id: change.chunk_id.clone(),
                    version: change.version.clone(),
                }
            }
        };

        let history = SyncHistoryEntry {
            change_id: change.change_id.clone(),
            chunk_id: change.chunk_id.clone(),
            change_type: change.action.kind().as_str().to_string(),
            applied_at: Utc::now(),
            outcome: SyncOutcome::Applied,
            detail: None,
            version: change.version.clone(),
        };
        match store.apply_change(&write, &history).await? {
            WriteEffect::Missing => {
                Err(ValidationError::ChunkNotFound(change.chunk_id.clone()).into())
            }
            effect => Ok(Applied::Written(effect)),
        }
    }

    /// Builds the resulting chunk, reusing the stored vector when the
    /// embedded text, dimension and model are all unchanged.
    async fn build_chunk(
        &self,
        change: &ValidatedChange,
        content: ChunkContent,
        existing: Option<&KnowledgeChunk>,
    ) -> Result<KnowledgeChunk, ApplyError> {
        let model = self.provider.model_name();
        let dims = self.provider.dims();
        let text = content.embed_text();

        let reusable = existing.filter(|c| {
            c.embed_text() == text && c.embedding_dim == dims && c.embedding_model == model
        });
        let embedding = match reusable {
            Some(current) => current.embedding.clone(),
            None if self.options.dry_run => vec![0.0; dims],
            None => self
                .provider
                .embed(&text, EmbedPurpose::Document)
                .await
                .map_err(ApplyError::Embedding)?,
        };
        if embedding.len() != dims {
            return Err(ApplyError::Embedding(EmbeddingError::DimensionMismatch {
                expected: dims,
                got: embedding.len(),
            }));
        }

        Ok(KnowledgeChunk::new(
            change.chunk_id.clone(),
            content,
            embedding,
            model,
            change.version.clone(),
        ))
    }
}

/// Prints a run summary in the CLI's report format.
pub fn print_summary(summary: &SyncRunSummary) {
    if summary.dry_run {
        println!("sync {} (dry-run)", summary.source);
    } else {
        println!("sync {}", summary.source);
    }
    println!("  status: {}", summary.status.as_str());
    println!("  source version: {}", summary.source_version);
    if summary.status != RunStatus::UpToDate {
        println!("  applied: {}", summary.applied_count);
        println!("  unchanged: {}", summary.unchanged_count);
        println!("  skipped: {}", summary.skipped_count);
        println!("  rolled back: {}", summary.rolled_back_count);
        for report in summary
            .outcomes
            .iter()
            .filter(|r| matches!(r.outcome, EntryOutcome::RolledBack | EntryOutcome::Skipped))
        {
            println!(
                "    {} {} {} [{:?}]: {}",
                report.change_id,
                report.change_type,
                report.chunk_id,
                report.outcome,
                report.detail.as_deref().unwrap_or("")
            );
        }
    }
    match &summary.final_version {
        Some(v) => println!("  synced version: {}", v),
        None => println!("  synced version: (none)"),
    }
    println!("ok");
}
