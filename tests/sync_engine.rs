use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

use kb_harness::sync::{EntryOutcome, RunStatus, SyncEngine, SyncOptions};
use kb_harness_core::changelog::{entries_from_rows, ChangeLogEntry, ChangeSource};
use kb_harness_core::embedding::{EmbedPurpose, EmbeddingProvider, HashEmbedder};
use kb_harness_core::error::{ChangeSourceError, EmbeddingError, StoreError, SyncError};
use kb_harness_core::models::{
    ChunkContent, KnowledgeChunk, SourceVersion, SyncHistoryEntry, SyncOutcome, SyncState,
};
use kb_harness_core::store::memory::InMemoryStore;
use kb_harness_core::store::{
    ChunkCandidate, ChunkWrite, DimensionCount, KnowledgeStore, LockAttempt, WriteEffect,
};

const DIMS: usize = 128;

fn v(s: &str) -> SourceVersion {
    SourceVersion::new(s)
}

/// Change log held in memory.
struct FixedSource {
    version: SourceVersion,
    rows: Vec<Value>,
    reachable: bool,
}

impl FixedSource {
    fn new(version: &str, rows: Vec<Value>) -> Self {
        Self {
            version: v(version),
            rows,
            reachable: true,
        }
    }

    fn unreachable() -> Self {
        Self {
            version: v("0"),
            rows: Vec::new(),
            reachable: false,
        }
    }
}

#[async_trait]
impl ChangeSource for FixedSource {
    fn describe(&self) -> String {
        "fixed".to_string()
    }

    async fn current_version(&self) -> Result<SourceVersion, ChangeSourceError> {
        if !self.reachable {
            return Err(ChangeSourceError::Unreachable("connection refused".into()));
        }
        Ok(self.version.clone())
    }

    async fn read_entries(
        &self,
        _since: Option<&SourceVersion>,
        current: &SourceVersion,
    ) -> Result<Vec<ChangeLogEntry>, ChangeSourceError> {
        Ok(entries_from_rows(self.rows.clone(), current))
    }
}

/// Fails the first `failures` calls with a transient error.
struct FlakyEmbedder {
    inner: HashEmbedder,
    failures: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for FlakyEmbedder {
    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dims(&self) -> usize {
        self.inner.dims()
    }

    async fn embed_batch(
        &self,
        texts: &[String],
        purpose: EmbedPurpose,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(EmbeddingError::Transient("HTTP 429".into()));
        }
        self.inner.embed_batch(texts, purpose).await
    }
}

/// In-memory store whose standalone audit writes always fail.
struct AuditDownStore(InMemoryStore);

#[async_trait]
impl KnowledgeStore for AuditDownStore {
    async fn get(&self, chunk_id: &str) -> Result<Option<KnowledgeChunk>, StoreError> {
        self.0.get(chunk_id).await
    }

    async fn list_chunks(&self) -> Result<Vec<KnowledgeChunk>, StoreError> {
        self.0.list_chunks().await
    }

    async fn count(&self) -> Result<usize, StoreError> {
        self.0.count().await
    }

    async fn is_retired(&self, chunk_id: &str) -> Result<bool, StoreError> {
        self.0.is_retired(chunk_id).await
    }

    async fn retired_ids(&self) -> Result<Vec<String>, StoreError> {
        self.0.retired_ids().await
    }

    async fn upsert(&self, chunk: &KnowledgeChunk) -> Result<WriteEffect, StoreError> {
        self.0.upsert(chunk).await
    }

    async fn delete(
        &self,
        chunk_id: &str,
        version: &SourceVersion,
    ) -> Result<WriteEffect, StoreError> {
        self.0.delete(chunk_id, version).await
    }

    async fn apply_change(
        &self,
        write: &ChunkWrite,
        history: &SyncHistoryEntry,
    ) -> Result<WriteEffect, StoreError> {
        self.0.apply_change(write, history).await
    }

    async fn record_history(&self, _entry: &SyncHistoryEntry) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk I/O error".into()))
    }

    async fn history(&self, limit: usize) -> Result<Vec<SyncHistoryEntry>, StoreError> {
        self.0.history(limit).await
    }

    async fn top_k_by_similarity(
        &self,
        query: &[f32],
        k: usize,
        category: Option<&str>,
    ) -> Result<Vec<ChunkCandidate>, StoreError> {
        self.0.top_k_by_similarity(query, k, category).await
    }

    async fn keyword_match(
        &self,
        terms: &[String],
        limit: usize,
        category: Option<&str>,
    ) -> Result<Vec<ChunkCandidate>, StoreError> {
        self.0.keyword_match(terms, limit, category).await
    }

    async fn dimension_census(&self) -> Result<Vec<DimensionCount>, StoreError> {
        self.0.dimension_census().await
    }

    async fn sync_state(&self) -> Result<SyncState, StoreError> {
        self.0.sync_state().await
    }

    async fn finalize_sync(
        &self,
        version: &SourceVersion,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.0.finalize_sync(version, at).await
    }

    async fn try_lock_sync(
        &self,
        holder: &str,
        now: DateTime<Utc>,
        ttl: chrono::Duration,
    ) -> Result<LockAttempt, StoreError> {
        self.0.try_lock_sync(holder, now, ttl).await
    }

    async fn unlock_sync(&self, holder: &str) -> Result<(), StoreError> {
        self.0.unlock_sync(holder).await
    }
}

fn options() -> SyncOptions {
    SyncOptions {
        retry_delay: Duration::ZERO,
        ..Default::default()
    }
}

fn chunk(id: &str, question: &str, answer: &str, version: &str) -> KnowledgeChunk {
    let content = ChunkContent {
        category: "FAQ".into(),
        subcategory: "General".into(),
        question: question.into(),
        answer: answer.into(),
        tags: Vec::new(),
        location: None,
    };
    let embedding = HashEmbedder::new(DIMS).embed_sync(&content.embed_text());
    KnowledgeChunk::new(id, content, embedding, format!("fnv1a-{DIMS}"), v(version))
}

async fn seeded_store() -> InMemoryStore {
    let store = InMemoryStore::new();
    store
        .upsert(&chunk(
            "scb_faq_141",
            "How much does a jump pass cost?",
            "$15 +tax per hour",
            "1",
        ))
        .await
        .unwrap();
    store
        .upsert(&chunk(
            "scb_contact_003",
            "What is your phone number?",
            "289-454-5555",
            "1",
        ))
        .await
        .unwrap();
    store.finalize_sync(&v("1"), Utc::now()).await.unwrap();
    store
}

fn update_and_bad_delete() -> FixedSource {
    FixedSource::new(
        "2",
        vec![
            json!({"change_id": "c1", "chunk_id": "scb_faq_141", "change_type": "update",
                   "new_value": {"answer": "$17 +tax per hour"}, "version": "2"}),
            json!({"change_id": "c2", "chunk_id": "scb_faq_999", "change_type": "delete",
                   "version": "2"}),
        ],
    )
}

#[tokio::test]
async fn failed_entry_rolls_back_alone_and_version_advances() {
    let store = seeded_store().await;
    let provider = HashEmbedder::new(DIMS);
    let source = update_and_bad_delete();

    let summary = SyncEngine::new(&store, &provider, &source, options())
        .run()
        .await
        .unwrap();

    assert_eq!(summary.status, RunStatus::Synced);
    assert_eq!(summary.applied_count, 1);
    assert_eq!(summary.rolled_back_count, 1);
    assert_eq!(summary.final_version, Some(v("2")));

    let updated = store.get("scb_faq_141").await.unwrap().unwrap();
    assert_eq!(updated.answer, "$17 +tax per hour");
    assert_eq!(updated.question, "How much does a jump pass cost?");
    assert_eq!(updated.source_version, v("2"));

    let history = store.history(10).await.unwrap();
    assert_eq!(history.len(), 2);
    let rolled_back = history
        .iter()
        .find(|h| h.chunk_id == "scb_faq_999")
        .unwrap();
    assert_eq!(rolled_back.outcome, SyncOutcome::RolledBack);
    assert!(rolled_back.detail.as_deref().unwrap().contains("does not exist"));

    let state = store.sync_state().await.unwrap();
    assert_eq!(state.last_synced_version, Some(v("2")));
}

#[tokio::test]
async fn equal_version_makes_no_writes() {
    let store = seeded_store().await;
    let provider = HashEmbedder::new(DIMS);
    let source = update_and_bad_delete();
    let engine = SyncEngine::new(&store, &provider, &source, options());

    engine.run().await.unwrap();
    let history_before = store.history(100).await.unwrap().len();
    let synced_at = store.sync_state().await.unwrap().last_synced_at;

    let summary = engine.run().await.unwrap();
    assert_eq!(summary.status, RunStatus::UpToDate);
    assert!(summary.outcomes.is_empty());
    assert_eq!(store.history(100).await.unwrap().len(), history_before);
    assert_eq!(store.sync_state().await.unwrap().last_synced_at, synced_at);
}

#[tokio::test]
async fn reapplying_identical_state_is_a_no_op() {
    let store = InMemoryStore::new();
    let provider = HashEmbedder::new(DIMS);
    let source = FixedSource::new(
        "5",
        vec![json!({"chunk_id": "scb_glow_002", "change_type": "create", "sheet": "Events",
                    "new_value": {"question": "When is glow night?", "answer": "Fridays 8pm"},
                    "version": "5"})],
    );
    let forced = SyncOptions {
        force: true,
        ..options()
    };

    let first = SyncEngine::new(&store, &provider, &source, forced.clone())
        .run()
        .await
        .unwrap();
    assert_eq!(first.applied_count, 1);

    let second = SyncEngine::new(&store, &provider, &source, forced)
        .run()
        .await
        .unwrap();
    assert_eq!(second.applied_count, 0);
    assert_eq!(second.unchanged_count, 1);

    assert_eq!(store.count().await.unwrap(), 1);
    assert_eq!(store.history(10).await.unwrap().len(), 1);
    let glow = store.get("scb_glow_002").await.unwrap().unwrap();
    assert_eq!(glow.category, "Events");
}

#[tokio::test]
async fn later_entries_for_the_same_chunk_win() {
    let store = InMemoryStore::new();
    let provider = HashEmbedder::new(DIMS);
    let source = FixedSource::new(
        "3",
        vec![
            json!({"chunk_id": "scb_socks_001", "change_type": "add", "version": "3",
                   "new_value": {"question": "Do I need grip socks?", "answer": "Yes, $3"}}),
            json!({"chunk_id": "scb_socks_001", "change_type": "update", "version": "3",
                   "field": "answer", "new_value": "Yes, $4"}),
        ],
    );
    let summary = SyncEngine::new(&store, &provider, &source, options())
        .run()
        .await
        .unwrap();
    assert_eq!(summary.applied_count, 2);
    let socks = store.get("scb_socks_001").await.unwrap().unwrap();
    assert_eq!(socks.answer, "Yes, $4");
    assert_eq!(socks.embedding, provider.embed_sync(&socks.embed_text()));
}

fn two_bad_entries() -> Vec<Value> {
    vec![
        json!({"chunk_id": "missing_1", "change_type": "update", "version": "2",
               "new_value": {"answer": "x"}}),
        json!({"chunk_id": "scb_faq_141", "change_type": "rename", "version": "2"}),
    ]
}

#[tokio::test]
async fn every_entry_failing_still_advances_marker() {
    let store = seeded_store().await;
    let provider = HashEmbedder::new(DIMS);
    let source = FixedSource::new("2", two_bad_entries());
    let engine = SyncEngine::new(&store, &provider, &source, options());

    let summary = engine.run().await.unwrap();
    assert_eq!(summary.status, RunStatus::Synced);
    assert_eq!(summary.rolled_back_count, 2);
    assert_eq!(summary.final_version, Some(v("2")));
    assert_eq!(
        store.sync_state().await.unwrap().last_synced_version,
        Some(v("2"))
    );
    assert_eq!(store.history(10).await.unwrap().len(), 2);

    // The same version is not re-read, so the rollbacks are not repeated.
    let again = engine.run().await.unwrap();
    assert_eq!(again.status, RunStatus::UpToDate);
    assert_eq!(store.history(10).await.unwrap().len(), 2);

    // A later version carrying the same rows does not replay them either.
    let later = FixedSource::new("3", two_bad_entries());
    let summary = SyncEngine::new(&store, &provider, &later, options())
        .run()
        .await
        .unwrap();
    assert!(summary.outcomes.is_empty());
    assert_eq!(store.history(10).await.unwrap().len(), 2);
}

#[tokio::test]
async fn unversioned_row_is_not_replayed_at_a_later_version() {
    let store = seeded_store().await;
    let provider = HashEmbedder::new(DIMS);
    let rows = vec![
        json!({"chunk_id": "scb_faq_141", "change_type": "update", "version": "2",
               "new_value": {"answer": "$17 +tax per hour"}}),
        json!({"chunk_id": "scb_glow_002", "change_type": "create",
               "new_value": {"question": "When is glow night?", "answer": "Fridays 8pm"}}),
    ];

    let at_v2 = FixedSource::new("2", rows.clone());
    let first = SyncEngine::new(&store, &provider, &at_v2, options())
        .run()
        .await
        .unwrap();
    assert_eq!(first.applied_count, 1);
    assert_eq!(first.outcomes.len(), 1);
    assert!(store.get("scb_glow_002").await.unwrap().is_none());
    let history_after_v2 = store.history(10).await.unwrap().len();

    let at_v3 = FixedSource::new("3", rows.clone());
    let second = SyncEngine::new(&store, &provider, &at_v3, options())
        .run()
        .await
        .unwrap();
    assert!(second.outcomes.is_empty());
    assert_eq!(store.history(10).await.unwrap().len(), history_after_v2);
    assert_eq!(
        store.sync_state().await.unwrap().last_synced_version,
        Some(v("3"))
    );

    // A forced re-read reports the row instead of guessing its version.
    let forced = SyncOptions {
        force: true,
        ..options()
    };
    let audit = SyncEngine::new(&store, &provider, &at_v3, forced)
        .run()
        .await
        .unwrap();
    let glow = audit
        .outcomes
        .iter()
        .find(|o| o.chunk_id == "scb_glow_002")
        .unwrap();
    assert_eq!(glow.outcome, EntryOutcome::RolledBack);
    assert!(glow.detail.as_deref().unwrap().contains("version"));
}

#[tokio::test]
async fn empty_log_with_new_version_advances_marker() {
    let store = seeded_store().await;
    let provider = HashEmbedder::new(DIMS);
    let source = FixedSource::new("4", Vec::new());
    let summary = SyncEngine::new(&store, &provider, &source, options())
        .run()
        .await
        .unwrap();
    assert_eq!(summary.status, RunStatus::Synced);
    assert_eq!(
        store.sync_state().await.unwrap().last_synced_version,
        Some(v("4"))
    );
}

#[tokio::test]
async fn unreachable_source_fails_without_touching_state() {
    let store = seeded_store().await;
    let provider = HashEmbedder::new(DIMS);
    let source = FixedSource::unreachable();
    let err = SyncEngine::new(&store, &provider, &source, options())
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::SourceUnreachable(_)));
    assert_eq!(
        store.sync_state().await.unwrap().last_synced_version,
        Some(v("1"))
    );
    assert!(store.history(10).await.unwrap().is_empty());

    // The lock was released, so the next run can proceed.
    let summary = SyncEngine::new(&store, &provider, &update_and_bad_delete(), options())
        .run()
        .await
        .unwrap();
    assert_eq!(summary.applied_count, 1);
}

#[tokio::test]
async fn concurrent_run_is_rejected() {
    let store = seeded_store().await;
    store
        .try_lock_sync("other-run", Utc::now(), chrono::Duration::hours(1))
        .await
        .unwrap();
    let provider = HashEmbedder::new(DIMS);
    let source = update_and_bad_delete();
    let err = SyncEngine::new(&store, &provider, &source, options())
        .run()
        .await
        .unwrap_err();
    match err {
        SyncError::AlreadyRunning { holder } => assert_eq!(holder, "other-run"),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn dimension_mismatch_blocks_sync() {
    let store = seeded_store().await;
    let provider = HashEmbedder::new(DIMS * 2);
    let source = update_and_bad_delete();
    let err = SyncEngine::new(&store, &provider, &source, options())
        .run()
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SyncError::Store(StoreError::DimensionMismatch { .. })
    ));
    let faq = store.get("scb_faq_141").await.unwrap().unwrap();
    assert_eq!(faq.answer, "$15 +tax per hour");
}

#[tokio::test]
async fn stale_entries_are_skipped_and_audited() {
    let store = seeded_store().await;
    store
        .upsert(&chunk(
            "scb_hours_001",
            "What are your hours?",
            "10am to 8pm",
            "7",
        ))
        .await
        .unwrap();
    let provider = HashEmbedder::new(DIMS);
    let source = FixedSource::new(
        "8",
        vec![json!({"chunk_id": "scb_hours_001", "change_type": "update",
                    "new_value": {"answer": "9am to 5pm"}, "version": "6"})],
    );
    let summary = SyncEngine::new(&store, &provider, &source, options())
        .run()
        .await
        .unwrap();
    assert_eq!(summary.skipped_count, 1);
    assert_eq!(summary.outcomes[0].outcome, EntryOutcome::Skipped);
    let hours = store.get("scb_hours_001").await.unwrap().unwrap();
    assert_eq!(hours.answer, "10am to 8pm");
    let history = store.history(1).await.unwrap();
    assert_eq!(history[0].outcome, SyncOutcome::Skipped);
}

#[tokio::test]
async fn deleted_ids_are_never_reused() {
    let store = seeded_store().await;
    let provider = HashEmbedder::new(DIMS);
    let source = FixedSource::new(
        "2",
        vec![
            json!({"chunk_id": "scb_contact_003", "change_type": "delete", "version": "2"}),
            json!({"chunk_id": "scb_contact_003", "change_type": "create", "version": "2",
                   "new_value": {"question": "Phone?", "answer": "555"}}),
        ],
    );
    let summary = SyncEngine::new(&store, &provider, &source, options())
        .run()
        .await
        .unwrap();
    assert_eq!(summary.outcomes[0].outcome, EntryOutcome::Applied);
    assert_eq!(summary.outcomes[1].outcome, EntryOutcome::RolledBack);
    assert!(summary.outcomes[1]
        .detail
        .as_deref()
        .unwrap()
        .contains("retired"));
    assert!(store.get("scb_contact_003").await.unwrap().is_none());
}

#[tokio::test]
async fn transient_embedding_failures_are_retried() {
    let store = seeded_store().await;
    let provider = FlakyEmbedder {
        inner: HashEmbedder::new(DIMS),
        failures: 2,
        calls: AtomicUsize::new(0),
    };
    let source = update_and_bad_delete();
    let summary = SyncEngine::new(&store, &provider, &source, options())
        .run()
        .await
        .unwrap();
    assert_eq!(summary.applied_count, 1);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_retries_roll_the_entry_back() {
    let store = seeded_store().await;
    let provider = FlakyEmbedder {
        inner: HashEmbedder::new(DIMS),
        failures: usize::MAX,
        calls: AtomicUsize::new(0),
    };
    let source = update_and_bad_delete();
    let summary = SyncEngine::new(&store, &provider, &source, options())
        .run()
        .await
        .unwrap();
    assert_eq!(summary.rolled_back_count, 2);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    let faq = store.get("scb_faq_141").await.unwrap().unwrap();
    assert_eq!(faq.answer, "$15 +tax per hour");
}

#[tokio::test]
async fn dry_run_predicts_without_writing() {
    let store = seeded_store().await;
    let provider = FlakyEmbedder {
        inner: HashEmbedder::new(DIMS),
        failures: usize::MAX,
        calls: AtomicUsize::new(0),
    };
    let source = update_and_bad_delete();
    let dry = SyncOptions {
        dry_run: true,
        ..options()
    };
    let summary = SyncEngine::new(&store, &provider, &source, dry)
        .run()
        .await
        .unwrap();
    assert!(summary.dry_run);
    assert_eq!(summary.applied_count, 1);
    assert_eq!(summary.rolled_back_count, 1);
    assert_eq!(provider.calls.load(Ordering::SeqCst), 0);

    let faq = store.get("scb_faq_141").await.unwrap().unwrap();
    assert_eq!(faq.answer, "$15 +tax per hour");
    assert!(store.history(10).await.unwrap().is_empty());
    assert_eq!(
        store.sync_state().await.unwrap().last_synced_version,
        Some(v("1"))
    );
}

#[tokio::test]
async fn unrecorded_rollback_fails_the_run_before_the_marker_moves() {
    let store = AuditDownStore(seeded_store().await);
    let provider = HashEmbedder::new(DIMS);
    let source = update_and_bad_delete();

    let err = SyncEngine::new(&store, &provider, &source, options())
        .run()
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Store(StoreError::Unavailable(_))));
    assert_eq!(
        store.sync_state().await.unwrap().last_synced_version,
        Some(v("1"))
    );

    // The lock was released, so a run against a healthy audit log proceeds.
    let summary = SyncEngine::new(&store.0, &provider, &source, options())
        .run()
        .await
        .unwrap();
    assert_eq!(summary.status, RunStatus::Synced);
    assert_eq!(summary.rolled_back_count, 1);
    assert_eq!(
        store.0.sync_state().await.unwrap().last_synced_version,
        Some(v("2"))
    );
}
