//! Error taxonomy shared by the store, ranking, and sync layers.
//!
//! Each enum maps to one failure class with its own handling rule:
//! validation failures reject a single item, transient embedding failures
//! are retried, dimension mismatches block search, an unreachable change
//! source fails the whole sync run, and transaction failures are turned
//! into rolled-back audit entries by the sync engine.

use thiserror::Error;

/// A malformed chunk or change entry. Rejects one item, never the batch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("unknown change type `{0}` (expected create, update or delete)")]
    UnknownChangeType(String),

    #[error("chunk `{0}` does not exist")]
    ChunkNotFound(String),

    #[error("chunk id `{0}` was retired and cannot be reused")]
    RetiredChunkId(String),

    #[error("field `{field}` is invalid: {reason}")]
    InvalidField { field: String, reason: String },

    #[error("update for `{0}` carries no field changes")]
    EmptyPatch(String),

    #[error("malformed change row: {0}")]
    Malformed(String),
}

/// Failure reported by an embedding backend.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum EmbeddingError {
    /// Rate limits, timeouts, 5xx responses. Safe to retry.
    #[error("transient embedding failure: {0}")]
    Transient(String),

    #[error("embedding failed: {0}")]
    Fatal(String),

    #[error("provider returned {got}-dimensional vectors, expected {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("embedding provider is disabled")]
    Disabled,
}

impl EmbeddingError {
    pub fn is_transient(&self) -> bool {
        matches!(self, EmbeddingError::Transient(_))
    }
}

/// Failure inside a [`KnowledgeStore`](crate::store::KnowledgeStore).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    /// Stored vectors do not all match the configured provider dimension.
    /// Blocks search until the corpus is re-embedded.
    #[error("embedding dimension mismatch: provider produces {configured}, store holds {stored:?}")]
    DimensionMismatch { configured: usize, stored: Vec<usize> },

    #[error("knowledge store unavailable: {0}")]
    Unavailable(String),

    #[error("transaction failed: {0}")]
    Transaction(String),

    #[error("chunk id `{0}` is retired")]
    Retired(String),

    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Whether repeating the same write could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transaction(_) | StoreError::Unavailable(_))
    }
}

/// Failure reading the external change log.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChangeSourceError {
    /// Network, auth, or missing-file failure before any rows were read.
    #[error("change source unreachable: {0}")]
    Unreachable(String),

    #[error("change source returned an unreadable payload: {0}")]
    Malformed(String),
}

/// Invalid ranking configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("fusion weights must be finite and non-negative (semantic={semantic}, keyword={keyword})")]
    InvalidWeight { semantic: f64, keyword: f64 },

    #[error("fusion weights must sum to 1.0 (semantic={semantic} + keyword={keyword} = {sum})")]
    WeightsDoNotSumToOne { semantic: f64, keyword: f64, sum: f64 },

    #[error("unknown search mode `{0}` (expected hybrid, semantic or keyword)")]
    UnknownSearchMode(String),

    #[error("sync.lock_ttl_secs must be between 1 and {max}, got {secs}")]
    LockTtlOutOfRange { secs: u64, max: u64 },
}

/// Failure of a whole sync run. Per-entry failures never surface here.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync run is already in progress (lock held by {holder})")]
    AlreadyRunning { holder: String },

    #[error(transparent)]
    SourceUnreachable(#[from] ChangeSourceError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("embedding provider unavailable for sync: {0}")]
    ProviderUnavailable(String),
}
