//! # KB Harness Core
//!
//! Runtime-agnostic logic for KB Harness: the knowledge chunk model, the
//! error taxonomy, the [`store::KnowledgeStore`] abstraction, hybrid ranking,
//! change-log validation, and the embedding provider trait.
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem I/O. Backends
//! (SQLite, remote embedding APIs, change-log readers) live in the
//! `kb-harness` app crate and plug in through the traits defined here.

pub mod changelog;
pub mod embedding;
pub mod error;
pub mod keyword;
pub mod models;
pub mod search;
pub mod store;
