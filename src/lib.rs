//! # Knowledge Base Harness
//!
//! Hybrid retrieval over a curated question/answer knowledge base, kept
//! consistent with an external change log through incremental, audited
//! sync runs.
//!
//! The pure logic (data model, ranking, validation, store trait) lives in
//! [`kb_harness_core`]. This crate wires it to SQLite, HTTP embedding
//! backends, change-log readers and the `kb` CLI.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────┐   ┌───────────┐
//! │ Change log  │──▶│ Sync engine │──▶│  SQLite   │
//! │ file / HTTP │   │ embed+audit │   │ FTS5+vecs │
//! └─────────────┘   └─────────────┘   └─────┬─────┘
//!                                           │
//! ┌─────────────┐                     ┌─────▼─────┐
//! │ Bulk corpus │────────────────────▶│  Hybrid   │
//! │    (JSON)   │                     │  ranker   │
//! └─────────────┘                     └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! kb init                              # create database
//! kb load --path ./data/corpus.json    # initial corpus
//! kb sync                              # apply pending changes
//! kb search "cost to jump"
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`sqlite_store`] | `KnowledgeStore` over SQLite |
//! | [`embedding`] | HTTP and local embedding backends |
//! | [`changelog`] | File and HTTP change-log readers |
//! | [`sync`] | Sync engine |
//! | [`ingest`] | Bulk corpus load |
//! | [`kb`] | Resource handle tying the pieces together |
//! | [`search`] / [`stats`] / [`embed_cmd`] | CLI commands |

pub mod changelog;
pub mod config;
pub mod db;
pub mod embed_cmd;
pub mod embedding;
pub mod ingest;
pub mod kb;
pub mod migrate;
pub mod search;
pub mod sqlite_store;
pub mod stats;
pub mod sync;
