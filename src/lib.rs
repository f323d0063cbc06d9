//! mneme — a persistent, hybrid-search fact store for long-running agents.
//!
//! Facts are versioned claims about named subjects, stored in SQLite with a
//! trigger-synchronized FTS5 index and optional embeddings. Replaced facts
//! are linked forward to their successors instead of being deleted, so
//! knowledge keeps its history. Retrieval blends BM25 lexical rank with
//! cosine similarity and per-category time decay.
//!
//! The store creates `mneme_*` tables and tracks its own schema version, so
//! it can live inside a database file it shares with the host application.
//!
//! # Conventions
//!
//! Relationship facts are directional: "Alice trusts Bob" with subject
//! "alice" is only indexed under alice. For reliable lookup from either side,
//! store both directions at insert time with the inverse phrasing — each
//! direction then gets its own lexical entry and embedding.

pub mod db;
pub mod embed;
pub mod error;
pub mod extract;
pub mod prompts;
pub mod tools;
pub mod transfer;
pub mod vector;

pub use db::{
    Fact, FactInput, FactStore, FilterOp, HistoryEntry, MetadataFilter, QueryOpts, SearchOpts,
    SearchResult, SqlitePool,
};
pub use embed::{embed_single, embed_with_retry, Embedder, OllamaEmbedder};
pub use error::MnemeError;
pub use extract::{
    metadata_conflicts, ExtractHints, ExtractOpts, ExtractOutcome, FactExtractor, Generator,
};
pub use transfer::{export, import, ExportData, ExportedFact, ImportOpts, ImportOutcome};
