//! Versioned schema migrations.
//!
//! The version counter lives in its own single-row table (`mneme_version`)
//! rather than PRAGMA user_version, so the store never collides with a host
//! application's schema versioning in a shared database file.

use rusqlite::{Connection, OptionalExtension};

use crate::error::MnemeError;

pub(super) const SCHEMA_VERSION: i64 = 6;

// V1: fact table, external-content FTS index with sync triggers, and the
// supporting indexes. The lexical index is written ONLY by these triggers;
// application code never touches it.
const V1: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS mneme_facts (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        content       TEXT NOT NULL,
        subject       TEXT NOT NULL,
        category      TEXT NOT NULL,
        metadata      TEXT,
        superseded_by INTEGER REFERENCES mneme_facts(id),
        embedding     BLOB,
        created_at    TEXT NOT NULL
    )",
    "CREATE VIRTUAL TABLE IF NOT EXISTS mneme_facts_fts USING fts5(
        content, subject, category,
        content='mneme_facts', content_rowid='id'
    )",
    "CREATE TRIGGER IF NOT EXISTS mneme_facts_ai AFTER INSERT ON mneme_facts BEGIN
        INSERT INTO mneme_facts_fts(rowid, content, subject, category)
        VALUES (new.id, new.content, new.subject, new.category);
    END",
    "CREATE TRIGGER IF NOT EXISTS mneme_facts_ad AFTER DELETE ON mneme_facts BEGIN
        INSERT INTO mneme_facts_fts(mneme_facts_fts, rowid, content, subject, category)
        VALUES ('delete', old.id, old.content, old.subject, old.category);
    END",
    "CREATE TRIGGER IF NOT EXISTS mneme_facts_au AFTER UPDATE ON mneme_facts BEGIN
        INSERT INTO mneme_facts_fts(mneme_facts_fts, rowid, content, subject, category)
        VALUES ('delete', old.id, old.content, old.subject, old.category);
        INSERT INTO mneme_facts_fts(rowid, content, subject, category)
        VALUES (new.id, new.content, new.subject, new.category);
    END",
    "CREATE INDEX IF NOT EXISTS idx_mneme_subject ON mneme_facts(subject)",
    "CREATE INDEX IF NOT EXISTS idx_mneme_category ON mneme_facts(category)",
    "CREATE INDEX IF NOT EXISTS idx_mneme_active ON mneme_facts(id) WHERE superseded_by IS NULL",
];

// V2: key/value meta table (embedding model + dimension binding).
const V2: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS mneme_meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
];

// V3: namespace partitioning.
const V3: &[&str] = &[
    "ALTER TABLE mneme_facts ADD COLUMN namespace TEXT NOT NULL DEFAULT ''",
    "CREATE INDEX IF NOT EXISTS idx_mneme_namespace ON mneme_facts(namespace)",
];

// V4: supersession timestamp.
const V4: &[&str] = &["ALTER TABLE mneme_facts ADD COLUMN superseded_at TEXT"];

// V5: explicit-trust counters.
const V5: &[&str] = &[
    "ALTER TABLE mneme_facts ADD COLUMN confirmed_count INTEGER NOT NULL DEFAULT 0",
    "ALTER TABLE mneme_facts ADD COLUMN last_confirmed_at TEXT",
];

// V6: implicit-trust counters, bumped when search returns a fact.
const V6: &[&str] = &[
    "ALTER TABLE mneme_facts ADD COLUMN use_count INTEGER NOT NULL DEFAULT 0",
    "ALTER TABLE mneme_facts ADD COLUMN last_used_at TEXT",
];

const MIGRATIONS: &[&[&str]] = &[V1, V2, V3, V4, V5, V6];

/// Apply pending migrations in order. The version row is updated after each
/// step, so a failed step leaves the schema at the last committed version.
pub(super) fn migrate(conn: &Connection) -> Result<(), MnemeError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS mneme_version (version INTEGER NOT NULL)",
        [],
    )
    .map_err(|e| MnemeError::Schema(format!("creating version table: {e}")))?;

    let mut version: i64 = conn
        .query_row("SELECT version FROM mneme_version", [], |r| r.get(0))
        .optional()
        .map_err(|e| MnemeError::Schema(format!("reading version: {e}")))?
        .unwrap_or(0);

    if version >= SCHEMA_VERSION {
        return Ok(());
    }

    for (i, stmts) in MIGRATIONS.iter().enumerate() {
        let target = (i + 1) as i64;
        if version >= target {
            continue;
        }
        for stmt in *stmts {
            conn.execute_batch(stmt)
                .map_err(|e| MnemeError::Schema(format!("V{target} migration: {e}")))?;
        }
        set_version(conn, target)
            .map_err(|e| MnemeError::Schema(format!("recording version {target}: {e}")))?;
        version = target;
    }

    Ok(())
}

fn set_version(conn: &Connection, version: i64) -> Result<(), rusqlite::Error> {
    let updated = conn.execute("UPDATE mneme_version SET version = ?1", [version])?;
    if updated == 0 {
        conn.execute("INSERT INTO mneme_version (version) VALUES (?1)", [version])?;
    }
    Ok(())
}
