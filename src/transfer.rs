//! Export/import of the full fact table across namespaces.
//!
//! Embeddings are deliberately excluded from exports: they're model-specific
//! binary blobs that don't transfer portably. Run `embed_facts` after import
//! to regenerate them with the currently configured model.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::db::{fmt_ts, FactInput, FactStore, SqlitePool};
use crate::error::MnemeError;

pub const EXPORT_VERSION: u32 = 1;

const CANCEL_CHECK_INTERVAL: usize = 256;

/// Top-level structure of an export.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExportData {
    pub version: u32,
    pub exported_at: DateTime<Utc>,
    /// Model the exported store was bound to; a hint for re-embedding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedder_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_dim: Option<usize>,
    pub facts: Vec<ExportedFact>,
}

/// A single exported fact. The id is only used to remap supersession chains
/// on import; the target store assigns fresh ids.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExportedFact {
    pub id: i64,
    pub namespace: String,
    pub content: String,
    pub subject: String,
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ImportOpts {
    /// Skip facts whose (content, subject, namespace) already exist.
    pub skip_duplicates: bool,
}

#[derive(Debug, Default)]
pub struct ImportOutcome {
    pub imported: usize,
    pub skipped: usize,
}

/// Read every fact (all namespaces, superseded included) from a database that
/// has been initialized by a `FactStore` at least once.
pub fn export(pool: &SqlitePool, cancel: &CancellationToken) -> Result<ExportData, MnemeError> {
    let conn = pool.get()?;

    let mut data = ExportData {
        version: EXPORT_VERSION,
        exported_at: Utc::now(),
        embedder_model: None,
        embedding_dim: None,
        facts: Vec::new(),
    };

    // Meta reads are non-fatal; the table may not exist in older files.
    data.embedder_model = conn
        .query_row("SELECT value FROM mneme_meta WHERE key = 'embedding_model'", [], |r| {
            r.get(0)
        })
        .ok();
    data.embedding_dim = conn
        .query_row("SELECT value FROM mneme_meta WHERE key = 'embedding_dim'", [], |r| {
            r.get::<_, String>(0)
        })
        .ok()
        .and_then(|s| s.parse().ok());

    let mut stmt = conn.prepare(
        "SELECT id, namespace, content, subject, category, metadata,
                superseded_by, superseded_at, created_at
         FROM mneme_facts ORDER BY id",
    )?;
    let rows = stmt.query_map([], |row| {
        let metadata: Option<String> = row.get(5)?;
        let superseded_at: Option<String> = row.get(7)?;
        let created_at: String = row.get(8)?;
        Ok(ExportedFact {
            id: row.get(0)?,
            namespace: row.get(1)?,
            content: row.get(2)?,
            subject: row.get(3)?,
            category: row.get(4)?,
            metadata: metadata
                .as_deref()
                .filter(|s| !s.is_empty())
                .and_then(|s| serde_json::from_str(s).ok()),
            superseded_by: row.get(6)?,
            superseded_at: superseded_at.as_deref().and_then(crate::db::parse_ts),
            created_at: crate::db::parse_ts(&created_at).unwrap_or_default(),
        })
    })?;

    for (i, row) in rows.enumerate() {
        if i % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
            return Err(MnemeError::Cancelled);
        }
        data.facts.push(row?);
    }

    Ok(data)
}

/// Insert facts from an export. Namespaces, timestamps, and metadata are
/// preserved; supersession links are remapped to the freshly assigned ids in
/// a second pass that keeps the original `superseded_at`.
pub fn import(
    pool: &SqlitePool,
    data: &ExportData,
    opts: &ImportOpts,
    cancel: &CancellationToken,
) -> Result<ImportOutcome, MnemeError> {
    if data.version != EXPORT_VERSION {
        return Err(MnemeError::UnsupportedVersion(data.version));
    }

    let mut outcome = ImportOutcome::default();

    // One store per namespace; opening it runs migrations and installs the
    // FTS triggers in the target database.
    let mut by_ns: BTreeMap<&str, Vec<&ExportedFact>> = BTreeMap::new();
    for ef in &data.facts {
        by_ns.entry(ef.namespace.as_str()).or_default().push(ef);
    }

    let mut id_map: HashMap<i64, i64> = HashMap::new();

    for (ns, facts) in by_ns {
        let store = FactStore::new(pool.clone(), None, ns)?;
        for ef in facts {
            if cancel.is_cancelled() {
                return Err(MnemeError::Cancelled);
            }
            if opts.skip_duplicates && store.exists(&ef.content, &ef.subject)? {
                outcome.skipped += 1;
                continue;
            }
            let mut input = FactInput::new(&ef.content, &ef.subject, &ef.category)
                .created_at(ef.created_at);
            if let Some(metadata) = &ef.metadata {
                input = input.metadata(metadata.clone());
            }
            let fact = store.insert(input)?;
            id_map.insert(ef.id, fact.id);
            outcome.imported += 1;
        }
    }

    // Second pass: restore supersession chains. Direct SQL so the original
    // superseded_at survives; the guard keeps links one-shot.
    let conn = pool.get()?;
    for ef in &data.facts {
        let Some(old_successor) = ef.superseded_by else {
            continue;
        };
        let (Some(&new_id), Some(&new_successor)) =
            (id_map.get(&ef.id), id_map.get(&old_successor))
        else {
            continue; // either endpoint was skipped as a duplicate
        };
        let at = ef.superseded_at.unwrap_or_else(Utc::now);
        conn.execute(
            "UPDATE mneme_facts SET superseded_by = ?1, superseded_at = ?2
             WHERE id = ?3 AND superseded_by IS NULL",
            rusqlite::params![new_successor, fmt_ts(&at), new_id],
        )?;
    }

    Ok(outcome)
}
