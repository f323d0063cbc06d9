//! SQLite-backed fact storage with FTS5 + vector hybrid search.
//!
//! The store creates `mneme_*` tables inside a caller-provided pool and keeps
//! its own schema version, so it can share a database file with host tables.
//! All reads and writes are scoped to the store's namespace; one
//! reader-writer lock per store serializes writers and admits concurrent
//! readers.

mod embedding;
mod facts;
mod schema;
mod search;

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Value as SqlValue;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::embed::Embedder;
use crate::error::MnemeError;
use crate::vector;

pub type SqlitePool = Pool<SqliteConnectionManager>;

type PooledConn = r2d2::PooledConnection<SqliteConnectionManager>;

/// Set busy_timeout on every connection handed out by the pool.
/// Prevents SQLITE_BUSY when multiple stores share one database file.
#[derive(Debug)]
struct BusyTimeoutCustomizer;

impl r2d2::CustomizeConnection<Connection, rusqlite::Error> for BusyTimeoutCustomizer {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), rusqlite::Error> {
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(())
    }
}

/// A single factual claim about a subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub id: i64,
    /// Partition key; set by the store on every write.
    pub namespace: String,
    pub content: String,
    /// Canonical entity name. Caller convention: lowercase, singular.
    pub subject: String,
    /// Open enumeration: "preference", "identity", "project", "note", ...
    pub category: String,
    /// Shallow JSON object with domain-specific extensions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Non-null means this fact is inactive, replaced by the pointed-to fact.
    pub superseded_by: Option<i64>,
    pub superseded_at: Option<DateTime<Utc>>,
    pub confirmed_count: i64,
    pub last_confirmed_at: Option<DateTime<Utc>>,
    /// Bumped when the fact is returned by search.
    pub use_count: i64,
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub created_at: DateTime<Utc>,
}

/// Input for fact insertion. The store assigns id and namespace.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FactInput {
    pub content: String,
    pub subject: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub embedding: Option<Vec<f32>>,
    /// Stamped with the current time when absent.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl FactInput {
    pub fn new(
        content: impl Into<String>,
        subject: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            content: content.into(),
            subject: subject.into(),
            category: category.into(),
            ..Default::default()
        }
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }
}

/// Comparison operators allowed in metadata filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl FilterOp {
    fn as_sql(self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "!=",
            FilterOp::Lt => "<",
            FilterOp::Le => "<=",
            FilterOp::Gt => ">",
            FilterOp::Ge => ">=",
        }
    }
}

impl FromStr for FilterOp {
    type Err = MnemeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "=" | "==" => Ok(FilterOp::Eq),
            "!=" => Ok(FilterOp::Ne),
            "<" => Ok(FilterOp::Lt),
            "<=" => Ok(FilterOp::Le),
            ">" => Ok(FilterOp::Gt),
            ">=" => Ok(FilterOp::Ge),
            other => Err(MnemeError::InvalidArgument(format!(
                "unknown metadata filter operator {other:?}"
            ))),
        }
    }
}

/// A condition on one top-level metadata JSON field.
///
/// With `include_null`, rows where the key is absent (or metadata is NULL)
/// also match — "applies universally if unset".
#[derive(Debug, Clone)]
pub struct MetadataFilter {
    pub key: String,
    pub op: FilterOp,
    pub value: Value,
    pub include_null: bool,
}

impl MetadataFilter {
    pub fn new(key: impl Into<String>, op: FilterOp, value: Value) -> Self {
        Self { key: key.into(), op, value, include_null: false }
    }

    pub fn eq(key: impl Into<String>, value: Value) -> Self {
        Self::new(key, FilterOp::Eq, value)
    }

    pub fn include_null(mut self) -> Self {
        self.include_null = true;
        self
    }
}

/// Filters for `list`.
#[derive(Debug, Clone, Default)]
pub struct QueryOpts {
    pub subject: Option<String>,
    pub category: Option<String>,
    /// Exclude superseded facts.
    pub only_active: bool,
    /// Empty means the store's own namespace.
    pub namespaces: Vec<String>,
    pub metadata_filters: Vec<MetadataFilter>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    /// 0 = no limit.
    pub limit: usize,
}

/// Search behavior. Zero weights mean "use the defaults" (0.6 / 0.4).
#[derive(Debug, Clone, Default)]
pub struct SearchOpts {
    /// 0 = default (20).
    pub max_results: usize,
    pub subject: Option<String>,
    pub category: Option<String>,
    pub only_active: bool,
    /// Empty means the store's own namespace.
    pub namespaces: Vec<String>,
    pub metadata_filters: Vec<MetadataFilter>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    /// Default exponential half-life applied to combined scores.
    pub decay_half_life: Option<Duration>,
    /// Per-category overrides. An explicit zero exempts that category from
    /// decay even when a default half-life is set.
    pub category_decay: HashMap<String, Duration>,
    pub fts_weight: f64,
    pub vec_weight: f64,
}

/// A fact with its relevance scores.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub fact: Fact,
    pub fts_score: f64,
    pub vec_score: f64,
    pub combined: f64,
}

/// A fact with its position in a supersession chain, oldest first.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub fact: Fact,
    pub position: usize,
    pub chain_length: usize,
}

/// SQLite-backed fact store, partitioned by namespace.
pub struct FactStore {
    pool: SqlitePool,
    /// Guards all database access: reads shared, writes exclusive.
    mu: RwLock<()>,
    embedder: Option<Arc<dyn Embedder>>,
    namespace: String,
}

impl std::fmt::Debug for FactStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactStore")
            .field("namespace", &self.namespace)
            .field("has_embedder", &self.embedder.is_some())
            .finish()
    }
}

impl FactStore {
    /// Create a store over a caller-provided pool. Runs any pending schema
    /// migrations and validates the embedder against the recorded model
    /// binding. The caller owns the pool's lifetime.
    ///
    /// Pass an empty namespace for single-tenant usage.
    pub fn new(
        pool: SqlitePool,
        embedder: Option<Arc<dyn Embedder>>,
        namespace: impl Into<String>,
    ) -> Result<Self, MnemeError> {
        let store = Self {
            pool,
            mu: RwLock::new(()),
            embedder,
            namespace: namespace.into(),
        };
        {
            let conn = store.conn()?;
            schema::migrate(&conn)?;
        }
        if store.embedder.is_some() {
            let conn = store.conn()?;
            store.validate_embedder(&conn)?;
        }
        Ok(store)
    }

    /// Open a connection pool for the given database path, configured for
    /// single-writer WAL usage. `":memory:"` opens a unique shared-cache
    /// in-memory database so all pool connections see the same data.
    pub fn open_pool(path: &str) -> Result<SqlitePool, MnemeError> {
        let (manager, size) = if path == ":memory:" {
            let name = uuid::Uuid::new_v4();
            (
                SqliteConnectionManager::file(format!("file:{name}?mode=memory&cache=shared")),
                2,
            )
        } else {
            (SqliteConnectionManager::file(path), 8)
        };
        let pool = Pool::builder()
            .max_size(size)
            .connection_customizer(Box::new(BusyTimeoutCustomizer))
            .build(manager)?;
        let conn = pool.get()?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(pool)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn embedder(&self) -> Option<&dyn Embedder> {
        self.embedder.as_deref()
    }

    fn conn(&self) -> Result<PooledConn, MnemeError> {
        Ok(self.pool.get()?)
    }

    fn get_meta(&self, conn: &Connection, key: &str) -> Option<String> {
        conn.query_row("SELECT value FROM mneme_meta WHERE key = ?1", [key], |r| r.get(0))
            .ok()
    }

    /// Reject an embedder whose model differs from the recorded binding.
    fn validate_embedder(&self, conn: &Connection) -> Result<(), MnemeError> {
        let Some(embedder) = self.embedder.as_deref() else {
            return Ok(());
        };
        let Some(stored) = self.get_meta(conn, "embedding_model") else {
            return Ok(()); // nothing recorded yet; bound on first embedding write
        };
        if stored != embedder.model() {
            return Err(MnemeError::ModelMismatch {
                stored,
                configured: embedder.model().to_string(),
            });
        }
        Ok(())
    }

    /// Record the embedding model and dimension on the first embedding write.
    fn record_embedder(&self, conn: &Connection, dim: usize) -> Result<(), MnemeError> {
        let Some(embedder) = self.embedder.as_deref() else {
            return Ok(());
        };
        if self.get_meta(conn, "embedding_model").is_some() {
            return Ok(());
        }
        conn.execute(
            "INSERT INTO mneme_meta (key, value) VALUES ('embedding_model', ?1)",
            [embedder.model()],
        )?;
        conn.execute(
            "INSERT INTO mneme_meta (key, value) VALUES ('embedding_dim', ?1)",
            [dim.to_string()],
        )?;
        Ok(())
    }

    /// Append a namespace WHERE clause. A non-empty override list searches
    /// exactly those namespaces; otherwise the store's own.
    fn push_namespace_filter(
        &self,
        q: &mut String,
        params: &mut Vec<SqlValue>,
        col: &str,
        namespaces: &[String],
    ) {
        if namespaces.is_empty() {
            q.push_str(" AND ");
            q.push_str(col);
            q.push_str(" = ?");
            params.push(SqlValue::Text(self.namespace.clone()));
        } else {
            let marks = vec!["?"; namespaces.len()].join(", ");
            q.push_str(&format!(" AND {col} IN ({marks})"));
            for ns in namespaces {
                params.push(SqlValue::Text(ns.clone()));
            }
        }
    }
}

/// Metadata keys are interpolated into the json_extract path, so anything
/// outside [A-Za-z0-9_]+ is rejected outright.
fn valid_metadata_key(key: &str) -> bool {
    !key.is_empty() && key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

/// Convert a JSON filter value into a natively-typed SQL parameter so that
/// json_extract comparisons use SQLite's numeric affinity where applicable.
fn filter_param(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

/// Append json_extract-based WHERE clauses for each metadata filter.
/// The table alias ("f." or "") is prepended to the column name.
fn push_metadata_filters(
    q: &mut String,
    params: &mut Vec<SqlValue>,
    alias: &str,
    filters: &[MetadataFilter],
) -> Result<(), MnemeError> {
    for mf in filters {
        if !valid_metadata_key(&mf.key) {
            return Err(MnemeError::InvalidArgument(format!(
                "invalid metadata filter key: {:?}",
                mf.key
            )));
        }
        let extract = format!("json_extract({alias}metadata, '$.{}')", mf.key);
        let op = mf.op.as_sql();
        if mf.include_null {
            q.push_str(&format!(" AND ({extract} IS NULL OR {extract} {op} ?)"));
        } else {
            q.push_str(&format!(" AND {extract} {op} ?"));
        }
        params.push(filter_param(&mf.value));
    }
    Ok(())
}

/// Append inclusive created_at range conditions.
fn push_temporal_filters(
    q: &mut String,
    params: &mut Vec<SqlValue>,
    alias: &str,
    after: Option<&DateTime<Utc>>,
    before: Option<&DateTime<Utc>>,
) {
    if let Some(after) = after {
        q.push_str(&format!(" AND {alias}created_at >= ?"));
        params.push(SqlValue::Text(fmt_ts(after)));
    }
    if let Some(before) = before {
        q.push_str(&format!(" AND {alias}created_at <= ?"));
        params.push(SqlValue::Text(fmt_ts(before)));
    }
}

/// RFC3339 UTC with fixed-width fractional seconds, so lexicographic SQL
/// comparison matches chronological order.
pub(crate) fn fmt_ts(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

const FACT_COLUMN_NAMES: [&str; 14] = [
    "id",
    "namespace",
    "content",
    "subject",
    "category",
    "metadata",
    "superseded_by",
    "superseded_at",
    "confirmed_count",
    "last_confirmed_at",
    "use_count",
    "last_used_at",
    "embedding",
    "created_at",
];

/// The canonical SELECT list for fact queries, optionally table-qualified.
fn fact_columns(alias: &str) -> String {
    FACT_COLUMN_NAMES
        .iter()
        .map(|c| format!("{alias}{c}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Row mapper matching `fact_columns` order.
fn scan_fact(row: &rusqlite::Row) -> rusqlite::Result<Fact> {
    let metadata: Option<String> = row.get(5)?;
    let superseded_at: Option<String> = row.get(7)?;
    let last_confirmed_at: Option<String> = row.get(9)?;
    let last_used_at: Option<String> = row.get(11)?;
    let emb_blob: Option<Vec<u8>> = row.get(12)?;
    let created_at: String = row.get(13)?;

    Ok(Fact {
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
        superseded_at: superseded_at.as_deref().and_then(parse_ts),
        confirmed_count: row.get(8)?,
        last_confirmed_at: last_confirmed_at.as_deref().and_then(parse_ts),
        use_count: row.get(10)?,
        last_used_at: last_used_at.as_deref().and_then(parse_ts),
        embedding: emb_blob.map(|b| vector::decode_f32s(&b)),
        created_at: parse_ts(&created_at).unwrap_or_default(),
    })
}
