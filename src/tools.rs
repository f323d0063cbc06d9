//! Tool-style operation surface over a `FactStore`.
//!
//! Each operation maps to one or two store calls and returns formatted text
//! plus an error flag instead of propagating errors — the transport layer
//! (RPC, MCP, whatever hosts this) just relays the output.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::db::{FactInput, FactStore, MetadataFilter, QueryOpts, SearchOpts};
use crate::embed;

const DEFAULT_SEARCH_LIMIT: usize = 10;
const MAX_SEARCH_LIMIT: usize = 50;
const DEFAULT_LIST_LIMIT: usize = 20;

/// Ephemeral notes decay with a 30-day half-life; stable categories
/// (preference, identity, ...) are not in the map and don't decay.
const NOTE_HALF_LIFE: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Result of one tool operation.
#[derive(Debug)]
pub struct ToolOutput {
    pub text: String,
    pub is_error: bool,
}

impl ToolOutput {
    fn ok(text: impl Into<String>) -> Self {
        Self { text: text.into(), is_error: false }
    }

    fn err(text: impl Into<String>) -> Self {
        Self { text: text.into(), is_error: true }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StoreInput {
    pub content: String,
    pub subject: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
    /// Id of an existing fact this new one replaces; preserved in history.
    #[serde(default)]
    pub supersedes: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchInput {
    pub query: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub include_superseded: bool,
    /// Equality match on metadata fields.
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListInput {
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteInput {
    pub id: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct SupersedeInput {
    pub old_id: i64,
    pub new_id: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryInput {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub subject: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConfirmInput {
    pub id: i64,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateMetadataInput {
    pub id: i64,
    /// Non-null values set keys; nulls delete them.
    pub patch: Map<String, Value>,
}

/// Bridges tool calls to a fact store.
pub struct ToolHandler {
    store: Arc<FactStore>,
}

impl ToolHandler {
    pub fn new(store: Arc<FactStore>) -> Self {
        Self { store }
    }

    pub fn store(&self, input: StoreInput, cancel: &CancellationToken) -> ToolOutput {
        if input.content.trim().is_empty() {
            return ToolOutput::err("Error: content is required");
        }
        if input.subject.trim().is_empty() {
            return ToolOutput::err("Error: subject is required");
        }
        let category = {
            let c = input.category.trim();
            if c.is_empty() { "note" } else { c }
        }
        .to_string();

        match self.store.exists(&input.content, &input.subject) {
            Ok(true) => return ToolOutput::ok("Already stored (duplicate)."),
            Ok(false) => {}
            Err(e) => return ToolOutput::err(format!("Error checking for duplicates: {e}")),
        }

        let Some(embedder) = self.store.embedder() else {
            return ToolOutput::err("Error: no embedder configured");
        };
        let emb = match embed::embed_single(embedder, &input.content, cancel) {
            Ok(emb) => emb,
            Err(e) => return ToolOutput::err(format!("Error computing embedding: {e}")),
        };

        let mut fact_input =
            FactInput::new(&input.content, &input.subject, &category).embedding(emb);
        if let Some(metadata) = input.metadata.filter(|m| !m.is_empty()) {
            fact_input = fact_input.metadata(Value::Object(metadata));
        }

        let fact = match self.store.insert(fact_input) {
            Ok(fact) => fact,
            Err(e) => return ToolOutput::err(format!("Error storing fact: {e}")),
        };

        let mut msg = format!(
            "Stored (id={}, subject={:?}, category={:?}).",
            fact.id, input.subject, category
        );

        // Supersession after a successful insert; failure downgrades to a warning.
        if let Some(old_id) = input.supersedes {
            match self.store.supersede(old_id, fact.id) {
                Ok(()) => {
                    let _ = write!(msg, " Superseded fact {old_id}.");
                }
                Err(e) => {
                    let _ = write!(msg, " Warning: supersession of fact {old_id} failed: {e}");
                }
            }
        }

        ToolOutput::ok(msg)
    }

    pub fn search(&self, input: SearchInput, cancel: &CancellationToken) -> ToolOutput {
        if input.query.trim().is_empty() {
            return ToolOutput::err("Error: query is required");
        }

        let limit = match input.limit {
            0 => DEFAULT_SEARCH_LIMIT,
            n => n.min(MAX_SEARCH_LIMIT),
        };

        let opts = SearchOpts {
            max_results: limit,
            subject: none_if_empty(input.subject),
            category: none_if_empty(input.category),
            only_active: !input.include_superseded,
            metadata_filters: equality_filters(input.metadata.as_ref()),
            category_decay: HashMap::from([("note".to_string(), NOTE_HALF_LIFE)]),
            ..Default::default()
        };

        let results = match self.store.search(&input.query, &opts, cancel) {
            Ok(results) => results,
            Err(e) => return ToolOutput::err(format!("Error searching: {e}")),
        };
        if results.is_empty() {
            return ToolOutput::ok("No matching facts found.");
        }

        // Best-effort usage bump for everything returned.
        let ids: Vec<i64> = results.iter().map(|r| r.fact.id).collect();
        if let Err(e) = self.store.touch(&ids) {
            warn!(error = %e, "usage-count touch failed");
        }

        let mut b = String::new();
        for (i, r) in results.iter().enumerate() {
            let _ = write!(
                b,
                "[{}] (id={}, score={:.3}, used={}, confirmed={}) {} | {}",
                i + 1,
                r.fact.id,
                r.combined,
                r.fact.use_count + 1, // touch just ran
                r.fact.confirmed_count,
                r.fact.subject,
                r.fact.category
            );
            if let Some(successor) = r.fact.superseded_by {
                let _ = write!(b, " [SUPERSEDED by {successor}]");
            }
            b.push('\n');
            let _ = writeln!(b, "    {}", r.fact.content);
            if let Some(metadata) = &r.fact.metadata {
                let _ = writeln!(b, "    metadata: {metadata}");
            }
            b.push('\n');
        }
        ToolOutput::ok(b)
    }

    pub fn list(&self, input: ListInput) -> ToolOutput {
        let limit = if input.limit == 0 { DEFAULT_LIST_LIMIT } else { input.limit };
        let opts = QueryOpts {
            subject: none_if_empty(input.subject),
            category: none_if_empty(input.category),
            only_active: true,
            limit,
            metadata_filters: equality_filters(input.metadata.as_ref()),
            ..Default::default()
        };

        let facts = match self.store.list(&opts) {
            Ok(facts) => facts,
            Err(e) => return ToolOutput::err(format!("Error listing: {e}")),
        };
        if facts.is_empty() {
            return ToolOutput::ok("No facts found.");
        }

        let mut b = String::new();
        for f in &facts {
            let _ = writeln!(
                b,
                "[id={}, used={}, confirmed={}] {} | {} | {}",
                f.id,
                f.use_count,
                f.confirmed_count,
                f.subject,
                f.category,
                f.created_at.format("%Y-%m-%d %H:%M")
            );
            let _ = writeln!(b, "  {}", f.content);
            if let Some(metadata) = &f.metadata {
                let _ = writeln!(b, "  metadata: {metadata}");
            }
            b.push('\n');
        }
        let _ = write!(b, "{} facts listed.", facts.len());
        ToolOutput::ok(b)
    }

    pub fn delete(&self, input: DeleteInput) -> ToolOutput {
        if input.id <= 0 {
            return ToolOutput::err("Error: id must be a positive integer");
        }
        match self.store.delete(input.id) {
            Ok(()) => ToolOutput::ok(format!("Deleted fact {}.", input.id)),
            Err(e) => ToolOutput::err(format!("Error: {e}")),
        }
    }

    pub fn supersede(&self, input: SupersedeInput) -> ToolOutput {
        if input.old_id <= 0 || input.new_id <= 0 {
            return ToolOutput::err("Error: both old_id and new_id must be positive integers");
        }
        if input.old_id == input.new_id {
            return ToolOutput::err("Error: old_id and new_id must be different");
        }

        let old_fact = match self.store.get(input.old_id) {
            Ok(Some(f)) => f,
            Ok(None) => return ToolOutput::err(format!("Error: fact {} not found", input.old_id)),
            Err(e) => {
                return ToolOutput::err(format!("Error looking up fact {}: {e}", input.old_id))
            }
        };
        if let Some(successor) = old_fact.superseded_by {
            return ToolOutput::err(format!(
                "Error: fact {} is already superseded by fact {successor}",
                input.old_id
            ));
        }

        let new_fact = match self.store.get(input.new_id) {
            Ok(Some(f)) => f,
            Ok(None) => return ToolOutput::err(format!("Error: fact {} not found", input.new_id)),
            Err(e) => {
                return ToolOutput::err(format!("Error looking up fact {}: {e}", input.new_id))
            }
        };

        if let Err(e) = self.store.supersede(input.old_id, input.new_id) {
            return ToolOutput::err(format!("Error: {e}"));
        }

        ToolOutput::ok(format!(
            "Superseded fact {} with fact {}.\n  Old: {}\n  New: {}",
            input.old_id, input.new_id, old_fact.content, new_fact.content
        ))
    }

    pub fn history(&self, input: HistoryInput) -> ToolOutput {
        let has_id = input.id > 0;
        let has_subject = !input.subject.trim().is_empty();
        if has_id == has_subject {
            return ToolOutput::err("Error: provide exactly one of id or subject");
        }

        let entries = match self.store.history(input.id.max(0), input.subject.trim()) {
            Ok(entries) => entries,
            Err(e) => return ToolOutput::err(format!("Error: {e}")),
        };
        if entries.is_empty() {
            return ToolOutput::ok("No history found.");
        }

        let mut b = String::new();
        for e in &entries {
            let status = match e.fact.superseded_by {
                Some(successor) => format!("SUPERSEDED by {successor}"),
                None => "ACTIVE".to_string(),
            };
            let _ = writeln!(
                b,
                "[{}/{}] (id={}) {} | {} | {} | {}",
                e.position + 1,
                e.chain_length,
                e.fact.id,
                e.fact.subject,
                e.fact.category,
                status,
                e.fact.created_at.format("%Y-%m-%d %H:%M")
            );
            let _ = writeln!(b, "  {}", e.fact.content);
            if let Some(metadata) = &e.fact.metadata {
                let _ = writeln!(b, "  metadata: {metadata}");
            }
            b.push('\n');
        }
        ToolOutput::ok(b)
    }

    pub fn confirm(&self, input: ConfirmInput) -> ToolOutput {
        if input.id <= 0 {
            return ToolOutput::err("Error: id must be a positive integer");
        }
        if let Err(e) = self.store.confirm(input.id) {
            return ToolOutput::err(format!("Error: {e}"));
        }
        // Re-fetch to show the updated count.
        match self.store.get(input.id) {
            Ok(Some(fact)) => ToolOutput::ok(format!(
                "Confirmed fact {} (count={}). {}",
                input.id, fact.confirmed_count, fact.content
            )),
            _ => ToolOutput::ok(format!("Confirmed fact {}.", input.id)),
        }
    }

    pub fn update_metadata(&self, input: UpdateMetadataInput) -> ToolOutput {
        if input.id <= 0 {
            return ToolOutput::err("Error: id must be a positive integer");
        }
        if input.patch.is_empty() {
            return ToolOutput::err("Error: patch must not be empty");
        }
        match self.store.update_metadata(input.id, &input.patch) {
            Ok(()) => match self.store.get(input.id) {
                Ok(Some(fact)) => ToolOutput::ok(format!(
                    "Updated metadata for fact {}: {}",
                    input.id,
                    fact.metadata
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| "null".into())
                )),
                _ => ToolOutput::ok(format!("Updated metadata for fact {}.", input.id)),
            },
            Err(e) => ToolOutput::err(format!("Error: {e}")),
        }
    }

    pub fn status(&self) -> ToolOutput {
        let count = match self.store.active_count() {
            Ok(count) => count,
            Err(e) => return ToolOutput::err(format!("Error: {e}")),
        };
        let facts = match self.store.list(&QueryOpts { only_active: true, ..Default::default() }) {
            Ok(facts) => facts,
            Err(e) => return ToolOutput::err(format!("Error: {e}")),
        };

        let mut subjects: BTreeMap<&str, usize> = BTreeMap::new();
        let mut categories: BTreeMap<&str, usize> = BTreeMap::new();
        for f in &facts {
            *subjects.entry(f.subject.as_str()).or_default() += 1;
            *categories.entry(f.category.as_str()).or_default() += 1;
        }

        let mut b = String::new();
        let _ = writeln!(b, "Active facts: {count}\n");
        if !categories.is_empty() {
            let _ = writeln!(b, "By category:");
            for (cat, n) in &categories {
                let _ = writeln!(b, "  {cat}: {n}");
            }
            b.push('\n');
        }
        if !subjects.is_empty() {
            let _ = writeln!(b, "By subject:");
            for (subj, n) in &subjects {
                let _ = writeln!(b, "  {subj}: {n}");
            }
        }
        ToolOutput::ok(b)
    }
}

fn none_if_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn equality_filters(metadata: Option<&Map<String, Value>>) -> Vec<MetadataFilter> {
    metadata
        .map(|m| {
            m.iter()
                .map(|(k, v)| MetadataFilter::eq(k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default()
}
