//! Hybrid search: a BM25 lexical pass and an exact cosine vector pass,
//! merged with score normalization, weight blending, and optional
//! per-category time decay.

use std::cmp::Ordering;
use std::collections::HashMap;

use chrono::Utc;
use rusqlite::{params_from_iter, Connection};
use tokio_util::sync::CancellationToken;

use super::*;
use crate::embed;

/// How often the vector scan polls the cancellation token.
const CANCEL_CHECK_INTERVAL: usize = 256;

impl SearchOpts {
    fn normalized(&self) -> SearchOpts {
        let mut opts = self.clone();
        if opts.max_results == 0 {
            opts.max_results = 20;
        }
        if opts.fts_weight == 0.0 && opts.vec_weight == 0.0 {
            opts.fts_weight = 0.6;
            opts.vec_weight = 0.4;
        }
        opts
    }
}

/// Make a raw query safe for an FTS5 MATCH expression. Each whitespace word
/// is double-quoted (internal quotes doubled), so column prefixes, boolean
/// operators, NEAR, and stray punctuation are all treated as literal terms
/// joined by implicit AND.
fn quote_match_query(raw: &str) -> String {
    raw.split_whitespace()
        .map(|w| format!("\"{}\"", w.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(" ")
}

impl FactStore {
    /// Hybrid FTS5 + vector search. Requires an embedder; the query is
    /// embedded before the store lock is taken, so searches never hold the
    /// lock across network I/O.
    pub fn search(
        &self,
        query: &str,
        opts: &SearchOpts,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>, MnemeError> {
        let Some(embedder) = self.embedder.as_deref() else {
            return Err(MnemeError::NoEmbedder);
        };
        let opts = opts.normalized();

        let query_emb = embed::embed_single(embedder, query, cancel)?;

        let _guard = self.mu.read();
        let conn = self.conn()?;

        let fts_results = self.search_fts(&conn, query, &opts)?;
        let vec_results = if query_emb.is_empty() {
            Vec::new()
        } else {
            self.search_vector(&conn, &query_emb, &opts, cancel)?
        };

        Ok(merge_results(fts_results, vec_results, &opts))
    }

    /// Hybrid search for multiple queries sharing one batched embedding call
    /// and one shared-lock acquisition, so every per-query view is of the
    /// same snapshot.
    pub fn search_batch(
        &self,
        queries: &[String],
        opts: &SearchOpts,
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<SearchResult>>, MnemeError> {
        if queries.is_empty() {
            return Ok(Vec::new());
        }
        let Some(embedder) = self.embedder.as_deref() else {
            return Err(MnemeError::NoEmbedder);
        };
        let opts = opts.normalized();

        let query_embs = embed::embed_with_retry(embedder, queries, cancel)?;

        let _guard = self.mu.read();
        let conn = self.conn()?;

        let mut results = Vec::with_capacity(queries.len());
        for (query, query_emb) in queries.iter().zip(query_embs.iter()) {
            if cancel.is_cancelled() {
                return Err(MnemeError::Cancelled);
            }
            let fts_results = self.search_fts(&conn, query, &opts)?;
            let vec_results = if query_emb.is_empty() {
                Vec::new()
            } else {
                self.search_vector(&conn, query_emb, &opts, cancel)?
            };
            results.push(merge_results(fts_results, vec_results, &opts));
        }
        Ok(results)
    }

    /// BM25-ranked lexical pass. Fetches `max_results * 2` rows to leave
    /// headroom for the merge.
    fn search_fts(
        &self,
        conn: &Connection,
        query: &str,
        opts: &SearchOpts,
    ) -> Result<Vec<SearchResult>, MnemeError> {
        let match_expr = quote_match_query(query);
        if match_expr.is_empty() {
            return Ok(Vec::new());
        }

        let mut q = format!(
            "SELECT {}, rank FROM mneme_facts_fts fts
             JOIN mneme_facts f ON f.id = fts.rowid
             WHERE mneme_facts_fts MATCH ?",
            fact_columns("f.")
        );
        let mut sql_params: Vec<SqlValue> = vec![SqlValue::Text(match_expr)];

        self.push_namespace_filter(&mut q, &mut sql_params, "f.namespace", &opts.namespaces);
        if opts.only_active {
            q.push_str(" AND f.superseded_by IS NULL");
        }
        if let Some(subject) = &opts.subject {
            q.push_str(" AND f.subject = ?");
            sql_params.push(SqlValue::Text(subject.clone()));
        }
        if let Some(category) = &opts.category {
            q.push_str(" AND f.category = ?");
            sql_params.push(SqlValue::Text(category.clone()));
        }
        push_metadata_filters(&mut q, &mut sql_params, "f.", &opts.metadata_filters)?;
        push_temporal_filters(
            &mut q,
            &mut sql_params,
            "f.",
            opts.created_after.as_ref(),
            opts.created_before.as_ref(),
        );

        q.push_str(" ORDER BY rank LIMIT ?");
        sql_params.push(SqlValue::Integer((opts.max_results * 2) as i64));

        let mut stmt = conn.prepare(&q)?;
        let rows = stmt.query_map(params_from_iter(sql_params), |row| {
            let fact = scan_fact(row)?;
            let rank: f64 = row.get(14)?;
            Ok((fact, rank))
        })?;

        let mut results = Vec::new();
        for row in rows {
            let (fact, rank) = row?;
            // BM25 rank is negative (lower = better); negate so higher = better.
            results.push(SearchResult {
                fact,
                fts_score: -rank,
                vec_score: 0.0,
                combined: 0.0,
            });
        }
        Ok(results)
    }

    /// Exact cosine-similarity scan over the filtered candidate set. Only
    /// strictly positive similarities are kept.
    fn search_vector(
        &self,
        conn: &Connection,
        query_emb: &[f32],
        opts: &SearchOpts,
        cancel: &CancellationToken,
    ) -> Result<Vec<SearchResult>, MnemeError> {
        let mut q = format!(
            "SELECT {} FROM mneme_facts WHERE embedding IS NOT NULL",
            fact_columns("")
        );
        let mut sql_params: Vec<SqlValue> = Vec::new();

        self.push_namespace_filter(&mut q, &mut sql_params, "namespace", &opts.namespaces);
        if opts.only_active {
            q.push_str(" AND superseded_by IS NULL");
        }
        if let Some(subject) = &opts.subject {
            q.push_str(" AND subject = ?");
            sql_params.push(SqlValue::Text(subject.clone()));
        }
        if let Some(category) = &opts.category {
            q.push_str(" AND category = ?");
            sql_params.push(SqlValue::Text(category.clone()));
        }
        push_metadata_filters(&mut q, &mut sql_params, "", &opts.metadata_filters)?;
        push_temporal_filters(
            &mut q,
            &mut sql_params,
            "",
            opts.created_after.as_ref(),
            opts.created_before.as_ref(),
        );

        let mut stmt = conn.prepare(&q)?;
        let rows = stmt.query_map(params_from_iter(sql_params), scan_fact)?;

        let mut candidates: Vec<(Fact, f64)> = Vec::new();
        for (i, row) in rows.enumerate() {
            if i % CANCEL_CHECK_INTERVAL == 0 && cancel.is_cancelled() {
                return Err(MnemeError::Cancelled);
            }
            let fact = row?;
            let Some(emb) = fact.embedding.as_deref() else {
                continue;
            };
            let sim = vector::cosine_similarity(query_emb, emb);
            if sim > 0.0 {
                candidates.push((fact, sim));
            }
        }

        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
        candidates.truncate(opts.max_results * 2);

        Ok(candidates
            .into_iter()
            .map(|(fact, sim)| SearchResult {
                fact,
                fts_score: 0.0,
                vec_score: sim,
                combined: 0.0,
            })
            .collect())
    }
}

/// Merge lexical and vector results by fact id, normalize lexical scores to
/// [0, 1], blend with the configured weights, apply decay, and keep the top
/// `max_results`.
fn merge_results(
    fts: Vec<SearchResult>,
    vec: Vec<SearchResult>,
    opts: &SearchOpts,
) -> Vec<SearchResult> {
    let mut by_id: HashMap<i64, SearchResult> = HashMap::new();

    let max_fts = fts.iter().map(|r| r.fts_score).fold(0.0f64, f64::max);
    for mut r in fts {
        if max_fts > 0.0 {
            r.fts_score /= max_fts;
        }
        by_id.insert(r.fact.id, r);
    }

    // Vector scores are already usable as-is; only positives were kept.
    for r in vec {
        match by_id.get_mut(&r.fact.id) {
            Some(existing) => existing.vec_score = r.vec_score,
            None => {
                by_id.insert(r.fact.id, r);
            }
        }
    }

    let now = Utc::now();
    let mut merged: Vec<SearchResult> = by_id
        .into_values()
        .map(|mut r| {
            r.combined = opts.fts_weight * r.fts_score + opts.vec_weight * r.vec_score;
            let half_life = opts
                .category_decay
                .get(&r.fact.category)
                .copied()
                .or(opts.decay_half_life)
                .unwrap_or(Duration::ZERO);
            if !half_life.is_zero() {
                let age_secs = (now - r.fact.created_at).num_milliseconds() as f64 / 1000.0;
                r.combined *= 0.5f64.powf(age_secs / half_life.as_secs_f64());
            }
            r
        })
        .collect();

    merged.sort_by(|a, b| b.combined.partial_cmp(&a.combined).unwrap_or(Ordering::Equal));
    merged.truncate(opts.max_results);
    merged
}
