//! Fact CRUD, supersession, counters, and chain traversal.

use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::{Map, Value};
use tracing::warn;

use super::*;

fn validate_input(input: &FactInput) -> Result<(), MnemeError> {
    if input.content.trim().is_empty() {
        return Err(MnemeError::InvalidArgument("content must not be empty".into()));
    }
    if input.subject.trim().is_empty() {
        return Err(MnemeError::InvalidArgument("subject must not be empty".into()));
    }
    Ok(())
}

impl FactStore {
    /// Insert a single fact. The namespace is forced to the store's own and
    /// `created_at` is stamped when absent.
    pub fn insert(&self, input: FactInput) -> Result<Fact, MnemeError> {
        validate_input(&input)?;
        let _guard = self.mu.write();
        let conn = self.conn()?;
        self.insert_on(&conn, input)
    }

    /// Insert multiple facts in a single transaction, all-or-nothing.
    /// Returned facts carry their assigned ids, in input order.
    pub fn insert_batch(&self, inputs: Vec<FactInput>) -> Result<Vec<Fact>, MnemeError> {
        for input in &inputs {
            validate_input(input)?;
        }
        let _guard = self.mu.write();
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut inserted = Vec::with_capacity(inputs.len());
        for input in inputs {
            inserted.push(self.insert_on(&tx, input)?);
        }
        tx.commit()?;
        Ok(inserted)
    }

    fn insert_on(&self, conn: &Connection, input: FactInput) -> Result<Fact, MnemeError> {
        let created_at = input.created_at.unwrap_or_else(Utc::now);
        let metadata = input.metadata.as_ref().map(Value::to_string);
        let emb_blob = input.embedding.as_deref().map(vector::encode_f32s);

        conn.execute(
            "INSERT INTO mneme_facts (namespace, content, subject, category, metadata, superseded_by, embedding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7)",
            params![
                self.namespace,
                input.content,
                input.subject,
                input.category,
                metadata,
                emb_blob,
                fmt_ts(&created_at)
            ],
        )?;
        let id = conn.last_insert_rowid();

        if let Some(ref emb) = input.embedding {
            self.record_embedder(conn, emb.len())?;
        }

        Ok(Fact {
            id,
            namespace: self.namespace.clone(),
            content: input.content,
            subject: input.subject,
            category: input.category,
            metadata: input.metadata,
            superseded_by: None,
            superseded_at: None,
            confirmed_count: 0,
            last_confirmed_at: None,
            use_count: 0,
            last_used_at: None,
            embedding: input.embedding,
            created_at,
        })
    }

    /// Link an old fact to its replacement. The update only touches rows that
    /// are still active, so a supersession link is assigned at most once.
    pub fn supersede(&self, old_id: i64, new_id: i64) -> Result<(), MnemeError> {
        let _guard = self.mu.write();
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE mneme_facts SET superseded_by = ?1, superseded_at = ?2
             WHERE id = ?3 AND namespace = ?4 AND superseded_by IS NULL",
            params![new_id, fmt_ts(&Utc::now()), old_id, self.namespace],
        )?;
        if n == 0 {
            return Err(MnemeError::NotFoundOrSuperseded(old_id));
        }
        Ok(())
    }

    /// Increment a fact's confirmation counter.
    pub fn confirm(&self, id: i64) -> Result<(), MnemeError> {
        let _guard = self.mu.write();
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE mneme_facts SET confirmed_count = confirmed_count + 1, last_confirmed_at = ?1
             WHERE id = ?2 AND namespace = ?3",
            params![fmt_ts(&Utc::now()), id, self.namespace],
        )?;
        if n == 0 {
            return Err(MnemeError::NotFound(id));
        }
        Ok(())
    }

    /// Bump usage counters for facts returned by search. Callers treat this
    /// as best-effort and must not fail their own operation on error.
    pub fn touch(&self, ids: &[i64]) -> Result<(), MnemeError> {
        if ids.is_empty() {
            return Ok(());
        }
        let _guard = self.mu.write();
        let conn = self.conn()?;
        let marks = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "UPDATE mneme_facts SET use_count = use_count + 1, last_used_at = ?
             WHERE namespace = ? AND id IN ({marks})"
        );
        let mut sql_params: Vec<SqlValue> = Vec::with_capacity(ids.len() + 2);
        sql_params.push(SqlValue::Text(fmt_ts(&Utc::now())));
        sql_params.push(SqlValue::Text(self.namespace.clone()));
        sql_params.extend(ids.iter().map(|id| SqlValue::Integer(*id)));
        conn.execute(&sql, params_from_iter(sql_params))?;
        Ok(())
    }

    /// Physically remove a fact. Superseding is the preferred path; delete is
    /// for facts that are genuinely wrong, not just outdated.
    pub fn delete(&self, id: i64) -> Result<(), MnemeError> {
        let _guard = self.mu.write();
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM mneme_facts WHERE id = ?1 AND namespace = ?2",
            params![id, self.namespace],
        )?;
        if n == 0 {
            return Err(MnemeError::NotFound(id));
        }
        Ok(())
    }

    /// Merge a patch into the fact's metadata object: non-null values set
    /// keys, null values delete them. Does not re-index or re-embed.
    pub fn update_metadata(&self, id: i64, patch: &Map<String, Value>) -> Result<(), MnemeError> {
        let _guard = self.mu.write();
        let conn = self.conn()?;

        let stored: Option<Option<String>> = conn
            .query_row(
                "SELECT metadata FROM mneme_facts WHERE id = ?1 AND namespace = ?2",
                params![id, self.namespace],
                |r| r.get(0),
            )
            .optional()?;
        let Some(stored) = stored else {
            return Err(MnemeError::NotFound(id));
        };

        let mut map = stored
            .as_deref()
            .and_then(|s| serde_json::from_str::<Value>(s).ok())
            .and_then(|v| match v {
                Value::Object(m) => Some(m),
                _ => None,
            })
            .unwrap_or_else(|| {
                if stored.as_deref().is_some_and(|s| !s.is_empty()) {
                    warn!(id, "unparseable stored metadata, starting from empty");
                }
                Map::new()
            });

        for (k, v) in patch {
            if v.is_null() {
                map.remove(k);
            } else {
                map.insert(k.clone(), v.clone());
            }
        }

        let new_meta = if map.is_empty() {
            None
        } else {
            Some(Value::Object(map).to_string())
        };
        conn.execute(
            "UPDATE mneme_facts SET metadata = ?1 WHERE id = ?2 AND namespace = ?3",
            params![new_meta, id, self.namespace],
        )?;
        Ok(())
    }

    /// Fetch a single fact. `None` when absent from this namespace.
    pub fn get(&self, id: i64) -> Result<Option<Fact>, MnemeError> {
        let _guard = self.mu.read();
        let conn = self.conn()?;
        let q = format!(
            "SELECT {} FROM mneme_facts WHERE id = ?1 AND namespace = ?2",
            fact_columns("")
        );
        Ok(conn
            .query_row(&q, params![id, self.namespace], scan_fact)
            .optional()?)
    }

    /// List facts matching the given filters, ordered by id.
    pub fn list(&self, opts: &QueryOpts) -> Result<Vec<Fact>, MnemeError> {
        let _guard = self.mu.read();
        let conn = self.conn()?;

        let mut q = format!("SELECT {} FROM mneme_facts WHERE 1=1", fact_columns(""));
        let mut sql_params: Vec<SqlValue> = Vec::new();

        self.push_namespace_filter(&mut q, &mut sql_params, "namespace", &opts.namespaces);
        if let Some(subject) = &opts.subject {
            q.push_str(" AND subject = ?");
            sql_params.push(SqlValue::Text(subject.clone()));
        }
        if let Some(category) = &opts.category {
            q.push_str(" AND category = ?");
            sql_params.push(SqlValue::Text(category.clone()));
        }
        if opts.only_active {
            q.push_str(" AND superseded_by IS NULL");
        }
        push_metadata_filters(&mut q, &mut sql_params, "", &opts.metadata_filters)?;
        push_temporal_filters(
            &mut q,
            &mut sql_params,
            "",
            opts.created_after.as_ref(),
            opts.created_before.as_ref(),
        );

        q.push_str(" ORDER BY id");
        if opts.limit > 0 {
            q.push_str(" LIMIT ?");
            sql_params.push(SqlValue::Integer(opts.limit as i64));
        }

        let mut stmt = conn.prepare(&q)?;
        let rows = stmt.query_map(params_from_iter(sql_params), scan_fact)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Facts for a given subject, ordered by id.
    pub fn by_subject(&self, subject: &str, only_active: bool) -> Result<Vec<Fact>, MnemeError> {
        let _guard = self.mu.read();
        let conn = self.conn()?;
        let mut q = format!(
            "SELECT {} FROM mneme_facts WHERE subject = ?1 AND namespace = ?2",
            fact_columns("")
        );
        if only_active {
            q.push_str(" AND superseded_by IS NULL");
        }
        q.push_str(" ORDER BY id");
        let mut stmt = conn.prepare(&q)?;
        let rows = stmt.query_map(params![subject, self.namespace], scan_fact)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Whether a fact with identical content and subject already exists in
    /// this namespace. Literal-duplicate gating is the caller's decision.
    pub fn exists(&self, content: &str, subject: &str) -> Result<bool, MnemeError> {
        let _guard = self.mu.read();
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM mneme_facts WHERE content = ?1 AND subject = ?2 AND namespace = ?3",
            params![content, subject, self.namespace],
            |r| r.get(0),
        )?;
        Ok(count > 0)
    }

    /// Number of non-superseded facts in this namespace.
    pub fn active_count(&self) -> Result<i64, MnemeError> {
        let _guard = self.mu.read();
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM mneme_facts WHERE superseded_by IS NULL AND namespace = ?1",
            params![self.namespace],
            |r| r.get(0),
        )?)
    }

    /// Supersession history. With `id > 0`, assembles the full chain
    /// containing that fact; with `id == 0` and a non-empty subject, returns
    /// every fact for the subject ordered by creation time.
    pub fn history(&self, id: i64, subject: &str) -> Result<Vec<HistoryEntry>, MnemeError> {
        let _guard = self.mu.read();
        let conn = self.conn()?;
        if id > 0 {
            return self.history_by_id(&conn, id);
        }
        if !subject.is_empty() {
            return self.history_by_subject(&conn, subject);
        }
        Err(MnemeError::InvalidArgument(
            "history requires either id or subject".into(),
        ))
    }

    fn history_by_id(&self, conn: &Connection, id: i64) -> Result<Vec<HistoryEntry>, MnemeError> {
        let by_id = format!(
            "SELECT {} FROM mneme_facts WHERE id = ?1 AND namespace = ?2",
            fact_columns("")
        );
        let anchor = conn
            .query_row(&by_id, params![id, self.namespace], scan_fact)
            .optional()?
            .ok_or(MnemeError::NotFound(id))?;

        // Walk backward: predecessors are facts whose superseded_by points at
        // the current chain member.
        let pred_q = format!(
            "SELECT {} FROM mneme_facts WHERE superseded_by = ?1 AND namespace = ?2",
            fact_columns("")
        );
        let mut backward = Vec::new();
        let mut current = anchor.id;
        while let Some(pred) = conn
            .query_row(&pred_q, params![current, self.namespace], scan_fact)
            .optional()?
        {
            current = pred.id;
            backward.push(pred);
        }

        let mut chain: Vec<Fact> = backward.into_iter().rev().collect();
        let mut next = anchor.superseded_by;
        chain.push(anchor);

        // Walk forward by following superseded_by pointers.
        while let Some(succ_id) = next {
            let Some(succ) = conn
                .query_row(&by_id, params![succ_id, self.namespace], scan_fact)
                .optional()?
            else {
                break;
            };
            next = succ.superseded_by;
            chain.push(succ);
        }

        let chain_length = chain.len();
        Ok(chain
            .into_iter()
            .enumerate()
            .map(|(position, fact)| HistoryEntry { fact, position, chain_length })
            .collect())
    }

    fn history_by_subject(
        &self,
        conn: &Connection,
        subject: &str,
    ) -> Result<Vec<HistoryEntry>, MnemeError> {
        let q = format!(
            "SELECT {} FROM mneme_facts WHERE subject = ?1 AND namespace = ?2 ORDER BY created_at, id",
            fact_columns("")
        );
        let mut stmt = conn.prepare(&q)?;
        let facts = stmt
            .query_map(params![subject, self.namespace], scan_fact)?
            .collect::<Result<Vec<_>, _>>()?;
        let chain_length = facts.len();
        Ok(facts
            .into_iter()
            .enumerate()
            .map(|(position, fact)| HistoryEntry { fact, position, chain_length })
            .collect())
    }
}
