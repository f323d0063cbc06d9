//! Embedding lifecycle: pending scans, writes, and batch backfill.

use rusqlite::params;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::embed;

impl FactStore {
    /// Facts in this namespace that have no embedding yet, oldest first.
    /// `limit == 0` defaults to 100.
    pub fn needing_embedding(&self, limit: usize) -> Result<Vec<Fact>, MnemeError> {
        let limit = if limit == 0 { 100 } else { limit };
        let _guard = self.mu.read();
        let conn = self.conn()?;
        let q = format!(
            "SELECT {} FROM mneme_facts WHERE embedding IS NULL AND namespace = ?1 ORDER BY id LIMIT ?2",
            fact_columns("")
        );
        let mut stmt = conn.prepare(&q)?;
        let rows = stmt.query_map(params![self.namespace, limit as i64], scan_fact)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Store a computed embedding for a fact. A cross-namespace id is a no-op.
    pub fn set_embedding(&self, id: i64, emb: &[f32]) -> Result<(), MnemeError> {
        let _guard = self.mu.write();
        let conn = self.conn()?;
        conn.execute(
            "UPDATE mneme_facts SET embedding = ?1 WHERE id = ?2 AND namespace = ?3",
            params![vector::encode_f32s(emb), id, self.namespace],
        )?;
        self.record_embedder(&conn, emb.len())?;
        Ok(())
    }

    /// Generate embeddings for every fact that lacks one, in batches.
    /// `batch_size == 0` defaults to 50.
    ///
    /// The exclusive lock is held across the embedding calls so the
    /// scan-and-update set stays consistent; this is a maintenance operation,
    /// not a hot-path one. Cancellation is checked between batches, and a
    /// cancelled run resumes cleanly on the next invocation.
    pub fn embed_facts(
        &self,
        batch_size: usize,
        cancel: &CancellationToken,
    ) -> Result<usize, MnemeError> {
        let Some(embedder) = self.embedder.as_deref() else {
            return Err(MnemeError::NoEmbedder);
        };
        let batch_size = if batch_size == 0 { 50 } else { batch_size };

        let _guard = self.mu.write();
        let mut conn = self.conn()?;

        let pending: Vec<(i64, String)> = {
            let mut stmt = conn.prepare(
                "SELECT id, content FROM mneme_facts WHERE embedding IS NULL AND namespace = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![self.namespace], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        if pending.is_empty() {
            return Ok(0);
        }

        let mut total = 0usize;
        for batch in pending.chunks(batch_size) {
            if cancel.is_cancelled() {
                return Err(MnemeError::Cancelled);
            }

            let texts: Vec<String> = batch.iter().map(|(_, content)| content.clone()).collect();
            let embeddings = embed::embed_with_retry(embedder, &texts, cancel)?;

            if total == 0 {
                if let Some(first) = embeddings.first().filter(|e| !e.is_empty()) {
                    self.record_embedder(&conn, first.len())?;
                }
            }

            let tx = conn.transaction()?;
            {
                let mut stmt =
                    tx.prepare("UPDATE mneme_facts SET embedding = ?1 WHERE id = ?2")?;
                for (emb, (id, _)) in embeddings.iter().zip(batch) {
                    stmt.execute(rusqlite::params![vector::encode_f32s(emb), id])?;
                }
            }
            tx.commit()?;
            total += batch.len();
        }

        Ok(total)
    }
}
