//! Embedder contract, retry policy, and the Ollama HTTP adapter.

use std::time::Duration;

use backon::{BlockingRetryable, ExponentialBuilder};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::MnemeError;

/// Extra attempts after the first failure. Total attempts = retries + 1.
/// Covers transient failures like model loading timeouts.
const EMBED_MAX_RETRIES: usize = 2;

const RETRY_MIN_DELAY: Duration = Duration::from_millis(100);

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Produces vector embeddings for text.
pub trait Embedder: Send + Sync {
    /// Convert a batch of texts into one vector per input text.
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MnemeError>;

    /// Stable identifier for the embedding model (e.g. "embeddinggemma").
    /// The store records this on first embedding write and rejects
    /// mismatched embedders on subsequent opens.
    fn model(&self) -> &str;
}

/// Embed with retries. Stops retrying once `cancel` fires and enforces the
/// one-vector-per-text output invariant.
pub fn embed_with_retry(
    embedder: &dyn Embedder,
    texts: &[String],
    cancel: &CancellationToken,
) -> Result<Vec<Vec<f32>>, MnemeError> {
    if cancel.is_cancelled() {
        return Err(MnemeError::Cancelled);
    }

    let result = (|| embedder.embed(texts))
        .retry(
            ExponentialBuilder::default()
                .with_min_delay(RETRY_MIN_DELAY)
                .with_max_times(EMBED_MAX_RETRIES),
        )
        .when(|_| !cancel.is_cancelled())
        .notify(|err, after| {
            warn!(error = %err, retry_in = ?after, "embedding attempt failed, retrying");
        })
        .call();

    match result {
        Ok(embeddings) => {
            if embeddings.len() != texts.len() {
                return Err(MnemeError::Embed(format!(
                    "count mismatch: sent {} texts, got {} vectors",
                    texts.len(),
                    embeddings.len()
                )));
            }
            Ok(embeddings)
        }
        Err(_) if cancel.is_cancelled() => Err(MnemeError::Cancelled),
        Err(e) => Err(MnemeError::Embed(format!(
            "failed after {} attempts: {e}",
            EMBED_MAX_RETRIES + 1
        ))),
    }
}

/// Embed a single text, with retries.
pub fn embed_single(
    embedder: &dyn Embedder,
    text: &str,
    cancel: &CancellationToken,
) -> Result<Vec<f32>, MnemeError> {
    let texts = [text.to_string()];
    let results = embed_with_retry(embedder, &texts, cancel)?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| MnemeError::Embed("empty embedding response".into()))
}

// ---------------------------------------------------------------------------
// Ollama adapter (POST /api/embed)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// Embedder backed by the Ollama HTTP API.
pub struct OllamaEmbedder {
    base_url: String,
    model: String,
    client: reqwest::blocking::Client,
}

impl OllamaEmbedder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        let base_url: String = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.into(),
            client: reqwest::blocking::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("failed to build HTTP client"),
        }
    }
}

impl Embedder for OllamaEmbedder {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MnemeError> {
        let resp = self
            .client
            .post(format!("{}/api/embed", self.base_url))
            .json(&EmbedRequest { model: &self.model, input: texts })
            .send()
            .map_err(|e| MnemeError::Embed(format!("request failed: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(MnemeError::Embed(format!("HTTP {status}: {body}")));
        }

        let parsed: EmbedResponse = resp
            .json()
            .map_err(|e| MnemeError::Embed(format!("response parse failed: {e}")))?;

        if parsed.embeddings.is_empty() {
            return Err(MnemeError::Embed("empty response".into()));
        }
        Ok(parsed.embeddings)
    }

    fn model(&self) -> &str {
        &self.model
    }
}
