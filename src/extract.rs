//! LLM-backed fact extraction and automatic supersession.
//!
//! The pipeline runs generate → parse → dedup → embed → insert →
//! auto-supersede. Per-fact failures are downgraded to entries in the
//! outcome's error list; only a generator failure aborts the whole run.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::db::{Fact, FactInput, FactStore, SearchOpts};
use crate::embed::{self, Embedder};
use crate::error::MnemeError;
use crate::prompts;
use crate::vector;

/// Minimum cosine similarity between a new fact's embedding and an existing
/// same-subject fact's embedding to trigger automatic supersession.
/// Conservative: the pair must be nearly paraphrasing the same claim.
pub const SIMILARITY_THRESHOLD: f64 = 0.85;

/// Produces text completions from a prompt.
pub trait Generator: Send + Sync {
    fn generate(&self, prompt: &str) -> Result<String, MnemeError>;

    /// Structured JSON output mode. Defaults to plain generation; backends
    /// with a native JSON mode override this for more reliable parsing.
    fn generate_json(&self, prompt: &str) -> Result<String, MnemeError> {
        self.generate(prompt)
    }
}

/// Domain context to guide extraction.
#[derive(Debug, Clone, Default)]
pub struct ExtractHints {
    /// Name/role the facts are being extracted for.
    pub persona: String,
    /// Domains to prioritize.
    pub focus: Vec<String>,
    /// Restrict to these categories; empty = all defaults.
    pub categories: Vec<String>,
}

/// Options for one extraction run. Facts land in the store's namespace.
#[derive(Debug, Clone, Default)]
pub struct ExtractOpts {
    /// Default subject when the generator omits one.
    pub subject: String,
    pub hints: ExtractHints,
}

/// Outcome of an extraction run.
#[derive(Debug, Default)]
pub struct ExtractOutcome {
    pub inserted: Vec<Fact>,
    /// Skipped via `exists`.
    pub duplicates: usize,
    /// Old facts auto-superseded by new ones.
    pub superseded: usize,
    /// Per-fact parse/embed/insert failures.
    pub errors: Vec<String>,
}

type PromptFn = dyn Fn(&str, &ExtractHints) -> String + Send + Sync;

/// Distills unstructured text into persisted facts using a generator.
pub struct FactExtractor {
    store: Arc<FactStore>,
    embedder: Option<Arc<dyn Embedder>>,
    generator: Arc<dyn Generator>,
    prompt_fn: Option<Box<PromptFn>>,
}

/// Intermediate representation parsed from generator output.
#[derive(Debug, Deserialize)]
struct ParsedFact {
    #[serde(default)]
    content: String,
    #[serde(default)]
    subject: String,
    #[serde(default)]
    category: String,
}

impl FactExtractor {
    pub fn new(
        store: Arc<FactStore>,
        embedder: Option<Arc<dyn Embedder>>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        Self { store, embedder, generator, prompt_fn: None }
    }

    /// Override the default prompt builder.
    pub fn set_prompt_fn(
        &mut self,
        f: impl Fn(&str, &ExtractHints) -> String + Send + Sync + 'static,
    ) {
        self.prompt_fn = Some(Box::new(f));
    }

    /// Extract facts from text and persist them.
    pub fn extract(
        &self,
        text: &str,
        opts: &ExtractOpts,
        cancel: &CancellationToken,
    ) -> Result<ExtractOutcome, MnemeError> {
        let prompt = match &self.prompt_fn {
            Some(f) => f(text, &opts.hints),
            None => prompts::extraction_prompt(text, &opts.hints),
        };

        // Generator failure is the only top-level error.
        let raw = self.generator.generate_json(&prompt)?;

        let mut outcome = ExtractOutcome::default();
        let parsed = match parse_extraction(&raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                outcome.errors.push(e.to_string());
                Vec::new()
            }
        };
        debug!(count = parsed.len(), "parsed extraction candidates");

        for pf in &parsed {
            if cancel.is_cancelled() {
                return Err(MnemeError::Cancelled);
            }

            let content = pf.content.trim();
            if content.is_empty() {
                continue;
            }
            let subject =
                if pf.subject.is_empty() { opts.subject.as_str() } else { pf.subject.as_str() };
            let category =
                if pf.category.is_empty() { "note" } else { pf.category.as_str() };

            match self.store.exists(content, subject) {
                Ok(true) => {
                    outcome.duplicates += 1;
                    continue;
                }
                Ok(false) => {}
                Err(e) => {
                    outcome.errors.push(format!("exists check for {content:?}: {e}"));
                    continue;
                }
            }

            let mut input = FactInput::new(content, subject, category);
            if let Some(embedder) = self.embedder.as_deref() {
                match embed::embed_single(embedder, content, cancel) {
                    Ok(emb) => input = input.embedding(emb),
                    Err(MnemeError::Cancelled) => return Err(MnemeError::Cancelled),
                    Err(e) => {
                        outcome.errors.push(format!("embedding {content:?}: {e}"));
                        continue;
                    }
                }
            }

            let fact = match self.store.insert(input) {
                Ok(fact) => fact,
                Err(e) => {
                    outcome.errors.push(format!("inserting {content:?}: {e}"));
                    continue;
                }
            };

            // Auto-supersession runs after insert so the new fact has an id.
            match self.try_supersede_existing(&fact, cancel) {
                Ok(Some(_)) => outcome.superseded += 1,
                Ok(None) => {}
                Err(MnemeError::Cancelled) => return Err(MnemeError::Cancelled),
                Err(e) => outcome.errors.push(format!("supersede check for {content:?}: {e}")),
            }

            outcome.inserted.push(fact);
        }

        Ok(outcome)
    }

    /// Search for same-subject active facts with high embedding similarity
    /// and supersede the best match. Returns the superseded fact's id, or
    /// `None` when nothing crossed the threshold.
    ///
    /// Metadata acts as a context discriminator: when both facts carry
    /// metadata and any shared key differs, supersession is skipped so facts
    /// from different contexts never replace each other.
    pub fn try_supersede_existing(
        &self,
        new_fact: &Fact,
        cancel: &CancellationToken,
    ) -> Result<Option<i64>, MnemeError> {
        if self.embedder.is_none() || new_fact.id == 0 {
            return Ok(None);
        }
        let Some(new_emb) = new_fact.embedding.as_deref() else {
            return Ok(None);
        };

        let opts = SearchOpts {
            max_results: 10,
            subject: Some(new_fact.subject.clone()),
            only_active: true,
            ..Default::default()
        };
        let results = self.store.search(&new_fact.content, &opts, cancel)?;

        let mut best_id = 0i64;
        let mut best_sim = 0.0f64;
        for r in &results {
            if r.fact.id == new_fact.id {
                continue;
            }
            let Some(emb) = r.fact.embedding.as_deref() else {
                continue;
            };
            if metadata_conflicts(new_fact.metadata.as_ref(), r.fact.metadata.as_ref()) {
                continue;
            }
            let sim = vector::cosine_similarity(new_emb, emb);
            if sim > best_sim {
                best_sim = sim;
                best_id = r.fact.id;
            }
        }

        if best_sim < SIMILARITY_THRESHOLD || best_id == 0 {
            return Ok(None);
        }

        self.store.supersede(best_id, new_fact.id)?;
        Ok(Some(best_id))
    }
}

/// True iff both values are non-empty JSON objects and any shared top-level
/// key has a different scalar representation. Empty, absent, or non-object
/// metadata never blocks — bare facts may freely replace each other.
pub fn metadata_conflicts(a: Option<&Value>, b: Option<&Value>) -> bool {
    let (Some(Value::Object(ma)), Some(Value::Object(mb))) = (a, b) else {
        return false;
    };
    if ma.is_empty() || mb.is_empty() {
        return false;
    }
    ma.iter()
        .any(|(k, va)| mb.get(k).is_some_and(|vb| scalar_repr(va) != scalar_repr(vb)))
}

fn scalar_repr(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parse generator output into candidate facts. Tries a direct array parse
/// first, then the outermost `[..]` block for output wrapped in markdown
/// fences or prose.
fn parse_extraction(raw: &str) -> Result<Vec<ParsedFact>, MnemeError> {
    let raw = raw.trim();
    match serde_json::from_str(raw) {
        Ok(facts) => Ok(facts),
        Err(err) => {
            if let (Some(start), Some(end)) = (raw.find('['), raw.rfind(']')) {
                if end > start {
                    if let Ok(facts) = serde_json::from_str(&raw[start..=end]) {
                        return Ok(facts);
                    }
                }
            }
            Err(MnemeError::Generate(format!(
                "failed to parse extraction response: {err}"
            )))
        }
    }
}
