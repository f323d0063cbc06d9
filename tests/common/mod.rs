//! Shared test fixtures: in-memory stores and stub backends.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use mneme::{Embedder, FactStore, Generator, MnemeError, SqlitePool};

pub fn mem_pool() -> SqlitePool {
    FactStore::open_pool(":memory:").expect("in-memory pool")
}

pub fn mem_store() -> Arc<FactStore> {
    store_on(mem_pool(), None, "")
}

pub fn store_on(
    pool: SqlitePool,
    embedder: Option<Arc<dyn Embedder>>,
    namespace: &str,
) -> Arc<FactStore> {
    Arc::new(FactStore::new(pool, embedder, namespace).expect("open store"))
}

/// Deterministic bag-of-words embedding: each lowercased word hashes into a
/// 32-bucket count vector, so texts sharing words have positive cosine
/// similarity and unrelated texts (mostly) don't.
pub fn bow_vector(text: &str) -> Vec<f32> {
    let mut v = vec![0.0f32; 32];
    for word in text.to_lowercase().split_whitespace() {
        let mut h: u32 = 2166136261;
        for b in word.bytes() {
            h ^= u32::from(b);
            h = h.wrapping_mul(16777619);
        }
        v[(h % 32) as usize] += 1.0;
    }
    v
}

pub struct BowEmbedder;

impl Embedder for BowEmbedder {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MnemeError> {
        Ok(texts.iter().map(|t| bow_vector(t)).collect())
    }

    fn model(&self) -> &str {
        "bow-test"
    }
}

/// Maps every text to the same vector, so any two texts have cosine
/// similarity 1.0. The vector dimension is configurable for tests that pin
/// fact embeddings explicitly.
pub struct ConstEmbedder {
    pub vector: Vec<f32>,
    pub model: String,
}

impl ConstEmbedder {
    pub fn new(vector: Vec<f32>) -> Self {
        Self { vector, model: "const-test".into() }
    }

    pub fn with_model(vector: Vec<f32>, model: &str) -> Self {
        Self { vector, model: model.into() }
    }
}

impl Embedder for ConstEmbedder {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MnemeError> {
        Ok(texts.iter().map(|_| self.vector.clone()).collect())
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Replays canned responses in order; errors once exhausted.
pub struct ScriptedGenerator {
    responses: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(String::from).collect()),
        }
    }
}

impl Generator for ScriptedGenerator {
    fn generate(&self, _prompt: &str) -> Result<String, MnemeError> {
        let mut responses = self.responses.lock().unwrap();
        if responses.is_empty() {
            return Err(MnemeError::Generate("no scripted response left".into()));
        }
        Ok(responses.remove(0))
    }
}

/// Always fails; for exercising top-level generator errors.
pub struct FailingGenerator;

impl Generator for FailingGenerator {
    fn generate(&self, _prompt: &str) -> Result<String, MnemeError> {
        Err(MnemeError::Generate("backend unavailable".into()))
    }
}
