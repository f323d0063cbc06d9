//! Embedding blob codec and similarity math.
//!
//! Embeddings are stored as raw little-endian float32 sequences, 4 bytes per
//! dimension, no header. The format is shared with the export/import tooling
//! and must stay stable.

/// Serialize an f32 vector to little-endian bytes for SQLite BLOB storage.
pub fn encode_f32s(v: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(v.len() * 4);
    for &f in v {
        buf.extend_from_slice(&f.to_le_bytes());
    }
    buf
}

/// Deserialize little-endian bytes back to an f32 vector.
/// A trailing partial chunk (length not a multiple of 4) is ignored.
pub fn decode_f32s(buf: &[u8]) -> Vec<f32> {
    buf.chunks_exact(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().expect("4-byte chunk");
            f32::from_le_bytes(arr)
        })
        .collect()
}

/// Cosine similarity between two vectors, accumulated in f64.
/// Returns 0.0 if the vectors differ in length, are empty, or either has
/// zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for i in 0..a.len() {
        let (fa, fb) = (a[i] as f64, b[i] as f64);
        dot += fa * fb;
        norm_a += fa * fa;
        norm_b += fb * fb;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}
