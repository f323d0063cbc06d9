#[derive(Debug, thiserror::Error)]
pub enum MnemeError {
    #[error("fact {0} not found")]
    NotFound(i64),

    #[error("fact {0} not found or already superseded")]
    NotFoundOrSuperseded(i64),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("embedding model mismatch: store has {stored:?}, embedder provides {configured:?}")]
    ModelMismatch { stored: String, configured: String },

    #[error("no embedder configured")]
    NoEmbedder,

    #[error("embedding failed: {0}")]
    Embed(String),

    #[error("generation failed: {0}")]
    Generate(String),

    #[error("schema migration: {0}")]
    Schema(String),

    #[error("unsupported export version {0}")]
    UnsupportedVersion(u32),

    #[error("operation cancelled")]
    Cancelled,

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("connection pool: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
