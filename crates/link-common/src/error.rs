/// Error types shared by the linking core and its infrastructure clients.
///
/// Per-article failures (`NoEmbedding`, `MalformedNode`, `InvalidSpan`, `ValidationRejected`)
/// are meant to be caught and counted by the caller. `ServiceUnavailable` aborts the stage
/// that needed the embedding service. Application errors are defined in the binary crate and
/// wrap `CommonError` via `#[from]`.

#[derive(Debug, thiserror::Error)]
pub enum CommonError {
    #[error("no embedding computed for {0}")]
    NoEmbedding(String),

    #[error("malformed node: {0}")]
    MalformedNode(String),

    #[error("invalid span {start}..{end}: {reason}")]
    InvalidSpan {
        start: usize,
        end: usize,
        reason: String,
    },

    #[error("vector dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding service unavailable after {attempts} attempts: {message}")]
    ServiceUnavailable { attempts: u32, message: String },

    #[error("cms rejected write for {id}: {message}")]
    ValidationRejected { id: String, message: String },

    #[error("cms error: {0}")]
    Cms(String),

    #[error("embedding error: {0}")]
    Embedding(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
