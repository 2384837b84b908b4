use thiserror::Error;

#[derive(Error, Debug)]
pub enum MemError {
    #[error("Memory not found: {0}")]
    NotFound(String),

    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Only produced by the strict decrypt primitive. The field-level codec
    /// falls back to the original value instead.
    #[error("Encryption key mismatch or corrupted ciphertext")]
    EncryptionKeyMismatch,

    #[error("No embedding function configured")]
    EmbeddingUnavailable,

    #[error("Embedding function failed: {0}")]
    Embedding(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Vector dimension mismatch: expected {expected}, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Poisoned lock: {0}")]
    Poisoned(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MemError>;
