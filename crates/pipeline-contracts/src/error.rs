//! Error types for contract encoding and decoding

use thiserror::Error;

/// Result type alias using ContractError
pub type Result<T> = std::result::Result<T, ContractError>;

/// Errors raised while encoding or decoding contract payloads
#[derive(Debug, Error)]
pub enum ContractError {
    /// JSON (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// zstd compression or decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// The payload was produced for a different type
    #[error("Payload kind mismatch: expected '{expected}', found '{found}'")]
    KindMismatch { expected: String, found: String },

    /// The payload was written by a newer codec than this build understands
    #[error("Unsupported payload version {found} for '{kind}' (supports up to {supported})")]
    UnsupportedVersion {
        kind: String,
        found: u16,
        supported: u16,
    },
}
