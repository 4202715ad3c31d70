//! Error types for encoding and decoding records.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding or decoding records.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Serialization to CBOR failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// Deserialization from CBOR failed.
    #[error("decode error: {0}")]
    Decode(String),

    /// The decoded structure is not what was expected.
    #[error("invalid structure: {0}")]
    InvalidStructure(String),
}

impl CodecError {
    /// Creates an invalid structure error.
    pub fn invalid_structure(message: impl Into<String>) -> Self {
        Self::InvalidStructure(message.into())
    }
}
