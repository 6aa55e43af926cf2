//! # Core Error Types

use thiserror::Error;

/// Errors raised while decoding cell data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Input ended before a complete header.
    #[error("truncated input: need {expected} bytes, have {actual}")]
    Truncated {
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// Block array length does not match the declared height.
    #[error("block data size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Bytes implied by the header.
        expected: usize,
        /// Bytes present.
        actual: usize,
    },

    /// Unknown compression tag in a payload frame.
    #[error("unknown compression tag {0}")]
    UnknownCompression(u8),

    /// LZ4 body could not be decompressed.
    #[error("decompression failed: {0}")]
    Decompress(String),
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
