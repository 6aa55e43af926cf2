//! # Payload Compression
//!
//! Encoded cells are compressed once per cache entry and the same bytes are
//! shipped to every session that wants the cell.
//!
//! ## Frame
//!
//! ```text
//! ┌──────────┬──────────────────────────────┐
//! │ tag (u8) │ body                         │
//! └──────────┴──────────────────────────────┘
//!   0 = raw     body is the encoded cell
//!   1 = lz4     body is lz4 with prepended size
//! ```
//!
//! Payloads shorter than the configured threshold are stored raw; LZ4 only
//! pays for itself on larger inputs.

use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

const TAG_RAW: u8 = 0;
const TAG_LZ4: u8 = 1;

/// Compression algorithm applied to cell payloads.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// LZ4 block compression.
    #[default]
    Lz4,
    /// No compression.
    Raw,
}

/// Compression settings. Part of every cache key: two sessions only share
/// payloads when they agree on these settings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Algorithm used for payloads at or above the threshold.
    pub algorithm: CompressionAlgorithm,
    /// Minimum payload size in bytes before compression is attempted.
    pub threshold: usize,
}

impl CompressionConfig {
    /// LZ4 with the default threshold.
    #[must_use]
    pub const fn lz4() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Lz4,
            threshold: 256,
        }
    }

    /// Never compress.
    #[must_use]
    pub const fn raw() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Raw,
            threshold: 0,
        }
    }

    /// Compresses an encoded cell into a tagged frame.
    #[must_use]
    pub fn compress(&self, data: &[u8]) -> Vec<u8> {
        let use_lz4 = self.algorithm == CompressionAlgorithm::Lz4 && data.len() >= self.threshold;
        if use_lz4 {
            let body = compress_prepend_size(data);
            let mut frame = Vec::with_capacity(body.len() + 1);
            frame.push(TAG_LZ4);
            frame.extend_from_slice(&body);
            frame
        } else {
            let mut frame = Vec::with_capacity(data.len() + 1);
            frame.push(TAG_RAW);
            frame.extend_from_slice(data);
            frame
        }
    }

    /// Reverses [`CompressionConfig::compress`]. The tag byte decides the
    /// algorithm, so any config can decode any frame.
    ///
    /// # Errors
    ///
    /// Fails on an empty frame, an unknown tag, or corrupt LZ4 data.
    pub fn decompress(frame: &[u8]) -> CoreResult<Vec<u8>> {
        let (&tag, body) = frame.split_first().ok_or(CoreError::Truncated {
            expected: 1,
            actual: 0,
        })?;
        match tag {
            TAG_RAW => Ok(body.to_vec()),
            TAG_LZ4 => decompress_size_prepended(body).map_err(|e| CoreError::Decompress(e.to_string())),
            other => Err(CoreError::UnknownCompression(other)),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self::lz4()
    }
}
