//! # UMBRA Core
//!
//! Plain data shared by every stage of the cell delivery pipeline.
//!
//! ## Contents
//!
//! - `CellCoord`: cell address plus its lossless 64-bit map key
//! - `CellSnapshot`: immutable cell content, safe to ship to a worker
//! - `CompressionConfig`: LZ4 framing for ready-to-send payloads
//! - `CellStatus`: per-session delivery state
//!
//! ## Example
//!
//! ```rust
//! use umbra_core::{Block, CellCoord, CellSnapshot, CompressionConfig};
//!
//! let coord = CellCoord::new(-3, 12);
//! assert_eq!(CellCoord::from_key(coord.to_key()), coord);
//!
//! let snapshot = CellSnapshot::filled(coord, 16, Block::STONE);
//! let frame = CompressionConfig::lz4().compress(&snapshot.encode());
//! let decoded = CellSnapshot::decode(&CompressionConfig::decompress(&frame).unwrap()).unwrap();
//! assert_eq!(decoded, snapshot);
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod cell;
pub mod compression;
pub mod error;
pub mod status;

pub use cell::{Block, CellCoord, CellKey, CellSnapshot, CELL_SIZE, DEFAULT_CELL_HEIGHT};
pub use compression::{CompressionAlgorithm, CompressionConfig};
pub use error::{CoreError, CoreResult};
pub use status::{CellStatus, SessionId, WorldId};
