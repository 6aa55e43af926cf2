//! # Cell Data
//!
//! The world is split into columns of blocks called cells. A cell is
//! addressed by an `(x, z)` pair and stored in maps under a packed 64-bit
//! key.
//!
//! ## Key Layout
//!
//! ```text
//!  63            32 31             0
//! ┌────────────────┬────────────────┐
//! │   x (as u32)   │   z (as u32)   │
//! └────────────────┴────────────────┘
//! ```
//!
//! Packing is a bijection over the full `i32` range of both axes.
//!
//! ## Snapshot Format
//!
//! A snapshot encodes as a 10 byte header (`x: i32`, `z: i32`,
//! `height: u16`, little endian) followed by the raw block array.

use std::fmt;

use bytemuck::{Pod, Zeroable};

use crate::error::{CoreError, CoreResult};

/// Cell width/depth in blocks.
pub const CELL_SIZE: usize = 16;

/// Default cell height in blocks.
pub const DEFAULT_CELL_HEIGHT: u16 = 256;

/// Size of the encoded snapshot header in bytes.
const HEADER_LEN: usize = 10;

/// Packed 64-bit map key of a cell coordinate.
pub type CellKey = u64;

/// Cell coordinate (identifies a cell in the world grid).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellCoord {
    /// X coordinate (in cells, not blocks).
    pub x: i32,
    /// Z coordinate (in cells, not blocks).
    pub z: i32,
}

impl CellCoord {
    /// Creates a new cell coordinate.
    #[inline]
    #[must_use]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Converts world block coordinates to the containing cell.
    #[inline]
    #[must_use]
    pub const fn from_block_pos(block_x: i32, block_z: i32) -> Self {
        Self {
            x: block_x.div_euclid(CELL_SIZE as i32),
            z: block_z.div_euclid(CELL_SIZE as i32),
        }
    }

    /// Packs the coordinate into its map key.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn to_key(self) -> CellKey {
        ((self.x as u32 as u64) << 32) | (self.z as u32 as u64)
    }

    /// Unpacks a map key produced by [`CellCoord::to_key`].
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub const fn from_key(key: CellKey) -> Self {
        Self {
            x: (key >> 32) as u32 as i32,
            z: key as u32 as i32,
        }
    }

    /// Chebyshev distance to another cell, used as a load priority.
    #[inline]
    #[must_use]
    pub const fn distance_to(self, other: Self) -> u32 {
        let dx = self.x.abs_diff(other.x);
        let dz = self.z.abs_diff(other.z);
        if dx > dz {
            dx
        } else {
            dz
        }
    }
}

impl fmt::Display for CellCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.x, self.z)
    }
}

/// A single block in a cell.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct Block {
    /// Block type ID.
    pub id: u16,
    /// Block metadata (rotation, variant, etc.).
    pub meta: u16,
}

impl Block {
    /// Air block (empty).
    pub const AIR: Self = Self { id: 0, meta: 0 };
    /// Stone block.
    pub const STONE: Self = Self { id: 2, meta: 0 };
    /// Bedrock block.
    pub const BEDROCK: Self = Self { id: 7, meta: 0 };
    /// Diamond ore, the kind of block worth hiding.
    pub const DIAMOND_ORE: Self = Self { id: 56, meta: 0 };

    /// Creates a new block with given ID.
    #[inline]
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self { id, meta: 0 }
    }

    /// Creates a block with ID and metadata.
    #[inline]
    #[must_use]
    pub const fn with_meta(id: u16, meta: u16) -> Self {
        Self { id, meta }
    }

    /// Returns true if this is an air block.
    #[inline]
    #[must_use]
    pub const fn is_air(self) -> bool {
        self.id == 0
    }
}

/// Immutable copy of one cell's content.
///
/// Snapshots are taken on the control thread and handed to worker threads,
/// so they own all of their data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CellSnapshot {
    coord: CellCoord,
    height: u16,
    /// Block data (indexed as `[y][z][x]`).
    blocks: Vec<Block>,
}

impl CellSnapshot {
    /// Creates a snapshot filled with a single block type.
    #[must_use]
    pub fn filled(coord: CellCoord, height: u16, block: Block) -> Self {
        Self {
            coord,
            height,
            blocks: vec![block; CELL_SIZE * CELL_SIZE * usize::from(height)],
        }
    }

    /// Creates an all-air snapshot.
    #[must_use]
    pub fn empty(coord: CellCoord, height: u16) -> Self {
        Self::filled(coord, height, Block::AIR)
    }

    /// Returns the cell this snapshot was taken from.
    #[inline]
    #[must_use]
    pub const fn coord(&self) -> CellCoord {
        self.coord
    }

    /// Returns the cell height in blocks.
    #[inline]
    #[must_use]
    pub const fn height(&self) -> u16 {
        self.height
    }

    #[inline]
    fn index(&self, x: usize, y: usize, z: usize) -> Option<usize> {
        if x < CELL_SIZE && z < CELL_SIZE && y < usize::from(self.height) {
            Some((y * CELL_SIZE + z) * CELL_SIZE + x)
        } else {
            None
        }
    }

    /// Gets a block at local coordinates. Out of range reads return air.
    #[inline]
    #[must_use]
    pub fn block(&self, x: usize, y: usize, z: usize) -> Block {
        self.index(x, y, z).map_or(Block::AIR, |i| self.blocks[i])
    }

    /// Sets a block at local coordinates. Out of range writes are ignored.
    #[inline]
    pub fn set_block(&mut self, x: usize, y: usize, z: usize, block: Block) {
        if let Some(i) = self.index(x, y, z) {
            self.blocks[i] = block;
        }
    }

    /// Mutable access to the raw block array, for transforms.
    #[inline]
    pub fn blocks_mut(&mut self) -> &mut [Block] {
        &mut self.blocks
    }

    /// Read access to the raw block array.
    #[inline]
    #[must_use]
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Encodes the snapshot into its uncompressed wire form.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let block_bytes: &[u8] = bytemuck::cast_slice(&self.blocks);
        let mut buf = Vec::with_capacity(HEADER_LEN + block_bytes.len());
        buf.extend_from_slice(&self.coord.x.to_le_bytes());
        buf.extend_from_slice(&self.coord.z.to_le_bytes());
        buf.extend_from_slice(&self.height.to_le_bytes());
        buf.extend_from_slice(block_bytes);
        buf
    }

    /// Decodes a snapshot produced by [`CellSnapshot::encode`].
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::Truncated`] when the header is incomplete and
    /// [`CoreError::SizeMismatch`] when the block array has the wrong size.
    pub fn decode(data: &[u8]) -> CoreResult<Self> {
        if data.len() < HEADER_LEN {
            return Err(CoreError::Truncated {
                expected: HEADER_LEN,
                actual: data.len(),
            });
        }
        let x = i32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let z = i32::from_le_bytes([data[4], data[5], data[6], data[7]]);
        let height = u16::from_le_bytes([data[8], data[9]]);

        let body = &data[HEADER_LEN..];
        let expected = CELL_SIZE * CELL_SIZE * usize::from(height) * std::mem::size_of::<Block>();
        if body.len() != expected {
            return Err(CoreError::SizeMismatch {
                expected,
                actual: body.len(),
            });
        }

        let blocks = body
            .chunks_exact(std::mem::size_of::<Block>())
            .map(bytemuck::pod_read_unaligned::<Block>)
            .collect();

        Ok(Self {
            coord: CellCoord::new(x, z),
            height,
            blocks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_lossless_at_extremes() {
        let coords = [
            CellCoord::new(0, 0),
            CellCoord::new(-1, -1),
            CellCoord::new(i32::MIN, i32::MAX),
            CellCoord::new(i32::MAX, i32::MIN),
            CellCoord::new(-30_000, 12),
        ];
        for coord in coords {
            assert_eq!(CellCoord::from_key(coord.to_key()), coord, "{coord}");
        }
    }

    #[test]
    fn test_distinct_coords_get_distinct_keys() {
        assert_ne!(CellCoord::new(0, 1).to_key(), CellCoord::new(1, 0).to_key());
        assert_ne!(CellCoord::new(0, -1).to_key(), CellCoord::new(-1, 0).to_key());
    }

    #[test]
    fn test_cell_from_block() {
        assert_eq!(CellCoord::from_block_pos(15, 15), CellCoord::new(0, 0));
        assert_eq!(CellCoord::from_block_pos(16, -1), CellCoord::new(1, -1));
        assert_eq!(CellCoord::from_block_pos(-17, -16), CellCoord::new(-2, -1));
    }

    #[test]
    fn test_distance() {
        let origin = CellCoord::new(0, 0);
        assert_eq!(origin.distance_to(CellCoord::new(3, -5)), 5);
        assert_eq!(origin.distance_to(origin), 0);
    }

    #[test]
    fn test_snapshot_encode_decode() {
        let mut snapshot = CellSnapshot::filled(CellCoord::new(-4, 9), 32, Block::STONE);
        snapshot.set_block(3, 10, 7, Block::DIAMOND_ORE);

        let restored = CellSnapshot::decode(&snapshot.encode()).unwrap();
        assert_eq!(restored, snapshot);
        assert_eq!(restored.block(3, 10, 7), Block::DIAMOND_ORE);
    }

    #[test]
    fn test_decode_rejects_short_input() {
        assert!(matches!(
            CellSnapshot::decode(&[1, 2, 3]),
            Err(CoreError::Truncated { .. })
        ));

        let mut bytes = CellSnapshot::empty(CellCoord::new(0, 0), 4).encode();
        bytes.pop();
        assert!(matches!(
            CellSnapshot::decode(&bytes),
            Err(CoreError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_out_of_range_access() {
        let mut snapshot = CellSnapshot::empty(CellCoord::new(0, 0), 8);
        snapshot.set_block(0, 8, 0, Block::STONE);
        assert_eq!(snapshot.block(0, 8, 0), Block::AIR);
        assert_eq!(snapshot.block(16, 0, 0), Block::AIR);
    }
}
