//! Coordinate math between node, block and sector space, plus the 64-bit block key codec.
//!
//! Node positions are plain [`IVec3`] values. Block and sector positions have
//! their own small integer types so the two spaces cannot be mixed up.
//! All conversions use floor division, so node `-1` lives in block `-1`.

use glam::IVec3;
use serde::{Deserialize, Serialize};

/// Edge length of a block, in nodes.
pub const BLOCK_SIZE: i32 = 16;

/// Number of nodes in one block.
pub const BLOCK_VOLUME: usize = (BLOCK_SIZE * BLOCK_SIZE * BLOCK_SIZE) as usize;

/// Default world generation limit in nodes along each axis.
pub const MAX_MAP_GENERATION_LIMIT: i32 = 31000;

/// The six face-adjacent offsets, ordered +X, -X, +Y, -Y, +Z, -Z.
pub const FACE_NEIGHBORS: [IVec3; 6] = [
    IVec3::new(1, 0, 0),
    IVec3::new(-1, 0, 0),
    IVec3::new(0, 1, 0),
    IVec3::new(0, -1, 0),
    IVec3::new(0, 0, 1),
    IVec3::new(0, 0, -1),
];

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Position of a block in block-grid units.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct BlockPos {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

impl BlockPos {
    /// Creates a new block position.
    pub const fn new(x: i16, y: i16, z: i16) -> Self {
        Self { x, y, z }
    }

    /// Returns the block offset by `(dx, dy, dz)`, saturating at the `i16` range.
    pub fn offset(self, dx: i16, dy: i16, dz: i16) -> Self {
        Self {
            x: self.x.saturating_add(dx),
            y: self.y.saturating_add(dy),
            z: self.z.saturating_add(dz),
        }
    }

    /// The six face-adjacent block positions.
    pub fn face_neighbors(self) -> [BlockPos; 6] {
        [
            self.offset(1, 0, 0),
            self.offset(-1, 0, 0),
            self.offset(0, 1, 0),
            self.offset(0, -1, 0),
            self.offset(0, 0, 1),
            self.offset(0, 0, -1),
        ]
    }

    /// Returns the sector column this block belongs to.
    pub fn sector(self) -> SectorPos {
        SectorPos::new(self.x, self.z)
    }

    fn as_ivec3(self) -> IVec3 {
        IVec3::new(self.x as i32, self.y as i32, self.z as i32)
    }
}

/// Position of a sector (a vertical column of blocks) in block-grid units.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectorPos {
    pub x: i16,
    pub z: i16,
}

impl SectorPos {
    /// Creates a new sector position.
    pub const fn new(x: i16, z: i16) -> Self {
        Self { x, z }
    }
}

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

/// Returns the block containing the node at `p`.
///
/// Nodes beyond the `i16` block grid clamp to its edge, which is always
/// over the generation limit, so they never alias a block near the origin.
pub fn node_to_block(p: IVec3) -> BlockPos {
    let b = p.div_euclid(IVec3::splat(BLOCK_SIZE));
    BlockPos::new(clamp_i16(b.x), clamp_i16(b.y), clamp_i16(b.z))
}

fn clamp_i16(v: i32) -> i16 {
    v.clamp(i16::MIN as i32, i16::MAX as i32) as i16
}

/// Returns the block containing `p` together with `p`'s offset inside that block.
///
/// Every component of the offset is in `0..BLOCK_SIZE`.
pub fn node_to_block_with_offset(p: IVec3) -> (BlockPos, IVec3) {
    let offset = p.rem_euclid(IVec3::splat(BLOCK_SIZE));
    (node_to_block(p), offset)
}

/// Returns the minimum-corner node position of a block.
pub fn block_to_node(b: BlockPos) -> IVec3 {
    b.as_ivec3() * BLOCK_SIZE
}

/// Returns the sector containing the block at `b`.
pub fn block_to_sector(b: BlockPos) -> SectorPos {
    b.sector()
}

/// Returns the sector containing the node at `p`.
pub fn node_to_sector(p: IVec3) -> SectorPos {
    node_to_block(p).sector()
}

/// Returns `true` if any component of `b` lies beyond `limit` nodes from the origin.
pub fn block_over_limit(b: BlockPos, limit: i32) -> bool {
    let max = limit / BLOCK_SIZE;
    let v = b.as_ivec3();
    v.x < -max || v.x > max || v.y < -max || v.y > max || v.z < -max || v.z > max
}

/// Returns the base block of the generation chunk containing `b`.
///
/// Chunks are `chunk_size` blocks wide and offset by `-chunk_size / 2`, which
/// keeps the world origin near the middle of a chunk.
pub fn chunk_base(b: BlockPos, chunk_size: i16) -> BlockPos {
    let size = chunk_size.max(1) as i32;
    let offset = -(size / 2);
    let rel = b.as_ivec3() - IVec3::splat(offset);
    let base = rel.div_euclid(IVec3::splat(size)) * size + IVec3::splat(offset);
    BlockPos::new(base.x as i16, base.y as i16, base.z as i16)
}

// ---------------------------------------------------------------------------
// Block keys
// ---------------------------------------------------------------------------

/// Encodes a block position as a 64-bit database key.
///
/// The layout is `z * 2^24 + y * 2^12 + x` over 12-bit signed components.
/// Keys do not preserve any spatial ordering.
pub fn block_key_encode(b: BlockPos) -> i64 {
    (b.z as i64) * 0x100_0000 + (b.y as i64) * 0x1000 + b.x as i64
}

/// Decodes a key produced by [`block_key_encode`].
pub fn block_key_decode(key: i64) -> BlockPos {
    let x = unsigned_to_signed(key.rem_euclid(4096), 2048);
    let key = (key - x) / 4096;
    let y = unsigned_to_signed(key.rem_euclid(4096), 2048);
    let key = (key - y) / 4096;
    let z = unsigned_to_signed(key.rem_euclid(4096), 2048);
    BlockPos::new(x as i16, y as i16, z as i16)
}

fn unsigned_to_signed(value: i64, max_positive: i64) -> i64 {
    if value < max_positive {
        value
    } else {
        value - 2 * max_positive
    }
}

// ---------------------------------------------------------------------------
// Areas
// ---------------------------------------------------------------------------

/// An inclusive axis-aligned box of node positions with an affine index.
///
/// Indexing is row-major with X fastest: `(z - min.z) * ey * ex + (y - min.y) * ex + (x - min.x)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeArea {
    pub min: IVec3,
    pub max: IVec3,
}

impl NodeArea {
    /// Creates an area spanning `min..=max`.
    pub fn new(min: IVec3, max: IVec3) -> Self {
        Self { min, max }
    }

    /// An area containing no positions.
    pub fn empty() -> Self {
        Self {
            min: IVec3::ZERO,
            max: IVec3::splat(-1),
        }
    }

    /// The node area covered by one block.
    pub fn of_block(b: BlockPos) -> Self {
        let min = block_to_node(b);
        Self::new(min, min + IVec3::splat(BLOCK_SIZE - 1))
    }

    /// The node area covered by an inclusive block range.
    pub fn of_blocks(range: BlockRange) -> Self {
        let min = block_to_node(range.min);
        let max = block_to_node(range.max) + IVec3::splat(BLOCK_SIZE - 1);
        Self::new(min, max)
    }

    pub fn is_empty(&self) -> bool {
        self.max.x < self.min.x || self.max.y < self.min.y || self.max.z < self.min.z
    }

    /// Size along each axis; zero for empty areas.
    pub fn extent(&self) -> IVec3 {
        if self.is_empty() {
            IVec3::ZERO
        } else {
            self.max - self.min + IVec3::ONE
        }
    }

    /// Number of positions in the area.
    pub fn volume(&self) -> usize {
        let e = self.extent();
        e.x as usize * e.y as usize * e.z as usize
    }

    pub fn contains(&self, p: IVec3) -> bool {
        !self.is_empty()
            && p.x >= self.min.x
            && p.y >= self.min.y
            && p.z >= self.min.z
            && p.x <= self.max.x
            && p.y <= self.max.y
            && p.z <= self.max.z
    }

    /// Returns `true` if `other` lies entirely inside this area.
    pub fn contains_area(&self, other: &NodeArea) -> bool {
        other.is_empty() || (self.contains(other.min) && self.contains(other.max))
    }

    /// Flat index of `p`. The caller must ensure `p` is contained.
    pub fn index(&self, p: IVec3) -> usize {
        let e = self.extent();
        let d = p - self.min;
        (d.z as usize * e.y as usize + d.y as usize) * e.x as usize + d.x as usize
    }

    /// Inverse of [`index`](Self::index).
    pub fn position(&self, index: usize) -> IVec3 {
        let e = self.extent();
        let ex = e.x as usize;
        let exy = ex * e.y as usize;
        let z = index / exy;
        let y = (index % exy) / ex;
        let x = index % ex;
        self.min + IVec3::new(x as i32, y as i32, z as i32)
    }

    /// Smallest area containing both `self` and `other`.
    pub fn union(&self, other: &NodeArea) -> NodeArea {
        if self.is_empty() {
            return *other;
        }
        if other.is_empty() {
            return *self;
        }
        NodeArea::new(self.min.min(other.min), self.max.max(other.max))
    }

    /// Intersection of two areas; may be empty.
    pub fn intersect(&self, other: &NodeArea) -> NodeArea {
        let a = NodeArea::new(self.min.max(other.min), self.max.min(other.max));
        if a.is_empty() { NodeArea::empty() } else { a }
    }

    /// Returns `true` if `p` lies on the outer shell of the area.
    pub fn is_border(&self, p: IVec3) -> bool {
        p.x == self.min.x
            || p.y == self.min.y
            || p.z == self.min.z
            || p.x == self.max.x
            || p.y == self.max.y
            || p.z == self.max.z
    }

    /// Iterates every position, X fastest, then Y, then Z.
    pub fn iter(&self) -> impl Iterator<Item = IVec3> + '_ {
        let area = *self;
        (0..self.volume()).map(move |i| area.position(i))
    }
}

impl Default for NodeArea {
    fn default() -> Self {
        Self::empty()
    }
}

/// An inclusive box of block positions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BlockRange {
    pub min: BlockPos,
    pub max: BlockPos,
}

impl BlockRange {
    pub fn new(min: BlockPos, max: BlockPos) -> Self {
        Self { min, max }
    }

    /// A range holding a single block.
    pub fn single(b: BlockPos) -> Self {
        Self { min: b, max: b }
    }

    /// Grows the range by `n` blocks on every side.
    pub fn padded(&self, n: i16) -> Self {
        Self {
            min: self.min.offset(-n, -n, -n),
            max: self.max.offset(n, n, n),
        }
    }

    pub fn contains(&self, b: BlockPos) -> bool {
        b.x >= self.min.x
            && b.y >= self.min.y
            && b.z >= self.min.z
            && b.x <= self.max.x
            && b.y <= self.max.y
            && b.z <= self.max.z
    }

    /// Number of blocks in the range.
    pub fn len(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        let dx = (self.max.x as i32 - self.min.x as i32 + 1) as usize;
        let dy = (self.max.y as i32 - self.min.y as i32 + 1) as usize;
        let dz = (self.max.z as i32 - self.min.z as i32 + 1) as usize;
        dx * dy * dz
    }

    pub fn is_empty(&self) -> bool {
        self.max.x < self.min.x || self.max.y < self.min.y || self.max.z < self.min.z
    }

    /// Iterates every block position, X fastest.
    pub fn iter(&self) -> impl Iterator<Item = BlockPos> + '_ {
        let r = *self;
        let (x0, x1) = (r.min.x as i32, r.max.x as i32);
        let (y0, y1) = (r.min.y as i32, r.max.y as i32);
        let (z0, z1) = (r.min.z as i32, r.max.z as i32);
        (z0..=z1).flat_map(move |z| {
            (y0..=y1).flat_map(move |y| {
                (x0..=x1).map(move |x| BlockPos::new(x as i16, y as i16, z as i16))
            })
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_nodes_floor_to_negative_blocks() {
        assert_eq!(node_to_block(IVec3::new(-1, -16, -17)), BlockPos::new(-1, -1, -2));
        assert_eq!(node_to_block(IVec3::new(0, 15, 16)), BlockPos::new(0, 0, 1));

        let (b, off) = node_to_block_with_offset(IVec3::new(-1, 33, -16));
        assert_eq!(b, BlockPos::new(-1, 2, -1));
        assert_eq!(off, IVec3::new(15, 1, 0));
    }

    #[test]
    fn test_block_to_node_is_min_corner() {
        assert_eq!(block_to_node(BlockPos::new(-2, 0, 3)), IVec3::new(-32, 0, 48));
        for p in [IVec3::new(-17, 5, 31), IVec3::new(0, 0, 0), IVec3::new(-1, -1, -1)] {
            let (b, off) = node_to_block_with_offset(p);
            assert_eq!(block_to_node(b) + off, p);
        }
    }

    #[test]
    fn test_block_key_roundtrip_full_range() {
        for z in (-2048i16..2048).step_by(97) {
            for y in (-2048i16..2048).step_by(89) {
                for x in [-2048i16, -1937, -1, 0, 1, 1000, 1937, 2047] {
                    let p = BlockPos::new(x, y, z);
                    assert_eq!(block_key_decode(block_key_encode(p)), p, "at {p:?}");
                }
            }
        }
    }

    #[test]
    fn test_block_key_known_values() {
        assert_eq!(block_key_encode(BlockPos::new(0, 0, 0)), 0);
        assert_eq!(block_key_encode(BlockPos::new(1, 0, 0)), 1);
        assert_eq!(block_key_encode(BlockPos::new(0, 1, 0)), 4096);
        assert_eq!(block_key_encode(BlockPos::new(0, 0, -1)), -16_777_216);
        assert_eq!(block_key_decode(-1), BlockPos::new(-1, 0, 0));
    }

    #[test]
    fn test_far_nodes_clamp_instead_of_wrapping() {
        let far = IVec3::new(0, 0, 16 * 65536);
        let b = node_to_block(far);
        assert_eq!(b, BlockPos::new(0, 0, i16::MAX));
        assert!(block_over_limit(b, MAX_MAP_GENERATION_LIMIT));
        assert_eq!(
            node_to_block(IVec3::splat(i32::MIN)),
            BlockPos::new(i16::MIN, i16::MIN, i16::MIN)
        );
    }

    #[test]
    fn test_block_over_limit() {
        let limit = MAX_MAP_GENERATION_LIMIT;
        assert!(!block_over_limit(BlockPos::new(1937, -1937, 0), limit));
        assert!(block_over_limit(BlockPos::new(1938, 0, 0), limit));
        assert!(block_over_limit(BlockPos::new(0, 0, -1938), limit));
    }

    #[test]
    fn test_chunk_base_offsets_around_origin() {
        assert_eq!(chunk_base(BlockPos::new(0, 0, 0), 5), BlockPos::new(-2, -2, -2));
        assert_eq!(chunk_base(BlockPos::new(2, 2, 2), 5), BlockPos::new(-2, -2, -2));
        assert_eq!(chunk_base(BlockPos::new(3, -3, 0), 5), BlockPos::new(3, -7, -2));
        assert_eq!(chunk_base(BlockPos::new(7, 0, 0), 1), BlockPos::new(7, 0, 0));
    }

    #[test]
    fn test_node_area_index_roundtrip() {
        let area = NodeArea::new(IVec3::new(-3, 2, -1), IVec3::new(4, 5, 1));
        assert_eq!(area.volume(), 8 * 4 * 3);
        for (i, p) in area.iter().enumerate() {
            assert_eq!(area.index(p), i);
            assert!(area.contains(p));
        }
        assert!(!area.contains(IVec3::new(5, 2, 0)));
    }

    #[test]
    fn test_node_area_union_and_intersect() {
        let a = NodeArea::of_block(BlockPos::new(0, 0, 0));
        let b = NodeArea::of_block(BlockPos::new(1, 0, 0));
        let u = a.union(&b);
        assert_eq!(u.extent(), IVec3::new(32, 16, 16));
        assert!(a.intersect(&b).is_empty());
        assert_eq!(NodeArea::empty().union(&a), a);
        assert_eq!(u.intersect(&b), b);
    }

    #[test]
    fn test_block_range_iter() {
        let r = BlockRange::new(BlockPos::new(-1, 0, 0), BlockPos::new(0, 1, 0));
        let all: Vec<_> = r.iter().collect();
        assert_eq!(all.len(), r.len());
        assert_eq!(all[0], BlockPos::new(-1, 0, 0));
        assert_eq!(all[3], BlockPos::new(0, 1, 0));
        assert_eq!(r.padded(1).len(), 4 * 4 * 3);
    }
}
