//! A batched gather, compute, scatter view over several blocks.
//!
//! [`VoxelCursor`] copies the nodes of a box of blocks into one flat array
//! addressed by a [`NodeArea`], so propagation code can read and write any
//! node in O(1) without resolving sectors and blocks each time. Results go
//! back to the world with [`VoxelCursor::blit_back`], which writes only the
//! nodes that actually differ.
//!
//! Blocks that could not be loaded are kept in the cursor but flagged as
//! having no data. Their nodes read as `None` and are never written back.

use std::collections::{BTreeMap, BTreeSet};

use glam::IVec3;

use crate::block::{Block, Epoch, ModState};
use crate::node::Node;
use crate::pos::{BLOCK_SIZE, BlockPos, BlockRange, NodeArea, block_to_node};
use crate::store::{BlockLookup, WorldStore};

const FLAG_NO_DATA: u8 = 0x01;

/// Flat copy of a box of blocks.
#[derive(Clone, Debug, Default)]
pub struct VoxelCursor {
    area: NodeArea,
    nodes: Vec<Node>,
    flags: Vec<u8>,
    /// Every block the cursor covers and whether it holds data.
    blocks: BTreeMap<BlockPos, bool>,
}

impl VoxelCursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// The node area currently covered.
    pub fn area(&self) -> NodeArea {
        self.area
    }

    /// Number of node slots held.
    pub fn volume(&self) -> usize {
        self.nodes.len()
    }

    /// Copies in every block of `range`, loading or generating blocks that
    /// are not resident. Blocks that still cannot be obtained are flagged as
    /// having no data.
    pub fn emerge(&mut self, store: &mut WorldStore, range: BlockRange) {
        self.add_area(NodeArea::of_blocks(range));
        for pos in range.iter() {
            if self.blocks.contains_key(&pos) {
                continue;
            }
            if let Err(e) = store.emerge_block(pos, true) {
                tracing::debug!("Cursor could not emerge {pos:?}: {e}");
            }
            self.copy_from_store(store, pos);
        }
    }

    /// Like [`emerge`](Self::emerge) but only copies blocks that are already
    /// resident. Never touches storage or the generator.
    pub fn emerge_resident(&mut self, store: &WorldStore, range: BlockRange) {
        self.add_area(NodeArea::of_blocks(range));
        for pos in range.iter() {
            if !self.blocks.contains_key(&pos) {
                self.copy_from_store(store, pos);
            }
        }
    }

    fn copy_from_store(&mut self, store: &WorldStore, pos: BlockPos) {
        match store.get_block(pos) {
            BlockLookup::Found(block) => self.insert_block(block),
            BlockLookup::NotResident | BlockLookup::OutOfRange => {
                self.blocks.insert(pos, false);
            }
        }
    }

    /// Copies a block into the cursor, growing the area to cover it.
    ///
    /// A block already covered is overwritten.
    pub fn insert_block(&mut self, block: &Block) {
        self.add_area(NodeArea::of_block(block.pos()));
        let base = block_to_node(block.pos());
        let row = BLOCK_SIZE as usize;
        let src = block.nodes();
        for z in 0..BLOCK_SIZE {
            for y in 0..BLOCK_SIZE {
                let s = (z as usize * row + y as usize) * row;
                let d = self.area.index(base + IVec3::new(0, y, z));
                self.nodes[d..d + row].copy_from_slice(&src[s..s + row]);
                self.flags[d..d + row].fill(0);
            }
        }
        self.blocks.insert(block.pos(), true);
    }

    /// Grows the covered area to the bounding box of itself and `area`.
    ///
    /// Existing contents are kept; new slots read as no data.
    pub fn add_area(&mut self, area: NodeArea) {
        if area.is_empty() || self.area.contains_area(&area) {
            return;
        }
        let grown = self.area.union(&area);
        let volume = grown.volume();
        let mut nodes = vec![Node::ignore(); volume];
        let mut flags = vec![FLAG_NO_DATA; volume];

        if !self.area.is_empty() {
            let old = self.area;
            let row = old.extent().x as usize;
            for z in old.min.z..=old.max.z {
                for y in old.min.y..=old.max.y {
                    let start = IVec3::new(old.min.x, y, z);
                    let s = old.index(start);
                    let d = grown.index(start);
                    nodes[d..d + row].copy_from_slice(&self.nodes[s..s + row]);
                    flags[d..d + row].copy_from_slice(&self.flags[s..s + row]);
                }
            }
        }

        self.area = grown;
        self.nodes = nodes;
        self.flags = flags;
    }

    /// Drops all contents and blocks.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Returns `true` if `p` is inside the covered area.
    pub fn contains(&self, p: IVec3) -> bool {
        self.area.contains(p)
    }

    /// Returns `true` if `p` is covered and its block holds data.
    pub fn has_data(&self, p: IVec3) -> bool {
        self.area.contains(p) && self.flags[self.area.index(p)] & FLAG_NO_DATA == 0
    }

    /// The node at `p`, or `None` if it is outside the area or has no data.
    pub fn get(&self, p: IVec3) -> Option<Node> {
        self.has_data(p).then(|| self.nodes[self.area.index(p)])
    }

    /// The node at `p`, or `IGNORE` if it is unavailable.
    pub fn get_or_ignore(&self, p: IVec3) -> Node {
        self.get(p).unwrap_or(Node::ignore())
    }

    /// Mutable access to a node with data.
    pub fn get_mut(&mut self, p: IVec3) -> Option<&mut Node> {
        if !self.has_data(p) {
            return None;
        }
        let i = self.area.index(p);
        Some(&mut self.nodes[i])
    }

    /// Writes a node. Returns `false` (and writes nothing) if `p` is outside
    /// the area or has no data.
    pub fn set(&mut self, p: IVec3, node: Node) -> bool {
        match self.get_mut(p) {
            Some(slot) => {
                *slot = node;
                true
            }
            None => false,
        }
    }

    /// Covered blocks and whether each holds data.
    pub fn blocks(&self) -> impl Iterator<Item = (BlockPos, bool)> + '_ {
        self.blocks.iter().map(|(pos, data)| (*pos, *data))
    }

    /// Whether a covered block holds data; `None` if the block is not covered.
    pub fn block_has_data(&self, pos: BlockPos) -> Option<bool> {
        self.blocks.get(&pos).copied()
    }

    /// Writes every differing node back to its resident block.
    ///
    /// Blocks that changed are raised to write-needed and get their epochs
    /// bumped once. Returns the positions of those blocks.
    pub fn blit_back(&self, store: &mut WorldStore) -> BTreeSet<BlockPos> {
        let mut modified = BTreeSet::new();
        for (&pos, &has_data) in &self.blocks {
            if !has_data {
                continue;
            }
            let Some(block) = store.get_block_mut(pos) else {
                continue;
            };
            if self.blit_block(block) {
                modified.insert(pos);
            }
        }
        modified
    }

    fn blit_block(&self, block: &mut Block) -> bool {
        let base = block_to_node(block.pos());
        let row = BLOCK_SIZE as usize;
        let mut diffs = Vec::new();
        let current = block.nodes();
        for z in 0..BLOCK_SIZE {
            for y in 0..BLOCK_SIZE {
                let s = (z as usize * row + y as usize) * row;
                let d = self.area.index(base + IVec3::new(0, y, z));
                for x in 0..row {
                    if self.flags[d + x] & FLAG_NO_DATA != 0 {
                        continue;
                    }
                    let node = self.nodes[d + x];
                    if node != current[s + x] {
                        diffs.push((s + x, node));
                    }
                }
            }
        }
        if diffs.is_empty() {
            return false;
        }

        let (mut content, mut light) = (false, false);
        let nodes = block.nodes_mut();
        for (i, node) in diffs {
            let old = nodes[i];
            content |= old.content != node.content || old.param2 != node.param2;
            light |= old.param1 != node.param1;
            nodes[i] = node;
        }
        if content {
            block.bump_epoch(Epoch::Content);
        }
        if light {
            block.bump_epoch(Epoch::Light);
        }
        block.raise_modified(ModState::WriteNeeded);
        true
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
