//! A fixed-size cube of nodes with change epochs, generation and persistence state.
//!
//! [`Block`] wraps a [`NodeBuffer`] of `16 × 16 × 16` nodes addressed by
//! local coordinates in `0..16`. Out-of-block access never panics: reads
//! return `None` and writes return [`OutsideBlock`].

use std::collections::BTreeMap;

use glam::IVec3;
use serde::{Deserialize, Serialize};

use crate::content::ContentRegistry;
use crate::node::{LightBank, Node};
use crate::pos::{BLOCK_SIZE, BlockPos, SectorPos};
use crate::snapshot::{BlockSnapshot, NodeBuffer};

/// Opaque per-node metadata. The store only tracks its existence.
pub type NodeMetadata = BTreeMap<String, String>;

/// How far map generation has progressed for a block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Generation {
    /// Nothing generated yet; contents are placeholders.
    #[default]
    Ungenerated,
    /// Touched by a neighbouring chunk's generation only.
    Partial,
    /// Fully generated.
    Full,
}

impl Generation {
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            Generation::Ungenerated => 0,
            Generation::Partial => 1,
            Generation::Full => 2,
        }
    }

    pub(crate) fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(Generation::Ungenerated),
            1 => Some(Generation::Partial),
            2 => Some(Generation::Full),
            _ => None,
        }
    }
}

/// Persistence state. Ordered so that a block only ever moves up until saved.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ModState {
    /// Identical to the stored copy.
    #[default]
    Clean,
    /// Minor changes; save when the block is unloaded.
    WriteAtUnload,
    /// Must be saved on the next save pass.
    WriteNeeded,
}

/// What a changed epoch counter tracks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Epoch {
    /// Content ids or `param2` changed.
    Content,
    /// Light values changed.
    Light,
    /// Node metadata changed.
    Metadata,
}

impl Epoch {
    fn index(self) -> usize {
        match self {
            Epoch::Content => 0,
            Epoch::Light => 1,
            Epoch::Metadata => 2,
        }
    }
}

/// Returned when a local position lies outside `0..16` on some axis.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("local position {0} is outside the block")]
pub struct OutsideBlock(pub IVec3);

/// A resident block of the world.
#[derive(Clone, Debug)]
pub struct Block {
    pos: BlockPos,
    /// Non-owning back-reference to the owning sector.
    sector: SectorPos,
    nodes: NodeBuffer,
    epochs: [u64; 3],
    generation: Generation,
    lighting_expired: bool,
    is_underground: bool,
    mod_state: ModState,
    usage_timer: f32,
    metadata: BTreeMap<u16, NodeMetadata>,
}

impl Block {
    /// A blank block: every node is `IGNORE`, nothing is generated and lighting is expired.
    pub fn new_blank(pos: BlockPos) -> Self {
        Self::with_buffer(pos, NodeBuffer::filled(Node::ignore()))
    }

    /// A block with every node set to `node`.
    pub fn new_filled(pos: BlockPos, node: Node) -> Self {
        Self::with_buffer(pos, NodeBuffer::filled(node))
    }

    pub(crate) fn with_buffer(pos: BlockPos, nodes: NodeBuffer) -> Self {
        Self {
            pos,
            sector: pos.sector(),
            nodes,
            epochs: [0; 3],
            generation: Generation::Ungenerated,
            lighting_expired: true,
            is_underground: false,
            mod_state: ModState::Clean,
            usage_timer: 0.0,
            metadata: BTreeMap::new(),
        }
    }

    pub fn pos(&self) -> BlockPos {
        self.pos
    }

    /// The sector this block belongs to.
    pub fn sector_pos(&self) -> SectorPos {
        self.sector
    }

    /// Flat storage index of a local position, or `None` if outside the block.
    pub fn local_index(local: IVec3) -> Option<usize> {
        let in_range = |v: i32| (0..BLOCK_SIZE).contains(&v);
        if !(in_range(local.x) && in_range(local.y) && in_range(local.z)) {
            return None;
        }
        let s = BLOCK_SIZE as usize;
        Some((local.z as usize * s + local.y as usize) * s + local.x as usize)
    }

    /// Returns the node at `local`, or `None` if outside the block.
    pub fn get_node(&self, local: IVec3) -> Option<Node> {
        Self::local_index(local).map(|i| self.nodes.get()[i])
    }

    /// Returns the node at `local`, or `IGNORE` if outside the block.
    pub fn get_node_or_ignore(&self, local: IVec3) -> Node {
        self.get_node(local).unwrap_or(Node::ignore())
    }

    /// Writes a node, bumps the matching epochs and raises the block to write-needed.
    pub fn set_node(&mut self, local: IVec3, node: Node) -> Result<(), OutsideBlock> {
        let i = Self::local_index(local).ok_or(OutsideBlock(local))?;
        let old = self.nodes.get()[i];
        if old == node {
            return Ok(());
        }
        self.nodes.get_mut()[i] = node;
        self.note_node_change(old, node);
        self.raise_modified(ModState::WriteNeeded);
        Ok(())
    }

    /// All nodes in storage order.
    pub fn nodes(&self) -> &[Node] {
        self.nodes.get()
    }

    /// Mutable node storage. Callers are responsible for epochs and modification state.
    pub(crate) fn nodes_mut(&mut self) -> &mut [Node] {
        self.nodes.get_mut()
    }

    /// Bumps the epochs that a change from `old` to `new` affects.
    pub(crate) fn note_node_change(&mut self, old: Node, new: Node) {
        if old.content != new.content || old.param2 != new.param2 {
            self.bump_epoch(Epoch::Content);
        }
        if old.param1 != new.param1 {
            self.bump_epoch(Epoch::Light);
        }
    }

    /// An immutable view of the current nodes for another thread.
    pub fn snapshot(&self) -> BlockSnapshot {
        BlockSnapshot::new(
            self.pos,
            &self.nodes,
            self.changed_epoch(Epoch::Content),
            self.changed_epoch(Epoch::Light),
        )
    }

    pub fn changed_epoch(&self, epoch: Epoch) -> u64 {
        self.epochs[epoch.index()]
    }

    pub fn bump_epoch(&mut self, epoch: Epoch) {
        self.epochs[epoch.index()] += 1;
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn set_generation(&mut self, generation: Generation) {
        self.generation = generation;
    }

    /// Returns `true` once the block is fully generated.
    pub fn is_generated(&self) -> bool {
        self.generation == Generation::Full
    }

    pub fn lighting_expired(&self) -> bool {
        self.lighting_expired
    }

    pub fn set_lighting_expired(&mut self, expired: bool) {
        self.lighting_expired = expired;
    }

    /// Heuristic: `true` if the block is believed to be below the surface.
    pub fn is_underground(&self) -> bool {
        self.is_underground
    }

    pub fn set_underground(&mut self, underground: bool) {
        self.is_underground = underground;
    }

    pub fn mod_state(&self) -> ModState {
        self.mod_state
    }

    /// Raises the modification state. Lower states never overwrite higher ones.
    pub fn raise_modified(&mut self, state: ModState) {
        if state > self.mod_state {
            self.mod_state = state;
        }
    }

    /// Marks the block as matching its stored copy.
    pub fn reset_modified(&mut self) {
        self.mod_state = ModState::Clean;
    }

    /// Seconds since the block was last used.
    pub fn usage_timer(&self) -> f32 {
        self.usage_timer
    }

    pub fn increment_usage_timer(&mut self, dtime: f32) {
        self.usage_timer += dtime;
    }

    pub fn reset_usage_timer(&mut self) {
        self.usage_timer = 0.0;
    }

    /// Metadata attached to the node at `local`.
    pub fn metadata(&self, local: IVec3) -> Option<&NodeMetadata> {
        let i = Self::local_index(local)?;
        self.metadata.get(&(i as u16))
    }

    /// Attaches metadata to a node, replacing any previous value.
    pub fn set_metadata(&mut self, local: IVec3, meta: NodeMetadata) -> Result<(), OutsideBlock> {
        let i = Self::local_index(local).ok_or(OutsideBlock(local))?;
        self.metadata.insert(i as u16, meta);
        self.bump_epoch(Epoch::Metadata);
        self.raise_modified(ModState::WriteNeeded);
        Ok(())
    }

    /// Detaches and returns a node's metadata.
    pub fn remove_metadata(&mut self, local: IVec3) -> Option<NodeMetadata> {
        let i = Self::local_index(local)?;
        let removed = self.metadata.remove(&(i as u16));
        if removed.is_some() {
            self.bump_epoch(Epoch::Metadata);
            self.raise_modified(ModState::WriteNeeded);
        }
        removed
    }

    /// Metadata entries by storage index.
    pub fn metadata_entries(&self) -> impl Iterator<Item = (u16, &NodeMetadata)> {
        self.metadata.iter().map(|(i, m)| (*i, m))
    }

    pub(crate) fn insert_metadata_raw(&mut self, index: u16, meta: NodeMetadata) {
        self.metadata.insert(index, meta);
    }

    /// Returns `true` if any node's day light differs from its night light.
    pub fn day_night_differs(&self, registry: &ContentRegistry) -> bool {
        self.nodes.get().iter().any(|n| {
            let f = registry.get(n.content);
            n.light(LightBank::Day, f) != n.light(LightBank::Night, f)
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentFeatures;
    use crate::node::ContentId;

    #[test]
    fn test_blank_block_is_ignore_and_ungenerated() {
        let block = Block::new_blank(BlockPos::new(1, -2, 3));
        assert_eq!(block.get_node(IVec3::ZERO), Some(Node::ignore()));
        assert_eq!(block.generation(), Generation::Ungenerated);
        assert!(block.lighting_expired());
        assert_eq!(block.mod_state(), ModState::Clean);
        assert_eq!(block.sector_pos(), SectorPos::new(1, 3));
    }

    #[test]
    fn test_set_then_get_roundtrip() {
        let mut block = Block::new_filled(BlockPos::default(), Node::air());
        let stone = Node::new(ContentId(4));
        block.set_node(IVec3::new(5, 10, 15), stone).unwrap();
        assert_eq!(block.get_node(IVec3::new(5, 10, 15)), Some(stone));
        assert_eq!(block.get_node(IVec3::new(4, 10, 15)), Some(Node::air()));
        assert_eq!(block.mod_state(), ModState::WriteNeeded);
    }

    #[test]
    fn test_out_of_block_access_is_rejected() {
        let mut block = Block::new_filled(BlockPos::default(), Node::air());
        assert_eq!(block.get_node(IVec3::new(16, 0, 0)), None);
        assert_eq!(block.get_node(IVec3::new(0, -1, 0)), None);
        assert_eq!(block.get_node_or_ignore(IVec3::new(0, 0, 99)), Node::ignore());
        let err = block.set_node(IVec3::new(0, 16, 0), Node::air());
        assert_eq!(err, Err(OutsideBlock(IVec3::new(0, 16, 0))));
        assert_eq!(block.changed_epoch(Epoch::Content), 0);
    }

    #[test]
    fn test_epochs_track_content_and_light_separately() {
        let mut block = Block::new_filled(BlockPos::default(), Node::air());
        block
            .set_node(IVec3::ZERO, Node::with_params(ContentId::AIR, 5, 0))
            .unwrap();
        assert_eq!(block.changed_epoch(Epoch::Light), 1);
        assert_eq!(block.changed_epoch(Epoch::Content), 0);

        block.set_node(IVec3::ZERO, Node::new(ContentId(2))).unwrap();
        assert_eq!(block.changed_epoch(Epoch::Content), 1);
        assert_eq!(block.changed_epoch(Epoch::Light), 2);

        // Writing the same value again changes nothing.
        block.set_node(IVec3::ZERO, Node::new(ContentId(2))).unwrap();
        assert_eq!(block.changed_epoch(Epoch::Content), 1);
    }

    #[test]
    fn test_mod_state_only_raises() {
        let mut block = Block::new_filled(BlockPos::default(), Node::air());
        block.raise_modified(ModState::WriteNeeded);
        block.raise_modified(ModState::WriteAtUnload);
        assert_eq!(block.mod_state(), ModState::WriteNeeded);
        block.reset_modified();
        assert_eq!(block.mod_state(), ModState::Clean);
    }

    #[test]
    fn test_metadata_side_table() {
        let mut block = Block::new_filled(BlockPos::default(), Node::air());
        let p = IVec3::new(1, 2, 3);
        assert!(block.metadata(p).is_none());

        let mut meta = NodeMetadata::new();
        meta.insert("owner".to_string(), "sam".to_string());
        block.set_metadata(p, meta.clone()).unwrap();
        assert_eq!(block.metadata(p), Some(&meta));
        assert_eq!(block.changed_epoch(Epoch::Metadata), 1);

        assert_eq!(block.remove_metadata(p), Some(meta));
        assert!(block.metadata(p).is_none());
        assert_eq!(block.metadata_entries().count(), 0);
    }

    #[test]
    fn test_snapshot_survives_mutation() {
        let mut block = Block::new_filled(BlockPos::default(), Node::air());
        let snap = block.snapshot();
        block.set_node(IVec3::ZERO, Node::new(ContentId(9))).unwrap();
        assert_eq!(snap.nodes()[0], Node::air());
        assert_eq!(snap.content_epoch(), 0);
        assert_eq!(block.snapshot().content_epoch(), 1);
    }

    #[test]
    fn test_day_night_differs() {
        let reg = ContentRegistry::new();
        let mut block = Block::new_filled(BlockPos::default(), Node::air());
        assert!(!block.day_night_differs(&reg));

        let mut lit = Node::air();
        lit.set_light(LightBank::Day, 15, &ContentFeatures::air());
        block.set_node(IVec3::ZERO, lit).unwrap();
        assert!(block.day_night_differs(&reg));
    }

    #[test]
    fn test_usage_timer() {
        let mut block = Block::new_filled(BlockPos::default(), Node::air());
        block.increment_usage_timer(1.5);
        block.increment_usage_timer(2.0);
        assert!((block.usage_timer() - 3.5).abs() < f32::EPSILON);
        block.reset_usage_timer();
        assert_eq!(block.usage_timer(), 0.0);
    }
}
