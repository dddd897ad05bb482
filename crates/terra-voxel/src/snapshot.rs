//! Copy-on-write node storage and the read-only snapshots handed to renderers.
//!
//! A [`NodeBuffer`] keeps its nodes behind an [`Arc`]. Taking a
//! [`BlockSnapshot`] only clones the `Arc`; the next mutation of the block
//! clones the array if a snapshot is still alive. A snapshot therefore never
//! sees a half-finished write, and the world thread never waits for readers.

use std::sync::Arc;

use crate::node::Node;
use crate::pos::{BLOCK_VOLUME, BlockPos};

/// Copy-on-write array of exactly [`BLOCK_VOLUME`] nodes.
#[derive(Clone, Debug)]
pub struct NodeBuffer {
    nodes: Arc<Vec<Node>>,
}

impl NodeBuffer {
    /// A buffer with every node set to `node`.
    pub fn filled(node: Node) -> Self {
        Self {
            nodes: Arc::new(vec![node; BLOCK_VOLUME]),
        }
    }

    /// Wraps an existing node vector.
    ///
    /// Returns `None` unless `nodes` holds exactly [`BLOCK_VOLUME`] entries.
    pub fn from_vec(nodes: Vec<Node>) -> Option<Self> {
        (nodes.len() == BLOCK_VOLUME).then(|| Self {
            nodes: Arc::new(nodes),
        })
    }

    /// Immutable access. Always cheap.
    pub fn get(&self) -> &[Node] {
        &self.nodes
    }

    /// Mutable access; clones the array first if a snapshot still shares it.
    pub fn get_mut(&mut self) -> &mut [Node] {
        Arc::make_mut(&mut self.nodes).as_mut_slice()
    }

    /// Returns `true` if any snapshot still shares this array.
    pub fn is_shared(&self) -> bool {
        Arc::strong_count(&self.nodes) > 1
    }

    fn share(&self) -> Arc<Vec<Node>> {
        Arc::clone(&self.nodes)
    }
}

/// Immutable view of a block's nodes at one point in time.
#[derive(Clone, Debug)]
pub struct BlockSnapshot {
    pos: BlockPos,
    content_epoch: u64,
    light_epoch: u64,
    nodes: Arc<Vec<Node>>,
}

impl BlockSnapshot {
    pub(crate) fn new(
        pos: BlockPos,
        buffer: &NodeBuffer,
        content_epoch: u64,
        light_epoch: u64,
    ) -> Self {
        Self {
            pos,
            content_epoch,
            light_epoch,
            nodes: buffer.share(),
        }
    }

    pub fn pos(&self) -> BlockPos {
        self.pos
    }

    /// The nodes, indexed like [`Block`](crate::Block) storage.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Content epoch of the block when the snapshot was taken.
    pub fn content_epoch(&self) -> u64 {
        self.content_epoch
    }

    /// Light epoch of the block when the snapshot was taken.
    pub fn light_epoch(&self) -> u64 {
        self.light_epoch
    }

    /// Returns `true` if both snapshots share the same node allocation.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.nodes, &other.nodes)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ContentId;

    #[test]
    fn test_snapshot_unaffected_by_later_write() {
        let mut buffer = NodeBuffer::filled(Node::air());
        let snap = BlockSnapshot::new(BlockPos::default(), &buffer, 0, 0);
        assert!(buffer.is_shared());

        buffer.get_mut()[0] = Node::new(ContentId(7));

        assert_eq!(buffer.get()[0].content, ContentId(7));
        assert_eq!(snap.nodes()[0], Node::air(), "snapshot must keep the old value");
        assert!(!buffer.is_shared());
    }

    #[test]
    fn test_write_without_snapshot_does_not_clone() {
        let mut buffer = NodeBuffer::filled(Node::air());
        let before = buffer.get().as_ptr();
        buffer.get_mut()[1] = Node::new(ContentId(2));
        assert_eq!(buffer.get().as_ptr(), before);
    }

    #[test]
    fn test_two_snapshots_share_allocation() {
        let buffer = NodeBuffer::filled(Node::ignore());
        let a = BlockSnapshot::new(BlockPos::new(1, 2, 3), &buffer, 4, 5);
        let b = BlockSnapshot::new(BlockPos::new(1, 2, 3), &buffer, 4, 5);
        assert!(a.ptr_eq(&b));
        assert_eq!(a.content_epoch(), 4);
        assert_eq!(a.light_epoch(), 5);
    }

    #[test]
    fn test_from_vec_rejects_wrong_length() {
        assert!(NodeBuffer::from_vec(vec![Node::air(); 10]).is_none());
        assert!(NodeBuffer::from_vec(vec![Node::air(); BLOCK_VOLUME]).is_some());
    }
}
