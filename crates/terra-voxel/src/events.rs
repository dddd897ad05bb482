//! Map edit notifications.
//!
//! The world store dispatches a [`MapEditEvent`] to every registered
//! [`MapEventReceiver`] after an edit that other systems (meshing, networking)
//! must hear about. [`ChannelReceiver`] forwards events over a crossbeam
//! channel for consumers living on another thread.

use std::collections::BTreeSet;

use crossbeam_channel::Sender;
use glam::IVec3;

use crate::node::Node;
use crate::pos::{BlockPos, BlockRange, NodeArea};

/// What kind of edit an event describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapEditKind {
    /// A node was placed.
    AddNode,
    /// A node was removed (replaced with air).
    RemoveNode,
    /// A node was replaced without the usual place/remove side effects.
    SwapNode,
    /// Node metadata changed.
    BlockMetadataChanged,
    /// Anything else; only `modified_blocks` is meaningful.
    Other,
}

/// A single map edit and every block it touched.
#[derive(Clone, Debug, PartialEq)]
pub struct MapEditEvent {
    pub kind: MapEditKind,
    /// The edited node position; unused for [`MapEditKind::Other`].
    pub pos: IVec3,
    /// The node written at `pos`, if any.
    pub node: Node,
    /// Blocks whose contents (including light) changed.
    pub modified_blocks: BTreeSet<BlockPos>,
}

impl MapEditEvent {
    /// An event with no position, covering the given blocks.
    pub fn other(modified_blocks: BTreeSet<BlockPos>) -> Self {
        Self {
            kind: MapEditKind::Other,
            pos: IVec3::ZERO,
            node: Node::ignore(),
            modified_blocks,
        }
    }

    /// The node area the event affects.
    ///
    /// Node edits report the single edited node. [`MapEditKind::Other`]
    /// reports the bounding box of all modified blocks.
    pub fn area(&self) -> NodeArea {
        match self.kind {
            MapEditKind::AddNode
            | MapEditKind::RemoveNode
            | MapEditKind::SwapNode
            | MapEditKind::BlockMetadataChanged => NodeArea::new(self.pos, self.pos),
            MapEditKind::Other => {
                let (Some(first), Some(last)) =
                    (self.modified_blocks.first(), self.modified_blocks.last())
                else {
                    return NodeArea::empty();
                };
                let mut range = BlockRange::new(*first, *last);
                for b in &self.modified_blocks {
                    range.min = BlockPos::new(
                        range.min.x.min(b.x),
                        range.min.y.min(b.y),
                        range.min.z.min(b.z),
                    );
                    range.max = BlockPos::new(
                        range.max.x.max(b.x),
                        range.max.y.max(b.y),
                        range.max.z.max(b.z),
                    );
                }
                NodeArea::of_blocks(range)
            }
        }
    }
}

/// Something that wants to hear about map edits.
pub trait MapEventReceiver: Send {
    fn on_map_edit(&mut self, event: &MapEditEvent);
}

/// Handle returned by [`EventReceivers::add`], used to remove the receiver again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ReceiverId(u64);

/// Ordered registry of event receivers.
#[derive(Default)]
pub struct EventReceivers {
    receivers: Vec<(ReceiverId, Box<dyn MapEventReceiver>)>,
    next_id: u64,
}

impl EventReceivers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a receiver. Receivers are called in registration order.
    pub fn add(&mut self, receiver: Box<dyn MapEventReceiver>) -> ReceiverId {
        let id = ReceiverId(self.next_id);
        self.next_id += 1;
        self.receivers.push((id, receiver));
        id
    }

    /// Unregisters and returns a receiver.
    pub fn remove(&mut self, id: ReceiverId) -> Option<Box<dyn MapEventReceiver>> {
        let index = self.receivers.iter().position(|(rid, _)| *rid == id)?;
        Some(self.receivers.remove(index).1)
    }

    /// Delivers `event` to every receiver.
    pub fn dispatch(&mut self, event: &MapEditEvent) {
        for (_, receiver) in &mut self.receivers {
            receiver.on_map_edit(event);
        }
    }

    pub fn len(&self) -> usize {
        self.receivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receivers.is_empty()
    }
}

/// Forwards every event into a channel. A disconnected channel is ignored.
pub struct ChannelReceiver {
    tx: Sender<MapEditEvent>,
}

impl ChannelReceiver {
    pub fn new(tx: Sender<MapEditEvent>) -> Self {
        Self { tx }
    }
}

impl MapEventReceiver for ChannelReceiver {
    fn on_map_edit(&mut self, event: &MapEditEvent) {
        let _ = self.tx.send(event.clone());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::ContentId;

    fn add_event(pos: IVec3) -> MapEditEvent {
        MapEditEvent {
            kind: MapEditKind::AddNode,
            pos,
            node: Node::new(ContentId(3)),
            modified_blocks: BTreeSet::from([crate::pos::node_to_block(pos)]),
        }
    }

    #[test]
    fn test_node_event_area_is_single_node() {
        let event = add_event(IVec3::new(-3, 4, 70));
        let area = event.area();
        assert_eq!(area.volume(), 1);
        assert!(area.contains(IVec3::new(-3, 4, 70)));
    }

    #[test]
    fn test_other_event_area_bounds_all_blocks() {
        let blocks = BTreeSet::from([
            BlockPos::new(0, 5, 0),
            BlockPos::new(-1, 0, 2),
            BlockPos::new(3, 1, -4),
        ]);
        let area = MapEditEvent::other(blocks).area();
        assert_eq!(area.min, IVec3::new(-16, 0, -64));
        assert_eq!(area.max, IVec3::new(63, 95, 47));
    }

    #[test]
    fn test_other_event_without_blocks_is_empty() {
        assert!(MapEditEvent::other(BTreeSet::new()).area().is_empty());
    }

    #[test]
    fn test_dispatch_and_remove() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut receivers = EventReceivers::new();
        let id = receivers.add(Box::new(ChannelReceiver::new(tx)));

        receivers.dispatch(&add_event(IVec3::ZERO));
        assert_eq!(rx.try_recv().unwrap().kind, MapEditKind::AddNode);

        assert!(receivers.remove(id).is_some());
        assert!(receivers.remove(id).is_none());
        receivers.dispatch(&add_event(IVec3::ZERO));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_disconnected_channel_is_ignored() {
        let (tx, rx) = crossbeam_channel::unbounded();
        drop(rx);
        let mut receivers = EventReceivers::new();
        receivers.add(Box::new(ChannelReceiver::new(tx)));
        receivers.dispatch(&add_event(IVec3::ONE));
        assert_eq!(receivers.len(), 1);
    }
}
