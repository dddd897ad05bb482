//! FIFO of node positions whose liquid state must be re-evaluated.

use std::collections::VecDeque;

use glam::IVec3;
use rustc_hash::FxHashSet;

/// A first-in first-out queue that holds each position at most once.
///
/// Pushing a position that is already queued keeps its original place.
#[derive(Debug, Default)]
pub struct LiquidQueue {
    queue: VecDeque<IVec3>,
    members: FxHashSet<IVec3>,
}

impl LiquidQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueues `p`. Returns `false` if it was already queued.
    pub fn push(&mut self, p: IVec3) -> bool {
        if !self.members.insert(p) {
            return false;
        }
        self.queue.push_back(p);
        true
    }

    pub fn pop(&mut self) -> Option<IVec3> {
        let p = self.queue.pop_front()?;
        self.members.remove(&p);
        Some(p)
    }

    /// Drops the `count` oldest entries and returns how many were dropped.
    pub fn discard_oldest(&mut self, count: usize) -> usize {
        let count = count.min(self.queue.len());
        for p in self.queue.drain(..count) {
            self.members.remove(&p);
        }
        count
    }

    pub fn contains(&self, p: IVec3) -> bool {
        self.members.contains(&p)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = IVec3> + '_ {
        self.queue.iter().copied()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.members.clear();
    }
}

impl Extend<IVec3> for LiquidQueue {
    fn extend<T: IntoIterator<Item = IVec3>>(&mut self, iter: T) {
        for p in iter {
            self.push(p);
        }
    }
}
