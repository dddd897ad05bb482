//! The chunk generation contract: stage, generate, merge.
//!
//! Generation works on whole chunks of `chunk_size³` blocks. The store stages
//! a chunk with [`WorldStore::init_chunk_make`](crate::WorldStore::init_chunk_make),
//! which hands out a [`ChunkMakeData`] holding a cursor over the chunk plus a
//! one-block margin. A [`MapGenerator`] fills it in, possibly on another
//! thread, and [`WorldStore::finish_generate`](crate::WorldStore::finish_generate)
//! consumes it and merges the result. [`GenerationGate`] guarantees that only
//! one staging of a chunk is in flight at a time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use glam::IVec3;

use crate::content::ContentRegistry;
use crate::cursor::VoxelCursor;
use crate::node::{ContentId, Node};
use crate::pos::{BlockPos, BlockRange, NodeArea};

/// A staged chunk handed to a [`MapGenerator`].
#[derive(Debug)]
pub struct ChunkMakeData {
    /// Base block of the chunk; also its key in the [`GenerationGate`].
    pub chunk_base: BlockPos,
    /// The blocks being generated, without margin.
    pub blocks: BlockRange,
    /// Covers `blocks` padded by one block on every side.
    pub cursor: VoxelCursor,
    /// World seed.
    pub seed: u64,
    /// Liquid positions the generator wants evaluated once the chunk is merged.
    pub transforming_liquid: VecDeque<IVec3>,
}

impl ChunkMakeData {
    /// Node area of the chunk itself, without the margin.
    pub fn chunk_area(&self) -> NodeArea {
        NodeArea::of_blocks(self.blocks)
    }
}

/// Fills a staged chunk with content.
///
/// Implementations must only write inside [`ChunkMakeData::cursor`]; writes to
/// the margin are merged like any other write.
pub trait MapGenerator: Send + Sync {
    fn make_chunk(&self, data: &mut ChunkMakeData, registry: &ContentRegistry);
}

// ---------------------------------------------------------------------------
// In-flight gate
// ---------------------------------------------------------------------------

/// Thread-safe set of chunk bases whose generation is in flight.
#[derive(Debug, Default)]
pub struct GenerationGate {
    in_flight: DashMap<BlockPos, Instant>,
    started: AtomicU64,
}

impl GenerationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `base`. Returns `false` if another staging of it is in flight.
    pub fn try_begin(&self, base: BlockPos) -> bool {
        match self.in_flight.entry(base) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                self.started.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    /// Releases `base` and returns how long it was in flight.
    pub fn finish(&self, base: BlockPos) -> Option<Duration> {
        self.in_flight
            .remove(&base)
            .map(|(_, started)| started.elapsed())
    }

    pub fn is_in_flight(&self, base: BlockPos) -> bool {
        self.in_flight.contains_key(&base)
    }

    /// Number of chunks currently in flight.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of stagings ever admitted.
    pub fn started_count(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Flat reference generator
// ---------------------------------------------------------------------------

/// Generates a flat world: `ground` up to `surface_y`, optional still water
/// above it up to a water level, air everywhere else.
#[derive(Clone, Debug)]
pub struct FlatGenerator {
    ground: ContentId,
    surface_y: i32,
    water: Option<(ContentId, i32)>,
}

impl FlatGenerator {
    pub fn new(ground: ContentId, surface_y: i32) -> Self {
        Self {
            ground,
            surface_y,
            water: None,
        }
    }

    /// Floods everything above the surface up to `level` with `source`.
    pub fn with_water(mut self, source: ContentId, level: i32) -> Self {
        self.water = Some((source, level));
        self
    }

    fn node_at(&self, y: i32) -> Node {
        if y <= self.surface_y {
            return Node::new(self.ground);
        }
        match self.water {
            Some((source, level)) if y <= level => Node::new(source),
            _ => Node::air(),
        }
    }
}

impl MapGenerator for FlatGenerator {
    fn make_chunk(&self, data: &mut ChunkMakeData, _registry: &ContentRegistry) {
        let area = data.chunk_area();
        for p in area.iter() {
            data.cursor.set(p, self.node_at(p.y));
        }
        // The water surface is the only place still water can start to move.
        if let Some((_, level)) = self.water
            && level > self.surface_y
            && (area.min.y..=area.max.y).contains(&level)
        {
            for z in area.min.z..=area.max.z {
                for x in area.min.x..=area.max.x {
                    data.transforming_liquid.push_back(IVec3::new(x, level, z));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
