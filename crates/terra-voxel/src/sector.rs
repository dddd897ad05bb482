//! A vertical column of blocks sharing one `(x, z)` sector position.
//!
//! Blocks are kept sorted by their vertical index so vertical scans walk
//! neighbouring slots. The most recently used slot is cached, which turns
//! repeated lookups of the same block into a single comparison.

use std::cell::Cell;

use crate::block::Block;
use crate::pos::{BlockPos, SectorPos};

/// Owns every resident block of one column.
#[derive(Debug)]
pub struct Sector {
    pos: SectorPos,
    /// Sorted by `block.pos().y`.
    blocks: Vec<Block>,
    /// Slot of the most recently used block.
    last_used: Cell<Option<usize>>,
}

impl Sector {
    /// Creates an empty sector.
    pub fn new(pos: SectorPos) -> Self {
        Self {
            pos,
            blocks: Vec::new(),
            last_used: Cell::new(None),
        }
    }

    pub fn pos(&self) -> SectorPos {
        self.pos
    }

    fn slot_of(&self, y: i16) -> Result<usize, usize> {
        if let Some(i) = self.last_used.get()
            && let Some(block) = self.blocks.get(i)
            && block.pos().y == y
        {
            return Ok(i);
        }
        let found = self.blocks.binary_search_by_key(&y, |b| b.pos().y);
        if let Ok(i) = found {
            self.last_used.set(Some(i));
        }
        found
    }

    /// Returns the block at vertical index `y` without creating it.
    pub fn get_block_no_create(&self, y: i16) -> Option<&Block> {
        let i = self.slot_of(y).ok()?;
        self.blocks.get(i)
    }

    /// Mutable variant of [`get_block_no_create`](Self::get_block_no_create).
    pub fn get_block_no_create_mut(&mut self, y: i16) -> Option<&mut Block> {
        let i = self.slot_of(y).ok()?;
        self.blocks.get_mut(i)
    }

    /// Returns the block at `y`, creating a blank one if it is not resident.
    pub fn get_or_create_block(&mut self, y: i16) -> &mut Block {
        let i = match self.slot_of(y) {
            Ok(i) => i,
            Err(i) => {
                let pos = BlockPos::new(self.pos.x, y, self.pos.z);
                self.blocks.insert(i, Block::new_blank(pos));
                self.last_used.set(Some(i));
                i
            }
        };
        &mut self.blocks[i]
    }

    /// Inserts a block, replacing any resident block at the same height.
    ///
    /// The block must belong to this sector; blocks from another column are
    /// handed back unchanged.
    pub fn insert_block(&mut self, block: Block) -> Result<&mut Block, Block> {
        if block.sector_pos() != self.pos {
            return Err(block);
        }
        let i = match self.slot_of(block.pos().y) {
            Ok(i) => {
                self.blocks[i] = block;
                i
            }
            Err(i) => {
                self.blocks.insert(i, block);
                i
            }
        };
        self.last_used.set(Some(i));
        Ok(&mut self.blocks[i])
    }

    /// Evicts and returns the block at `y`.
    pub fn remove_block(&mut self, y: i16) -> Option<Block> {
        let i = self.slot_of(y).ok()?;
        self.last_used.set(None);
        Some(self.blocks.remove(i))
    }

    /// Evicts and returns every block.
    pub fn remove_all(&mut self) -> Vec<Block> {
        self.last_used.set(None);
        std::mem::take(&mut self.blocks)
    }

    /// Resident blocks from bottom to top.
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter()
    }

    /// Mutable iterator over resident blocks from bottom to top.
    pub fn blocks_mut(&mut self) -> impl Iterator<Item = &mut Block> {
        self.blocks.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
