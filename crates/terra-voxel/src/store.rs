//! The world store: owner of every resident block.
//!
//! [`WorldStore`] keeps blocks in [`Sector`] columns keyed by
//! [`SectorPos`](crate::SectorPos) and is the single authority for which
//! blocks exist in memory. Missing blocks are emerged on demand: loaded
//! through the [`PersistenceGateway`], or generated chunk by chunk through
//! the [`MapGenerator`]. The store also owns the liquid queue and the map
//! event receivers.
//!
//! The store itself is driven by one world thread. Other threads talk to it
//! through an [`EmergeHandle`] and read block contents through immutable
//! [`BlockSnapshot`]s.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use glam::IVec3;
use rustc_hash::FxHashMap;

use crate::block::{Block, Generation, ModState, NodeMetadata};
use crate::content::ContentRegistry;
use crate::cursor::VoxelCursor;
use crate::error::WorldError;
use crate::events::{EventReceivers, MapEditEvent, MapEditKind, MapEventReceiver, ReceiverId};
use crate::generation::{ChunkMakeData, GenerationGate, MapGenerator};
use crate::liquid_queue::LiquidQueue;
use crate::node::{LightBank, Node};
use crate::persistence::{
    DirectoryGateway, PersistenceGateway, StorageError, WORLD_FORMAT_VERSION, WorldMeta,
};
use crate::pos::{
    BLOCK_SIZE, BlockPos, BlockRange, MAX_MAP_GENERATION_LIMIT, SectorPos, block_key_decode,
    block_key_encode, block_over_limit, chunk_base, node_to_block_with_offset,
};
use crate::sector::Sector;
use crate::serial::{CompressionConfig, check_node_metadata, deserialize_block, serialize_block};
use crate::snapshot::BlockSnapshot;

/// What to do with a stored block that cannot be decoded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LoadPolicy {
    /// Log a warning and use a blank, ungenerated block instead.
    #[default]
    Lenient,
    /// Fail the load with [`WorldError::Serialization`].
    Strict,
}

/// Tunables of a [`WorldStore`].
#[derive(Clone, Debug)]
pub struct StoreSettings {
    pub seed: u64,
    /// Width of a generation chunk in blocks.
    pub chunk_size: i16,
    pub load_policy: LoadPolicy,
    pub compression: CompressionConfig,
    /// Generation limit in nodes from the origin along each axis.
    pub generation_limit: i32,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            seed: 0,
            chunk_size: 5,
            load_policy: LoadPolicy::Lenient,
            compression: CompressionConfig::default(),
            generation_limit: MAX_MAP_GENERATION_LIMIT,
        }
    }
}

/// Result of a no-create block lookup.
#[derive(Debug)]
pub enum BlockLookup<'a> {
    Found(&'a Block),
    NotResident,
    /// The position lies beyond the generation limit.
    OutOfRange,
}

/// How [`WorldStore::emerge_block`] obtained a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmergeOutcome {
    /// Already resident and generated.
    FromMemory,
    /// Loaded from storage and generated.
    FromDisk,
    /// Generated just now.
    Generated,
    /// Not generated; the block may be resident as a placeholder.
    NotGenerated,
}

/// Outcome of a save pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SaveReport {
    pub saved: usize,
    pub failed: usize,
}

/// Outcome of [`WorldStore::unload_unused_data`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UnloadReport {
    pub unloaded: usize,
    pub saved: usize,
    /// Blocks kept resident because saving them failed.
    pub failed: usize,
}

/// Reply to an emerge request: a snapshot, or `None` if the block could not be obtained.
pub type EmergeReply = Option<BlockSnapshot>;

struct EmergeRequest {
    pos: BlockPos,
    reply: Sender<EmergeReply>,
}

/// Cloneable handle for requesting blocks from other threads.
#[derive(Clone)]
pub struct EmergeHandle {
    tx: Sender<EmergeRequest>,
}

impl EmergeHandle {
    /// Queues a request for `pos`. The reply arrives once the world thread has
    /// served it; the receiver disconnects if the store is gone.
    pub fn request(&self, pos: BlockPos) -> Receiver<EmergeReply> {
        let (reply, rx) = crossbeam_channel::bounded(1);
        // On a closed store the request, and with it the reply sender, is dropped.
        let _ = self.tx.send(EmergeRequest { pos, reply });
        rx
    }
}

/// Resumable state of a changed-block scan for a renderer.
#[derive(Debug, Default)]
pub struct RenderScan {
    /// Content and light epochs last reported per block.
    seen: FxHashMap<BlockPos, (u64, u64)>,
    resume_after: Option<BlockPos>,
}

impl RenderScan {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Result of one [`WorldStore::scan_changed_blocks`] call.
#[derive(Debug, Default)]
pub struct ScanBatch {
    pub changed: Vec<BlockSnapshot>,
    /// `true` once the scan reached the last resident block.
    pub complete: bool,
}

/// Owns all sectors and blocks of one open world.
pub struct WorldStore {
    sectors: FxHashMap<SectorPos, Sector>,
    registry: Arc<ContentRegistry>,
    gateway: Box<dyn PersistenceGateway>,
    generator: Arc<dyn MapGenerator>,
    gate: Arc<GenerationGate>,
    settings: StoreSettings,
    transforming_liquid: LiquidQueue,
    receivers: EventReceivers,
    emerge_tx: Sender<EmergeRequest>,
    emerge_rx: Receiver<EmergeRequest>,
    /// Requests waiting for a chunk that is being generated, by chunk base.
    parked: FxHashMap<BlockPos, Vec<EmergeRequest>>,
    generation_passes: u64,
}

impl WorldStore {
    pub fn new(
        gateway: Box<dyn PersistenceGateway>,
        registry: Arc<ContentRegistry>,
        generator: Arc<dyn MapGenerator>,
        settings: StoreSettings,
    ) -> Self {
        let (emerge_tx, emerge_rx) = crossbeam_channel::unbounded();
        Self {
            sectors: FxHashMap::default(),
            registry,
            gateway,
            generator,
            gate: Arc::new(GenerationGate::new()),
            settings,
            transforming_liquid: LiquidQueue::new(),
            receivers: EventReceivers::new(),
            emerge_tx,
            emerge_rx,
            parked: FxHashMap::default(),
            generation_passes: 0,
        }
    }

    /// Opens a world directory. Seed and chunk size of an existing world
    /// override the ones in `settings`.
    pub fn open_dir(
        path: &Path,
        registry: Arc<ContentRegistry>,
        generator: Arc<dyn MapGenerator>,
        mut settings: StoreSettings,
    ) -> Result<Self, WorldError> {
        let fresh = WorldMeta {
            format_version: WORLD_FORMAT_VERSION,
            seed: settings.seed,
            chunk_size: settings.chunk_size,
        };
        let (gateway, meta) = DirectoryGateway::open(path, &fresh)?;
        settings.seed = meta.seed;
        settings.chunk_size = meta.chunk_size;
        tracing::info!(
            "Opened world {} (seed {}, chunk size {})",
            path.display(),
            meta.seed,
            meta.chunk_size
        );
        Ok(Self::new(Box::new(gateway), registry, generator, settings))
    }

    pub fn registry(&self) -> &Arc<ContentRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &StoreSettings {
        &self.settings
    }

    pub fn generation_gate(&self) -> &Arc<GenerationGate> {
        &self.gate
    }

    /// Number of chunks merged by [`finish_generate`](Self::finish_generate).
    pub fn generation_passes(&self) -> u64 {
        self.generation_passes
    }

    fn check_limit(&self, pos: BlockPos) -> Result<(), WorldError> {
        if block_over_limit(pos, self.settings.generation_limit) {
            return Err(WorldError::PositionOutOfRange(pos));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lookup
    // -----------------------------------------------------------------------

    /// Looks up a resident block without creating, loading or generating it.
    pub fn get_block(&self, pos: BlockPos) -> BlockLookup<'_> {
        if block_over_limit(pos, self.settings.generation_limit) {
            return BlockLookup::OutOfRange;
        }
        match self
            .sectors
            .get(&pos.sector())
            .and_then(|s| s.get_block_no_create(pos.y))
        {
            Some(block) => BlockLookup::Found(block),
            None => BlockLookup::NotResident,
        }
    }

    pub fn get_block_mut(&mut self, pos: BlockPos) -> Option<&mut Block> {
        self.sectors
            .get_mut(&pos.sector())
            .and_then(|s| s.get_block_no_create_mut(pos.y))
    }

    pub fn is_resident(&self, pos: BlockPos) -> bool {
        matches!(self.get_block(pos), BlockLookup::Found(_))
    }

    /// The node at `p`, or `None` if its block is not resident.
    pub fn get_node(&self, p: IVec3) -> Option<Node> {
        let (pos, offset) = node_to_block_with_offset(p);
        match self.get_block(pos) {
            BlockLookup::Found(block) => block.get_node(offset),
            _ => None,
        }
    }

    pub fn get_node_or_ignore(&self, p: IVec3) -> Node {
        self.get_node(p).unwrap_or(Node::ignore())
    }

    /// Effective light at `p`, never below the content's own emission.
    pub fn get_light(&self, p: IVec3, bank: LightBank) -> Option<u8> {
        let node = self.get_node(p)?;
        Some(node.light(bank, self.registry.get(node.content)))
    }

    /// Writes a node into a resident block.
    ///
    /// Returns `Ok(false)` if the block is not resident.
    pub fn set_node(&mut self, p: IVec3, node: Node) -> Result<bool, WorldError> {
        let (pos, offset) = node_to_block_with_offset(p);
        self.check_limit(pos)?;
        let Some(block) = self.get_block_mut(pos) else {
            return Ok(false);
        };
        block.reset_usage_timer();
        Ok(block.set_node(offset, node).is_ok())
    }

    /// Returns the resident block at `pos`, creating a blank one if needed.
    pub fn create_blank_block(&mut self, pos: BlockPos) -> Result<&mut Block, WorldError> {
        self.check_limit(pos)?;
        let sector = self
            .sectors
            .entry(pos.sector())
            .or_insert_with(|| Sector::new(pos.sector()));
        Ok(sector.get_or_create_block(pos.y))
    }

    /// Makes `block` resident, replacing any block at the same position.
    pub fn insert_block(&mut self, block: Block) {
        let sector_pos = block.sector_pos();
        let sector = self
            .sectors
            .entry(sector_pos)
            .or_insert_with(|| Sector::new(sector_pos));
        if let Err(block) = sector.insert_block(block) {
            tracing::warn!("Block {:?} does not belong to sector {sector_pos:?}", block.pos());
        }
    }

    /// Resident block positions, sorted.
    pub fn list_loaded_blocks(&self) -> Vec<BlockPos> {
        let mut out: Vec<BlockPos> = self
            .sectors
            .values()
            .flat_map(|s| s.blocks().map(Block::pos))
            .collect();
        out.sort_unstable();
        out
    }

    /// Every block that is resident or stored, sorted.
    pub fn list_all_loadable_blocks(&self) -> Result<Vec<BlockPos>, WorldError> {
        let mut out: BTreeSet<BlockPos> = self
            .gateway
            .list_all_keys()?
            .into_iter()
            .map(block_key_decode)
            .collect();
        out.extend(self.list_loaded_blocks());
        Ok(out.into_iter().collect())
    }

    pub fn loaded_block_count(&self) -> usize {
        self.sectors.values().map(Sector::len).sum()
    }

    pub fn sector_count(&self) -> usize {
        self.sectors.len()
    }

    // -----------------------------------------------------------------------
    // Emerge
    // -----------------------------------------------------------------------

    /// Loads a block from storage, replacing any resident copy.
    ///
    /// Returns `Ok(false)` if nothing is stored for `pos`. A stored block that
    /// cannot be decoded is handled according to [`LoadPolicy`].
    pub fn load_block(&mut self, pos: BlockPos) -> Result<bool, WorldError> {
        self.check_limit(pos)?;
        let Some(blob) = self.gateway.load(block_key_encode(pos))? else {
            return Ok(false);
        };
        let block = match deserialize_block(pos, &blob) {
            Ok(block) => block,
            Err(source) => match self.settings.load_policy {
                LoadPolicy::Strict => return Err(WorldError::Serialization { pos, source }),
                LoadPolicy::Lenient => {
                    tracing::warn!("Block {pos:?} is corrupt ({source}); replacing with a blank block");
                    Block::new_blank(pos)
                }
            },
        };
        self.insert_block(block);
        Ok(true)
    }

    /// Makes `pos` resident, loading it or, if `allow_generate`, generating
    /// its whole chunk.
    pub fn emerge_block(
        &mut self,
        pos: BlockPos,
        allow_generate: bool,
    ) -> Result<EmergeOutcome, WorldError> {
        self.check_limit(pos)?;
        let loaded = !self.is_resident(pos) && self.load_block(pos)?;
        if let Some(block) = self.get_block_mut(pos) {
            block.reset_usage_timer();
            if block.is_generated() {
                return Ok(if loaded {
                    EmergeOutcome::FromDisk
                } else {
                    EmergeOutcome::FromMemory
                });
            }
        }
        if !allow_generate {
            return Ok(EmergeOutcome::NotGenerated);
        }
        let Some(mut data) = self.init_chunk_make(pos)? else {
            return Ok(EmergeOutcome::NotGenerated);
        };
        let generator = Arc::clone(&self.generator);
        generator.make_chunk(&mut data, &self.registry);
        self.finish_generate(data);
        Ok(EmergeOutcome::Generated)
    }

    /// Stages the chunk containing `pos` for generation.
    ///
    /// Every block of the chunk and its one-block margin is made resident
    /// (loaded, or created blank) and copied into the returned cursor.
    /// Returns `Ok(None)` if the chunk is already being generated.
    pub fn init_chunk_make(&mut self, pos: BlockPos) -> Result<Option<ChunkMakeData>, WorldError> {
        self.check_limit(pos)?;
        let size = self.settings.chunk_size.max(1);
        let base = chunk_base(pos, size);
        if !self.gate.try_begin(base) {
            return Ok(None);
        }

        let blocks = BlockRange::new(base, base.offset(size - 1, size - 1, size - 1));
        let padded = blocks.padded(1);
        if let Err(e) = self.stage_blocks(padded) {
            self.gate.finish(base);
            return Err(e);
        }

        let mut cursor = VoxelCursor::new();
        cursor.emerge_resident(self, padded);
        tracing::debug!("Staged chunk {base:?} for generation");
        Ok(Some(ChunkMakeData {
            chunk_base: base,
            blocks,
            cursor,
            seed: self.settings.seed,
            transforming_liquid: Default::default(),
        }))
    }

    fn stage_blocks(&mut self, range: BlockRange) -> Result<(), WorldError> {
        for pos in range.iter() {
            if block_over_limit(pos, self.settings.generation_limit) || self.is_resident(pos) {
                continue;
            }
            if !self.load_block(pos)? {
                self.create_blank_block(pos)?;
            }
        }
        Ok(())
    }

    /// Merges a generated chunk into the world. Consuming `data` makes this
    /// run exactly once per staging.
    ///
    /// Writes the cursor back, marks the chunk generated (and its margin
    /// partially generated), moves staged liquid positions to the liquid
    /// queue, releases the chunk and answers requests waiting for it.
    /// Returns the blocks that changed.
    pub fn finish_generate(&mut self, data: ChunkMakeData) -> BTreeSet<BlockPos> {
        let ChunkMakeData {
            chunk_base: base,
            blocks,
            cursor,
            transforming_liquid,
            ..
        } = data;
        let padded = blocks.padded(1);

        // Blocks may have been evicted while the chunk was out.
        for pos in padded.iter() {
            if cursor.block_has_data(pos) == Some(true) && !self.is_resident(pos) {
                let restored = matches!(self.load_block(pos), Ok(true));
                if !restored && let Err(e) = self.create_blank_block(pos) {
                    tracing::warn!("Cannot restore {pos:?} for chunk {base:?}: {e}");
                }
            }
        }

        let mut modified = cursor.blit_back(self);
        let registry = Arc::clone(&self.registry);
        for pos in padded.iter() {
            let Some(block) = self.get_block_mut(pos) else {
                continue;
            };
            if blocks.contains(pos) {
                block.set_generation(Generation::Full);
                block.set_lighting_expired(true);
                block.set_underground(top_layer_blocks_sunlight(block, &registry));
                block.raise_modified(ModState::WriteNeeded);
                modified.insert(pos);
            } else if block.generation() == Generation::Ungenerated {
                block.set_generation(Generation::Partial);
            }
        }

        self.transforming_liquid.extend(transforming_liquid);
        if let Some(elapsed) = self.gate.finish(base) {
            tracing::debug!("Generated chunk {base:?} in {elapsed:?}");
        }
        self.generation_passes += 1;

        if !modified.is_empty() {
            self.receivers.dispatch(&MapEditEvent::other(modified.clone()));
        }
        if let Some(waiting) = self.parked.remove(&base) {
            self.answer_requests(waiting);
        }
        modified
    }

    /// Releases a staged chunk without merging it.
    pub fn abandon_chunk_make(&mut self, data: ChunkMakeData) {
        self.gate.finish(data.chunk_base);
        if let Some(waiting) = self.parked.remove(&data.chunk_base) {
            self.answer_requests(waiting);
        }
    }

    /// A handle other threads use to request blocks.
    pub fn emerge_handle(&self) -> EmergeHandle {
        EmergeHandle {
            tx: self.emerge_tx.clone(),
        }
    }

    /// Serves every queued emerge request and returns how many were taken.
    ///
    /// Requests for blocks of a chunk that is being generated elsewhere wait
    /// for [`finish_generate`](Self::finish_generate). All requesters of the
    /// same block receive the same snapshot.
    pub fn serve_emerge_requests(&mut self) -> usize {
        let requests: Vec<EmergeRequest> = self.emerge_rx.try_iter().collect();
        let count = requests.len();
        self.answer_requests(requests);
        count
    }

    fn answer_requests(&mut self, requests: Vec<EmergeRequest>) {
        let mut by_block: BTreeMap<BlockPos, Vec<Sender<EmergeReply>>> = BTreeMap::new();
        for request in requests {
            by_block.entry(request.pos).or_default().push(request.reply);
        }

        let size = self.settings.chunk_size.max(1);
        for (pos, replies) in by_block {
            let ready = matches!(self.get_block(pos), BlockLookup::Found(b) if b.is_generated());
            let base = chunk_base(pos, size);
            if !ready && self.gate.is_in_flight(base) {
                let parked = self.parked.entry(base).or_default();
                parked.extend(replies.into_iter().map(|reply| EmergeRequest { pos, reply }));
                continue;
            }

            let reply = match self.emerge_block(pos, true) {
                Ok(_) => match self.get_block(pos) {
                    BlockLookup::Found(block) => Some(block.snapshot()),
                    _ => None,
                },
                Err(e) => {
                    tracing::warn!("Emerge request for {pos:?} failed: {e}");
                    None
                }
            };
            for tx in replies {
                let _ = tx.send(reply.clone());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Saving and eviction
    // -----------------------------------------------------------------------

    /// Serializes and stores one resident block. Returns `Ok(false)` if it is
    /// not resident.
    pub fn save_block(&mut self, pos: BlockPos) -> Result<bool, WorldError> {
        let compression = self.settings.compression;
        let Some(block) = self
            .sectors
            .get_mut(&pos.sector())
            .and_then(|s| s.get_block_no_create_mut(pos.y))
        else {
            return Ok(false);
        };
        let blob = serialize_block(block, &compression)
            .map_err(|source| WorldError::Serialization { pos, source })?;
        self.gateway.save(block_key_encode(pos), &blob)?;
        block.reset_modified();
        Ok(true)
    }

    /// Saves every block whose modification state is at least `level`.
    ///
    /// Failures are counted per block; a failed block keeps its state so the
    /// next pass retries it.
    pub fn save(&mut self, level: ModState) -> SaveReport {
        let level = level.max(ModState::WriteAtUnload);
        let compression = self.settings.compression;
        let mut report = SaveReport::default();
        let mut saved = Vec::new();

        if let Err(e) = self.gateway.begin_batch() {
            tracing::warn!("Could not begin save batch: {e}");
        }
        for sector in self.sectors.values_mut() {
            for block in sector.blocks_mut() {
                if block.mod_state() < level {
                    continue;
                }
                let blob = match serialize_block(block, &compression) {
                    Ok(blob) => blob,
                    Err(e) => {
                        tracing::warn!("Failed to encode block {:?}: {e}", block.pos());
                        report.failed += 1;
                        continue;
                    }
                };
                match self.gateway.save(block_key_encode(block.pos()), &blob) {
                    Ok(()) => {
                        saved.push((block.pos(), block.mod_state()));
                        block.reset_modified();
                        report.saved += 1;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to save block {:?}: {e}", block.pos());
                        report.failed += 1;
                    }
                }
            }
        }

        if let Err(e) = self.gateway.end_batch() {
            tracing::warn!("Save batch did not complete: {e}");
            // Which deferred writes failed is unknown; keep all of them dirty.
            let failed = match e {
                StorageError::BatchIncomplete { failed } => failed.min(report.saved),
                _ => report.saved,
            };
            report.saved -= failed;
            report.failed += failed;
            for (pos, state) in saved {
                if let Some(block) = self.get_block_mut(pos) {
                    block.raise_modified(state);
                }
            }
        }

        if report.saved > 0 || report.failed > 0 {
            tracing::info!("Saved {} blocks ({} failed)", report.saved, report.failed);
        }
        report
    }

    /// Advances the usage timer of every resident block.
    pub fn step_usage_timers(&mut self, dtime: f32) {
        for sector in self.sectors.values_mut() {
            for block in sector.blocks_mut() {
                block.increment_usage_timer(dtime);
            }
        }
    }

    /// Evicts blocks unused for longer than `timeout` seconds, saving
    /// modified ones first. Blocks of chunks being generated stay resident.
    pub fn unload_unused_data(&mut self, timeout: f32) -> UnloadReport {
        let size = self.settings.chunk_size.max(1);
        let candidates: Vec<BlockPos> = self
            .sectors
            .values()
            .flat_map(|s| s.blocks())
            .filter(|b| b.usage_timer() > timeout)
            .map(Block::pos)
            .filter(|pos| !self.gate.is_in_flight(chunk_base(*pos, size)))
            .collect();

        let mut report = UnloadReport::default();
        for pos in candidates {
            let needs_save = matches!(
                self.get_block(pos),
                BlockLookup::Found(b) if b.mod_state() >= ModState::WriteAtUnload
            );
            if needs_save {
                match self.save_block(pos) {
                    Ok(_) => report.saved += 1,
                    Err(e) => {
                        tracing::warn!("Keeping {pos:?} resident, save failed: {e}");
                        report.failed += 1;
                        continue;
                    }
                }
            }
            if self.evict(pos).is_some() {
                report.unloaded += 1;
            }
        }
        if report.unloaded > 0 {
            tracing::debug!(
                "Unloaded {} blocks ({} saved, {} kept)",
                report.unloaded,
                report.saved,
                report.failed
            );
        }
        report
    }

    /// Removes a block without saving it. Empty sectors are dropped.
    pub fn evict(&mut self, pos: BlockPos) -> Option<Block> {
        let sector_pos = pos.sector();
        let sector = self.sectors.get_mut(&sector_pos)?;
        let block = sector.remove_block(pos.y);
        if sector.is_empty() {
            self.sectors.remove(&sector_pos);
        }
        block
    }

    // -----------------------------------------------------------------------
    // Liquid queue
    // -----------------------------------------------------------------------

    /// Queues a node for liquid evaluation.
    pub fn transforming_liquid_add(&mut self, p: IVec3) {
        self.transforming_liquid.push(p);
    }

    pub fn transforming_liquid_size(&self) -> usize {
        self.transforming_liquid.len()
    }

    pub fn liquid_queue(&self) -> &LiquidQueue {
        &self.transforming_liquid
    }

    pub fn liquid_queue_mut(&mut self) -> &mut LiquidQueue {
        &mut self.transforming_liquid
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    pub fn add_event_receiver(&mut self, receiver: Box<dyn MapEventReceiver>) -> ReceiverId {
        self.receivers.add(receiver)
    }

    pub fn remove_event_receiver(&mut self, id: ReceiverId) -> Option<Box<dyn MapEventReceiver>> {
        self.receivers.remove(id)
    }

    pub fn dispatch_event(&mut self, event: &MapEditEvent) {
        self.receivers.dispatch(event);
    }

    /// Places a node, drops its metadata and notifies receivers.
    ///
    /// Light is not updated here.
    pub fn add_node_with_event(&mut self, p: IVec3, node: Node) -> Result<bool, WorldError> {
        self.edit_node_with_event(p, node, MapEditKind::AddNode)
    }

    /// Replaces a node with air and notifies receivers.
    pub fn remove_node_with_event(&mut self, p: IVec3) -> Result<bool, WorldError> {
        self.edit_node_with_event(p, Node::air(), MapEditKind::RemoveNode)
    }

    fn edit_node_with_event(
        &mut self,
        p: IVec3,
        node: Node,
        kind: MapEditKind,
    ) -> Result<bool, WorldError> {
        if !self.set_node(p, node)? {
            return Ok(false);
        }
        self.remove_node_metadata(p);
        let (pos, _) = node_to_block_with_offset(p);
        let event = MapEditEvent {
            kind,
            pos: p,
            node,
            modified_blocks: BTreeSet::from([pos]),
        };
        self.receivers.dispatch(&event);
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Metadata and queries
    // -----------------------------------------------------------------------

    pub fn get_node_metadata(&self, p: IVec3) -> Option<&NodeMetadata> {
        let (pos, offset) = node_to_block_with_offset(p);
        match self.get_block(pos) {
            BlockLookup::Found(block) => block.metadata(offset),
            _ => None,
        }
    }

    /// Attaches metadata to a node. Refused (`false`) when the block is not
    /// resident, the node itself is unknown, or the metadata is too large to
    /// be stored.
    pub fn set_node_metadata(&mut self, p: IVec3, meta: NodeMetadata) -> bool {
        if let Err(e) = check_node_metadata(&meta) {
            tracing::warn!("Refusing metadata at {p}: {e}");
            return false;
        }
        let (pos, offset) = node_to_block_with_offset(p);
        let Some(block) = self.get_block_mut(pos) else {
            return false;
        };
        if block.get_node_or_ignore(offset) == Node::ignore() {
            return false;
        }
        block.set_metadata(offset, meta).is_ok()
    }

    pub fn remove_node_metadata(&mut self, p: IVec3) -> Option<NodeMetadata> {
        let (pos, offset) = node_to_block_with_offset(p);
        self.get_block_mut(pos)?.remove_metadata(offset)
    }

    /// Returns `true` if the node's block is believed to be underground.
    pub fn is_node_underground(&self, p: IVec3) -> bool {
        let (pos, _) = node_to_block_with_offset(p);
        matches!(self.get_block(pos), BlockLookup::Found(b) if b.is_underground())
    }

    /// Returns `true` if the resident block has nodes whose day and night light differ.
    pub fn day_night_diff(&self, pos: BlockPos) -> bool {
        matches!(self.get_block(pos), BlockLookup::Found(b) if b.day_night_differs(&self.registry))
    }

    /// Collects snapshots of blocks whose content or light changed since the
    /// scan last reported them, spending at most `budget` wall time.
    ///
    /// At least one block is examined per call, so repeated calls always make
    /// progress. The scan resumes where the previous call stopped.
    pub fn scan_changed_blocks(&self, scan: &mut RenderScan, budget: Duration) -> ScanBatch {
        let deadline = Instant::now() + budget;
        let positions = self.list_loaded_blocks();
        let start = match scan.resume_after {
            Some(last) => positions.partition_point(|p| *p <= last),
            None => 0,
        };

        let mut batch = ScanBatch::default();
        for (i, pos) in positions[start..].iter().enumerate() {
            if i > 0 && Instant::now() >= deadline {
                return batch;
            }
            if let BlockLookup::Found(block) = self.get_block(*pos) {
                let snapshot = block.snapshot();
                let epochs = (snapshot.content_epoch(), snapshot.light_epoch());
                if scan.seen.insert(*pos, epochs) != Some(epochs) {
                    batch.changed.push(snapshot);
                }
            }
            scan.resume_after = Some(*pos);
        }

        scan.resume_after = None;
        scan.seen.retain(|pos, _| positions.binary_search(pos).is_ok());
        batch.complete = true;
        batch
    }
}

/// Underground heuristic for a freshly generated block: nothing in its top
/// layer lets sunlight through.
fn top_layer_blocks_sunlight(block: &Block, registry: &ContentRegistry) -> bool {
    let top = BLOCK_SIZE - 1;
    (0..BLOCK_SIZE).all(|z| {
        (0..BLOCK_SIZE).all(|x| {
            let node = block.get_node_or_ignore(IVec3::new(x, top, z));
            !registry.get(node.content).sunlight_propagates
        })
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Barrier;

    use super::*;
    use crate::block::Epoch;
    use crate::content::{ContentFeatures, LiquidType};
    use crate::generation::FlatGenerator;
    use crate::node::ContentId;
    use crate::persistence::MemoryGateway;

    pub(crate) fn test_registry() -> Arc<ContentRegistry> {
        let mut reg = ContentRegistry::new();
        reg.register(ContentFeatures::solid("stone")).unwrap();
        reg.register(ContentFeatures::emitter("torch", 14)).unwrap();
        reg.register(ContentFeatures::liquid(
            "water_source",
            LiquidType::Source,
            "water_source",
            "water_flowing",
        ))
        .unwrap();
        reg.register(ContentFeatures::liquid(
            "water_flowing",
            LiquidType::Flowing,
            "water_source",
            "water_flowing",
        ))
        .unwrap();
        reg.resolve_liquids().unwrap();
        Arc::new(reg)
    }

    pub(crate) fn stone_id() -> ContentId {
        ContentId(1)
    }

    fn test_settings() -> StoreSettings {
        StoreSettings {
            chunk_size: 2,
            ..StoreSettings::default()
        }
    }

    fn store_with(gateway: MemoryGateway, settings: StoreSettings) -> WorldStore {
        let generator = Arc::new(FlatGenerator::new(stone_id(), -1));
        WorldStore::new(Box::new(gateway), test_registry(), generator, settings)
    }

    /// A store over memory storage generating stone up to y = -1 in chunks of 2³ blocks.
    pub(crate) fn flat_store() -> WorldStore {
        store_with(MemoryGateway::new(), test_settings())
    }

    #[test]
    fn test_lookup_variants() {
        let mut store = flat_store();
        let pos = BlockPos::new(3, 4, 5);
        assert!(matches!(store.get_block(pos), BlockLookup::NotResident));
        assert!(matches!(
            store.get_block(BlockPos::new(0, 2000, 0)),
            BlockLookup::OutOfRange
        ));
        store.create_blank_block(pos).unwrap();
        assert!(matches!(store.get_block(pos), BlockLookup::Found(_)));
        assert_eq!(store.sector_count(), 1);
        assert_eq!(store.get_node(IVec3::new(48, 64, 80)), Some(Node::ignore()));
    }

    #[test]
    fn test_out_of_limit_fails_fast() {
        let mut store = flat_store();
        let far = IVec3::new(0, 0, 31_100);
        assert!(matches!(
            store.set_node(far, Node::air()),
            Err(WorldError::PositionOutOfRange(_))
        ));
        assert!(matches!(
            store.emerge_block(BlockPos::new(-1950, 0, 0), true),
            Err(WorldError::PositionOutOfRange(_))
        ));
        assert_eq!(store.get_node(far), None);
    }

    #[test]
    fn test_far_node_does_not_alias_origin_block() {
        let mut store = flat_store();
        store.emerge_block(BlockPos::new(0, 0, 0), true).unwrap();
        let origin = store.get_node(IVec3::ZERO);
        let far = IVec3::new(0, 0, 16 * 65536);

        assert!(matches!(
            store.set_node(far, Node::new(stone_id())),
            Err(WorldError::PositionOutOfRange(_))
        ));
        assert_eq!(store.get_node(far), None);
        assert_eq!(store.get_light(far, LightBank::Day), None);
        assert_eq!(store.get_node(IVec3::ZERO), origin);
    }

    #[test]
    fn test_set_node_on_missing_block_is_noop() {
        let mut store = flat_store();
        assert!(!store.set_node(IVec3::ZERO, Node::air()).unwrap());
        assert_eq!(store.loaded_block_count(), 0);
    }

    #[test]
    fn test_emerge_generates_whole_chunk_once() {
        let mut store = flat_store();
        let outcome = store.emerge_block(BlockPos::new(0, 0, 0), true).unwrap();
        assert_eq!(outcome, EmergeOutcome::Generated);
        assert_eq!(store.generation_passes(), 1);

        // Chunks of size 2 are offset by -1, so block 0 shares a chunk with -1.
        let sibling = BlockPos::new(-1, -1, -1);
        let outcome = store.emerge_block(sibling, true).unwrap();
        assert_eq!(outcome, EmergeOutcome::FromMemory);
        assert_eq!(store.generation_passes(), 1);

        let BlockLookup::Found(margin) = store.get_block(BlockPos::new(1, 0, 0)) else {
            panic!("margin block should be resident");
        };
        assert_eq!(margin.generation(), Generation::Partial);
        assert_eq!(store.get_node(IVec3::new(0, -1, 0)).unwrap().content, stone_id());
        assert_eq!(store.get_node(IVec3::new(0, 0, 0)).unwrap().content, ContentId::AIR);
        assert!(store.is_node_underground(IVec3::new(0, -1, 0)));
        assert!(!store.is_node_underground(IVec3::new(0, 0, 0)));
    }

    #[test]
    fn test_emerge_without_generation() {
        let mut store = flat_store();
        let outcome = store.emerge_block(BlockPos::new(4, 4, 4), false).unwrap();
        assert_eq!(outcome, EmergeOutcome::NotGenerated);
        assert!(!store.is_resident(BlockPos::new(4, 4, 4)));
        assert_eq!(store.generation_passes(), 0);
    }

    #[test]
    fn test_save_and_reopen_memory() {
        let gateway = MemoryGateway::new();
        let mut store = store_with(gateway.clone(), test_settings());
        store.emerge_block(BlockPos::new(0, 0, 0), true).unwrap();
        let torch = Node::new(ContentId(2));
        store.set_node(IVec3::new(3, 1, 3), torch).unwrap();
        let mut meta = NodeMetadata::new();
        meta.insert("text".into(), "hello".into());
        assert!(store.set_node_metadata(IVec3::new(3, 1, 3), meta.clone()));

        // Only the generated chunk is dirty; blank margin blocks stay unsaved.
        let report = store.save(ModState::WriteAtUnload);
        assert_eq!(report, SaveReport { saved: 8, failed: 0 });

        let mut reopened = store_with(gateway, test_settings());
        let chunk = BlockRange::new(BlockPos::new(-1, -1, -1), BlockPos::new(0, 0, 0));
        for pos in chunk.iter() {
            assert!(reopened.load_block(pos).unwrap());
            let (BlockLookup::Found(a), BlockLookup::Found(b)) =
                (store.get_block(pos), reopened.get_block(pos))
            else {
                panic!("both copies of {pos:?} should be resident");
            };
            assert_eq!(a.nodes(), b.nodes());
            assert_eq!(a.generation(), b.generation());
            assert_eq!(a.metadata_entries().count(), b.metadata_entries().count());
        }
        assert_eq!(reopened.get_node_metadata(IVec3::new(3, 1, 3)), Some(&meta));
        assert_eq!(
            reopened.emerge_block(BlockPos::new(0, 0, 0), true).unwrap(),
            EmergeOutcome::FromMemory
        );
        assert_eq!(reopened.generation_passes(), 0);
    }

    #[test]
    fn test_save_and_reopen_directory() {
        let dir = tempfile::tempdir().unwrap();
        let generator = Arc::new(FlatGenerator::new(stone_id(), -1));
        let settings = StoreSettings {
            seed: 77,
            ..test_settings()
        };
        let p = IVec3::new(-5, 2, 7);
        {
            let mut store =
                WorldStore::open_dir(dir.path(), test_registry(), generator.clone(), settings)
                    .unwrap();
            store.emerge_block(BlockPos::new(-1, 0, 0), true).unwrap();
            store.set_node(p, Node::new(stone_id())).unwrap();
            assert_eq!(store.save(ModState::WriteAtUnload).failed, 0);
        }

        let mut store =
            WorldStore::open_dir(dir.path(), test_registry(), generator, test_settings()).unwrap();
        assert_eq!(store.settings().seed, 77);
        assert_eq!(
            store.emerge_block(BlockPos::new(-1, 0, 0), false).unwrap(),
            EmergeOutcome::FromDisk
        );
        assert_eq!(store.get_node(p).unwrap().content, stone_id());
        assert!(
            store
                .list_all_loadable_blocks()
                .unwrap()
                .contains(&BlockPos::new(-1, 0, 0))
        );
    }

    #[test]
    fn test_corrupt_block_lenient_and_strict() {
        let gateway = MemoryGateway::new();
        let pos = BlockPos::new(2, 2, 2);
        gateway.insert_raw(block_key_encode(pos), b"garbage".to_vec());

        let mut lenient = store_with(gateway.clone(), test_settings());
        assert!(lenient.load_block(pos).unwrap());
        let BlockLookup::Found(block) = lenient.get_block(pos) else {
            panic!("blank replacement should be resident");
        };
        assert_eq!(block.generation(), Generation::Ungenerated);

        let strict_settings = StoreSettings {
            load_policy: LoadPolicy::Strict,
            ..test_settings()
        };
        let mut strict = store_with(gateway, strict_settings);
        assert!(matches!(
            strict.load_block(pos),
            Err(WorldError::Serialization { .. })
        ));
        assert!(!strict.is_resident(pos));
    }

    #[test]
    fn test_save_recovers_per_block() {
        let gateway = MemoryGateway::new();
        let mut store = store_with(gateway.clone(), test_settings());
        store.emerge_block(BlockPos::new(0, 0, 0), true).unwrap();
        let bad = BlockPos::new(0, 0, 0);
        gateway.reject_key(block_key_encode(bad));

        let report = store.save(ModState::WriteNeeded);
        assert_eq!(report.failed, 1);
        assert!(report.saved > 0);
        let BlockLookup::Found(block) = store.get_block(bad) else {
            panic!("block should stay resident");
        };
        assert_eq!(block.mod_state(), ModState::WriteNeeded);
    }

    #[test]
    fn test_unencodable_block_fails_save_and_stays_dirty() {
        let gateway = MemoryGateway::new();
        let mut store = store_with(gateway.clone(), test_settings());
        store.emerge_block(BlockPos::new(0, 0, 0), true).unwrap();
        let p = IVec3::new(3, -1, 3);
        let mut huge = NodeMetadata::new();
        huge.insert("k".repeat(70_000), "v".into());
        assert!(!store.set_node_metadata(p, huge.clone()));

        // Bypass the store check to reach the encoder with an oversized key.
        let bad = BlockPos::new(0, -1, 0);
        store
            .get_block_mut(bad)
            .unwrap()
            .set_metadata(IVec3::new(3, 15, 3), huge)
            .unwrap();
        let report = store.save(ModState::WriteAtUnload);
        assert_eq!(report, SaveReport { saved: 7, failed: 1 });
        assert!(gateway.load(block_key_encode(bad)).unwrap().is_none());
        let BlockLookup::Found(block) = store.get_block(bad) else {
            panic!("block should stay resident");
        };
        assert_eq!(block.mod_state(), ModState::WriteNeeded);
        assert!(matches!(
            store.save_block(bad),
            Err(WorldError::Serialization { .. })
        ));

        store.step_usage_timers(20.0);
        let report = store.unload_unused_data(10.0);
        assert_eq!(report.failed, 1);
        assert!(store.is_resident(bad));
    }

    #[test]
    fn test_unload_unused_saves_and_evicts() {
        let gateway = MemoryGateway::new();
        let mut store = store_with(gateway.clone(), test_settings());
        store.emerge_block(BlockPos::new(0, 0, 0), true).unwrap();
        let resident = store.loaded_block_count();

        store.step_usage_timers(5.0);
        assert_eq!(store.unload_unused_data(10.0).unloaded, 0);
        store.step_usage_timers(6.0);
        let report = store.unload_unused_data(10.0);
        assert_eq!(report.unloaded, resident);
        assert_eq!(store.loaded_block_count(), 0);
        assert_eq!(store.sector_count(), 0);
        // Only the generated chunk was modified; margin blocks were never written.
        assert_eq!(report.saved, 8);
        assert_eq!(gateway.len(), 8);
    }

    #[test]
    fn test_metadata_refusals() {
        let mut store = flat_store();
        let p = IVec3::new(1, 1, 1);
        assert!(!store.set_node_metadata(p, NodeMetadata::new()));
        store.create_blank_block(BlockPos::new(0, 0, 0)).unwrap();
        // The blank block still holds unknown nodes.
        assert!(!store.set_node_metadata(p, NodeMetadata::new()));
        store.set_node(p, Node::air()).unwrap();
        assert!(store.set_node_metadata(p, NodeMetadata::new()));
        assert!(store.remove_node_metadata(p).is_some());
    }

    #[test]
    fn test_node_events_reach_receivers() {
        let mut store = flat_store();
        let (tx, rx) = crossbeam_channel::unbounded();
        let id = store.add_event_receiver(Box::new(crate::events::ChannelReceiver::new(tx)));
        store.emerge_block(BlockPos::new(0, 0, 0), true).unwrap();
        let generated = rx.try_recv().unwrap();
        assert_eq!(generated.kind, MapEditKind::Other);
        assert!(generated.modified_blocks.contains(&BlockPos::new(0, 0, 0)));

        let p = IVec3::new(4, 4, 4);
        assert!(store.add_node_with_event(p, Node::new(stone_id())).unwrap());
        let event = rx.try_recv().unwrap();
        assert_eq!(event.kind, MapEditKind::AddNode);
        assert_eq!(event.pos, p);
        assert!(store.remove_node_with_event(p).unwrap());
        assert_eq!(rx.try_recv().unwrap().kind, MapEditKind::RemoveNode);

        store.remove_event_receiver(id);
        store.add_node_with_event(p, Node::new(stone_id())).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_light_query_respects_emission_floor() {
        let mut store = flat_store();
        store.emerge_block(BlockPos::new(0, 0, 0), true).unwrap();
        let p = IVec3::new(2, 2, 2);
        store.set_node(p, Node::new(ContentId(2))).unwrap();
        assert_eq!(store.get_light(p, LightBank::Day), Some(14));
        assert_eq!(store.get_light(IVec3::new(500, 0, 0), LightBank::Day), None);
    }

    #[test]
    fn test_scan_changed_blocks_resumes() {
        let mut store = flat_store();
        store.emerge_block(BlockPos::new(0, 0, 0), true).unwrap();
        let total = store.loaded_block_count();
        let mut scan = RenderScan::new();

        let first = store.scan_changed_blocks(&mut scan, Duration::from_secs(10));
        assert!(first.complete);
        assert_eq!(first.changed.len(), total);
        let again = store.scan_changed_blocks(&mut scan, Duration::from_secs(10));
        assert!(again.changed.is_empty());

        store.set_node(IVec3::new(1, 1, 1), Node::new(stone_id())).unwrap();
        let mut calls = 0;
        let mut changed = Vec::new();
        loop {
            calls += 1;
            let batch = store.scan_changed_blocks(&mut scan, Duration::ZERO);
            changed.extend(batch.changed);
            if batch.complete {
                break;
            }
        }
        assert_eq!(calls, total);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].pos(), BlockPos::new(0, 0, 0));
        assert_eq!(changed[0].content_epoch(), {
            let BlockLookup::Found(b) = store.get_block(BlockPos::new(0, 0, 0)) else {
                panic!("block should be resident");
            };
            b.changed_epoch(Epoch::Content)
        });
    }

    #[test]
    fn test_concurrent_emerge_is_deduplicated() {
        let mut store = flat_store();
        let handle = store.emerge_handle();
        let barrier = Arc::new(Barrier::new(2));
        let pos = BlockPos::new(0, 0, 0);

        let threads: Vec<_> = (0..2)
            .map(|_| {
                let handle = handle.clone();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    handle.request(pos)
                })
            })
            .collect();
        let replies: Vec<_> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        assert_eq!(store.serve_emerge_requests(), 2);
        let a = replies[0].recv().unwrap().expect("block should emerge");
        let b = replies[1].recv().unwrap().expect("block should emerge");
        assert!(a.ptr_eq(&b));
        assert_eq!(store.generation_passes(), 1);
    }

    #[test]
    fn test_request_waits_for_in_flight_chunk() {
        let mut store = flat_store();
        let handle = store.emerge_handle();
        let data = store.init_chunk_make(BlockPos::new(0, 0, 0)).unwrap().unwrap();
        assert!(store.init_chunk_make(BlockPos::new(-1, 0, 0)).unwrap().is_none());

        let reply = handle.request(BlockPos::new(-1, -1, 0));
        assert_eq!(store.serve_emerge_requests(), 1);
        assert!(reply.try_recv().is_err());

        // Generate on another thread, as a worker pool would.
        let registry = Arc::clone(store.registry());
        let data = std::thread::spawn(move || {
            let mut data = data;
            FlatGenerator::new(stone_id(), -1).make_chunk(&mut data, &registry);
            data
        })
        .join()
        .unwrap();
        store.finish_generate(data);

        let snapshot = reply.try_recv().unwrap().expect("block should emerge");
        assert_eq!(snapshot.pos(), BlockPos::new(-1, -1, 0));
        assert_eq!(store.generation_passes(), 1);
        assert_eq!(store.generation_gate().in_flight_count(), 0);
    }

    #[test]
    fn test_generated_liquid_is_queued() {
        let registry = test_registry();
        let water = registry.lookup("water_source").unwrap();
        let generator = Arc::new(FlatGenerator::new(stone_id(), -1).with_water(water, 3));
        let mut store = WorldStore::new(
            Box::new(MemoryGateway::new()),
            registry,
            generator,
            test_settings(),
        );
        store.emerge_block(BlockPos::new(0, 0, 0), true).unwrap();
        // One chunk is 32 × 32 nodes wide.
        assert_eq!(store.transforming_liquid_size(), 32 * 32);
        assert!(store.liquid_queue().contains(IVec3::new(0, 3, 0)));
    }
}
