//! The liquid transform step.
//!
//! Each queued position is re-evaluated against its six neighbours and
//! rewritten as a source, a flowing node at some level, or the floodable
//! content it replaced. Neighbours that may be affected are queued again, so
//! a disturbance travels one node per evaluation.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::IVec3;
use terra_voxel::{
    BlockPos, BlockRange, ContentId, ContentRegistry, LIQUID_FLOW_DOWN_MASK, LIQUID_LEVEL_MASK,
    LIQUID_LEVEL_MAX, LightBank, LiquidType, Node, NodeArea, VoxelCursor, WorldStore,
    node_to_block,
};

use crate::backlog::BacklogMonitor;

/// Extra levels a flowing node gains from the liquid directly above it.
pub const WATER_DROP_BOOST: i8 = 4;

/// The cursor is written back and dropped once it would hold more nodes
/// than this.
const CURSOR_FLUSH_VOLUME: usize = 2_000_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Side {
    Upper,
    Same,
    Lower,
}

const NEIGHBORS: [(IVec3, Side); 6] = [
    (IVec3::new(0, 0, 1), Side::Same),
    (IVec3::new(0, 1, 0), Side::Upper),
    (IVec3::new(1, 0, 0), Side::Same),
    (IVec3::new(0, 0, -1), Side::Same),
    (IVec3::new(0, -1, 0), Side::Lower),
    (IVec3::new(-1, 0, 0), Side::Same),
];

/// Tuning for [`LiquidEngine`].
#[derive(Clone, Debug, PartialEq)]
pub struct LiquidSettings {
    /// Most queue entries evaluated per tick.
    pub loop_max: usize,
    /// How long the queue may keep growing before its oldest entries are
    /// dropped. Zero disables purging.
    pub queue_purge_time: Duration,
}

impl Default for LiquidSettings {
    fn default() -> Self {
        Self {
            loop_max: 100_000,
            queue_purge_time: Duration::ZERO,
        }
    }
}

/// Hooks into the rest of the game for liquid state changes.
pub trait LiquidHooks {
    /// Called before floodable content at `p` is replaced by liquid.
    /// Returning `true` keeps the node as it is.
    fn on_flood(&mut self, _p: IVec3, _old: Node, _new: Node) -> bool {
        false
    }

    /// Called when liquid at `p` drains away, so whatever rested on it can
    /// be checked.
    fn on_node_emptied(&mut self, _p: IVec3) {}
}

impl LiquidHooks for () {}

/// Outcome of one [`LiquidEngine::step`].
#[derive(Debug, Default)]
pub struct LiquidReport {
    /// Queue entries evaluated.
    pub processed: usize,
    /// Queue entries dropped by the purge policy.
    pub purged: usize,
    /// Blocks whose stored nodes changed.
    pub modified_blocks: BTreeSet<BlockPos>,
    /// Every rewritten node with the value it held before, in change order.
    /// Suitable for incremental relighting.
    pub changed_nodes: Vec<(IVec3, Node)>,
}

#[derive(Debug, Default)]
pub struct LiquidEngine {
    settings: LiquidSettings,
    backlog: BacklogMonitor,
}

impl LiquidEngine {
    pub fn new(settings: LiquidSettings) -> Self {
        Self {
            settings,
            backlog: BacklogMonitor::new(),
        }
    }

    pub fn settings(&self) -> &LiquidSettings {
        &self.settings
    }

    /// Runs one tick against the store's liquid queue.
    pub fn step(&mut self, store: &mut WorldStore, hooks: &mut dyn LiquidHooks) -> LiquidReport {
        self.step_at(store, hooks, Instant::now())
    }

    /// Runs one tick, using `now` as the current time for the purge policy.
    ///
    /// At most `min(queue length at entry, loop_max)` entries are evaluated.
    /// Only resident blocks are read or written.
    pub fn step_at(
        &mut self,
        store: &mut WorldStore,
        hooks: &mut dyn LiquidHooks,
        now: Instant,
    ) -> LiquidReport {
        let started = Instant::now();
        let registry = Arc::clone(store.registry());
        let budget = store.transforming_liquid_size().min(self.settings.loop_max);

        let mut report = LiquidReport::default();
        let mut cursor = VoxelCursor::new();
        let mut must_reflow = Vec::new();

        while report.processed < budget {
            let Some(p0) = store.liquid_queue_mut().pop() else {
                break;
            };
            report.processed += 1;
            cover(store, &mut cursor, p0, &mut report.modified_blocks);
            transform_node(
                store,
                &mut cursor,
                &registry,
                hooks,
                p0,
                &mut must_reflow,
                &mut report.changed_nodes,
            );
        }

        report.modified_blocks.extend(cursor.blit_back(store));
        for p in must_reflow {
            store.transforming_liquid_add(p);
        }
        report.purged = self.backlog.observe(
            store.liquid_queue_mut(),
            self.settings.loop_max,
            self.settings.queue_purge_time,
            now,
        );

        if report.processed > 0 {
            tracing::debug!(
                processed = report.processed,
                changed = report.changed_nodes.len(),
                queued = store.transforming_liquid_size(),
                elapsed = ?started.elapsed(),
                "liquid step"
            );
        }
        report
    }
}

/// Brings the blocks around `p` into the cursor, flushing it first if it
/// would grow too large.
fn cover(
    store: &mut WorldStore,
    cursor: &mut VoxelCursor,
    p: IVec3,
    modified: &mut BTreeSet<BlockPos>,
) {
    let range = BlockRange::single(node_to_block(p)).padded(1);
    let needed = NodeArea::of_blocks(range);
    if !cursor.area().contains_area(&needed)
        && cursor.area().union(&needed).volume() > CURSOR_FLUSH_VOLUME
    {
        modified.extend(cursor.blit_back(store));
        cursor.clear();
    }
    cursor.emerge_resident(store, range);
}

/// A neighbour of the node being evaluated.
#[derive(Clone, Copy)]
struct Neighbor {
    p: IVec3,
    node: Node,
    side: Side,
}

fn transform_node(
    store: &mut WorldStore,
    cursor: &mut VoxelCursor,
    registry: &ContentRegistry,
    hooks: &mut dyn LiquidHooks,
    p0: IVec3,
    must_reflow: &mut Vec<IVec3>,
    changed: &mut Vec<(IVec3, Node)>,
) {
    let n0 = cursor.get_or_ignore(p0);
    let cf = registry.get(n0.content);

    // Current level, the flowing content liquid here would take, and what
    // is left behind when no liquid can reach this node.
    let (liquid_level, mut liquid_kind, floodable_node) = match cf.liquid_type {
        LiquidType::Source => (LIQUID_LEVEL_MAX as i8 + 1, cf.flowing_id, ContentId::AIR),
        LiquidType::Flowing => (n0.liquid_level() as i8, n0.content, ContentId::AIR),
        LiquidType::None if cf.floodable => (-1, ContentId::AIR, n0.content),
        LiquidType::None => return,
    };

    let mut sources: Vec<Neighbor> = Vec::with_capacity(6);
    let mut flows: Vec<Neighbor> = Vec::with_capacity(6);
    let mut airs: Vec<Neighbor> = Vec::with_capacity(6);
    let mut flowing_down = false;
    let mut ignored_sources = false;

    for (dir, side) in NEIGHBORS {
        let nb = Neighbor {
            p: p0 + dir,
            node: cursor.get_or_ignore(p0 + dir),
            side,
        };
        let f = registry.get(nb.node.content);
        match f.liquid_type {
            LiquidType::None if f.floodable => {
                airs.push(nb);
                // Liquid keeps probing the space around it whether or not it changes.
                if side != Side::Upper && cf.liquid_type != LiquidType::None {
                    store.transforming_liquid_add(nb.p);
                }
                if side == Side::Lower {
                    flowing_down = true;
                }
            }
            LiquidType::None => {
                if nb.node.content == ContentId::IGNORE {
                    // Unknown space below stops sideways spreading; unknown
                    // space beside may hide a source.
                    if side == Side::Lower {
                        flowing_down = true;
                    } else {
                        ignored_sources = true;
                    }
                }
            }
            LiquidType::Source => {
                if liquid_kind == ContentId::AIR {
                    liquid_kind = f.flowing_id;
                }
                // A source below never feeds this node.
                if f.flowing_id == liquid_kind && side != Side::Lower {
                    sources.push(nb);
                }
            }
            LiquidType::Flowing => {
                if liquid_kind == ContentId::AIR {
                    liquid_kind = f.flowing_id;
                }
                if f.flowing_id == liquid_kind {
                    flows.push(nb);
                    if side == Side::Lower {
                        flowing_down = true;
                    }
                }
            }
        }
    }

    let kind = registry.get(liquid_kind);
    let range = kind.liquid_range.min(LIQUID_LEVEL_MAX + 1) as i8;
    let min_level = LIQUID_LEVEL_MAX as i8 + 1 - range;
    let max_level = LIQUID_LEVEL_MAX as i8;

    let (new_content, new_level) = if (sources.len() >= 2 && kind.liquid_renewable)
        || cf.liquid_type == LiquidType::Source
    {
        (kind.source_id, -1)
    } else if !sources.is_empty() {
        let content = if max_level >= min_level { liquid_kind } else { floodable_node };
        (content, max_level)
    } else if ignored_sources && liquid_level >= 0 {
        // A source may be waiting in an unloaded block; hold still.
        (liquid_kind, liquid_level)
    } else {
        let mut best: i8 = -1;
        for nb in &flows {
            let level = nb.node.liquid_level() as i8;
            match nb.side {
                Side::Upper => best = best.max((level + WATER_DROP_BOOST).min(max_level)),
                Side::Same if !nb.node.flows_down() && level > 0 => best = best.max(level - 1),
                _ => {}
            }
        }

        let viscosity = kind.liquid_viscosity as i8;
        let level = if viscosity > 1 && best != liquid_level {
            let inc = best - liquid_level;
            let level = if inc.abs() > viscosity {
                liquid_level + inc / viscosity
            } else {
                liquid_level + inc.signum()
            };
            if level != best {
                must_reflow.push(p0);
            }
            level
        } else {
            best
        };
        let content = if best >= min_level { liquid_kind } else { floodable_node };
        (content, level)
    };

    let unchanged = new_content == n0.content
        && (cf.liquid_type != LiquidType::Flowing
            || (n0.liquid_level() as i8 == new_level && n0.flows_down() == flowing_down));
    if unchanged {
        return;
    }

    let new_f = registry.get(new_content);
    let mut n = Node::new(new_content);
    if new_f.liquid_type == LiquidType::Flowing {
        let down = if flowing_down { LIQUID_FLOW_DOWN_MASK } else { 0 };
        n.param2 = down | (new_level.max(0) as u8 & LIQUID_LEVEL_MASK);
    }
    if floodable_node != ContentId::AIR
        && new_content != floodable_node
        && hooks.on_flood(p0, n0, n)
    {
        return;
    }
    // Light is recomputed from the changed-node list.
    for bank in LightBank::ALL {
        n.set_light(bank, 0, new_f);
    }
    if !cursor.set(p0, n) {
        return;
    }
    changed.push((p0, n0));
    if cf.is_liquid() && !new_f.is_liquid() {
        hooks.on_node_emptied(p0);
    }

    if new_f.is_liquid() {
        for nb in flows.iter().chain(&airs) {
            if nb.side != Side::Upper {
                store.transforming_liquid_add(nb.p);
            }
        }
    } else {
        for nb in &flows {
            store.transforming_liquid_add(nb.p);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use terra_voxel::{
        Block, BlockLookup, ContentFeatures, FlatGenerator, Generation, MemoryGateway,
        StoreSettings,
    };

    const STONE: ContentId = ContentId(1);
    const WATER_SOURCE: ContentId = ContentId(2);
    const WATER_FLOWING: ContentId = ContentId(3);
    const OIL_SOURCE: ContentId = ContentId(4);
    const OIL_FLOWING: ContentId = ContentId(5);
    const PLANT: ContentId = ContentId(6);

    fn test_registry() -> Arc<ContentRegistry> {
        let mut reg = ContentRegistry::new();
        reg.register(ContentFeatures::solid("stone")).unwrap();
        for (name, ty) in [
            ("water_source", LiquidType::Source),
            ("water_flowing", LiquidType::Flowing),
        ] {
            reg.register(ContentFeatures::liquid(name, ty, "water_source", "water_flowing"))
                .unwrap();
        }
        for (name, ty) in [
            ("oil_source", LiquidType::Source),
            ("oil_flowing", LiquidType::Flowing),
        ] {
            reg.register(ContentFeatures {
                liquid_viscosity: 3,
                ..ContentFeatures::liquid(name, ty, "oil_source", "oil_flowing")
            })
            .unwrap();
        }
        reg.register(ContentFeatures {
            walkable: false,
            floodable: true,
            ..ContentFeatures::solid("plant")
        })
        .unwrap();
        reg.resolve_liquids().unwrap();
        Arc::new(reg)
    }

    /// 3x3x3 blocks of air around the origin block with a stone floor at y = 4.
    fn basin() -> WorldStore {
        let settings = StoreSettings {
            chunk_size: 1,
            ..StoreSettings::default()
        };
        let mut store = WorldStore::new(
            Box::new(MemoryGateway::new()),
            test_registry(),
            Arc::new(FlatGenerator::new(STONE, -1)),
            settings,
        );
        for pos in BlockRange::single(BlockPos::new(0, 0, 0)).padded(1).iter() {
            let mut block = Block::new_filled(pos, Node::air());
            block.set_generation(Generation::Full);
            store.insert_block(block);
        }
        for x in -16..32 {
            for z in -16..32 {
                store.set_node(IVec3::new(x, 4, z), Node::new(STONE)).unwrap();
            }
        }
        store
    }

    fn drain(store: &mut WorldStore, engine: &mut LiquidEngine, hooks: &mut dyn LiquidHooks) {
        for _ in 0..500 {
            if store.transforming_liquid_size() == 0 {
                return;
            }
            engine.step(store, hooks);
        }
        panic!("liquid queue did not settle");
    }

    fn node(store: &WorldStore, x: i32, y: i32, z: i32) -> Node {
        store.get_node(IVec3::new(x, y, z)).unwrap()
    }

    #[test]
    fn test_source_pours_into_column_and_spreads_on_floor() {
        let mut store = basin();
        let mut engine = LiquidEngine::default();
        let source = IVec3::new(8, 10, 8);
        store.set_node(source, Node::new(WATER_SOURCE)).unwrap();
        store.transforming_liquid_add(source);
        store.transforming_liquid_add(source - IVec3::Y);

        let report = engine.step(&mut store, &mut ());
        assert_eq!(report.processed, 2);
        let below = node(&store, 8, 9, 8);
        assert_eq!(below.content, WATER_FLOWING);
        assert_eq!(below.liquid_level(), LIQUID_LEVEL_MAX);
        assert!(below.flows_down());
        assert_eq!(report.changed_nodes, vec![(source - IVec3::Y, Node::air())]);
        assert!(report.modified_blocks.contains(&BlockPos::new(0, 0, 0)));

        drain(&mut store, &mut engine, &mut ());

        assert_eq!(node(&store, 8, 10, 8).content, WATER_SOURCE);
        for y in 5..10 {
            let n = node(&store, 8, y, 8);
            assert_eq!(n.content, WATER_FLOWING, "y = {y}");
            assert_eq!(n.liquid_level(), LIQUID_LEVEL_MAX, "y = {y}");
        }
        assert!(!node(&store, 8, 5, 8).flows_down());

        // Along the floor, one level is lost per hop away from the falls.
        let mut previous = node(&store, 9, 5, 8).liquid_level();
        assert_eq!(previous, LIQUID_LEVEL_MAX);
        for x in 10..=16 {
            let n = node(&store, x, 5, 8);
            assert_eq!(n.content, WATER_FLOWING, "x = {x}");
            assert_eq!(n.liquid_level(), previous - 1, "x = {x}");
            previous = n.liquid_level();
        }
        assert_eq!(node(&store, 17, 5, 8).content, ContentId::AIR);
        // Nothing flows out of the floor.
        assert_eq!(node(&store, 16, 4, 8).content, STONE);
    }

    #[test]
    fn test_two_sources_renew() {
        let mut store = basin();
        let mut engine = LiquidEngine::default();
        store.set_node(IVec3::new(4, 5, 4), Node::new(WATER_SOURCE)).unwrap();
        store.set_node(IVec3::new(6, 5, 4), Node::new(WATER_SOURCE)).unwrap();
        store.transforming_liquid_add(IVec3::new(5, 5, 4));
        engine.step(&mut store, &mut ());
        assert_eq!(node(&store, 5, 5, 4).content, WATER_SOURCE);
    }

    #[test]
    fn test_viscosity_caps_level_change_and_reflows() {
        let mut store = basin();
        let mut engine = LiquidEngine::default();
        let top = IVec3::new(3, 6, 3);
        let p = IVec3::new(3, 5, 3);
        store.set_node(top, Node::with_params(OIL_FLOWING, 0, 7)).unwrap();
        store.set_node(p, Node::with_params(OIL_FLOWING, 0, 0)).unwrap();
        store.transforming_liquid_add(p);

        engine.step(&mut store, &mut ());
        assert_eq!(store.get_node(p).unwrap().liquid_level(), 2);
        assert!(store.liquid_queue().contains(p));

        // Air around `p` was queued too; only follow `p` itself.
        store.liquid_queue_mut().clear();
        store.transforming_liquid_add(p);
        engine.step(&mut store, &mut ());
        assert_eq!(store.get_node(p).unwrap().liquid_level(), 3);
    }

    #[test]
    fn test_flowing_without_feed_drains_and_reports_empty() {
        #[derive(Default)]
        struct Emptied(Vec<IVec3>);
        impl LiquidHooks for Emptied {
            fn on_node_emptied(&mut self, p: IVec3) {
                self.0.push(p);
            }
        }

        let mut store = basin();
        let mut engine = LiquidEngine::default();
        let p = IVec3::new(7, 5, 7);
        store.set_node(p, Node::with_params(WATER_FLOWING, 0, 3)).unwrap();
        store.transforming_liquid_add(p);

        let mut hooks = Emptied::default();
        let report = engine.step(&mut store, &mut hooks);
        assert_eq!(store.get_node(p).unwrap().content, ContentId::AIR);
        assert_eq!(hooks.0, vec![p]);
        assert_eq!(report.changed_nodes.len(), 1);
    }

    #[test]
    fn test_flood_veto_keeps_node() {
        struct Veto(bool);
        impl LiquidHooks for Veto {
            fn on_flood(&mut self, _p: IVec3, old: Node, new: Node) -> bool {
                assert_eq!(old.content, PLANT);
                assert_eq!(new.content, WATER_FLOWING);
                self.0
            }
        }

        for veto in [true, false] {
            let mut store = basin();
            let mut engine = LiquidEngine::default();
            let plant = IVec3::new(9, 5, 8);
            store.set_node(IVec3::new(8, 5, 8), Node::new(WATER_SOURCE)).unwrap();
            store.set_node(plant, Node::new(PLANT)).unwrap();
            store.transforming_liquid_add(plant);
            engine.step(&mut store, &mut Veto(veto));
            let expected = if veto { PLANT } else { WATER_FLOWING };
            assert_eq!(store.get_node(plant).unwrap().content, expected);
        }
    }

    #[test]
    fn test_unloaded_neighbour_holds_level() {
        let mut store = basin();
        let mut engine = LiquidEngine::default();
        // The -x face of the basin borders unloaded blocks.
        let p = IVec3::new(-16, 5, 3);
        store.set_node(p, Node::with_params(WATER_FLOWING, 0, 5)).unwrap();
        store.transforming_liquid_add(p);
        let report = engine.step(&mut store, &mut ());
        assert!(report.changed_nodes.is_empty());
        assert_eq!(store.get_node(p).unwrap().liquid_level(), 5);
    }

    #[test]
    fn test_budget_bounds_work_per_tick() {
        let mut store = basin();
        let mut engine = LiquidEngine::new(LiquidSettings {
            loop_max: 3,
            ..LiquidSettings::default()
        });
        for x in 0..10 {
            store.transforming_liquid_add(IVec3::new(x, 20, 0));
        }
        let report = engine.step(&mut store, &mut ());
        assert_eq!(report.processed, 3);
        assert_eq!(store.transforming_liquid_size(), 7);
    }

    #[test]
    fn test_purge_drops_sustained_backlog() {
        let mut store = basin();
        let mut engine = LiquidEngine::new(LiquidSettings {
            loop_max: 10,
            queue_purge_time: Duration::from_secs(5),
        });
        let t0 = Instant::now();
        let mut next = 0;
        let mut purged = 0;
        for tick in 0..3u64 {
            // Positions in unloaded space are popped without effect.
            for _ in 0..20 {
                store.transforming_liquid_add(IVec3::new(next, 1000, 0));
                next += 1;
            }
            let report = engine.step_at(&mut store, &mut (), t0 + Duration::from_secs(tick * 3));
            assert_eq!(report.processed, 10);
            purged += report.purged;
        }
        assert_eq!(purged, 20);
        assert_eq!(store.transforming_liquid_size(), 10);
    }

    #[test]
    fn test_emerged_chunk_water_settles() {
        let settings = StoreSettings {
            chunk_size: 1,
            ..StoreSettings::default()
        };
        let generator = FlatGenerator::new(STONE, -1).with_water(WATER_SOURCE, 2);
        let mut store = WorldStore::new(
            Box::new(MemoryGateway::new()),
            test_registry(),
            Arc::new(generator),
            settings,
        );
        store.emerge_block(BlockPos::new(0, 0, 0), true).unwrap();
        assert_eq!(store.transforming_liquid_size(), 16 * 16);
        let mut engine = LiquidEngine::default();
        drain(&mut store, &mut engine, &mut ());
        // A lake of sources stays a lake.
        match store.get_block(BlockPos::new(0, 0, 0)) {
            BlockLookup::Found(block) => {
                assert_eq!(block.get_node_or_ignore(IVec3::new(5, 2, 5)).content, WATER_SOURCE);
                assert_eq!(block.get_node_or_ignore(IVec3::new(5, 3, 5)).content, ContentId::AIR);
            }
            _ => panic!("block not resident"),
        }
    }
}
