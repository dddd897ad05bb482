//! Relighting of resident blocks in a [`WorldStore`].
//!
//! Every entry point copies the blocks it needs (plus a one-block margin) into
//! a [`VoxelCursor`], runs the propagation kernels over it and blits the
//! result back. Only resident blocks are read; nothing is loaded or
//! generated. Blocks whose light could not be finished because a wave hit a
//! missing neighbour are left flagged as lighting-expired.

use std::cmp::Reverse;
use std::collections::BTreeSet;
use std::sync::Arc;

use glam::IVec3;
use terra_voxel::{
    BlockLookup, BlockPos, BlockRange, ContentId, ContentRegistry, FACE_NEIGHBORS, LIGHT_SUN,
    LightBank, MapEditEvent, MapEditKind, Node, NodeArea, VoxelCursor, WorldError, WorldStore,
    node_to_block,
};

use crate::propagation::{
    LightSources, UnlightFrontier, clear_and_collect_sources, propagate_sunlight, spread_light,
    unspread_light,
};

/// Recomputes both light banks of `targets` from scratch.
///
/// Targets are processed top-down. When sunlight leaving the bottom of a
/// block disagrees with the block below, the block below is relit as well,
/// as long as it is resident. Returns the blocks whose stored nodes changed.
pub fn update_lighting(store: &mut WorldStore, targets: &BTreeSet<BlockPos>) -> BTreeSet<BlockPos> {
    let registry = Arc::clone(store.registry());
    let mut ordered: Vec<BlockPos> = targets
        .iter()
        .copied()
        .filter(|pos| store.is_resident(*pos))
        .collect();
    if ordered.is_empty() {
        return BTreeSet::new();
    }
    ordered.sort_by_key(|b| (Reverse(b.y), b.x, b.z));

    let mut cursor = VoxelCursor::new();
    let mut report = BTreeSet::new();
    let mut relit = BTreeSet::new();

    for bank in LightBank::ALL {
        let mut sources = LightSources::default();
        let mut unlight = UnlightFrontier::default();
        let mut cleared = BTreeSet::new();

        for &start in &ordered {
            let mut pos = start;
            while cleared.insert(pos) {
                cursor.emerge_resident(store, BlockRange::single(pos).padded(1));
                if cursor.block_has_data(pos) != Some(true) {
                    break;
                }
                let area = NodeArea::of_block(pos);
                let found = clear_and_collect_sources(&mut cursor, &registry, area, bank);
                sources.extend(found.sources);
                unlight.extend(found.unlight_from);
                if bank == LightBank::Night {
                    break;
                }

                let open_sky = match store.get_block(pos) {
                    BlockLookup::Found(block) => !block.is_underground(),
                    _ => false,
                };
                let sun = propagate_sunlight(&mut cursor, &registry, area, open_sky);
                sources.extend(sun.sources);
                let below = pos.offset(0, -1, 0);
                if sun.bottom_valid || !store.is_resident(below) {
                    break;
                }
                tracing::trace!(?pos, "sunlight continues below, extending relight");
                pos = below;
            }
        }

        unspread_light(&mut cursor, &registry, bank, unlight, &mut sources, &mut report);
        spread_light(&mut cursor, &registry, bank, sources, &mut report);
        relit.extend(cleared);
    }

    let modified = cursor.blit_back(store);
    for pos in &relit {
        if let Some(block) = store.get_block_mut(*pos) {
            block.set_lighting_expired(report.contains(pos));
        }
    }
    tracing::debug!(
        targets = targets.len(),
        relit = relit.len(),
        modified = modified.len(),
        incomplete = report.len(),
        "relit blocks"
    );
    modified
}

/// Updates light around nodes that were just changed in the store.
///
/// `changes` holds each changed position with the node it held before. The
/// new nodes must already be written. Light is only recomputed where the
/// change can reach, which is much cheaper than [`update_lighting`].
pub fn update_lighting_nodes(
    store: &mut WorldStore,
    changes: &[(IVec3, Node)],
) -> BTreeSet<BlockPos> {
    if changes.is_empty() {
        return BTreeSet::new();
    }
    let registry = Arc::clone(store.registry());
    let blocks: BTreeSet<BlockPos> = changes.iter().map(|(p, _)| node_to_block(*p)).collect();

    let mut cursor = VoxelCursor::new();
    for &pos in &blocks {
        cursor.emerge_resident(store, BlockRange::single(pos).padded(1));
    }

    let mut report = BTreeSet::new();
    for bank in LightBank::ALL {
        let mut sources = LightSources::default();
        let mut unlight = UnlightFrontier::default();

        for &(p, old) in changes {
            let Some(node) = cursor.get_mut(p) else {
                continue;
            };
            let f = registry.get(node.content);
            let old_light = old.light(bank, registry.get(old.content));
            node.set_light(bank, 0, f);
            if old_light > 0 {
                unlight.insert(p, old_light);
            }
            if f.light_source > 0 {
                sources.insert(p);
            }
            // Lit neighbours shine back in; unspreading drops the ones that
            // were lit only through `p`.
            for dir in FACE_NEIGHBORS {
                let q = p + dir;
                if let Some(n) = cursor.get(q)
                    && n.light(bank, registry.get(n.content)) > 0
                {
                    sources.insert(q);
                }
            }
            if bank == LightBank::Day {
                update_sun_column(
                    store,
                    &mut cursor,
                    &registry,
                    p,
                    old_light == LIGHT_SUN,
                    &mut sources,
                    &mut unlight,
                );
            }
        }

        unspread_light(&mut cursor, &registry, bank, unlight, &mut sources, &mut report);
        spread_light(&mut cursor, &registry, bank, sources, &mut report);
    }

    let modified = cursor.blit_back(store);
    for pos in blocks.intersection(&report) {
        if let Some(block) = store.get_block_mut(*pos) {
            block.set_lighting_expired(true);
        }
    }
    modified
}

/// Brings the sunlight column through `p` in line with its new content.
///
/// If sunlight now passes `p`, it is pushed down until something stops it.
/// If `p` used to carry sunlight and no longer does, the sunlit run below it
/// is darkened and handed to the unlight wave.
fn update_sun_column(
    store: &WorldStore,
    cursor: &mut VoxelCursor,
    registry: &ContentRegistry,
    p: IVec3,
    was_sunlit: bool,
    sources: &mut LightSources,
    unlight: &mut UnlightFrontier,
) {
    let above = p + IVec3::Y;
    let sun_above = match cursor.get(above) {
        Some(n) if n.content != ContentId::IGNORE => {
            n.light(LightBank::Day, registry.get(n.content)) == LIGHT_SUN
        }
        _ => !store.is_node_underground(p),
    };
    let passes = registry.get(cursor.get_or_ignore(p).content).sunlight_propagates;

    if sun_above && passes {
        let mut q = p;
        while cover(store, cursor, q) {
            let Some(node) = cursor.get_mut(q) else {
                break;
            };
            let f = registry.get(node.content);
            if !f.sunlight_propagates {
                break;
            }
            node.set_light(LightBank::Day, LIGHT_SUN, f);
            sources.insert(q);
            q -= IVec3::Y;
        }
    } else if was_sunlit {
        let mut q = p - IVec3::Y;
        while cover(store, cursor, q) {
            let Some(node) = cursor.get_mut(q) else {
                break;
            };
            let f = registry.get(node.content);
            if node.light(LightBank::Day, f) != LIGHT_SUN {
                break;
            }
            node.set_light(LightBank::Day, 0, f);
            sources.remove(&q);
            unlight.insert(q, LIGHT_SUN);
            q -= IVec3::Y;
        }
    }
}

/// Makes sure `p` is in the cursor, pulling in its block (with margin) if it
/// is resident. Returns whether `p` has data.
fn cover(store: &WorldStore, cursor: &mut VoxelCursor, p: IVec3) -> bool {
    if !cursor.contains(p) {
        let pos = node_to_block(p);
        if !store.is_resident(pos) {
            return false;
        }
        cursor.emerge_resident(store, BlockRange::single(pos).padded(1));
    }
    cursor.has_data(p)
}

fn place_and_relight(
    store: &mut WorldStore,
    p: IVec3,
    node: Node,
    kind: MapEditKind,
) -> Result<BTreeSet<BlockPos>, WorldError> {
    let old = store.get_node(p).unwrap_or(Node::ignore());
    if !store.set_node(p, node)? {
        return Ok(BTreeSet::new());
    }
    store.remove_node_metadata(p);
    queue_liquid_around(store, p);
    let mut modified = update_lighting_nodes(store, &[(p, old)]);
    modified.insert(node_to_block(p));
    store.dispatch_event(&MapEditEvent {
        kind,
        pos: p,
        node,
        modified_blocks: modified.clone(),
    });
    Ok(modified)
}

/// Queues the liquid and air neighbours of an edited node, then the node
/// itself, so nearby liquid reacts to the edit.
fn queue_liquid_around(store: &mut WorldStore, p: IVec3) {
    let registry = Arc::clone(store.registry());
    for dir in FACE_NEIGHBORS {
        let q = p + dir;
        if let Some(n) = store.get_node(q)
            && (n.content == ContentId::AIR || registry.get(n.content).is_liquid())
        {
            store.transforming_liquid_add(q);
        }
    }
    store.transforming_liquid_add(p);
}

/// Places `node` at `p`, relights around it and notifies event receivers.
///
/// Metadata at `p` is dropped. Returns the modified blocks, which is empty if
/// the block at `p` is not resident.
pub fn add_node_and_update(
    store: &mut WorldStore,
    p: IVec3,
    node: Node,
) -> Result<BTreeSet<BlockPos>, WorldError> {
    place_and_relight(store, p, node, MapEditKind::AddNode)
}

/// Replaces the node at `p` with air, relights and notifies event receivers.
pub fn remove_node_and_update(
    store: &mut WorldStore,
    p: IVec3,
) -> Result<BTreeSet<BlockPos>, WorldError> {
    place_and_relight(store, p, Node::air(), MapEditKind::RemoveNode)
}

/// Relights up to `max_blocks` generated blocks flagged lighting-expired
/// whose six face neighbours are all resident.
pub fn relight_expired(store: &mut WorldStore, max_blocks: usize) -> BTreeSet<BlockPos> {
    let targets: BTreeSet<BlockPos> = store
        .list_loaded_blocks()
        .into_iter()
        .filter(|pos| {
            matches!(store.get_block(*pos),
                BlockLookup::Found(b) if b.lighting_expired() && b.is_generated())
        })
        .filter(|pos| pos.face_neighbors().iter().all(|n| store.is_resident(*n)))
        .take(max_blocks)
        .collect();
    if targets.is_empty() {
        return targets;
    }
    update_lighting(store, &targets)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
