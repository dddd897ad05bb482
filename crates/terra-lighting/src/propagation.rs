//! Worklist light propagation over a [`VoxelCursor`].
//!
//! Light lives in two banks, day and night, and is always propagated one bank
//! at a time. Both [`unspread_light`] and [`spread_light`] are breadth-first
//! worklists, so their stack use does not depend on how far light travels.
//!
//! Nodes outside the cursor (or without data) are never touched. When a wave
//! reaches one, the block of the node it came from is added to the report set
//! so the caller knows that block's lighting may be incomplete.

use std::collections::{BTreeSet, VecDeque};

use glam::IVec3;
use rustc_hash::{FxHashMap, FxHashSet};
use terra_voxel::{
    BlockPos, ContentId, ContentRegistry, FACE_NEIGHBORS, LIGHT_SUN, LightBank, NodeArea,
    VoxelCursor, diminish_light, node_to_block, undiminish_light,
};

/// Positions light is re-spread from.
pub type LightSources = FxHashSet<IVec3>;

/// Positions light is removed from, with the level they held before removal.
pub type UnlightFrontier = FxHashMap<IVec3, u8>;

/// What [`clear_and_collect_sources`] found while darkening an area.
#[derive(Debug, Default)]
pub struct ClearedArea {
    /// Emitters inside the area.
    pub sources: LightSources,
    /// Lit nodes on the area's border; their light may have leaked outward.
    pub unlight_from: UnlightFrontier,
}

/// Result of [`propagate_sunlight`].
#[derive(Debug, Default)]
pub struct SunlightColumns {
    /// Nodes whose light can spread further.
    pub sources: LightSources,
    /// `false` when the node row just below the area disagrees with the
    /// sunlight leaving it, meaning the area below needs relighting too.
    pub bottom_valid: bool,
}

/// Sets the light of every node in `area` to zero in `bank`.
///
/// Emitters become sources. Border nodes that were lit become unlight seeds,
/// so light they pushed into neighbouring areas is taken back.
pub fn clear_and_collect_sources(
    cursor: &mut VoxelCursor,
    registry: &ContentRegistry,
    area: NodeArea,
    bank: LightBank,
) -> ClearedArea {
    let mut cleared = ClearedArea::default();
    for p in area.iter() {
        let Some(node) = cursor.get_mut(p) else {
            continue;
        };
        let f = registry.get(node.content);
        let old = node.light(bank, f);
        node.set_light(bank, 0, f);
        if f.light_source > 0 {
            cleared.sources.insert(p);
        }
        if old != 0 && area.is_border(p) {
            cleared.unlight_from.insert(p, old);
        }
    }
    cleared
}

/// Removes light that was derived from the nodes in `from`.
///
/// Each seed carries the level it had before it went dark. A neighbour dimmer
/// than that level may have been lit by it, so it is darkened and continues
/// the wave. A neighbour at least as bright is lit by something else and is
/// added to `sources` so [`spread_light`] can fill the hole back in.
pub fn unspread_light(
    cursor: &mut VoxelCursor,
    registry: &ContentRegistry,
    bank: LightBank,
    from: UnlightFrontier,
    sources: &mut LightSources,
    report: &mut BTreeSet<BlockPos>,
) {
    let mut queue: VecDeque<(IVec3, u8)> = from.into_iter().collect();
    while let Some((p, old_light)) = queue.pop_front() {
        for dir in FACE_NEIGHBORS {
            let q = p + dir;
            let Some(neighbor) = cursor.get_mut(q) else {
                report.insert(node_to_block(p));
                continue;
            };
            let f = registry.get(neighbor.content);
            let light = neighbor.light(bank, f);
            if light < old_light {
                if f.light_propagates && light != 0 {
                    neighbor.set_light(bank, 0, f);
                    // An emitter keeps shining after being darkened.
                    if f.light_source == 0 {
                        sources.remove(&q);
                    }
                    queue.push_back((q, light));
                }
            } else if light != 0 {
                sources.insert(q);
            }
        }
    }
}

/// Spreads light outward from `sources` until every node is at least as
/// bright as each neighbour's light minus one.
pub fn spread_light(
    cursor: &mut VoxelCursor,
    registry: &ContentRegistry,
    bank: LightBank,
    sources: LightSources,
    report: &mut BTreeSet<BlockPos>,
) {
    let mut queue: VecDeque<IVec3> = sources.into_iter().collect();
    while let Some(p) = queue.pop_front() {
        let Some(node) = cursor.get(p) else {
            continue;
        };
        let old_light = node.light(bank, registry.get(node.content));
        let new_light = diminish_light(old_light);

        for dir in FACE_NEIGHBORS {
            let q = p + dir;
            let Some(neighbor) = cursor.get_mut(q) else {
                report.insert(node_to_block(p));
                continue;
            };
            let f = registry.get(neighbor.content);
            let light = neighbor.light(bank, f);
            if light > undiminish_light(old_light) {
                queue.push_back(q);
            } else if light < new_light && f.light_propagates {
                neighbor.set_light(bank, new_light, f);
                if neighbor.light(bank, f) > light {
                    queue.push_back(q);
                }
            }
        }
    }
}

/// Pushes day light straight down every column of `area`.
///
/// A column enters with the day light of the node above the area. When that
/// node is unknown, `inexistent_top_provides_sunlight` decides whether the
/// column starts in full sunlight or in darkness. Light stays at
/// [`LIGHT_SUN`] through content that passes sunlight, decays by one through
/// other light-propagating content and stops at anything opaque.
pub fn propagate_sunlight(
    cursor: &mut VoxelCursor,
    registry: &ContentRegistry,
    area: NodeArea,
    inexistent_top_provides_sunlight: bool,
) -> SunlightColumns {
    let mut out = SunlightColumns {
        sources: LightSources::default(),
        bottom_valid: true,
    };
    if area.is_empty() {
        return out;
    }

    for z in area.min.z..=area.max.z {
        for x in area.min.x..=area.max.x {
            let above = IVec3::new(x, area.max.y + 1, z);
            let mut light = match cursor.get(above) {
                Some(n) if n.content != ContentId::IGNORE => {
                    n.light(LightBank::Day, registry.get(n.content))
                }
                _ if inexistent_top_provides_sunlight => LIGHT_SUN,
                _ => 0,
            };

            for y in (area.min.y..=area.max.y).rev() {
                let p = IVec3::new(x, y, z);
                let Some(node) = cursor.get_mut(p) else {
                    light = 0;
                    continue;
                };
                let f = registry.get(node.content);
                light = if light == LIGHT_SUN && f.sunlight_propagates {
                    LIGHT_SUN
                } else if f.light_propagates {
                    diminish_light(light)
                } else {
                    0
                };
                node.set_light(LightBank::Day, light, f);
                if diminish_light(light) != 0 {
                    out.sources.insert(p);
                }
            }

            // Unknown nodes below are trusted.
            let below = IVec3::new(x, area.min.y - 1, z);
            if let Some(n) = cursor.get(below)
                && n.content != ContentId::IGNORE
            {
                let f = registry.get(n.content);
                let below_sunlit = n.light(LightBank::Day, f) == LIGHT_SUN;
                if light == LIGHT_SUN && f.sunlight_propagates && !below_sunlit {
                    out.bottom_valid = false;
                } else if light != LIGHT_SUN && below_sunlit {
                    out.bottom_valid = false;
                }
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
