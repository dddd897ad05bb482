//! The [`Node`] value type and light helpers.
//!
//! A node is four bytes: a content id and two parameter bytes. `param1`
//! stores day light in its low nibble and night light in its high nibble
//! when the content's features say light is stored. `param2` is content
//! specific; flowing liquids keep their level and flow-down flag there.

use serde::{Deserialize, Serialize};

use crate::content::ContentFeatures;

/// Identifier of a content type inside the [`ContentRegistry`](crate::ContentRegistry).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentId(pub u16);

impl ContentId {
    /// Empty space. Always id 0 so zeroed memory reads as air.
    pub const AIR: ContentId = ContentId(0);
    /// Unknown or not loaded.
    pub const IGNORE: ContentId = ContentId(u16::MAX);
}

/// Brightest light an artificial source may emit.
pub const LIGHT_MAX: u8 = 14;
/// Light value reserved for unattenuated sunlight.
pub const LIGHT_SUN: u8 = 15;

/// Maximum liquid level stored in `param2`.
pub const LIQUID_LEVEL_MAX: u8 = 7;
/// Mask of the level bits in `param2`.
pub const LIQUID_LEVEL_MASK: u8 = 0x07;
/// Flag bit marking a flowing liquid that falls downward.
pub const LIQUID_FLOW_DOWN_MASK: u8 = 0x08;

/// Selects one of the two independent light banks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LightBank {
    Day,
    Night,
}

impl LightBank {
    pub const ALL: [LightBank; 2] = [LightBank::Day, LightBank::Night];
}

/// One voxel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub content: ContentId,
    pub param1: u8,
    pub param2: u8,
}

static_assertions::assert_eq_size!(Node, [u8; 4]);

impl Node {
    /// A node of `content` with zeroed parameters.
    pub const fn new(content: ContentId) -> Self {
        Self {
            content,
            param1: 0,
            param2: 0,
        }
    }

    /// A node with explicit parameter bytes.
    pub const fn with_params(content: ContentId, param1: u8, param2: u8) -> Self {
        Self {
            content,
            param1,
            param2,
        }
    }

    pub const fn air() -> Self {
        Self::new(ContentId::AIR)
    }

    pub const fn ignore() -> Self {
        Self::new(ContentId::IGNORE)
    }

    /// Raw stored light of a bank, ignoring the content's emission.
    pub fn raw_light(&self, bank: LightBank) -> u8 {
        match bank {
            LightBank::Day => self.param1 & 0x0F,
            LightBank::Night => (self.param1 >> 4) & 0x0F,
        }
    }

    /// Effective light of a bank: the stored value, never below the content's emission.
    pub fn light(&self, bank: LightBank, features: &ContentFeatures) -> u8 {
        if features.stores_light {
            self.raw_light(bank).max(features.light_source)
        } else {
            features.light_source
        }
    }

    /// Stores a light value. Contents that do not store light are left untouched.
    pub fn set_light(&mut self, bank: LightBank, level: u8, features: &ContentFeatures) {
        if !features.stores_light {
            return;
        }
        let level = level.min(LIGHT_SUN);
        self.param1 = match bank {
            LightBank::Day => (self.param1 & 0xF0) | level,
            LightBank::Night => (self.param1 & 0x0F) | (level << 4),
        };
    }

    /// Day light blended toward night light by `daylight_factor` (0..=1000).
    pub fn light_blend(&self, daylight_factor: u32, features: &ContentFeatures) -> u8 {
        blend_light(
            daylight_factor,
            self.light(LightBank::Day, features),
            self.light(LightBank::Night, features),
        )
    }

    /// Liquid level in `param2`.
    pub fn liquid_level(&self) -> u8 {
        self.param2 & LIQUID_LEVEL_MASK
    }

    /// Returns `true` if the flow-down flag is set.
    pub fn flows_down(&self) -> bool {
        self.param2 & LIQUID_FLOW_DOWN_MASK != 0
    }
}

impl Default for Node {
    fn default() -> Self {
        Self::air()
    }
}

/// One step of light decay across a node boundary.
pub fn diminish_light(light: u8) -> u8 {
    light.saturating_sub(1)
}

/// The light a neighbour must have had to produce `light` after one step.
pub fn undiminish_light(light: u8) -> u8 {
    light.saturating_add(1).min(LIGHT_SUN)
}

/// Interpolates between night and day light.
///
/// `daylight_factor` is in thousandths: 1000 is full day, 0 is full night.
pub fn blend_light(daylight_factor: u32, day: u8, night: u8) -> u8 {
    let f = daylight_factor.min(1000);
    let l = (f * day as u32 + (1000 - f) * night as u32) / 1000;
    l.min(LIGHT_SUN as u32) as u8
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::ContentFeatures;

    #[test]
    fn test_light_banks_are_independent() {
        let f = ContentFeatures::air();
        let mut n = Node::air();
        n.set_light(LightBank::Day, 12, &f);
        n.set_light(LightBank::Night, 3, &f);
        assert_eq!(n.light(LightBank::Day, &f), 12);
        assert_eq!(n.light(LightBank::Night, &f), 3);
        assert_eq!(n.param1, 0x3C);

        n.set_light(LightBank::Day, 0, &f);
        assert_eq!(n.light(LightBank::Night, &f), 3);
    }

    #[test]
    fn test_light_never_below_emission_floor() {
        let mut torch = ContentFeatures::air();
        torch.name = "torch".to_string();
        torch.light_source = 13;
        let mut n = Node::air();
        n.set_light(LightBank::Day, 2, &torch);
        assert_eq!(n.light(LightBank::Day, &torch), 13);
        assert_eq!(n.light(LightBank::Night, &torch), 13);
    }

    #[test]
    fn test_non_light_storing_content_ignores_set() {
        let stone = ContentFeatures::solid("stone");
        let mut n = Node::air();
        n.set_light(LightBank::Day, 9, &stone);
        assert_eq!(n.param1, 0);
        assert_eq!(n.light(LightBank::Day, &stone), 0);
    }

    #[test]
    fn test_diminish_and_undiminish() {
        assert_eq!(diminish_light(0), 0);
        assert_eq!(diminish_light(14), 13);
        assert_eq!(diminish_light(LIGHT_SUN), 14);
        assert_eq!(undiminish_light(13), 14);
        assert_eq!(undiminish_light(LIGHT_SUN), LIGHT_SUN);
    }

    #[test]
    fn test_blend_light() {
        assert_eq!(blend_light(1000, 15, 0), 15);
        assert_eq!(blend_light(0, 15, 4), 4);
        assert_eq!(blend_light(500, 14, 2), 8);
    }

    #[test]
    fn test_liquid_param2_helpers() {
        let n = Node::with_params(ContentId(3), 0, LIQUID_FLOW_DOWN_MASK | 5);
        assert_eq!(n.liquid_level(), 5);
        assert!(n.flows_down());
    }
}
