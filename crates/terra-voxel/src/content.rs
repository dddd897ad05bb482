//! Content registry: maps compact [`ContentId`] values to [`ContentFeatures`].
//!
//! The registry is built once when a world opens and is then shared
//! immutably (`Arc<ContentRegistry>`) with every component. Air is always
//! ID 0. [`ContentId::IGNORE`] is never registered; lookups for it, and for
//! any unknown id, return fixed fallback features.

use std::sync::LazyLock;

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::node::{ContentId, LIGHT_MAX, LIQUID_LEVEL_MAX};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// How a content type takes part in liquid flow.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LiquidType {
    /// Not a liquid.
    #[default]
    None,
    /// A liquid source; always at maximum level.
    Source,
    /// Flowing liquid with a level in `param2`.
    Flowing,
}

/// Everything the world store and the propagation engines need to know about a content type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentFeatures {
    /// Unique name, e.g. `"stone"` or `"water_source"`.
    pub name: String,
    /// Whether entities collide with this content.
    pub walkable: bool,
    /// Whether light passes through (with one step of decay).
    pub light_propagates: bool,
    /// Whether sunlight passes straight down without decay.
    pub sunlight_propagates: bool,
    /// Whether `param1` holds light for this content.
    pub stores_light: bool,
    /// Emitted light level, `0..=14`.
    pub light_source: u8,
    pub liquid_type: LiquidType,
    /// Name of the flowing variant of this liquid.
    pub liquid_alternative_flowing: String,
    /// Name of the source variant of this liquid.
    pub liquid_alternative_source: String,
    /// Levels the liquid may change per step is `level_difference / viscosity`.
    pub liquid_viscosity: u8,
    /// How many nodes the liquid spreads horizontally from a source.
    pub liquid_range: u8,
    /// Whether two adjacent sources create a new one.
    pub liquid_renewable: bool,
    /// Whether flowing liquid may replace this content.
    pub floodable: bool,

    /// Resolved id of `liquid_alternative_flowing`.
    #[serde(skip, default = "ignore_id")]
    pub flowing_id: ContentId,
    /// Resolved id of `liquid_alternative_source`.
    #[serde(skip, default = "ignore_id")]
    pub source_id: ContentId,
}

fn ignore_id() -> ContentId {
    ContentId::IGNORE
}

impl Default for ContentFeatures {
    fn default() -> Self {
        Self {
            name: String::new(),
            walkable: true,
            light_propagates: false,
            sunlight_propagates: false,
            stores_light: false,
            light_source: 0,
            liquid_type: LiquidType::None,
            liquid_alternative_flowing: String::new(),
            liquid_alternative_source: String::new(),
            liquid_viscosity: 1,
            liquid_range: LIQUID_LEVEL_MAX + 1,
            liquid_renewable: true,
            floodable: false,
            flowing_id: ContentId::IGNORE,
            source_id: ContentId::IGNORE,
        }
    }
}

impl ContentFeatures {
    /// Features of empty space.
    pub fn air() -> Self {
        Self {
            name: "air".to_string(),
            walkable: false,
            light_propagates: true,
            sunlight_propagates: true,
            stores_light: true,
            floodable: true,
            ..Self::default()
        }
    }

    /// An opaque, walkable solid.
    pub fn solid(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// A walkable solid that lets light and sunlight through, like glass.
    pub fn transparent(name: &str) -> Self {
        Self {
            name: name.to_string(),
            light_propagates: true,
            sunlight_propagates: true,
            stores_light: true,
            ..Self::default()
        }
    }

    /// A non-walkable light emitter. `level` is clamped to [`LIGHT_MAX`].
    pub fn emitter(name: &str, level: u8) -> Self {
        Self {
            name: name.to_string(),
            walkable: false,
            light_propagates: true,
            sunlight_propagates: true,
            stores_light: true,
            light_source: level.min(LIGHT_MAX),
            floodable: true,
            ..Self::default()
        }
    }

    /// One half of a liquid pair. `source` and `flowing` name both halves.
    pub fn liquid(name: &str, liquid_type: LiquidType, source: &str, flowing: &str) -> Self {
        Self {
            name: name.to_string(),
            walkable: false,
            light_propagates: true,
            sunlight_propagates: false,
            stores_light: true,
            liquid_type,
            liquid_alternative_source: source.to_string(),
            liquid_alternative_flowing: flowing.to_string(),
            ..Self::default()
        }
    }

    pub fn is_liquid(&self) -> bool {
        self.liquid_type != LiquidType::None
    }

    /// Fallback used for [`ContentId::IGNORE`].
    fn ignore() -> Self {
        Self {
            name: "ignore".to_string(),
            walkable: false,
            ..Self::default()
        }
    }

    /// Fallback used for ids the registry does not know.
    fn unknown() -> Self {
        Self {
            name: "unknown".to_string(),
            ..Self::default()
        }
    }
}

static IGNORE_FEATURES: LazyLock<ContentFeatures> = LazyLock::new(ContentFeatures::ignore);
static UNKNOWN_FEATURES: LazyLock<ContentFeatures> = LazyLock::new(ContentFeatures::unknown);

/// Errors that can occur while building a registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A type with the same name has already been registered.
    #[error("duplicate content name: {0}")]
    DuplicateName(String),
    /// Every id below `IGNORE` is taken.
    #[error("content registry is full")]
    RegistryFull,
    /// A liquid names an alternative that was never registered.
    #[error("liquid {liquid} refers to unknown alternative {alternative}")]
    UnknownLiquidAlternative { liquid: String, alternative: String },
    /// A definition file could not be parsed.
    #[error("failed to parse content definitions: {0}")]
    Parse(#[source] ron::error::SpannedError),
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Maps [`ContentId`] to [`ContentFeatures`] with O(1) lookup by index and by name.
pub struct ContentRegistry {
    /// Dense array where `index == ContentId.0`.
    types: Vec<ContentFeatures>,
    name_to_id: FxHashMap<String, ContentId>,
}

impl ContentRegistry {
    /// Creates a registry with only air registered.
    pub fn new() -> Self {
        let mut name_to_id = FxHashMap::default();
        name_to_id.insert("air".to_string(), ContentId::AIR);
        Self {
            types: vec![ContentFeatures::air()],
            name_to_id,
        }
    }

    /// Builds a registry from a RON list of features and resolves liquid alternatives.
    ///
    /// Air is implicit; listing it again is an error.
    pub fn from_ron(source: &str) -> Result<Self, RegistryError> {
        let defs: Vec<ContentFeatures> = ron::from_str(source).map_err(RegistryError::Parse)?;
        let mut registry = Self::new();
        for def in defs {
            registry.register(def)?;
        }
        registry.resolve_liquids()?;
        Ok(registry)
    }

    /// Registers a content type and returns its id.
    ///
    /// # Errors
    ///
    /// [`RegistryError::DuplicateName`] when the name is taken and
    /// [`RegistryError::RegistryFull`] when no id below `IGNORE` is left.
    pub fn register(&mut self, def: ContentFeatures) -> Result<ContentId, RegistryError> {
        if self.name_to_id.contains_key(&def.name) {
            return Err(RegistryError::DuplicateName(def.name));
        }
        if self.types.len() >= ContentId::IGNORE.0 as usize {
            return Err(RegistryError::RegistryFull);
        }
        let id = ContentId(self.types.len() as u16);
        self.name_to_id.insert(def.name.clone(), id);
        self.types.push(def);
        Ok(id)
    }

    /// Links every liquid to the ids of its source and flowing variants.
    ///
    /// Call once after all liquids are registered.
    pub fn resolve_liquids(&mut self) -> Result<(), RegistryError> {
        for i in 0..self.types.len() {
            if !self.types[i].is_liquid() {
                continue;
            }
            let flowing = self.resolve_alternative(i, &self.types[i].liquid_alternative_flowing)?;
            let source = self.resolve_alternative(i, &self.types[i].liquid_alternative_source)?;
            self.types[i].flowing_id = flowing;
            self.types[i].source_id = source;
        }
        Ok(())
    }

    fn resolve_alternative(&self, index: usize, name: &str) -> Result<ContentId, RegistryError> {
        self.lookup(name)
            .ok_or_else(|| RegistryError::UnknownLiquidAlternative {
                liquid: self.types[index].name.clone(),
                alternative: name.to_string(),
            })
    }

    /// Returns the features of `id`, or fixed fallbacks for `IGNORE` and unknown ids.
    pub fn get(&self, id: ContentId) -> &ContentFeatures {
        if id == ContentId::IGNORE {
            return &IGNORE_FEATURES;
        }
        self.types.get(id.0 as usize).unwrap_or(&UNKNOWN_FEATURES)
    }

    /// Returns the id of a named content type.
    pub fn lookup(&self, name: &str) -> Option<ContentId> {
        self.name_to_id.get(name).copied()
    }

    /// The liquid a content belongs to, identified by its flowing variant.
    ///
    /// Sources and flowing nodes of the same liquid share a kind.
    pub fn liquid_kind(&self, id: ContentId) -> Option<ContentId> {
        let f = self.get(id);
        f.is_liquid().then_some(f.flowing_id)
    }

    /// Number of registered types, including air.
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Returns `true` if only air is registered.
    pub fn is_empty(&self) -> bool {
        self.types.len() <= 1
    }
}

impl Default for ContentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
