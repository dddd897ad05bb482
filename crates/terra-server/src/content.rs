//! Built-in content types, optionally replaced by a `content.ron` file in the
//! config directory.

use std::path::Path;

use terra_voxel::{ContentFeatures, ContentRegistry, LIGHT_MAX, LiquidType, RegistryError};

use crate::error::ServerError;

/// Content definition file looked up in the config directory.
pub const CONTENT_FILE: &str = "content.ron";

/// Node the flat generator builds the ground from.
pub const GROUND: &str = "stone";

/// Source variant of the generator's water.
pub const WATER_SOURCE: &str = "water_source";

/// The content types a fresh server knows about.
pub fn default_registry() -> Result<ContentRegistry, RegistryError> {
    let mut registry = ContentRegistry::new();
    registry.register(ContentFeatures::solid(GROUND))?;
    registry.register(ContentFeatures::solid("dirt"))?;
    registry.register(ContentFeatures::transparent("glass"))?;
    registry.register(ContentFeatures::emitter("torch", LIGHT_MAX - 1))?;
    registry.register(ContentFeatures {
        walkable: false,
        light_propagates: true,
        sunlight_propagates: true,
        stores_light: true,
        floodable: true,
        ..ContentFeatures::solid("grass")
    })?;

    registry.register(ContentFeatures::liquid(
        WATER_SOURCE,
        LiquidType::Source,
        WATER_SOURCE,
        "water_flowing",
    ))?;
    registry.register(ContentFeatures::liquid(
        "water_flowing",
        LiquidType::Flowing,
        WATER_SOURCE,
        "water_flowing",
    ))?;
    registry.register(lava(LiquidType::Source, "lava_source"))?;
    registry.register(lava(LiquidType::Flowing, "lava_flowing"))?;

    registry.resolve_liquids()?;
    Ok(registry)
}

fn lava(liquid_type: LiquidType, name: &str) -> ContentFeatures {
    ContentFeatures {
        light_source: LIGHT_MAX - 1,
        liquid_viscosity: 7,
        liquid_range: 4,
        liquid_renewable: false,
        ..ContentFeatures::liquid(name, liquid_type, "lava_source", "lava_flowing")
    }
}

/// Loads `content.ron` from `config_dir`, or the built-in types if there is none.
pub fn load_registry(config_dir: &Path) -> Result<ContentRegistry, ServerError> {
    let path = config_dir.join(CONTENT_FILE);
    if !path.exists() {
        return Ok(default_registry()?);
    }
    let source = std::fs::read_to_string(&path).map_err(|source| ServerError::ContentRead {
        path: path.clone(),
        source,
    })?;
    let registry = ContentRegistry::from_ron(&source)?;
    tracing::info!(
        "Loaded {} content types from {}",
        registry.len(),
        path.display()
    );
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry_links_liquids() {
        let registry = default_registry().unwrap();
        let source = registry.lookup(WATER_SOURCE).unwrap();
        let flowing = registry.lookup("water_flowing").unwrap();
        assert_eq!(registry.get(source).flowing_id, flowing);
        assert_eq!(registry.get(flowing).source_id, source);
        assert_eq!(registry.liquid_kind(source), registry.liquid_kind(flowing));

        let lava = registry.lookup("lava_source").unwrap();
        assert!(!registry.get(lava).liquid_renewable);
        assert_ne!(registry.liquid_kind(lava), registry.liquid_kind(source));
    }

    #[test]
    fn test_missing_file_falls_back_to_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let registry = load_registry(dir.path()).unwrap();
        assert_eq!(registry.len(), default_registry().unwrap().len());
    }

    #[test]
    fn test_content_file_replaces_builtin() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONTENT_FILE),
            r#"[(name: "stone"), (name: "lamp", light_source: 10, light_propagates: true)]"#,
        )
        .unwrap();
        let registry = load_registry(dir.path()).unwrap();
        assert_eq!(registry.len(), 3);
        let lamp = registry.lookup("lamp").unwrap();
        assert_eq!(registry.get(lamp).light_source, 10);
        assert!(registry.lookup("torch").is_none());
    }

    #[test]
    fn test_broken_content_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONTENT_FILE), "[(name: ").unwrap();
        let result = load_registry(dir.path());
        assert!(matches!(
            result,
            Err(ServerError::Registry(RegistryError::Parse(_)))
        ));
    }
}
