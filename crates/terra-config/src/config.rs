//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name of the config inside the config directory.
pub const CONFIG_FILE: &str = "config.ron";

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// World location and storage settings.
    pub world: WorldConfig,
    /// Map upkeep: unloading, saving, tick rate.
    pub map: MapConfig,
    /// Liquid simulation settings.
    pub liquid: LiquidConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// World storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorldConfig {
    /// World directory. Relative paths resolve against the working directory.
    pub path: PathBuf,
    /// Seed for a newly created world. Existing worlds keep their own.
    pub seed: u64,
    /// Width of a generation chunk in blocks, for newly created worlds.
    pub chunk_size: i16,
    /// Refuse to load unreadable blocks instead of regenerating them.
    pub strict_loading: bool,
    /// Compress block payloads on save.
    pub compression: bool,
    /// Minimum payload size in bytes before compression is applied.
    pub compression_threshold: usize,
    /// Generation limit in nodes from the origin along each axis.
    pub generation_limit: i32,
    /// Blocks around the origin emerged at startup, per axis.
    pub spawn_radius: i16,
    /// Highest solid node layer of the flat terrain.
    pub surface_y: i32,
    /// Still water fills the space above the surface up to this layer.
    pub water_level: Option<i32>,
}

/// Map upkeep configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MapConfig {
    /// Seconds a block may go unused before it is unloaded.
    pub unload_timeout_s: f32,
    /// Seconds between saves of modified blocks.
    pub save_interval_s: f32,
    /// World ticks per second.
    pub tick_rate_hz: u32,
    /// Most lighting-expired blocks relit per tick.
    pub relight_budget: usize,
}

/// Liquid simulation configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LiquidConfig {
    /// Most queued liquid positions evaluated per step.
    pub loop_max: usize,
    /// Seconds the liquid queue may keep growing before it is purged (0 = never).
    pub queue_purge_time_s: u32,
    /// Seconds between liquid steps.
    pub update_interval_s: f32,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
}

// --- Default implementations ---

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("world"),
            seed: 0,
            chunk_size: 5,
            strict_loading: false,
            compression: true,
            compression_threshold: 256,
            generation_limit: 31_000,
            spawn_radius: 2,
            surface_y: 8,
            water_level: None,
        }
    }
}

impl Default for MapConfig {
    fn default() -> Self {
        Self {
            unload_timeout_s: 29.0,
            save_interval_s: 5.3,
            tick_rate_hz: 20,
            relight_budget: 64,
        }
    }
}

impl Default for LiquidConfig {
    fn default() -> Self {
        Self {
            loop_max: 100_000,
            queue_purge_time_s: 0,
            update_interval_s: 1.0,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Platform config directory for Terra, e.g. `~/.config/terra` on Linux.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("terra")
}

// --- Load / Save / Reload ---

fn read_config(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    ron::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let config = read_config(&config_path)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);
        std::fs::create_dir_all(config_dir).map_err(|source| ConfigError::Write {
            path: config_dir.to_path_buf(),
            source,
        })?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::Encode)?;

        std::fs::write(&config_path, serialized).map_err(|source| ConfigError::Write {
            path: config_path,
            source,
        })?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);
        let new_config = read_config(&config_path)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
