//! The server's view of one world: the store plus the engines that keep it
//! moving, advanced one fixed step at a time.

use std::sync::Arc;

use terra_config::{Config, MapConfig, WorldConfig};
use terra_lighting::{relight_expired, update_lighting_nodes};
use terra_liquid::{LiquidEngine, LiquidSettings};
use terra_voxel::{
    BlockPos, BlockRange, CompressionConfig, ContentRegistry, EmergeOutcome, FlatGenerator,
    LoadPolicy, MAX_MAP_GENERATION_LIMIT, MapEditEvent, ModState, SaveReport, StoreSettings,
    WorldError, WorldStore,
};

use crate::content::{GROUND, WATER_SOURCE};
use crate::error::ServerError;

/// What one [`ServerWorld::step`] did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StepReport {
    pub emerges_served: usize,
    pub liquid_processed: usize,
    pub liquid_changed: usize,
    pub relit_blocks: usize,
    pub unloaded: usize,
    pub saved: usize,
}

/// Translates the world section of the config into store tunables.
pub fn store_settings(world: &WorldConfig) -> StoreSettings {
    StoreSettings {
        seed: world.seed,
        chunk_size: world.chunk_size.max(1),
        load_policy: if world.strict_loading {
            LoadPolicy::Strict
        } else {
            LoadPolicy::Lenient
        },
        compression: CompressionConfig {
            enabled: world.compression,
            threshold: world.compression_threshold,
        },
        generation_limit: world.generation_limit.clamp(0, MAX_MAP_GENERATION_LIMIT),
    }
}

/// Builds the flat generator described by the world config.
pub fn flat_generator(
    world: &WorldConfig,
    registry: &ContentRegistry,
) -> Result<FlatGenerator, ServerError> {
    let ground = registry
        .lookup(GROUND)
        .ok_or(ServerError::MissingContent(GROUND))?;
    let mut generator = FlatGenerator::new(ground, world.surface_y);
    if let Some(level) = world.water_level {
        let water = registry
            .lookup(WATER_SOURCE)
            .ok_or(ServerError::MissingContent(WATER_SOURCE))?;
        generator = generator.with_water(water, level);
    }
    Ok(generator)
}

pub struct ServerWorld {
    store: WorldStore,
    liquid: LiquidEngine,
    map: MapConfig,
    liquid_interval: f32,
    liquid_timer: f32,
    save_timer: f32,
    /// Blocks kept resident regardless of use.
    anchor: Option<BlockRange>,
}

impl ServerWorld {
    pub fn new(store: WorldStore, config: &Config) -> Self {
        let liquid = LiquidEngine::new(LiquidSettings {
            loop_max: config.liquid.loop_max,
            queue_purge_time: std::time::Duration::from_secs(u64::from(
                config.liquid.queue_purge_time_s,
            )),
        });
        Self {
            store,
            liquid,
            map: config.map.clone(),
            liquid_interval: config.liquid.update_interval_s.max(0.0),
            liquid_timer: 0.0,
            save_timer: 0.0,
            anchor: None,
        }
    }

    /// Opens (or creates) the world directory named in `config`.
    pub fn open(config: &Config, registry: Arc<ContentRegistry>) -> Result<Self, ServerError> {
        let generator = flat_generator(&config.world, &registry)?;
        let store = WorldStore::open_dir(
            &config.world.path,
            registry,
            Arc::new(generator),
            store_settings(&config.world),
        )?;
        Ok(Self::new(store, config))
    }

    pub fn store(&self) -> &WorldStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut WorldStore {
        &mut self.store
    }

    /// Emerges every block within `radius` blocks of the origin and keeps
    /// them resident from then on. Returns how many had to be generated.
    pub fn emerge_spawn(&mut self, radius: i16) -> Result<usize, WorldError> {
        let radius = radius.max(0);
        let range = BlockRange::new(
            BlockPos::new(-radius, -radius, -radius),
            BlockPos::new(radius, radius, radius),
        );
        let mut generated = 0;
        for pos in range.iter() {
            if self.store.emerge_block(pos, true)? == EmergeOutcome::Generated {
                generated += 1;
            }
        }
        tracing::info!(
            "Spawn area ready: {} blocks, {} generated, {} resident",
            range.len(),
            generated,
            self.store.loaded_block_count()
        );
        self.anchor = Some(range);
        Ok(generated)
    }

    /// Advances the world by `dtime` seconds.
    pub fn step(&mut self, dtime: f32) -> StepReport {
        let mut report = StepReport {
            emerges_served: self.store.serve_emerge_requests(),
            ..StepReport::default()
        };

        self.liquid_timer += dtime;
        if self.liquid_timer >= self.liquid_interval {
            self.liquid_timer = 0.0;
            let liquid = self.liquid.step(&mut self.store, &mut ());
            report.liquid_processed = liquid.processed;
            report.liquid_changed = liquid.changed_nodes.len();
            if !liquid.changed_nodes.is_empty() {
                let mut modified = liquid.modified_blocks;
                modified.extend(update_lighting_nodes(&mut self.store, &liquid.changed_nodes));
                self.store.dispatch_event(&MapEditEvent::other(modified));
            }
        }

        let relit = relight_expired(&mut self.store, self.map.relight_budget);
        report.relit_blocks = relit.len();
        if !relit.is_empty() {
            self.store.dispatch_event(&MapEditEvent::other(relit));
        }

        self.store.step_usage_timers(dtime);
        if let Some(anchor) = self.anchor {
            for pos in anchor.iter() {
                if let Some(block) = self.store.get_block_mut(pos) {
                    block.reset_usage_timer();
                }
            }
        }
        report.unloaded = self
            .store
            .unload_unused_data(self.map.unload_timeout_s)
            .unloaded;

        self.save_timer += dtime;
        if self.save_timer >= self.map.save_interval_s {
            self.save_timer = 0.0;
            report.saved = self.store.save(ModState::WriteNeeded).saved;
        }
        report
    }

    /// Saves every modified block, including those only due at unload.
    pub fn shutdown(mut self) -> SaveReport {
        let report = self.store.save(ModState::WriteAtUnload);
        tracing::info!(
            "World saved on shutdown: {} blocks, {} failed",
            report.saved,
            report.failed
        );
        report
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
