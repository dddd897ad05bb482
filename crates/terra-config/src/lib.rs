//! Configuration for the Terra world server.
//!
//! Settings persist to disk as a RON file and can be overridden from the
//! command line via clap. Every section tolerates missing and unknown fields,
//! so config files survive upgrades in both directions.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    CONFIG_FILE, Config, DebugConfig, LiquidConfig, MapConfig, WorldConfig, default_config_dir,
};
pub use error::ConfigError;
