//! Command-line argument parsing for the Terra server.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Terra server command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "terra", about = "Persistent voxel world server")]
pub struct CliArgs {
    /// World directory.
    #[arg(long)]
    pub world: Option<PathBuf>,

    /// Seed used when creating a new world.
    #[arg(long)]
    pub seed: Option<u64>,

    /// Fail on unreadable blocks instead of regenerating them.
    #[arg(long)]
    pub strict: bool,

    /// Stop after this many ticks (runs until interrupted otherwise).
    #[arg(long)]
    pub ticks: Option<u64>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref path) = args.world {
            self.world.path = path.clone();
        }
        if let Some(seed) = args.seed {
            self.world.seed = seed;
        }
        if args.strict {
            self.world.strict_loading = true;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
