//! The `terra` binary: serves one world until stopped.
//!
//! Stops after `--ticks` world steps, or when `quit` is typed on stdin.

use std::io::BufRead;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use crossbeam_channel::Receiver;
use terra_config::{CliArgs, Config, default_config_dir};
use terra_server::{ServerError, ServerWorld, TickLoop, content};

fn main() {
    let args = CliArgs::parse();

    let config_dir = args.config.clone().unwrap_or_else(default_config_dir);
    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {e}");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    terra_log::init_logging(
        Some(&config_dir.join("logs")),
        cfg!(debug_assertions),
        Some(&config),
    );

    if let Err(e) = run(&config, &config_dir, args.ticks) {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

fn run(config: &Config, config_dir: &Path, ticks: Option<u64>) -> Result<(), ServerError> {
    let registry = Arc::new(content::load_registry(config_dir)?);
    let mut world = ServerWorld::open(config, registry)?;
    world.emerge_spawn(config.world.spawn_radius)?;

    let quit = spawn_stdin_watcher();
    let mut tick_loop = TickLoop::new(config.map.tick_rate_hz);
    tracing::info!(
        "Serving {} at {} Hz",
        config.world.path.display(),
        config.map.tick_rate_hz
    );

    loop {
        tick_loop.tick(|dt, _| {
            world.step(dt as f32);
        });
        if ticks.is_some_and(|limit| tick_loop.update_count() >= limit) {
            break;
        }
        if quit.try_recv().is_ok() {
            tracing::info!("Quit requested");
            break;
        }
        std::thread::sleep(tick_loop.time_to_next_step());
    }

    world.shutdown();
    Ok(())
}

/// Reads stdin on a helper thread and signals once a `quit` line arrives.
fn spawn_stdin_watcher() -> Receiver<()> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    let spawned = std::thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };
                if matches!(line.trim(), "quit" | "exit" | "stop") {
                    let _ = tx.send(());
                    break;
                }
            }
        });
    if let Err(e) = spawned {
        tracing::warn!("Console input unavailable: {e}");
    }
    rx
}
