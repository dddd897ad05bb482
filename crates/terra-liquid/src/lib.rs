//! Liquid flow for resident world blocks.
//!
//! [`LiquidEngine`] drains the world store's liquid queue a bounded number of
//! entries per tick. The caller relights the nodes it reports as changed.

mod backlog;
pub mod transform;

pub use backlog::BacklogMonitor;
pub use transform::{LiquidEngine, LiquidHooks, LiquidReport, LiquidSettings, WATER_DROP_BOOST};
