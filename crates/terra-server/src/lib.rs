//! Terra world server: wires the world store, the lighting and liquid
//! engines, configuration and logging into a fixed-step server loop.

pub mod content;
pub mod error;
pub mod tick_loop;
pub mod world;

pub use error::ServerError;
pub use tick_loop::TickLoop;
pub use world::{ServerWorld, StepReport};
