//! Day and night light propagation for resident world blocks.

pub mod propagation;
pub mod region;

pub use propagation::{
    ClearedArea, LightSources, SunlightColumns, UnlightFrontier, clear_and_collect_sources,
    propagate_sunlight, spread_light, unspread_light,
};
pub use region::{
    add_node_and_update, relight_expired, remove_node_and_update, update_lighting,
    update_lighting_nodes,
};
