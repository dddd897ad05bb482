//! Persistent voxel world storage: blocks, sectors, the emerge cache and the
//! cursor that the lighting and liquid engines work through.

pub mod block;
pub mod content;
pub mod cursor;
pub mod error;
pub mod events;
pub mod generation;
pub mod liquid_queue;
pub mod node;
pub mod persistence;
pub mod pos;
pub mod sector;
pub mod serial;
pub mod snapshot;
pub mod store;

pub use block::{Block, Epoch, Generation, ModState, NodeMetadata, OutsideBlock};
pub use content::{ContentFeatures, ContentRegistry, LiquidType, RegistryError};
pub use cursor::VoxelCursor;
pub use error::WorldError;
pub use events::{
    ChannelReceiver, EventReceivers, MapEditEvent, MapEditKind, MapEventReceiver, ReceiverId,
};
pub use generation::{ChunkMakeData, FlatGenerator, GenerationGate, MapGenerator};
pub use liquid_queue::LiquidQueue;
pub use node::{
    ContentId, LIGHT_MAX, LIGHT_SUN, LIQUID_FLOW_DOWN_MASK, LIQUID_LEVEL_MASK, LIQUID_LEVEL_MAX,
    LightBank, Node, blend_light, diminish_light, undiminish_light,
};
pub use persistence::{
    DirectoryGateway, MemoryGateway, PersistenceGateway, StorageError, WorldMeta,
};
pub use pos::{
    BLOCK_SIZE, BLOCK_VOLUME, BlockPos, BlockRange, FACE_NEIGHBORS, MAX_MAP_GENERATION_LIMIT,
    NodeArea, SectorPos, block_key_decode, block_key_encode, block_over_limit, block_to_node,
    block_to_sector, chunk_base, node_to_block, node_to_block_with_offset, node_to_sector,
};
pub use sector::Sector;
pub use serial::{
    BlockSerError, CompressionConfig, check_node_metadata, deserialize_block, serialize_block,
};
pub use snapshot::{BlockSnapshot, NodeBuffer};
pub use store::{
    BlockLookup, EmergeHandle, EmergeOutcome, EmergeReply, LoadPolicy, RenderScan, SaveReport,
    ScanBatch, StoreSettings, UnloadReport, WorldStore,
};
