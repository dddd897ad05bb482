//! World store error types.

use std::path::PathBuf;

use crate::persistence::StorageError;
use crate::pos::BlockPos;
use crate::serial::BlockSerError;

/// Errors surfaced by [`WorldStore`](crate::WorldStore) operations.
///
/// A block that is simply not resident is not an error; lookups report it
/// through [`BlockLookup::NotResident`](crate::BlockLookup::NotResident).
#[derive(Debug, thiserror::Error)]
pub enum WorldError {
    /// The position lies beyond the world generation limit.
    #[error("block position {0:?} is outside the world limit")]
    PositionOutOfRange(BlockPos),

    /// A block could not be encoded for saving, or a stored block could not
    /// be decoded under the strict load policy.
    #[error("block {pos:?} could not be serialized: {source}")]
    Serialization {
        pos: BlockPos,
        #[source]
        source: BlockSerError,
    },

    /// The persistence backend failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The world metadata file exists but cannot be read.
    #[error("world metadata at {path} is corrupt: {reason}")]
    CorruptMetadata { path: PathBuf, reason: String },

    /// The world directory has contents but no metadata file.
    #[error("{0} is not empty but has no world metadata")]
    MissingMetadata(PathBuf),

    /// The world metadata could not be written.
    #[error("failed to write world metadata: {0}")]
    MetadataWrite(#[source] std::io::Error),
}
