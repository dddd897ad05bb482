use std::path::PathBuf;

use terra_config::ConfigError;
use terra_voxel::{RegistryError, WorldError};
use thiserror::Error;

/// Errors that stop the server from starting.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    World(#[from] WorldError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("failed to read content definitions {path}: {source}")]
    ContentRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The flat generator needs a content type the registry lacks.
    #[error("content registry has no {0:?} type")]
    MissingContent(&'static str),
}
