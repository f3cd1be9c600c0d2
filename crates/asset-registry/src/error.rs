use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("State format version mismatch: found {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("Registry state is not empty; load into a temporary state and merge instead")]
    StateNotEmpty,

    #[error("Package file error: {0}")]
    PackageFile(PathBuf),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RegistryError>;
