use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Meta(#[from] pbundle_meta::Error),

    #[error("not an AppBundle: {0}")]
    BadBundle(String),

    #[error("required tool still missing after static-tools extraction: {0}")]
    ToolMissing(String),

    #[error("mount failed: {0}")]
    MountFailed(String),

    #[error("extraction failed: {0}")]
    ExtractFailed(String),

    #[error("stale workdir {0}: mount sentinel present but AppRun is missing")]
    CorruptWorkdir(PathBuf),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
