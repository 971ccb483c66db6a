use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Meta(#[from] pbundle_meta::Error),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("{tool} failed: {detail}")]
    ToolFailed { tool: String, detail: String },

    #[error("AppDir does not exist or is not a directory: {0}")]
    BadAppDir(PathBuf),

    #[error("Runtime loader not found; pass --runtime or install appbundle-runtime")]
    RuntimeNotFound,

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
