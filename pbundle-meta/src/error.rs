use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ELF parse error: {0}")]
    Elf(#[from] goblin::error::Error),

    #[error("CBOR decode failed: {0}")]
    CborDecode(String),

    #[error("CBOR encode failed: {0}")]
    CborEncode(String),

    #[error("Invalid AppBundleID: {0}")]
    InvalidId(String),

    #[error("Unknown filesystem type: {0}")]
    UnknownFilesystem(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
