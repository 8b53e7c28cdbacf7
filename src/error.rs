use thiserror::Error;

#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("Invalid magic number in metadata header")]
    InvalidMagic,

    #[error("Unsupported format version: {0}")]
    UnsupportedVersion(u32),

    #[error("Invalid argument: {0}")]
    InvalidArgs(String),

    #[error("Out of range: {0}")]
    OutOfRange(String),

    #[error("No space: {0}")]
    NoSpace(&'static str),

    #[error("Bad state: {0}")]
    BadState(String),

    #[error("Metadata corrupt: {0}")]
    Corrupt(String),

    #[error("Metadata integrity failure: {0}")]
    DataIntegrity(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VolumeError>;
