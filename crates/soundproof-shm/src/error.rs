//! Error types for shared-memory regions and channels

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShmError {
    #[error("Shared memory IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Region too small: {size} bytes, need at least {need}")]
    TooSmall { size: u64, need: u64 },

    #[error("Bad region magic (not a shared region, or clobbered)")]
    BadMagic,

    #[error("Incompatible region version {found_major}.{found_minor}.{found_patch}, supported {supported_major}.{supported_minor}.x")]
    Version {
        found_major: u32,
        found_minor: u32,
        found_patch: u32,
        supported_major: u32,
        supported_minor: u32,
    },

    #[error("Channel limit exceeded: a region holds at most {0} channels")]
    ChannelLimit(usize),

    #[error("Channel name too long: {0:?}")]
    NameTooLong(String),

    #[error("Channel capacity must be non-zero")]
    ZeroCapacity,

    #[error("Malformed channel header at index {0}")]
    BadChannel(usize),
}

pub type Result<T> = std::result::Result<T, ShmError>;
