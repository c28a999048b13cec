//! Centralized error type for the soundproof umbrella crate.
//!
//! Wraps the subsystem errors so `?` propagates naturally across crate boundaries.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Shm(#[from] soundproof_shm::ShmError),

    #[error("bridge: {0}")]
    Bridge(#[from] soundproof_bridge::BridgeError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
