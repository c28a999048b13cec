use soundproof_bridge::descriptor::PluginId;
use soundproof_bridge::wire::{ErrorCode, Reply};
use thiserror::Error;

/// Errors from server-side operations.
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Shared memory error: {0}")]
    Shm(#[from] soundproof_shm::ShmError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unknown plugin id {0}")]
    UnknownPlugin(PluginId),

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl ServerError {
    /// Wire classification this error reports back to the host.
    pub fn code(&self) -> ErrorCode {
        match self {
            ServerError::Shm(_) | ServerError::Io(_) => ErrorCode::System,
            ServerError::Serialization(_) | ServerError::Json(_) | ServerError::Protocol(_) => {
                ErrorCode::Protocol
            }
            ServerError::UnknownPlugin(_) => ErrorCode::UnknownPlugin,
            ServerError::Plugin(_) => ErrorCode::Plugin,
            ServerError::Unsupported(_) => ErrorCode::Unsupported,
        }
    }

    pub fn to_reply(&self) -> Reply {
        Reply::Error {
            code: self.code(),
            message: self.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
