use crate::descriptor::PluginId;
use crate::wire::ErrorCode;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from bridge operations.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Shared memory error: {0}")]
    Shm(#[from] soundproof_shm::ShmError),

    #[error("Failed to spawn server process {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Message of {size} bytes does not fit channel capacity {capacity}")]
    Oversized { size: usize, capacity: u32 },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Plugin error ({code}): {message}")]
    Plugin { code: ErrorCode, message: String },

    #[error("Unknown plugin id {0}")]
    UnknownPlugin(PluginId),

    #[error("Server process died")]
    ProcessDied,

    #[error("Bridge is shut down")]
    Disconnected,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl BridgeError {
    /// Lift an error reply off the wire into the host-side taxonomy.
    pub(crate) fn from_wire(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::Protocol => BridgeError::Protocol(message),
            _ => BridgeError::Plugin { code, message },
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BridgeError::Oversized {
            size: 9000,
            capacity: 4096,
        };
        assert_eq!(
            err.to_string(),
            "Message of 9000 bytes does not fit channel capacity 4096"
        );

        let err = BridgeError::Plugin {
            code: ErrorCode::Plugin,
            message: "setChunk rejected".to_string(),
        };
        assert_eq!(err.to_string(), "Plugin error (plugin): setChunk rejected");

        let err = BridgeError::ProcessDied;
        assert_eq!(err.to_string(), "Server process died");
    }

    #[test]
    fn test_from_wire_mapping() {
        match BridgeError::from_wire(ErrorCode::Protocol, "bad frame".to_string()) {
            BridgeError::Protocol(msg) => assert_eq!(msg, "bad frame"),
            other => panic!("Unexpected mapping: {other}"),
        }
        match BridgeError::from_wire(ErrorCode::UnknownPlugin, "id 7".to_string()) {
            BridgeError::Plugin { code, .. } => assert_eq!(code, ErrorCode::UnknownPlugin),
            other => panic!("Unexpected mapping: {other}"),
        }
    }
}
