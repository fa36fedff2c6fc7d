/*!
 * Error types for the Liaison server.
 */
use thiserror::Error;

use liaison_core::error::Error as CoreError;
use liaison_devices::DeviceError;

/// Error type for RPC dispatch and the WebSocket server
#[derive(Error, Debug)]
pub enum ServerError {
    /// The request was not valid JSON or did not have the expected shape
    #[error("Malformed request: {0}")]
    MalformedRequest(String),

    /// No object is registered under the requested name
    #[error("Unknown object: {0}")]
    UnknownObject(String),

    /// The object has no such method
    #[error("Unknown method: {0}")]
    UnknownMethod(String),

    /// The method exists but is not exposed to remote callers
    #[error("Method not exposed: {0}")]
    MethodNotExposed(String),

    /// The referenced connection is not open
    #[error("Unknown connection: {0}")]
    UnknownConnection(String),

    /// A call argument was missing or had the wrong type
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The call did not finish in time
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The invoked method failed
    #[error("Invocation failed: {0}")]
    Invocation(String),

    /// Device error
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Core error
    #[error("Core error: {0}")]
    Core(#[from] CoreError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket protocol error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for server operations
pub type Result<T> = std::result::Result<T, ServerError>;

impl ServerError {
    /// Stable name of the error kind, sent to remote callers.
    ///
    /// Device failures report the device error's own kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerError::MalformedRequest(_) => "MalformedRequest",
            ServerError::UnknownObject(_) => "UnknownObject",
            ServerError::UnknownMethod(_) => "UnknownMethod",
            ServerError::MethodNotExposed(_) => "MethodNotExposed",
            ServerError::UnknownConnection(_) => "UnknownConnection",
            ServerError::InvalidArgument(_) => "InvalidArgument",
            ServerError::Timeout(_) => "Timeout",
            ServerError::Invocation(_) => "Invocation",
            ServerError::Device(err) => err.kind(),
            ServerError::Core(_) => "Core",
            ServerError::Io(_) => "Io",
            ServerError::WebSocket(_) => "WebSocket",
            ServerError::Serialization(_) => "Serialization",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_and_message() {
        let err = ServerError::UnknownObject("Nope".to_string());
        assert_eq!(err.kind(), "UnknownObject");
        assert_eq!(err.to_string(), "Unknown object: Nope");

        let err: ServerError = DeviceError::NotFound("pad".to_string()).into();
        assert_eq!(err.kind(), "NotFound");
        assert!(err.to_string().contains("pad"));

        let err: ServerError = DeviceError::UnknownDeviceType("Lamp".to_string()).into();
        assert_eq!(err.kind(), "UnknownDeviceType");
        let err: ServerError = DeviceError::ConnectionError("COM3".to_string()).into();
        assert_eq!(err.kind(), "ConnectionError");
    }
}
