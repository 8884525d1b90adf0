//! Error types for the data channel polyfill

/// Result type alias using the polyfill Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while establishing or using polyfilled channels
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No remote peer identity has been bound to the connection
    #[error("No remote peer identity bound; accept a remote description first")]
    NoPeerBound,

    /// No local peer identity has been bound to the connection
    #[error("No local peer identity bound; set a local description first")]
    NoLocalIdentity,

    /// Operation not allowed in the current ready state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Session description carries no origin field
    #[error("Malformed session description: {0}")]
    MalformedDescription(String),

    /// Control message could not be decoded
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Transport-level fault on a dedicated connection
    #[error("Transport error: {0}")]
    Transport(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Native host (webrtc-rs) error
    #[error("Native WebRTC error: {0}")]
    Native(String),
}

impl Error {
    /// Check if this error is caused by API misuse rather than the network
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfig(_)
                | Error::NoPeerBound
                | Error::NoLocalIdentity
                | Error::InvalidState(_)
        )
    }

    /// Check if this error came from a duplex connection
    pub fn is_transport_error(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::WebSocketError(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocketError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::InvalidConfig("test".to_string());
        assert_eq!(err.to_string(), "Invalid configuration: test");
    }

    #[test]
    fn test_error_is_caller_error() {
        assert!(Error::NoPeerBound.is_caller_error());
        assert!(Error::NoLocalIdentity.is_caller_error());
        assert!(Error::InvalidState("closed".to_string()).is_caller_error());
        assert!(!Error::Transport("reset".to_string()).is_caller_error());
        assert!(!Error::MalformedDescription("no o=".to_string()).is_caller_error());
    }

    #[test]
    fn test_error_is_transport_error() {
        assert!(Error::Transport("reset".to_string()).is_transport_error());
        assert!(Error::WebSocketError("eof".to_string()).is_transport_error());
        assert!(!Error::NoPeerBound.is_transport_error());
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("[").unwrap_err();
        let err = Error::from(json_err);
        assert!(matches!(err, Error::SerializationError(_)));
    }
}
