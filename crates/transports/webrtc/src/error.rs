//! Error types for the SurfaceCast transport

use surfacecast_wire::WireError;

/// Result type alias using the transport Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while running a streaming session
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No encoder configuration could be negotiated
    #[error("Codec unsupported: {0}")]
    CodecUnsupported(String),

    /// Signaling exchange error
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Peer object is not ready to negotiate yet
    #[error("Peer not ready: {0}")]
    PeerNotReady(String),

    /// Video encoding or still decoding error
    #[error("Encoding error: {0}")]
    EncodingError(String),

    /// Encoder rejected a new configuration; the previous one is still in effect
    #[error("Reconfiguration rejected: {0}")]
    ReconfigurationRejected(String),

    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Session management error
    #[error("Session error: {0}")]
    SessionError(String),

    /// Frame source (surface automation layer) error
    #[error("Surface error: {0}")]
    SurfaceError(String),

    /// Bindings could not be restored after a document change
    #[error("Navigation recovery failed: {0}")]
    NavigationRecoveryFailed(String),

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// Data channel error
    #[error("Data channel error: {0}")]
    DataChannelError(String),

    /// Wire packet encoding error
    #[error("Wire error: {0}")]
    Wire(#[from] WireError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::PeerNotReady(_)
                | Error::SignalingError(_)
                | Error::DataChannelError(_)
                | Error::IoError(_)
        )
    }

    /// Check if this error leaves a running session unusable
    ///
    /// The encoder is gone, the page lost its bindings, or the peer cannot
    /// negotiate. Rejected requests and per-frame drops are not fatal.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(
            self,
            Error::EncodingError(_)
                | Error::NavigationRecoveryFailed(_)
                | Error::PeerNotReady(_)
                | Error::PeerConnectionError(_)
                | Error::SdpError(_)
                | Error::WebRtcError(_)
                | Error::SessionError(_)
        )
    }

    /// Stable machine-readable code used in error notifications
    pub fn code(&self) -> &'static str {
        match self {
            Error::InvalidConfig(_) => "invalid_config",
            Error::CodecUnsupported(_) => "codec_unsupported",
            Error::SignalingError(_) => "signaling",
            Error::PeerNotReady(_) => "peer_not_ready",
            Error::EncodingError(_) => "encoding",
            Error::ReconfigurationRejected(_) => "reconfiguration_rejected",
            Error::SessionNotFound(_) => "session_not_found",
            Error::SessionError(_) => "session",
            Error::SurfaceError(_) => "surface",
            Error::NavigationRecoveryFailed(_) => "navigation_recovery_failed",
            Error::PeerConnectionError(_) => "peer_connection",
            Error::IceCandidateError(_) => "ice_candidate",
            Error::SdpError(_) => "sdp",
            Error::DataChannelError(_) => "data_channel",
            Error::Wire(_) => "wire",
            Error::SerializationError(_) => "serialization",
            Error::WebRtcError(_) => "webrtc",
            Error::IoError(_) => "io",
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
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
    fn test_error_is_retryable() {
        assert!(Error::PeerNotReady("test".to_string()).is_retryable());
        assert!(Error::SignalingError("test".to_string()).is_retryable());
        assert!(!Error::InvalidConfig("test".to_string()).is_retryable());
        assert!(!Error::SdpError("test".to_string()).is_retryable());
    }

    #[test]
    fn test_error_is_fatal_to_session() {
        assert!(Error::EncodingError("encoder gone".to_string()).is_fatal_to_session());
        assert!(Error::NavigationRecoveryFailed("s1".to_string()).is_fatal_to_session());
        assert!(Error::SdpError("no local description".to_string()).is_fatal_to_session());

        assert!(!Error::ReconfigurationRejected("2560x1440".to_string()).is_fatal_to_session());
        assert!(!Error::InvalidConfig("scale".to_string()).is_fatal_to_session());
        assert!(!Error::SessionNotFound("s1".to_string()).is_fatal_to_session());
        assert!(!Error::SurfaceError("dispatch".to_string()).is_fatal_to_session());
    }

    #[test]
    fn test_wire_error_conversion() {
        let err = Error::from(WireError::PayloadTooLarge(10));
        assert!(matches!(err, Error::Wire(_)));
        assert_eq!(err.code(), "wire");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err = Error::from(io_err);
        assert!(matches!(err, Error::IoError(_)));
    }
}
