//! Notifications pushed from sessions to the signaling layer
//!
//! Everything a session learns asynchronously (local ICE candidates, peer
//! state, cursor changes, lifecycle transitions, fatal errors) is emitted as
//! a [`SessionEvent`] on the controller's event stream.

use serde::{Deserialize, Serialize};

use super::IceCandidate;
use crate::session::LifecycleState;
use crate::Error;

/// Session notification payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionNotification {
    /// Local ICE candidate to forward to the viewer
    IceCandidate { candidate: IceCandidate },

    /// Peer connection state changed
    ConnectionStateChanged { state: String },

    /// Remote page changed its cursor
    CursorStyleChanged { style: String },

    /// Session moved to a new lifecycle state
    LifecycleChanged { state: LifecycleState },

    /// Session hit an error it cannot report through a command reply
    Error {
        /// Stable error code, see [`Error::code`]
        code: String,
        /// Human-readable message
        message: String,
    },
}

impl SessionNotification {
    pub fn ice_candidate(candidate: IceCandidate) -> Self {
        Self::IceCandidate { candidate }
    }

    pub fn connection_state(state: impl Into<String>) -> Self {
        Self::ConnectionStateChanged {
            state: state.into(),
        }
    }

    pub fn cursor_style(style: impl Into<String>) -> Self {
        Self::CursorStyleChanged {
            style: style.into(),
        }
    }

    pub fn lifecycle(state: LifecycleState) -> Self {
        Self::LifecycleChanged { state }
    }

    pub fn error(error: &Error) -> Self {
        Self::Error {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }

    /// Get the notification name for logging
    pub fn name(&self) -> &'static str {
        match self {
            Self::IceCandidate { .. } => "ice_candidate",
            Self::ConnectionStateChanged { .. } => "connection_state_changed",
            Self::CursorStyleChanged { .. } => "cursor_style_changed",
            Self::LifecycleChanged { .. } => "lifecycle_changed",
            Self::Error { .. } => "error",
        }
    }
}

/// A notification tagged with its session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: String,
    #[serde(flatten)]
    pub notification: SessionNotification,
    pub timestamp_ns: u64,
}

impl SessionEvent {
    pub fn new(session_id: impl Into<String>, notification: SessionNotification) -> Self {
        Self {
            session_id: session_id.into(),
            notification,
            timestamp_ns: current_timestamp_ns(),
        }
    }
}

/// Get current timestamp in nanoseconds
pub fn current_timestamp_ns() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ActivePhase;

    #[test]
    fn test_event_json_is_flat() {
        let event = SessionEvent::new(
            "s1",
            SessionNotification::cursor_style("pointer"),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["session_id"], "s1");
        assert_eq!(json["type"], "cursor_style_changed");
        assert_eq!(json["style"], "pointer");
    }

    #[test]
    fn test_lifecycle_event_round_trips() {
        let event = SessionEvent::new(
            "s1",
            SessionNotification::lifecycle(LifecycleState::Active(ActivePhase::Streaming)),
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: SessionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.notification.name(), "lifecycle_changed");
    }

    #[test]
    fn test_error_notification_carries_code() {
        let notification =
            SessionNotification::error(&Error::NavigationRecoveryFailed("page hung".to_string()));
        match notification {
            SessionNotification::Error { code, message } => {
                assert_eq!(code, "navigation_recovery_failed");
                assert!(message.contains("page hung"));
            }
            other => panic!("unexpected notification: {other:?}"),
        }
    }
}
