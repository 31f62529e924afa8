//! Session lifecycle state machine

use std::fmt;

use serde::{Deserialize, Serialize};

/// Sub-state of an active session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivePhase {
    /// Bindings installed and encoder reachable; no viewer yet
    HeadlessReady,
    /// Remote answer applied
    ClientConnected,
    /// Data channel open and frames flowing
    Streaming,
}

/// Lifecycle of one session instance
///
/// `Idle -> Starting -> Active(HeadlessReady) -> Active(ClientConnected)
/// -> Active(Streaming)`, and from any active state `Stopping -> Stopped`.
/// `Stopped` is terminal; a restart builds a fresh instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "phase", rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Starting,
    Active(ActivePhase),
    Stopping,
    Stopped,
}

impl LifecycleState {
    /// Check if the session is in any active phase
    pub fn is_active(&self) -> bool {
        matches!(self, LifecycleState::Active(_))
    }

    /// Check if the session has fully stopped
    pub fn is_terminal(&self) -> bool {
        matches!(self, LifecycleState::Stopped)
    }

    /// Check if the session is stopping or stopped
    pub fn is_shutting_down(&self) -> bool {
        matches!(self, LifecycleState::Stopping | LifecycleState::Stopped)
    }

    /// Check whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use ActivePhase::*;
        use LifecycleState::*;

        match (*self, next) {
            (Idle, Starting) => true,
            (Starting, Active(HeadlessReady)) => true,
            (Active(HeadlessReady), Active(ClientConnected)) => true,
            (Active(ClientConnected), Active(Streaming)) => true,
            // A failed start cleans up through Stopping as well
            (Starting | Active(_), Stopping) => true,
            (Stopping, Stopped) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Idle => write!(f, "idle"),
            LifecycleState::Starting => write!(f, "starting"),
            LifecycleState::Active(ActivePhase::HeadlessReady) => write!(f, "active(headless_ready)"),
            LifecycleState::Active(ActivePhase::ClientConnected) => {
                write!(f, "active(client_connected)")
            }
            LifecycleState::Active(ActivePhase::Streaming) => write!(f, "active(streaming)"),
            LifecycleState::Stopping => write!(f, "stopping"),
            LifecycleState::Stopped => write!(f, "stopped"),
        }
    }
}
