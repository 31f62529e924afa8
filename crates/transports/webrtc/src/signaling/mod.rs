//! Signaling for the server-side peer
//!
//! The transport carrying signaling to the viewer belongs to the embedding
//! application. This module holds the payload types, the per-session
//! [`ConnectionManager`] and the notifications sessions push outward.

mod events;
mod manager;
mod types;

pub use events::{current_timestamp_ns, SessionEvent, SessionNotification};
pub use manager::ConnectionManager;
pub use types::{IceCandidate, SdpKind, SessionDescription};
