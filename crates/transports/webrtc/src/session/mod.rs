//! Stream sessions
//!
//! One task per session owns its encoder, peer connection and surface
//! bindings. [`StreamController`] is the registry in front of those tasks.

mod actor;
mod command;
mod controller;
mod state;
mod stats;

pub use controller::StreamController;
pub use state::{ActivePhase, LifecycleState};
pub use stats::{SessionStats, StatsSnapshot};
