//! Messages accepted by a session task

use tokio::sync::oneshot;

use crate::signaling::{IceCandidate, SessionDescription};
use crate::surface::InputEvent;
use crate::Result;

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

/// Control operation sent from the controller to a session task
#[derive(Debug)]
pub(crate) enum SessionCommand {
    CreateOffer(Reply<Option<SessionDescription>>),
    ApplyAnswer(SessionDescription, Reply<()>),
    AddIceCandidate(IceCandidate, Reply<()>),
    ReconfigureViewport {
        width: u32,
        height: u32,
        scale: f64,
        reply: Reply<()>,
    },
    ReconfigureScale {
        scale: f64,
        reply: Reply<()>,
    },
    HandleNavigation(Reply<()>),
    DispatchInput(InputEvent, Reply<()>),
    Stop(oneshot::Sender<()>),
}

impl SessionCommand {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            SessionCommand::CreateOffer(_) => "create_offer",
            SessionCommand::ApplyAnswer(..) => "apply_answer",
            SessionCommand::AddIceCandidate(..) => "add_ice_candidate",
            SessionCommand::ReconfigureViewport { .. } => "reconfigure_viewport",
            SessionCommand::ReconfigureScale { .. } => "reconfigure_scale",
            SessionCommand::HandleNavigation(_) => "handle_navigation",
            SessionCommand::DispatchInput(..) => "dispatch_input",
            SessionCommand::Stop(_) => "stop",
        }
    }
}
