use std::collections::VecDeque;

use tracing::debug;

use parley_shared::protocol::IceCandidate;
use parley_shared::types::UserId;

use crate::media::{LocalMedia, PeerLink, RemoteMedia, SessionId};

/// Fixed when the session is created; never inferred afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    /// Initiated the call and produces the offer.
    Caller,
    /// Received the call and produces the answer.
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    #[default]
    Idle,
    Calling,
    Ringing,
    Connecting,
    InCall,
    Rejected,
    Ended,
}

impl CallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CallState::Rejected | CallState::Ended)
    }

    /// A call is underway: not idle and not finished.
    pub fn is_active(self) -> bool {
        !matches!(self, CallState::Idle) && !self.is_terminal()
    }
}

/// What the presentation layer observes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallStatus {
    pub state: CallState,
    pub role: Option<CallRole>,
    pub peer: Option<UserId>,
    /// The caller's declared display name, for the incoming-call modal.
    pub peer_name: Option<String>,
}

pub struct CallSession {
    pub id: SessionId,
    pub peer: UserId,
    pub peer_name: Option<String>,
    pub role: CallRole,
    pub state: CallState,
    pub local_media: Option<Box<dyn LocalMedia>>,
    pub remote_media: Option<RemoteMedia>,
    pub peer_link: Option<Box<dyn PeerLink>>,
    /// Remote candidates waiting for the remote description, oldest first.
    pub pending_candidates: VecDeque<IceCandidate>,
    pub remote_description_set: bool,
}

impl CallSession {
    pub fn new(id: SessionId, peer: UserId, role: CallRole, peer_name: Option<String>) -> Self {
        let state = match role {
            CallRole::Caller => CallState::Calling,
            CallRole::Callee => CallState::Ringing,
        };
        Self {
            id,
            peer,
            peer_name,
            role,
            state,
            local_media: None,
            remote_media: None,
            peer_link: None,
            pending_candidates: VecDeque::new(),
            remote_description_set: false,
        }
    }

    pub fn status(&self) -> CallStatus {
        CallStatus {
            state: self.state,
            role: Some(self.role),
            peer: Some(self.peer.clone()),
            peer_name: self.peer_name.clone(),
        }
    }

    /// Release every resource the session holds. Idempotent.
    pub async fn release(&mut self) {
        if let Some(mut media) = self.local_media.take() {
            media.stop();
        }
        if let Some(link) = self.peer_link.take() {
            link.close().await;
        }
        self.remote_media = None;
        self.pending_candidates.clear();
        self.remote_description_set = false;
        debug!(session = self.id, peer = %self.peer, "Call session released");
    }
}
