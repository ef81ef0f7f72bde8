//! Seams between the call controller and the outside world: the relay it
//! signals over, and the backend that provides microphone capture and the
//! peer connection.

use async_trait::async_trait;
use tokio::sync::mpsc;

use parley_net::EventChannel;
use parley_shared::protocol::{IceCandidate, SignalMessage};

use crate::error::{CallError, MediaError};

/// Identifies one call session. Peer events carry it so that late events
/// from a torn-down connection can be told apart from the current one.
pub type SessionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Handle to the remote party's audio once it starts flowing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMedia {
    pub track_id: String,
}

/// Reported by a [`PeerLink`] as negotiation progresses.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A local network-path candidate to trickle to the other side.
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteMedia),
    Connected,
    Disconnected,
    Failed,
}

/// Sending half handed to a peer link, tagged with its session.
#[derive(Debug, Clone)]
pub struct PeerEvents {
    session: SessionId,
    tx: mpsc::UnboundedSender<(SessionId, PeerEvent)>,
}

impl PeerEvents {
    pub fn new(session: SessionId, tx: mpsc::UnboundedSender<(SessionId, PeerEvent)>) -> Self {
        Self { session, tx }
    }

    pub fn emit(&self, event: PeerEvent) {
        let _ = self.tx.send((self.session, event));
    }
}

/// A captured local audio source. Owned by exactly one call session.
pub trait LocalMedia: Send + Sync {
    /// Stop every track. Must be safe to call more than once.
    fn stop(&mut self);

    fn is_live(&self) -> bool;
}

#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_offer(&self) -> Result<String, MediaError>;

    /// Only valid once the remote offer has been applied.
    async fn create_answer(&self) -> Result<String, MediaError>;

    async fn set_remote_description(&self, kind: SdpKind, sdp: String) -> Result<(), MediaError>;

    async fn add_candidate(&self, candidate: IceCandidate) -> Result<(), MediaError>;

    async fn close(&self);
}

#[async_trait]
pub trait MediaBackend: Send + Sync + 'static {
    async fn acquire_local_audio(&self) -> Result<Box<dyn LocalMedia>, MediaError>;

    async fn create_peer(&self, events: PeerEvents) -> Result<Box<dyn PeerLink>, MediaError>;
}

/// Delivers call signals to the other party through the relay.
#[async_trait]
pub trait Signaler: Send + Sync + 'static {
    async fn signal(&self, message: &SignalMessage) -> Result<(), CallError>;
}

#[async_trait]
impl Signaler for EventChannel {
    async fn signal(&self, message: &SignalMessage) -> Result<(), CallError> {
        let (event, payload) = message.to_event()?;
        self.emit(event, &payload).await?;
        Ok(())
    }
}
