//! Call signaling state machine.
//!
//! ```text
//! caller: idle -> calling -> connecting -> in-call
//!                    \-> rejected (decline, ring timeout)
//! callee: idle -> ringing -> connecting -> in-call
//!                    \-> rejected (user decline)
//!                    \-> ended (no answer before the deadline)
//! any active state -> ended (hangup, peer hangup, transport loss, negotiation failure)
//! calling, ringing, connecting -> ended (event channel lost, negotiation timeout)
//! ```
//!
//! Every path into `rejected` or `ended` goes through [`CallController::cleanup`],
//! which drops the session and releases its media. The published status
//! keeps showing the terminal state until the next call or `dismiss`.

use std::fmt::Display;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use parley_shared::constants::DEFAULT_RING_TIMEOUT_SECS;
use parley_shared::protocol::{CallSignal, IceCandidate, SignalMessage};
use parley_shared::types::UserId;

use crate::error::{CallError, MediaError, Result};
use crate::media::{MediaBackend, PeerEvent, PeerEvents, SdpKind, SessionId, Signaler};
use crate::session::{CallRole, CallSession, CallState, CallStatus};

#[derive(Debug, Clone)]
pub struct CallConfig {
    /// How long either side waits on the other before giving up: a caller
    /// in `calling`, a callee in `ringing`, and both sides in `connecting`
    /// until the remote description is applied.
    pub ring_timeout: Duration,
    /// Sent with outgoing call requests.
    pub display_name: Option<String>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(DEFAULT_RING_TIMEOUT_SECS),
            display_name: None,
        }
    }
}

pub struct CallController<S, B> {
    local: UserId,
    signaler: S,
    backend: B,
    config: CallConfig,
    session: Option<CallSession>,
    next_session: SessionId,
    peer_tx: mpsc::UnboundedSender<(SessionId, PeerEvent)>,
    status_tx: watch::Sender<CallStatus>,
    ring_deadline: Option<Instant>,
}

impl<S: Signaler, B: MediaBackend> CallController<S, B> {
    /// Returns the controller and the receiver its peer links report into.
    /// Feed that receiver back through [`CallController::handle_peer_event`].
    pub fn new(
        local: UserId,
        signaler: S,
        backend: B,
        config: CallConfig,
    ) -> (Self, mpsc::UnboundedReceiver<(SessionId, PeerEvent)>) {
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(CallStatus::default());
        (
            Self {
                local,
                signaler,
                backend,
                config,
                session: None,
                next_session: 0,
                peer_tx,
                status_tx,
                ring_deadline: None,
            },
            peer_rx,
        )
    }

    pub fn subscribe(&self) -> watch::Receiver<CallStatus> {
        self.status_tx.subscribe()
    }

    pub fn status(&self) -> CallStatus {
        self.status_tx.borrow().clone()
    }

    pub fn state(&self) -> CallState {
        self.status_tx.borrow().state
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn has_local_media(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.local_media.is_some())
    }

    pub fn has_remote_media(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.remote_media.is_some())
    }

    pub fn pending_candidates(&self) -> usize {
        self.session
            .as_ref()
            .map_or(0, |s| s.pending_candidates.len())
    }

    /// When the current wait on the other side gives up.
    pub fn ring_deadline(&self) -> Option<Instant> {
        self.ring_deadline
    }

    // -----------------------------------------------------------------------
    // User actions
    // -----------------------------------------------------------------------

    pub async fn initiate(&mut self, peer: UserId) -> Result<()> {
        if peer == self.local {
            return Err(CallError::InvalidPeer);
        }
        if self.session.is_some() {
            return Err(CallError::Busy);
        }

        let id = self.bump_session();
        self.session = Some(CallSession::new(id, peer.clone(), CallRole::Caller, None));
        self.arm_deadline();
        self.publish();
        info!(peer = %peer, session = id, "Calling");

        let request = CallSignal::Request {
            caller_name: self.config.display_name.clone(),
        };
        if let Err(e) = self.send(&peer, request).await {
            warn!(peer = %peer, error = %e, "Call request not delivered");
            self.finish(CallState::Ended).await;
            return Err(e);
        }
        Ok(())
    }

    /// Answer the ringing call. Local media is acquired before the accept
    /// goes out, so a device failure declines instead of half-connecting.
    pub async fn accept(&mut self) -> Result<()> {
        let (id, peer) = match &self.session {
            Some(s) if s.role == CallRole::Callee && s.state == CallState::Ringing => {
                (s.id, s.peer.clone())
            }
            _ => return Err(CallError::NoIncomingCall),
        };

        if let Err(e) = self.prepare_media(id).await {
            warn!(peer = %peer, error = %e, "Cannot answer: media unavailable");
            self.send_quietly(&peer, CallSignal::Decline).await;
            self.finish(CallState::Ended).await;
            return Err(e);
        }

        if let Err(e) = self.send(&peer, CallSignal::Accept).await {
            self.finish(CallState::Ended).await;
            return Err(e);
        }
        self.set_state(CallState::Connecting);
        self.arm_deadline();
        info!(peer = %peer, "Call accepted, waiting for offer");
        Ok(())
    }

    pub async fn decline(&mut self) -> Result<()> {
        let peer = match &self.session {
            Some(s) if s.role == CallRole::Callee && s.state == CallState::Ringing => s.peer.clone(),
            _ => return Err(CallError::NoIncomingCall),
        };
        self.send_quietly(&peer, CallSignal::Decline).await;
        self.finish(CallState::Rejected).await;
        Ok(())
    }

    /// End the call from any non-idle, non-terminal state.
    pub async fn hangup(&mut self) -> Result<()> {
        let Some(peer) = self.session.as_ref().map(|s| s.peer.clone()) else {
            debug!("Hangup with no call in progress");
            return Ok(());
        };
        self.send_quietly(&peer, CallSignal::Hangup).await;
        self.finish(CallState::Ended).await;
        Ok(())
    }

    /// Clear a terminal status once the UI has shown it.
    pub fn dismiss(&mut self) {
        if self.session.is_none() {
            self.status_tx.send_replace(CallStatus::default());
        }
    }

    /// The deadline armed by the last transition passed.
    pub async fn on_ring_timeout(&mut self) {
        self.ring_deadline = None;
        let Some(session) = &self.session else {
            return;
        };
        let peer = session.peer.clone();
        match (session.role, session.state) {
            (CallRole::Caller, CallState::Calling) => {
                info!(peer = %peer, "No answer");
                self.send_quietly(&peer, CallSignal::Hangup).await;
                self.finish(CallState::Rejected).await;
            }
            (CallRole::Callee, CallState::Ringing) => {
                info!(peer = %peer, "Incoming call not answered");
                self.send_quietly(&peer, CallSignal::Decline).await;
                self.finish(CallState::Ended).await;
            }
            (_, CallState::Connecting) if !session.remote_description_set => {
                self.fail("negotiation timed out").await;
            }
            _ => {}
        }
    }

    /// The event channel dropped. A call whose peer link is up keeps its
    /// media path; anything still negotiating cannot finish.
    pub async fn on_channel_lost(&mut self) {
        match &self.session {
            Some(s) if s.state != CallState::InCall => {
                warn!(peer = %s.peer, state = ?s.state, "Signaling lost before the call connected");
                self.finish(CallState::Ended).await;
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // Relay input
    // -----------------------------------------------------------------------

    pub async fn handle_signal(&mut self, message: SignalMessage) {
        if message.to != self.local {
            return;
        }
        let from = message.from;

        if let CallSignal::Request { caller_name } = message.signal {
            self.on_request(from, caller_name).await;
            return;
        }

        let Some(session) = self.session.as_ref() else {
            debug!(from = %from, signal = message.signal.event_name(), "No call for signal");
            return;
        };
        if session.peer != from {
            debug!(from = %from, expected = %session.peer, "Ignoring signal from stale peer");
            return;
        }

        match message.signal {
            CallSignal::Accept => self.on_accept().await,
            CallSignal::Decline => self.on_decline().await,
            CallSignal::Offer(sdp) => self.on_offer(sdp).await,
            CallSignal::Answer(sdp) => self.on_answer(sdp).await,
            CallSignal::Candidate(candidate) => self.on_candidate(candidate).await,
            CallSignal::Hangup => {
                info!(peer = %from, "Peer hung up");
                self.finish(CallState::Ended).await;
            }
            CallSignal::Request { .. } => {}
        }
    }

    /// A relay message that failed to decode. Ends the call if it claims to
    /// come from the current peer.
    pub async fn handle_malformed(&mut self, from: Option<UserId>, error: impl Display) {
        let current = self.session.as_ref().map(|s| &s.peer);
        if from.is_some() && from.as_ref() == current {
            self.fail(error).await;
        } else {
            debug!(error = %error, "Ignoring malformed call signal");
        }
    }

    pub async fn handle_peer_event(&mut self, session_id: SessionId, event: PeerEvent) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.id != session_id {
            debug!(session = session_id, "Ignoring event from a previous call");
            return;
        }

        match event {
            PeerEvent::LocalCandidate(candidate) => {
                let peer = session.peer.clone();
                self.send_quietly(&peer, CallSignal::Candidate(candidate)).await;
            }
            PeerEvent::RemoteTrack(media) => {
                debug!(track = %media.track_id, "Remote audio attached");
                session.remote_media = Some(media);
            }
            PeerEvent::Connected => {
                if session.state == CallState::Connecting {
                    info!(peer = %session.peer, "Call connected");
                    self.set_state(CallState::InCall);
                }
            }
            PeerEvent::Disconnected | PeerEvent::Failed => {
                warn!(peer = %session.peer, event = ?event, "Peer connection lost");
                self.finish(CallState::Ended).await;
            }
        }
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    async fn on_request(&mut self, from: UserId, caller_name: Option<String>) {
        if from == self.local {
            return;
        }
        if let Some(session) = &self.session {
            if session.peer == from && session.role == CallRole::Callee {
                debug!(from = %from, "Duplicate call request");
                return;
            }
            info!(from = %from, "Busy, declining incoming call");
            self.send_quietly(&from, CallSignal::Decline).await;
            return;
        }

        let id = self.bump_session();
        self.session = Some(CallSession::new(id, from.clone(), CallRole::Callee, caller_name));
        self.arm_deadline();
        self.publish();
        info!(from = %from, session = id, "Incoming call");
    }

    async fn on_accept(&mut self) {
        let (id, peer) = match &self.session {
            Some(s) if s.role == CallRole::Caller && s.state == CallState::Calling => {
                (s.id, s.peer.clone())
            }
            _ => {
                debug!("Unexpected accept");
                return;
            }
        };
        if let Err(e) = self.prepare_media(id).await {
            warn!(peer = %peer, error = %e, "Media unavailable, abandoning call");
            self.send_quietly(&peer, CallSignal::Hangup).await;
            self.finish(CallState::Ended).await;
            return;
        }
        self.set_state(CallState::Connecting);
        self.arm_deadline();

        let offer = match self.link() {
            Some(link) => link.create_offer().await,
            None => return,
        };
        match offer {
            Ok(sdp) => {
                if let Err(e) = self.send(&peer, CallSignal::Offer(sdp)).await {
                    self.fail(e).await;
                }
            }
            Err(e) => self.fail(e).await,
        }
    }

    async fn on_decline(&mut self) {
        match &self.session {
            Some(s) if s.role == CallRole::Caller => {
                info!(peer = %s.peer, "Call declined");
                self.finish(CallState::Rejected).await;
            }
            _ => debug!("Unexpected decline"),
        }
    }

    async fn on_offer(&mut self, sdp: String) {
        match &self.session {
            Some(s)
                if s.role == CallRole::Callee
                    && s.state == CallState::Connecting
                    && !s.remote_description_set => {}
            _ => {
                debug!("Unexpected offer");
                return;
            }
        }

        if let Err(e) = self.apply_remote(SdpKind::Offer, sdp).await {
            self.fail(e).await;
            return;
        }

        let answer = match self.link() {
            Some(link) => link.create_answer().await,
            None => return,
        };
        let peer = self.peer();
        match (answer, peer) {
            (Ok(sdp), Some(peer)) => {
                if let Err(e) = self.send(&peer, CallSignal::Answer(sdp)).await {
                    self.fail(e).await;
                }
            }
            (Err(e), _) => self.fail(e).await,
            (Ok(_), None) => {}
        }
    }

    async fn on_answer(&mut self, sdp: String) {
        match &self.session {
            Some(s)
                if s.role == CallRole::Caller
                    && s.state == CallState::Connecting
                    && !s.remote_description_set => {}
            _ => {
                debug!("Unexpected answer");
                return;
            }
        }
        if let Err(e) = self.apply_remote(SdpKind::Answer, sdp).await {
            self.fail(e).await;
        }
    }

    async fn on_candidate(&mut self, candidate: IceCandidate) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        match (&session.peer_link, session.remote_description_set) {
            (Some(link), true) => {
                if let Err(e) = link.add_candidate(candidate).await {
                    warn!(error = %e, "Remote candidate rejected");
                }
            }
            _ => {
                session.pending_candidates.push_back(candidate);
                debug!(queued = session.pending_candidates.len(), "Remote candidate buffered");
            }
        }
    }

    /// Apply the remote description, then every buffered candidate in
    /// arrival order.
    async fn apply_remote(&mut self, kind: SdpKind, sdp: String) -> std::result::Result<(), MediaError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let Some(link) = session.peer_link.as_ref() else {
            return Err(MediaError::Peer("no peer connection".into()));
        };

        link.set_remote_description(kind, sdp).await?;
        session.remote_description_set = true;

        let flushed = session.pending_candidates.len();
        while let Some(candidate) = session.pending_candidates.pop_front() {
            if let Err(e) = link.add_candidate(candidate).await {
                warn!(error = %e, "Buffered candidate rejected");
            }
        }
        debug!(kind = ?kind, flushed, "Remote description applied");
        self.ring_deadline = None;
        Ok(())
    }

    async fn prepare_media(&mut self, id: SessionId) -> Result<()> {
        let mut local = self.backend.acquire_local_audio().await?;
        let link = match self
            .backend
            .create_peer(PeerEvents::new(id, self.peer_tx.clone()))
            .await
        {
            Ok(link) => link,
            Err(e) => {
                local.stop();
                return Err(e.into());
            }
        };

        match self.session.as_mut() {
            Some(session) if session.id == id => {
                session.local_media = Some(local);
                session.peer_link = Some(link);
                Ok(())
            }
            _ => {
                local.stop();
                link.close().await;
                Err(CallError::Closed)
            }
        }
    }

    /// Negotiation failure: tell the peer, then end like a hangup.
    async fn fail(&mut self, error: impl Display) {
        warn!(error = %error, "Call negotiation failed");
        if let Some(peer) = self.peer() {
            self.send_quietly(&peer, CallSignal::Hangup).await;
        }
        self.finish(CallState::Ended).await;
    }

    async fn finish(&mut self, state: CallState) {
        if let Some(session) = self.session.as_ref() {
            let status = CallStatus {
                state,
                ..session.status()
            };
            self.status_tx.send_replace(status);
            info!(peer = %session.peer, state = ?state, "Call finished");
        }
        self.cleanup().await;
    }

    /// Release the session's media and return to idle. Safe to call any
    /// number of times. An interrupted call is reported as ended.
    pub async fn cleanup(&mut self) {
        self.ring_deadline = None;
        let Some(mut session) = self.session.take() else {
            return;
        };
        session.release().await;

        if self.status_tx.borrow().state.is_active() {
            self.status_tx.send_replace(CallStatus {
                state: CallState::Ended,
                ..session.status()
            });
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn arm_deadline(&mut self) {
        self.ring_deadline = Some(Instant::now() + self.config.ring_timeout);
    }

    fn link(&self) -> Option<&dyn crate::media::PeerLink> {
        self.session.as_ref()?.peer_link.as_deref()
    }

    fn peer(&self) -> Option<UserId> {
        self.session.as_ref().map(|s| s.peer.clone())
    }

    fn bump_session(&mut self) -> SessionId {
        self.next_session += 1;
        self.next_session
    }

    fn set_state(&mut self, state: CallState) {
        if let Some(session) = self.session.as_mut() {
            debug!(from = ?session.state, to = ?state, "Call state");
            session.state = state;
        }
        self.publish();
    }

    fn publish(&self) {
        if let Some(session) = &self.session {
            self.status_tx.send_replace(session.status());
        }
    }

    async fn send(&self, to: &UserId, signal: CallSignal) -> Result<()> {
        let message = SignalMessage::new(self.local.clone(), to.clone(), signal);
        self.signaler.signal(&message).await
    }

    async fn send_quietly(&self, to: &UserId, signal: CallSignal) {
        let event = signal.event_name();
        if let Err(e) = self.send(to, signal).await {
            warn!(event, peer = %to, error = %e, "Call signal not delivered");
        }
    }
}
