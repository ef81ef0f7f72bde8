use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::types::{ConversationId, DeliveryStatus, MessageId, ParticipantRef, UserId};

// ---------------------------------------------------------------------------
// Event names
// ---------------------------------------------------------------------------

pub const EVENT_REGISTER_USER: &str = "register-user";
pub const EVENT_CONVERSATION_JOIN: &str = "conversation:join";
pub const EVENT_CONVERSATION_LEAVE: &str = "conversation:leave";
pub const EVENT_NEW_MESSAGE: &str = "message:new";
pub const EVENT_MESSAGE_STATUS: &str = "message:status";
pub const EVENT_TYPING_START: &str = "typing:start";
pub const EVENT_TYPING_STOP: &str = "typing:stop";
pub const EVENT_USER_STATUS: &str = "user:status";
pub const EVENT_CHECK_STATUS: &str = "user:check-status";

pub const EVENT_CALL_REQUEST: &str = "call:request";
pub const EVENT_CALL_ACCEPT: &str = "call:accept";
pub const EVENT_CALL_DECLINE: &str = "call:decline";
pub const EVENT_CALL_OFFER: &str = "call:offer";
pub const EVENT_CALL_ANSWER: &str = "call:answer";
pub const EVENT_CALL_CANDIDATE: &str = "call:ice-candidate";
pub const EVENT_CALL_HANGUP: &str = "call:hangup";

/// Every relay event owned by the call controller.
pub const CALL_EVENTS: [&str; 7] = [
    EVENT_CALL_REQUEST,
    EVENT_CALL_ACCEPT,
    EVENT_CALL_DECLINE,
    EVENT_CALL_OFFER,
    EVENT_CALL_ANSWER,
    EVENT_CALL_CANDIDATE,
    EVENT_CALL_HANGUP,
];

// ---------------------------------------------------------------------------
// Frame envelope
// ---------------------------------------------------------------------------

/// One frame on the event stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Frame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    /// Correlates a request with its acknowledgement.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

impl Frame {
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
            ack: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Remote service records
// ---------------------------------------------------------------------------

/// Sender or receiver as delivered by the remote service: a bare id, or an
/// embedded participant snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PartyField {
    Id(UserId),
    Snapshot(ParticipantSnapshot),
}

impl PartyField {
    pub fn id(&self) -> &UserId {
        match self {
            PartyField::Id(id) => id,
            PartyField::Snapshot(snapshot) => &snapshot.id,
        }
    }

    pub fn snapshot(&self) -> Option<&ParticipantSnapshot> {
        match self {
            PartyField::Id(_) => None,
            PartyField::Snapshot(snapshot) => Some(snapshot),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSnapshot {
    #[serde(rename = "_id")]
    pub id: UserId,
    #[serde(default)]
    pub full_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub profile_image: Option<String>,
}

impl ParticipantSnapshot {
    pub fn to_ref(&self) -> ParticipantRef {
        let display_name = self
            .full_name
            .clone()
            .filter(|n| !n.is_empty())
            .or_else(|| self.username.clone().filter(|n| !n.is_empty()))
            .unwrap_or_else(|| "Unknown".to_string());

        ParticipantRef {
            id: self.id.clone(),
            display_name,
            handle: self.username.clone().unwrap_or_default(),
            avatar: self.profile_image.clone(),
        }
    }
}

/// A message record as stored by the remote service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(rename = "_id")]
    pub id: MessageId,
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    pub sender: PartyField,
    pub receiver: PartyField,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    /// Explicit content type tag, when the service provides one.
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub status: DeliveryStatus,
    pub created_at: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
}

/// One page of history, newest page first on the service side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HistoryPage {
    pub messages: Vec<WireMessage>,
    #[serde(default)]
    pub has_more: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    pub receiver_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SendResponse {
    pub success: bool,
    pub chat: WireMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UnsendRequest {
    pub message_id: MessageId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnsendResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

// ---------------------------------------------------------------------------
// Push payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NewMessagePush {
    pub conversation_id: ConversationId,
    pub message: WireMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusPush {
    pub conversation_id: ConversationId,
    pub message_id: MessageId,
    pub status: DeliveryStatus,
}

/// Typing indicator. Either field may identify the typing context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TypingPush {
    #[serde(default)]
    pub conversation_id: Option<ConversationId>,
    #[serde(default)]
    pub sender_id: Option<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserStatusPush {
    pub user_id: UserId,
    pub online: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRoom {
    pub conversation_id: ConversationId,
}

// ---------------------------------------------------------------------------
// Call signaling
// ---------------------------------------------------------------------------

/// A trickled network-path candidate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CallSignal {
    /// Outbound call request, carrying the caller's display name
    Request { caller_name: Option<String> },
    Accept,
    Decline,
    /// Negotiation offer (SDP)
    Offer(String),
    /// Negotiation answer (SDP)
    Answer(String),
    Candidate(IceCandidate),
    Hangup,
}

impl CallSignal {
    pub fn event_name(&self) -> &'static str {
        match self {
            CallSignal::Request { .. } => EVENT_CALL_REQUEST,
            CallSignal::Accept => EVENT_CALL_ACCEPT,
            CallSignal::Decline => EVENT_CALL_DECLINE,
            CallSignal::Offer(_) => EVENT_CALL_OFFER,
            CallSignal::Answer(_) => EVENT_CALL_ANSWER,
            CallSignal::Candidate(_) => EVENT_CALL_CANDIDATE,
            CallSignal::Hangup => EVENT_CALL_HANGUP,
        }
    }
}

/// A call signal addressed by sender/recipient pair.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalMessage {
    pub from: UserId,
    pub to: UserId,
    pub signal: CallSignal,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignalPayload {
    from: Option<UserId>,
    to: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    caller_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    candidate: Option<IceCandidate>,
}

impl SignalMessage {
    pub fn new(from: UserId, to: UserId, signal: CallSignal) -> Self {
        Self { from, to, signal }
    }

    /// Encode as an (event name, payload) pair for the event channel.
    pub fn to_event(&self) -> Result<(&'static str, Value), ProtocolError> {
        let mut payload = SignalPayload {
            from: Some(self.from.clone()),
            to: Some(self.to.clone()),
            ..Default::default()
        };

        match &self.signal {
            CallSignal::Request { caller_name } => payload.caller_name = caller_name.clone(),
            CallSignal::Offer(sdp) | CallSignal::Answer(sdp) => payload.sdp = Some(sdp.clone()),
            CallSignal::Candidate(candidate) => payload.candidate = Some(candidate.clone()),
            CallSignal::Accept | CallSignal::Decline | CallSignal::Hangup => {}
        }

        Ok((self.signal.event_name(), serde_json::to_value(payload)?))
    }

    /// Decode a relay event. Fails on unknown names and on payloads missing
    /// the fields their event requires.
    pub fn from_event(event: &str, data: &Value) -> Result<Self, ProtocolError> {
        let payload: SignalPayload = serde_json::from_value(data.clone())?;
        let malformed = |reason: &str| ProtocolError::Malformed {
            event: event.to_string(),
            reason: reason.to_string(),
        };

        let from = payload.from.ok_or_else(|| malformed("missing sender"))?;
        let to = payload.to.ok_or_else(|| malformed("missing recipient"))?;

        let signal = match event {
            EVENT_CALL_REQUEST => CallSignal::Request {
                caller_name: payload.caller_name,
            },
            EVENT_CALL_ACCEPT => CallSignal::Accept,
            EVENT_CALL_DECLINE => CallSignal::Decline,
            EVENT_CALL_OFFER => CallSignal::Offer(payload.sdp.ok_or_else(|| malformed("missing sdp"))?),
            EVENT_CALL_ANSWER => {
                CallSignal::Answer(payload.sdp.ok_or_else(|| malformed("missing sdp"))?)
            }
            EVENT_CALL_CANDIDATE => CallSignal::Candidate(
                payload
                    .candidate
                    .ok_or_else(|| malformed("missing candidate"))?,
            ),
            EVENT_CALL_HANGUP => CallSignal::Hangup,
            other => return Err(ProtocolError::UnknownEvent(other.to_string())),
        };

        Ok(Self { from, to, signal })
    }
}
