//! Remote message record → UI message.
//!
//! Pure transform: no I/O, no clock, no timezone conversion.

use chrono::{DateTime, FixedOffset};

use parley_shared::constants::DEFAULT_MEDIA_GATEWAY;
use parley_shared::protocol::WireMessage;
use parley_shared::types::{ContentKind, DeliveryStatus, MessageId, UserId};
use parley_shared::ProtocolError;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp", "svg", "heic"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mov", "mkv", "avi", "m4v"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "ogg", "oga", "m4a", "aac", "flac", "opus"];

/// A normalized message, ready for the presentation layer.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: MessageId,
    /// Temporary id this message was shown under before reconciliation.
    pub local_id: Option<MessageId>,
    pub sender: UserId,
    pub receiver: UserId,
    pub text: Option<String>,
    /// Fully-qualified media address.
    pub media_url: Option<String>,
    pub kind: ContentKind,
    pub status: DeliveryStatus,
    pub created_at: DateTime<FixedOffset>,
    pub is_own: bool,
    pub file_name: Option<String>,
    pub file_size: Option<u64>,
    /// Set on an optimistic message whose send failed.
    pub send_failed: bool,
}

impl ChatMessage {
    /// True if `id` is this message's final or temporary identifier.
    pub fn matches(&self, id: &MessageId) -> bool {
        self.id == *id || self.local_id.as_ref() == Some(id)
    }
}

/// Base address used to resolve relative media references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaGateway {
    base: String,
}

impl MediaGateway {
    pub fn new(base: impl Into<String>) -> Self {
        let base: String = base.into();
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn resolve(&self, reference: &str) -> String {
        if is_absolute_url(reference) {
            reference.to_string()
        } else {
            format!("{}/{}", self.base, reference.trim_start_matches('/'))
        }
    }
}

impl Default for MediaGateway {
    fn default() -> Self {
        Self::new(DEFAULT_MEDIA_GATEWAY)
    }
}

/// Viewer identity plus media gateway: everything mapping depends on.
#[derive(Debug, Clone)]
pub struct MessageMapper {
    viewer: UserId,
    gateway: MediaGateway,
}

impl MessageMapper {
    pub fn new(viewer: UserId, gateway: MediaGateway) -> Self {
        Self { viewer, gateway }
    }

    pub fn viewer(&self) -> &UserId {
        &self.viewer
    }

    pub fn gateway(&self) -> &MediaGateway {
        &self.gateway
    }

    pub fn map(&self, raw: &WireMessage) -> Result<ChatMessage, ProtocolError> {
        map_message(raw, &self.viewer, &self.gateway)
    }
}

pub fn map_message(
    raw: &WireMessage,
    viewer: &UserId,
    gateway: &MediaGateway,
) -> Result<ChatMessage, ProtocolError> {
    let media = raw.media_url.as_deref().filter(|m| !m.trim().is_empty());
    let sender = raw.sender.id().clone();

    Ok(ChatMessage {
        id: raw.id.clone(),
        local_id: None,
        is_own: sender == *viewer,
        sender,
        receiver: raw.receiver.id().clone(),
        text: raw.message.clone(),
        media_url: media.map(|m| gateway.resolve(m)),
        kind: classify(raw.kind.as_deref(), media),
        status: raw.status,
        created_at: parse_timestamp(&raw.created_at)?,
        file_name: raw.file_name.clone(),
        file_size: raw.file_size,
        send_failed: false,
    })
}

/// Content classification: explicit tag, then file extension, then
/// generic file. No media at all means text.
pub fn classify(tag: Option<&str>, media: Option<&str>) -> ContentKind {
    let Some(media) = media else {
        return ContentKind::Text;
    };

    if let Some(kind) = tag.and_then(ContentKind::from_tag) {
        return kind;
    }

    match extension(media) {
        Some(ext) if IMAGE_EXTENSIONS.contains(&ext.as_str()) => ContentKind::Image,
        Some(ext) if VIDEO_EXTENSIONS.contains(&ext.as_str()) => ContentKind::Video,
        Some(ext) if AUDIO_EXTENSIONS.contains(&ext.as_str()) => ContentKind::Audio,
        _ => ContentKind::File,
    }
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<FixedOffset>, ProtocolError> {
    Ok(DateTime::parse_from_rfc3339(raw.trim())?)
}

fn is_absolute_url(reference: &str) -> bool {
    let lower = reference.get(..8).unwrap_or(reference).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

fn extension(reference: &str) -> Option<String> {
    // Strip query and fragment before looking at the last path segment.
    let path = reference.split(['?', '#']).next().unwrap_or(reference);
    let file = path.rsplit('/').next().unwrap_or(path);
    let (stem, ext) = file.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
