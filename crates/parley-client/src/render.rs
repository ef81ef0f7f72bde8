//! Text rendering for the terminal surface.

use chrono::{DateTime, FixedOffset, Timelike, Utc};

use parley_chat::ChatMessage;
use parley_media::{CallState, CallStatus};
use parley_shared::types::{ContentKind, DeliveryStatus};

use crate::theme::Theme;

/// "just now", "about N minutes ago" and "about N hours ago" within a day,
/// then the wall-clock time in the message's own offset.
pub fn relative_time(at: DateTime<FixedOffset>, now: DateTime<Utc>) -> String {
    let elapsed = now.signed_duration_since(at);
    let hours = elapsed.num_hours();

    if hours < 24 {
        if hours <= 0 {
            let minutes = elapsed.num_minutes();
            return if minutes <= 1 {
                "just now".to_string()
            } else {
                format!("about {minutes} minutes ago")
            };
        }
        let unit = if hours == 1 { "hour" } else { "hours" };
        return format!("about {hours} {unit} ago");
    }

    let (pm, hour) = at.hour12();
    let suffix = if pm { "pm" } else { "am" };
    format!("{}:{:02}{}", hour, at.minute(), suffix)
}

pub fn call_status_text(state: CallState) -> Option<&'static str> {
    match state {
        CallState::Idle => None,
        CallState::Calling => Some("Calling..."),
        CallState::Ringing => Some("Ringing..."),
        CallState::Connecting => Some("Connecting..."),
        CallState::InCall => Some("In Call..."),
        CallState::Rejected => Some("Call Rejected"),
        CallState::Ended => Some("Call Ended"),
    }
}

/// One status line for the call modal, or `None` when idle.
pub fn call_banner(status: &CallStatus) -> Option<String> {
    let text = call_status_text(status.state)?;
    let who = status
        .peer_name
        .clone()
        .or_else(|| status.peer.as_ref().map(ToString::to_string));
    Some(match who {
        Some(who) => format!("[call] {text} {who}"),
        None => format!("[call] {text}"),
    })
}

fn status_mark(status: DeliveryStatus) -> &'static str {
    match status {
        DeliveryStatus::Sent => "\u{2713}",
        DeliveryStatus::Delivered => "\u{2713}\u{2713}",
        DeliveryStatus::Read => "seen",
    }
}

fn body(message: &ChatMessage) -> String {
    let text = message.text.as_deref().unwrap_or_default();
    let Some(url) = message.media_url.as_deref() else {
        return text.to_string();
    };
    let label = match message.kind {
        ContentKind::Image => "image",
        ContentKind::Video => "video",
        ContentKind::Audio => "audio",
        ContentKind::File | ContentKind::Text => "file",
    };
    let name = message.file_name.as_deref().unwrap_or(url);
    if text.is_empty() {
        format!("[{label}: {name}]")
    } else {
        format!("[{label}: {name}] {text}")
    }
}

/// A message as one transcript line.
pub fn message_line(message: &ChatMessage, theme: Theme, now: DateTime<Utc>) -> String {
    let bubble = theme.bubble(message.is_own).paint(&body(message));
    let time = relative_time(message.created_at, now);

    if message.is_own {
        let state = if message.send_failed {
            "failed, /retry"
        } else {
            status_mark(message.status)
        };
        format!("{:>12}  {bubble} {time} {state}  ({})", "", message.id)
    } else {
        format!("{bubble} {time}  ({})", message.id)
    }
}
