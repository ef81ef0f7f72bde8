//! Terminal input parsing.

use parley_shared::types::{ConversationId, MessageId, UserId};

use crate::theme::Theme;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Open {
        conversation: ConversationId,
        peer: Option<UserId>,
    },
    Older,
    Send(String),
    Media {
        url: String,
        caption: Option<String>,
    },
    Seen(MessageId),
    Unsend(MessageId),
    Retry(MessageId),
    Online(UserId),
    Theme(Theme),
    Call(UserId),
    Accept,
    Decline,
    Hangup,
    Dismiss,
    Up,
    Down,
    Help,
    Quit,
}

pub const HELP: &str = "\
/open <conversation> [peer]  switch conversation
/older                       load older messages
/media <url> [caption]       send a media message
/seen <id>  /unsend <id>  /retry <id>
/online <user>               ask whether a user is online
/theme <Default|Superman|Hearts|Couple>
/call <user>  /accept  /decline  /hangup  /dismiss
/up  /down                   scroll the transcript
/quit";

pub fn parse(line: &str) -> Result<Option<Input>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Input::Send(line.to_string())));
    };

    let (name, args) = match rest.split_once(char::is_whitespace) {
        Some((name, args)) => (name, args.trim()),
        None => (rest, ""),
    };
    let mut words = args.split_whitespace();

    let input = match name {
        "open" => Input::Open {
            conversation: ConversationId::new(required(words.next(), "conversation")?),
            peer: words.next().map(UserId::new),
        },
        "older" => Input::Older,
        "media" => {
            let url = required(words.next(), "url")?.to_string();
            let caption = args[url.len()..].trim();
            Input::Media {
                url,
                caption: (!caption.is_empty()).then(|| caption.to_string()),
            }
        }
        "seen" => Input::Seen(MessageId::new(required(words.next(), "message id")?)),
        "unsend" => Input::Unsend(MessageId::new(required(words.next(), "message id")?)),
        "retry" => Input::Retry(MessageId::new(required(words.next(), "message id")?)),
        "online" => Input::Online(UserId::new(required(words.next(), "user")?)),
        "theme" => Input::Theme(required(words.next(), "theme")?.parse()?),
        "call" => Input::Call(UserId::new(required(words.next(), "user")?)),
        "accept" => Input::Accept,
        "decline" => Input::Decline,
        "hangup" => Input::Hangup,
        "dismiss" => Input::Dismiss,
        "up" => Input::Up,
        "down" => Input::Down,
        "help" => Input::Help,
        "quit" | "exit" => Input::Quit,
        other => return Err(format!("unknown command: /{other}")),
    };
    Ok(Some(input))
}

fn required<'a>(word: Option<&'a str>, what: &str) -> Result<&'a str, String> {
    word.ok_or_else(|| format!("missing {what}"))
}
