use thiserror::Error;

use parley_net::ChannelError;
use parley_shared::types::MessageId;
use parley_shared::ProtocolError;

/// Failures talking to the remote history/send service.
#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
}

/// Errors surfaced by the conversation layer. All of them are recoverable:
/// the store is left as it was before the failed operation.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("History fetch failed: {0}")]
    History(RemoteError),

    #[error("Send failed: {0}")]
    Send(RemoteError),

    #[error("Unsend failed: {0}")]
    Unsend(RemoteError),

    #[error("Malformed message record: {0}")]
    Malformed(#[from] ProtocolError),

    #[error("No active conversation")]
    NoActiveConversation,

    #[error("Conversation has no known recipient yet")]
    NoRecipient,

    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("Event channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Conversation sync task stopped")]
    Closed,
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ChatError>;
