//! # parley-chat
//!
//! Conversation synchronization: maps remote message records into UI
//! messages, keeps the active conversation's ordered window consistent
//! across history pages, optimistic sends and pushed events, and runs the
//! task that ties those sources together.

pub mod conversation;
pub mod mapper;
pub mod presence;
pub mod remote;
pub mod sync;

mod error;

pub use conversation::{
    Applied, ConversationStore, ConversationView, Cursor, HistoryRequest, PageTicket,
    Reconciled, ScrollAnchor,
};
pub use error::{ChatError, RemoteError, Result};
pub use mapper::{ChatMessage, MediaGateway, MessageMapper};
pub use presence::PresenceTracker;
pub use remote::{HttpRemote, RemoteService};
pub use sync::{spawn_chat_sync, ChatConfig, ChatHandle, ChatNotice};
