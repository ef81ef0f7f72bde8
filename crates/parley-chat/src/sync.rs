//! Conversation sync task.
//!
//! One tokio task owns the [`ConversationStore`] and the [`PresenceTracker`].
//! It reacts to three inputs, multiplexed with `select!`: commands from the
//! presentation layer, pushed events from the shared [`EventChannel`], and
//! completions of the remote calls it spawned. Remote calls never run inside
//! the loop, so a slow fetch cannot hold up pushes; their results come back
//! tagged with the ticket or epoch they were issued under and stale ones are
//! dropped.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use parley_net::{
    ChannelError, ChannelEvent, EventChannel, EVENT_CONNECTED, EVENT_DISCONNECTED, EVENT_RECONNECTED,
};
use parley_shared::constants::DEFAULT_PAGE_SIZE;
use parley_shared::protocol::{
    ConversationRoom, HistoryPage, NewMessagePush, SendRequest, StatusPush, TypingPush,
    UserStatusPush, WireMessage, EVENT_CHECK_STATUS, EVENT_CONVERSATION_JOIN,
    EVENT_CONVERSATION_LEAVE, EVENT_MESSAGE_STATUS, EVENT_NEW_MESSAGE, EVENT_REGISTER_USER,
    EVENT_TYPING_START, EVENT_TYPING_STOP, EVENT_USER_STATUS,
};
use parley_shared::types::{ConversationId, DeliveryStatus, MessageId, ParticipantRef, UserId};

use crate::conversation::{Applied, ConversationStore, ConversationView, PageTicket, ScrollAnchor};
use crate::error::{ChatError, RemoteError, Result};
use crate::mapper::{ChatMessage, MediaGateway, MessageMapper};
use crate::presence::PresenceTracker;
use crate::remote::RemoteService;

const SUBSCRIBED_EVENTS: [&str; 8] = [
    EVENT_NEW_MESSAGE,
    EVENT_MESSAGE_STATUS,
    EVENT_TYPING_START,
    EVENT_TYPING_STOP,
    EVENT_USER_STATUS,
    EVENT_CONNECTED,
    EVENT_DISCONNECTED,
    EVENT_RECONNECTED,
];

#[derive(Debug, Clone)]
pub struct ChatConfig {
    pub page_size: usize,
    pub gateway: MediaGateway,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            gateway: MediaGateway::default(),
        }
    }
}

/// Transient notifications for the presentation layer.
#[derive(Debug)]
pub enum ChatNotice {
    /// A recoverable failure. Store state is as it was before the operation.
    Failed(ChatError),
    /// An older page was prepended; keep the anchor message in place.
    OlderLoaded(ScrollAnchor),
    /// The remote service confirmed an unsend and the message was removed.
    Unsent(MessageId),
    /// The event channel came back after a loss.
    Reconnected,
}

enum ChatCommand {
    Select {
        conversation_id: ConversationId,
        participant: Option<ParticipantRef>,
    },
    LoadOlder,
    Send {
        text: Option<String>,
        media_url: Option<String>,
        file_name: Option<String>,
        reply: oneshot::Sender<Result<MessageId>>,
    },
    Retry(MessageId),
    MarkSeen(MessageId),
    Unsend(MessageId),
    Typing(bool),
    CheckOnline {
        user: UserId,
        reply: oneshot::Sender<Result<bool>>,
    },
    Reset,
    Shutdown,
}

enum TaskResult {
    Page {
        ticket: PageTicket,
        result: std::result::Result<HistoryPage, RemoteError>,
    },
    Sent {
        epoch: u64,
        temp_id: MessageId,
        result: std::result::Result<WireMessage, RemoteError>,
    },
    Unsent {
        epoch: u64,
        id: MessageId,
        result: std::result::Result<(), RemoteError>,
    },
    Online {
        user: UserId,
        result: std::result::Result<Value, ChannelError>,
        reply: oneshot::Sender<Result<bool>>,
    },
}

/// Handle to the sync task. Clones share the same task.
#[derive(Clone)]
pub struct ChatHandle {
    cmd_tx: mpsc::Sender<ChatCommand>,
    view_rx: watch::Receiver<ConversationView>,
    presence_rx: watch::Receiver<PresenceTracker>,
}

impl ChatHandle {
    /// Make `conversation_id` the active conversation and load its newest
    /// page. `participant` is used when the conversation has no messages.
    pub async fn select(
        &self,
        conversation_id: ConversationId,
        participant: Option<ParticipantRef>,
    ) -> Result<()> {
        self.send(ChatCommand::Select {
            conversation_id,
            participant,
        })
        .await
    }

    pub async fn load_older(&self) -> Result<()> {
        self.send(ChatCommand::LoadOlder).await
    }

    /// Show `text` immediately and send it. Returns the temporary id.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<MessageId> {
        self.send_message(Some(text.into()), None, None).await
    }

    pub async fn send_media(
        &self,
        media_url: impl Into<String>,
        file_name: Option<String>,
        caption: Option<String>,
    ) -> Result<MessageId> {
        self.send_message(caption, Some(media_url.into()), file_name)
            .await
    }

    async fn send_message(
        &self,
        text: Option<String>,
        media_url: Option<String>,
        file_name: Option<String>,
    ) -> Result<MessageId> {
        let (reply, rx) = oneshot::channel();
        self.send(ChatCommand::Send {
            text,
            media_url,
            file_name,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ChatError::Closed)?
    }

    /// Resend a message whose send failed.
    pub async fn retry(&self, temp_id: MessageId) -> Result<()> {
        self.send(ChatCommand::Retry(temp_id)).await
    }

    pub async fn mark_seen(&self, id: MessageId) -> Result<()> {
        self.send(ChatCommand::MarkSeen(id)).await
    }

    /// Ask the remote service to remove a message. It disappears only after
    /// the service confirms.
    pub async fn unsend(&self, id: MessageId) -> Result<()> {
        self.send(ChatCommand::Unsend(id)).await
    }

    pub async fn typing(&self, active: bool) -> Result<()> {
        self.send(ChatCommand::Typing(active)).await
    }

    pub async fn check_online(&self, user: UserId) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.send(ChatCommand::CheckOnline { user, reply }).await?;
        rx.await.map_err(|_| ChatError::Closed)?
    }

    pub async fn reset(&self) -> Result<()> {
        self.send(ChatCommand::Reset).await
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(ChatCommand::Shutdown).await;
    }

    pub fn view(&self) -> watch::Receiver<ConversationView> {
        self.view_rx.clone()
    }

    pub fn presence(&self) -> watch::Receiver<PresenceTracker> {
        self.presence_rx.clone()
    }

    async fn send(&self, cmd: ChatCommand) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| ChatError::Closed)
    }
}

/// Spawn the sync task on the current runtime.
///
/// The task subscribes before returning, so connecting the channel
/// afterwards is enough for `register-user` to go out.
pub async fn spawn_chat_sync<R: RemoteService>(
    remote: R,
    channel: EventChannel,
    viewer: UserId,
    config: ChatConfig,
) -> Result<(ChatHandle, mpsc::UnboundedReceiver<ChatNotice>)> {
    let events = channel.subscribe(&SUBSCRIBED_EVENTS).await?;

    let (cmd_tx, cmd_rx) = mpsc::channel(128);
    let (notice_tx, notice_rx) = mpsc::unbounded_channel();
    let (results_tx, results_rx) = mpsc::unbounded_channel();
    let (view_tx, view_rx) = watch::channel(ConversationView::default());
    let (presence_tx, presence_rx) = watch::channel(PresenceTracker::new());

    let task = SyncTask {
        remote: Arc::new(remote),
        channel,
        store: ConversationStore::new(
            MessageMapper::new(viewer, config.gateway),
            config.page_size,
        ),
        presence: PresenceTracker::new(),
        view_tx,
        presence_tx,
        notice_tx,
        results_tx,
        registered: false,
    };

    tokio::spawn(async move {
        let mut events = events;
        let mut cmd_rx = cmd_rx;
        let mut results_rx = results_rx;
        let mut task = task;

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ChatCommand::Shutdown) | None => {
                            info!("Chat sync shutting down");
                            break;
                        }
                        Some(cmd) => task.handle_command(cmd).await,
                    }
                }
                Some(event) = events.recv() => task.handle_event(event).await,
                Some(result) = results_rx.recv() => task.handle_result(result),
            }
        }
    });

    Ok((
        ChatHandle {
            cmd_tx,
            view_rx,
            presence_rx,
        },
        notice_rx,
    ))
}

// ---------------------------------------------------------------------------
// Task state
// ---------------------------------------------------------------------------

struct SyncTask<R> {
    remote: Arc<R>,
    channel: EventChannel,
    store: ConversationStore,
    presence: PresenceTracker,
    view_tx: watch::Sender<ConversationView>,
    presence_tx: watch::Sender<PresenceTracker>,
    notice_tx: mpsc::UnboundedSender<ChatNotice>,
    results_tx: mpsc::UnboundedSender<TaskResult>,
    /// `register-user` went out on the current connection. Room joins and
    /// leaves wait for it.
    registered: bool,
}

impl<R: RemoteService> SyncTask<R> {
    async fn handle_command(&mut self, cmd: ChatCommand) {
        match cmd {
            ChatCommand::Select {
                conversation_id,
                participant,
            } => {
                let previous = self.store.active_conversation().cloned();
                if self.registered {
                    if let Some(previous) = previous.as_ref().filter(|p| **p != conversation_id) {
                        self.emit_room(EVENT_CONVERSATION_LEAVE, previous).await;
                    }
                }

                let request = self.store.load_initial(conversation_id.clone(), participant);
                if !self.registered {
                    // Registers first, then joins the now-active conversation.
                    self.restore_memberships().await;
                } else if previous.as_ref() != Some(&conversation_id) {
                    self.emit_room(EVENT_CONVERSATION_JOIN, &conversation_id).await;
                }
                self.fetch(request.ticket, request.conversation_id, request.limit, request.before);
                self.publish_view();
            }
            ChatCommand::LoadOlder => {
                if let Some(request) = self.store.load_older() {
                    self.fetch(
                        request.ticket,
                        request.conversation_id,
                        request.limit,
                        request.before,
                    );
                    self.publish_view();
                }
            }
            ChatCommand::Send {
                text,
                media_url,
                file_name,
                reply,
            } => match self.store.push_optimistic(text, media_url.clone(), file_name) {
                Ok(message) => {
                    let _ = reply.send(Ok(message.id.clone()));
                    self.publish_view();
                    self.submit(message, media_url);
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            ChatCommand::Retry(temp_id) => match self.store.retry_failed(&temp_id) {
                Some(message) => {
                    info!(message = %temp_id, "Retrying send");
                    let media_url = message.media_url.clone();
                    self.publish_view();
                    self.submit(message, media_url);
                }
                None => self.notify(ChatNotice::Failed(ChatError::MessageNotFound(temp_id))),
            },
            ChatCommand::MarkSeen(id) => {
                if self.store.mark_seen(&id) {
                    self.publish_view();
                    // The caller may hold the local id of a reconciled send.
                    let Some(message_id) = self.store.message(&id).map(|m| m.id.clone()) else {
                        return;
                    };
                    if message_id.is_local() {
                        debug!(message = %message_id, "Not reporting read status for unsent message");
                        return;
                    }
                    if let Some(conversation_id) = self.store.active_conversation().cloned() {
                        let push = StatusPush {
                            conversation_id,
                            message_id,
                            status: DeliveryStatus::Read,
                        };
                        if let Err(e) = self.channel.emit(EVENT_MESSAGE_STATUS, &push).await {
                            warn!(error = %e, "Failed to report read status");
                        }
                    }
                }
            }
            ChatCommand::Unsend(id) => self.unsend(id),
            ChatCommand::Typing(active) => {
                let Some(conversation_id) = self.store.active_conversation().cloned() else {
                    return;
                };
                let event = if active {
                    EVENT_TYPING_START
                } else {
                    EVENT_TYPING_STOP
                };
                let push = TypingPush {
                    conversation_id: Some(conversation_id),
                    sender_id: Some(self.store.viewer().clone()),
                };
                if let Err(e) = self.channel.emit(event, &push).await {
                    debug!(error = %e, "Typing indicator not sent");
                }
            }
            ChatCommand::CheckOnline { user, reply } => {
                let channel = self.channel.clone();
                let results = self.results_tx.clone();
                tokio::spawn(async move {
                    let result = channel.emit_with_ack(EVENT_CHECK_STATUS, &user).await;
                    let _ = results.send(TaskResult::Online {
                        user,
                        result,
                        reply,
                    });
                });
            }
            ChatCommand::Reset => {
                if let Some(active) = self.store.active_conversation().cloned() {
                    if self.registered {
                        self.emit_room(EVENT_CONVERSATION_LEAVE, &active).await;
                    }
                }
                self.store.reset();
                self.presence.clear_typing();
                self.publish_view();
                self.publish_presence();
            }
            ChatCommand::Shutdown => {}
        }
    }

    async fn handle_event(&mut self, event: ChannelEvent) {
        match event.name.as_str() {
            EVENT_NEW_MESSAGE => {
                let Some(push) = decode::<NewMessagePush>(&event) else {
                    return;
                };
                match self.store.mapper().map(&push.message) {
                    Ok(message) => {
                        if self.store.append_incoming(&push.conversation_id, message) {
                            self.publish_view();
                        }
                    }
                    Err(e) => warn!(error = %e, "Dropping unmappable pushed message"),
                }
            }
            EVENT_MESSAGE_STATUS => {
                let Some(push) = decode::<StatusPush>(&event) else {
                    return;
                };
                if self.store.active_conversation() == Some(&push.conversation_id)
                    && self.store.update_status(&push.message_id, push.status)
                {
                    self.publish_view();
                }
            }
            EVENT_TYPING_START | EVENT_TYPING_STOP => {
                let Some(push) = decode::<TypingPush>(&event) else {
                    return;
                };
                let Some(sender) = push.sender_id else {
                    return;
                };
                self.presence.set_typing(
                    push.conversation_id,
                    sender,
                    event.name == EVENT_TYPING_START,
                );
                self.publish_presence();
            }
            EVENT_USER_STATUS => {
                let Some(push) = decode::<UserStatusPush>(&event) else {
                    return;
                };
                if self.presence.set_online(push.user_id, push.online) {
                    self.publish_presence();
                }
            }
            EVENT_CONNECTED => {
                if self.registered {
                    debug!("Already registered on this connection");
                } else {
                    self.restore_memberships().await;
                }
            }
            EVENT_DISCONNECTED => {
                debug!("Event channel lost, memberships will be restored on connect");
                self.registered = false;
            }
            EVENT_RECONNECTED => {
                info!("Event channel reconnected");
                self.notify(ChatNotice::Reconnected);
            }
            other => debug!(event = other, "Ignoring event"),
        }
    }

    fn handle_result(&mut self, result: TaskResult) {
        match result {
            TaskResult::Page { ticket, result } => match self.store.apply_page(ticket, result) {
                Ok(Applied::Stale) => {}
                Ok(Applied::Initial { .. }) => self.publish_view(),
                Ok(Applied::Older(anchor)) => {
                    self.publish_view();
                    self.notify(ChatNotice::OlderLoaded(anchor));
                }
                Err(e) => {
                    warn!(error = %e, "History load failed");
                    self.publish_view();
                    self.notify(ChatNotice::Failed(e));
                }
            },
            TaskResult::Sent {
                epoch,
                temp_id,
                result,
            } => {
                if epoch != self.store.epoch() {
                    debug!(message = %temp_id, "Dropping send result from old conversation");
                    return;
                }
                let outcome = result
                    .map_err(ChatError::Send)
                    .and_then(|raw| Ok(self.store.mapper().map(&raw)?))
                    .and_then(|server| self.store.reconcile_optimistic(&temp_id, server));

                if let Err(e) = outcome {
                    warn!(message = %temp_id, error = %e, "Send failed");
                    self.store.mark_send_failed(&temp_id);
                    self.notify(ChatNotice::Failed(e));
                }
                self.publish_view();
            }
            TaskResult::Unsent { epoch, id, result } => match result {
                Ok(()) => {
                    if epoch == self.store.epoch() && self.store.remove(&id).is_some() {
                        self.publish_view();
                    }
                    self.notify(ChatNotice::Unsent(id));
                }
                Err(e) => {
                    warn!(message = %id, error = %e, "Unsend failed");
                    self.notify(ChatNotice::Failed(ChatError::Unsend(e)));
                }
            },
            TaskResult::Online {
                user,
                result,
                reply,
            } => {
                let answer = result.map_err(ChatError::from).map(|ack| ack_online(&ack));
                if let Ok(online) = answer {
                    if self.presence.set_online(user, online) {
                        self.publish_presence();
                    }
                }
                let _ = reply.send(answer);
            }
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn fetch(
        &self,
        ticket: PageTicket,
        conversation_id: ConversationId,
        limit: usize,
        before: Option<String>,
    ) {
        let remote = Arc::clone(&self.remote);
        let results = self.results_tx.clone();
        tokio::spawn(async move {
            let result = remote
                .fetch_history(&conversation_id, limit, before.as_deref())
                .await;
            let _ = results.send(TaskResult::Page { ticket, result });
        });
    }

    fn submit(&self, message: ChatMessage, media_url: Option<String>) {
        let request = SendRequest {
            receiver_id: message.receiver.clone(),
            conversation_id: self.store.active_conversation().cloned(),
            message: message.text.clone(),
            media_url,
        };
        let epoch = self.store.epoch();
        let remote = Arc::clone(&self.remote);
        let results = self.results_tx.clone();
        tokio::spawn(async move {
            let result = remote.send_message(&request).await;
            let _ = results.send(TaskResult::Sent {
                epoch,
                temp_id: message.id,
                result,
            });
        });
    }

    fn unsend(&mut self, id: MessageId) {
        let Some(message) = self.store.message(&id).cloned() else {
            self.notify(ChatNotice::Failed(ChatError::MessageNotFound(id)));
            return;
        };

        // Never reached the service: nothing to ask for.
        if message.id.is_local() {
            if message.send_failed {
                self.store.remove(&message.id);
                self.publish_view();
                self.notify(ChatNotice::Unsent(message.id));
            } else {
                self.notify(ChatNotice::Failed(ChatError::MessageNotFound(id)));
            }
            return;
        }

        let epoch = self.store.epoch();
        let remote = Arc::clone(&self.remote);
        let results = self.results_tx.clone();
        tokio::spawn(async move {
            let result = remote.unsend_message(&message.id).await;
            let _ = results.send(TaskResult::Unsent {
                epoch,
                id: message.id,
                result,
            });
        });
    }

    /// Server-side memberships do not survive a connection; re-establish
    /// them on every connect.
    async fn restore_memberships(&mut self) {
        let viewer = self.store.viewer().clone();
        if let Err(e) = self.channel.emit(EVENT_REGISTER_USER, &viewer).await {
            warn!(error = %e, "Failed to register user");
            return;
        }
        self.registered = true;
        debug!(user = %viewer, "Registered on event channel");

        if let Some(active) = self.store.active_conversation().cloned() {
            self.emit_room(EVENT_CONVERSATION_JOIN, &active).await;
        }
    }

    async fn emit_room(&self, event: &str, conversation_id: &ConversationId) {
        let room = ConversationRoom {
            conversation_id: conversation_id.clone(),
        };
        if let Err(e) = self.channel.emit(event, &room).await {
            warn!(event, conversation = %conversation_id, error = %e, "Room membership not updated");
        }
    }

    fn publish_view(&self) {
        self.view_tx.send_replace(self.store.view());
    }

    fn publish_presence(&self) {
        self.presence_tx.send_replace(self.presence.clone());
    }

    fn notify(&self, notice: ChatNotice) {
        let _ = self.notice_tx.send(notice);
    }
}

fn decode<T: serde::de::DeserializeOwned>(event: &ChannelEvent) -> Option<T> {
    match event.decode::<T>() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(event = %event.name, error = %e, "Malformed push payload");
            None
        }
    }
}

/// The status check may be answered with a bare boolean or `{ "online": bool }`.
fn ack_online(ack: &Value) -> bool {
    match ack {
        Value::Bool(online) => *online,
        Value::Object(map) => map.get("online").and_then(Value::as_bool).unwrap_or(false),
        _ => false,
    }
}
