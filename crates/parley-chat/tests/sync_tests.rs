//! Conversation sync task driven end to end over the in-memory channel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;
use tokio::sync::{mpsc, watch};

use parley_chat::{
    spawn_chat_sync, ChatConfig, ChatError, ChatHandle, ChatNotice, ConversationView,
    RemoteError, RemoteService,
};
use parley_net::{memory_transport, ChannelConfig, EventChannel, MemoryPeer, MemoryServer};
use parley_shared::protocol::{
    Frame, HistoryPage, NewMessagePush, PartyField, SendRequest, WireMessage,
};
use parley_shared::types::{ConversationId, DeliveryStatus, MessageId, ParticipantRef, UserId};

const VIEWER: &str = "me";
const PEER: &str = "alice";
const WAIT: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// Scripted remote service
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Script {
    history: HashMap<ConversationId, Vec<WireMessage>>,
    fail_sends: bool,
    fail_unsends: bool,
    sent: Vec<SendRequest>,
}

#[derive(Clone, Default)]
struct ScriptedRemote {
    script: Arc<Mutex<Script>>,
}

impl ScriptedRemote {
    fn with_history(conversation: &str, count: usize) -> Self {
        let remote = Self::default();
        let messages = (0..count)
            .map(|i| wire(&format!("m{i:02}"), PEER, VIEWER, i as u32))
            .collect();
        remote
            .script
            .lock()
            .unwrap()
            .history
            .insert(ConversationId::new(conversation), messages);
        remote
    }

    fn set_fail_sends(&self, fail: bool) {
        self.script.lock().unwrap().fail_sends = fail;
    }

    fn set_fail_unsends(&self, fail: bool) {
        self.script.lock().unwrap().fail_unsends = fail;
    }
}

fn rejected() -> RemoteError {
    RemoteError::Rejected {
        status: 503,
        message: "unavailable".into(),
    }
}

#[async_trait]
impl RemoteService for ScriptedRemote {
    async fn fetch_history(
        &self,
        conversation_id: &ConversationId,
        limit: usize,
        before: Option<&str>,
    ) -> Result<HistoryPage, RemoteError> {
        let script = self.script.lock().unwrap();
        let all = script.history.get(conversation_id).cloned().unwrap_or_default();
        let boundary = before.map(|b| DateTime::parse_from_rfc3339(b).unwrap());

        let eligible: Vec<WireMessage> = all
            .into_iter()
            .filter(|m| {
                boundary.map_or(true, |b| DateTime::parse_from_rfc3339(&m.created_at).unwrap() < b)
            })
            .collect();
        let has_more = eligible.len() > limit;
        Ok(HistoryPage {
            messages: eligible.into_iter().rev().take(limit).collect(),
            has_more,
        })
    }

    async fn send_message(&self, request: &SendRequest) -> Result<WireMessage, RemoteError> {
        let mut script = self.script.lock().unwrap();
        if script.fail_sends {
            return Err(rejected());
        }
        script.sent.push(request.clone());
        let mut record = wire(
            &format!("s{}", script.sent.len()),
            VIEWER,
            request.receiver_id.as_str(),
            0,
        );
        record.message = request.message.clone();
        record.media_url = request.media_url.clone();
        record.status = DeliveryStatus::Sent;
        record.created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        Ok(record)
    }

    async fn unsend_message(&self, _message_id: &MessageId) -> Result<(), RemoteError> {
        if self.script.lock().unwrap().fail_unsends {
            return Err(rejected());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn wire(id: &str, sender: &str, receiver: &str, minute: u32) -> WireMessage {
    WireMessage {
        id: MessageId::new(id),
        conversation_id: Some(ConversationId::new("c1")),
        sender: PartyField::Id(UserId::new(sender)),
        receiver: PartyField::Id(UserId::new(receiver)),
        message: Some(format!("text {id}")),
        media_url: None,
        kind: None,
        status: DeliveryStatus::Delivered,
        created_at: format!("2024-05-01T10:{minute:02}:00.000Z"),
        file_name: None,
        file_size: None,
    }
}

fn fast_channel() -> (EventChannel, MemoryServer) {
    let (connector, server) = memory_transport();
    let channel = EventChannel::spawn(
        connector,
        ChannelConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            ack_timeout: Duration::from_millis(500),
        },
    );
    (channel, server)
}

async fn start(
    remote: ScriptedRemote,
) -> (
    ChatHandle,
    mpsc::UnboundedReceiver<ChatNotice>,
    EventChannel,
    MemoryServer,
) {
    let (channel, server) = fast_channel();
    let (handle, notices) = spawn_chat_sync(
        remote,
        channel.clone(),
        UserId::new(VIEWER),
        ChatConfig::default(),
    )
    .await
    .unwrap();
    (handle, notices, channel, server)
}

fn alice() -> Option<ParticipantRef> {
    Some(ParticipantRef::bare(UserId::new(PEER)))
}

async fn wait_view(
    rx: &mut watch::Receiver<ConversationView>,
    predicate: impl Fn(&ConversationView) -> bool,
) -> ConversationView {
    tokio::time::timeout(WAIT, async {
        loop {
            {
                let view = rx.borrow_and_update();
                if predicate(&view) {
                    return view.clone();
                }
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("view never reached the expected state")
}

async fn next_notice(rx: &mut mpsc::UnboundedReceiver<ChatNotice>) -> ChatNotice {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("no notice")
        .expect("notice channel closed")
}

async fn next_frame(peer: &mut MemoryPeer, event: &str) -> Frame {
    tokio::time::timeout(WAIT, async {
        loop {
            let frame = peer.recv().await.expect("peer closed");
            if frame.event == event {
                return frame;
            }
        }
    })
    .await
    .expect("frame never arrived")
}

fn push(id: &str, conversation: &str, minute: u32) -> Frame {
    let payload = NewMessagePush {
        conversation_id: ConversationId::new(conversation),
        message: wire(id, PEER, VIEWER, minute),
    };
    Frame::new("message:new", serde_json::to_value(payload).unwrap())
}

fn ids(view: &ConversationView) -> Vec<&str> {
    view.messages.iter().map(|m| m.id.as_str()).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_paginates_twenty_five_messages() {
    let (handle, mut notices, _channel, _server) =
        start(ScriptedRemote::with_history("c1", 25)).await;
    let mut view = handle.view();

    handle.select(ConversationId::new("c1"), None).await.unwrap();
    let first = wait_view(&mut view, |v| !v.loading_initial && !v.messages.is_empty()).await;
    assert_eq!(first.messages.len(), 10);
    assert!(first.has_more_older);
    assert_eq!(first.participant.unwrap().id, UserId::new(PEER));

    handle.load_older().await.unwrap();
    match next_notice(&mut notices).await {
        ChatNotice::OlderLoaded(anchor) => {
            assert_eq!(anchor.prepended, 10);
            assert_eq!(anchor.anchor, Some(MessageId::new("m15")));
        }
        other => panic!("unexpected notice: {other:?}"),
    }

    handle.load_older().await.unwrap();
    match next_notice(&mut notices).await {
        ChatNotice::OlderLoaded(anchor) => assert_eq!(anchor.prepended, 5),
        other => panic!("unexpected notice: {other:?}"),
    }

    let last = wait_view(&mut view, |v| v.messages.len() == 25).await;
    assert!(!last.has_more_older);
    assert!(last
        .messages
        .windows(2)
        .all(|w| w[0].created_at <= w[1].created_at));
}

#[tokio::test]
async fn test_pushes_are_deduplicated_and_scoped() {
    let (handle, _notices, channel, mut server) = start(ScriptedRemote::default()).await;
    let mut view = handle.view();
    channel.connect().await.unwrap();
    let peer = server.accept().await.unwrap();

    handle.select(ConversationId::new("c1"), alice()).await.unwrap();
    wait_view(&mut view, |v| v.conversation_id.is_some() && !v.loading_initial).await;

    peer.send(push("p1", "c1", 1)).await;
    peer.send(push("p1", "c1", 1)).await;
    peer.send(push("x1", "c9", 2)).await;
    peer.send(push("p2", "c1", 3)).await;

    let settled = wait_view(&mut view, |v| v.messages.len() >= 2).await;
    assert_eq!(ids(&settled), vec!["p1", "p2"]);
}

#[tokio::test]
async fn test_memberships_restored_after_reconnect() {
    let (handle, mut notices, channel, mut server) =
        start(ScriptedRemote::with_history("c1", 3)).await;
    channel.connect().await.unwrap();

    let mut first = server.accept().await.unwrap();
    let register = next_frame(&mut first, "register-user").await;
    assert_eq!(register.data, json!(VIEWER));

    handle.select(ConversationId::new("c1"), None).await.unwrap();
    let join = next_frame(&mut first, "conversation:join").await;
    assert_eq!(join.data, json!({ "conversationId": "c1" }));

    drop(first);
    let mut second = tokio::time::timeout(WAIT, server.accept())
        .await
        .unwrap()
        .unwrap();
    next_frame(&mut second, "register-user").await;
    let rejoin = next_frame(&mut second, "conversation:join").await;
    assert_eq!(rejoin.data, json!({ "conversationId": "c1" }));

    assert!(matches!(
        next_notice(&mut notices).await,
        ChatNotice::Reconnected
    ));
}

#[tokio::test]
async fn test_select_before_connect_registers_then_joins_once() {
    let (handle, _notices, _channel, mut server) =
        start(ScriptedRemote::with_history("c1", 3)).await;
    let mut view = handle.view();

    handle.select(ConversationId::new("c1"), None).await.unwrap();
    let mut peer = tokio::time::timeout(WAIT, server.accept())
        .await
        .unwrap()
        .unwrap();
    wait_view(&mut view, |v| v.messages.len() == 3).await;

    let mut membership = Vec::new();
    while let Ok(Some(frame)) = tokio::time::timeout(Duration::from_millis(200), peer.recv()).await {
        if frame.event == "register-user" || frame.event.starts_with("conversation:") {
            membership.push(frame.event);
        }
    }
    assert_eq!(membership, vec!["register-user", "conversation:join"]);
}

#[tokio::test]
async fn test_read_receipt_names_the_server_id() {
    let remote = ScriptedRemote::default();
    let (handle, mut notices, channel, mut server) = start(remote.clone()).await;
    let mut view = handle.view();
    channel.connect().await.unwrap();
    let mut peer = server.accept().await.unwrap();

    handle.select(ConversationId::new("c1"), alice()).await.unwrap();
    wait_view(&mut view, |v| v.conversation_id.is_some() && !v.loading_initial).await;

    let temp = handle.send_text("hello").await.unwrap();
    wait_view(&mut view, |v| {
        v.messages.len() == 1 && !v.messages[0].id.is_local()
    })
    .await;

    handle.mark_seen(temp).await.unwrap();
    let receipt = next_frame(&mut peer, "message:status").await;
    assert_eq!(receipt.data["messageId"], json!("s1"));
    assert_eq!(receipt.data["status"], json!("read"));

    // A send that never reached the server has nothing to acknowledge.
    remote.set_fail_sends(true);
    let unsent = handle.send_text("again").await.unwrap();
    assert!(matches!(
        next_notice(&mut notices).await,
        ChatNotice::Failed(ChatError::Send(_))
    ));
    handle.mark_seen(unsent).await.unwrap();
    handle.typing(true).await.unwrap();
    let next = tokio::time::timeout(WAIT, async {
        loop {
            let frame = peer.recv().await.expect("peer closed");
            if frame.event == "message:status" || frame.event == "typing:start" {
                return frame;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(next.event, "typing:start");
}

#[tokio::test]
async fn test_optimistic_send_is_reconciled_in_place() {
    let remote = ScriptedRemote::default();
    let (handle, _notices, _channel, _server) = start(remote.clone()).await;
    let mut view = handle.view();

    handle.select(ConversationId::new("c1"), alice()).await.unwrap();
    wait_view(&mut view, |v| v.conversation_id.is_some() && !v.loading_initial).await;

    let temp = handle.send_text("hello").await.unwrap();
    assert!(temp.is_local());

    let done = wait_view(&mut view, |v| {
        v.messages.len() == 1 && !v.messages[0].id.is_local()
    })
    .await;
    let message = &done.messages[0];
    assert_eq!(message.id, MessageId::new("s1"));
    assert_eq!(message.local_id, Some(temp));
    assert_eq!(message.text.as_deref(), Some("hello"));
    assert!(message.is_own);

    let sent = remote.script.lock().unwrap().sent.clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].receiver_id, UserId::new(PEER));
}

#[tokio::test]
async fn test_failed_send_is_flagged_then_retried() {
    let remote = ScriptedRemote::default();
    remote.set_fail_sends(true);
    let (handle, mut notices, _channel, _server) = start(remote.clone()).await;
    let mut view = handle.view();

    handle.select(ConversationId::new("c1"), alice()).await.unwrap();
    wait_view(&mut view, |v| v.conversation_id.is_some() && !v.loading_initial).await;

    let temp = handle.send_text("hello").await.unwrap();
    assert!(matches!(
        next_notice(&mut notices).await,
        ChatNotice::Failed(ChatError::Send(_))
    ));
    let failed = wait_view(&mut view, |v| v.messages.iter().any(|m| m.send_failed)).await;
    assert_eq!(failed.messages.len(), 1);

    remote.set_fail_sends(false);
    handle.retry(temp.clone()).await.unwrap();
    let done = wait_view(&mut view, |v| {
        v.messages.len() == 1 && !v.messages[0].id.is_local()
    })
    .await;
    assert!(!done.messages[0].send_failed);
    assert_eq!(done.messages[0].local_id, Some(temp));
}

#[tokio::test]
async fn test_unsend_waits_for_confirmation() {
    let remote = ScriptedRemote::with_history("c1", 1);
    remote.set_fail_unsends(true);
    let (handle, mut notices, _channel, _server) = start(remote.clone()).await;
    let mut view = handle.view();

    handle.select(ConversationId::new("c1"), None).await.unwrap();
    wait_view(&mut view, |v| v.messages.len() == 1).await;

    handle.unsend(MessageId::new("m00")).await.unwrap();
    assert!(matches!(
        next_notice(&mut notices).await,
        ChatNotice::Failed(ChatError::Unsend(_))
    ));
    assert_eq!(view.borrow().messages.len(), 1);

    remote.set_fail_unsends(false);
    handle.unsend(MessageId::new("m00")).await.unwrap();
    assert!(matches!(
        next_notice(&mut notices).await,
        ChatNotice::Unsent(id) if id == MessageId::new("m00")
    ));
    wait_view(&mut view, |v| v.messages.is_empty()).await;
}

#[tokio::test]
async fn test_check_online_uses_acknowledgement() {
    let (handle, _notices, channel, mut server) = start(ScriptedRemote::default()).await;
    channel.connect().await.unwrap();
    let mut peer = server.accept().await.unwrap();

    let asker = handle.clone();
    let answer = tokio::spawn(async move { asker.check_online(UserId::new(PEER)).await });

    let request = next_frame(&mut peer, "user:check-status").await;
    assert_eq!(request.data, json!(PEER));
    let mut reply = Frame::new("user:check-status", json!(true));
    reply.ack = request.ack;
    peer.send(reply).await;

    assert!(answer.await.unwrap().unwrap());
    assert_eq!(
        handle.presence().borrow().is_online(&UserId::new(PEER)),
        Some(true)
    );
}

#[tokio::test]
async fn test_status_push_advances_only() {
    let (handle, _notices, channel, mut server) =
        start(ScriptedRemote::with_history("c1", 2)).await;
    let mut view = handle.view();
    channel.connect().await.unwrap();
    let peer = server.accept().await.unwrap();

    handle.select(ConversationId::new("c1"), None).await.unwrap();
    wait_view(&mut view, |v| v.messages.len() == 2).await;

    let status = |status: &str| {
        Frame::new(
            "message:status",
            json!({ "conversationId": "c1", "messageId": "m01", "status": status }),
        )
    };
    peer.send(status("read")).await;
    peer.send(status("delivered")).await;

    let read = wait_view(&mut view, |v| {
        v.messages.iter().any(|m| m.status == DeliveryStatus::Read)
    })
    .await;
    assert_eq!(read.messages[1].status, DeliveryStatus::Read);

    // Flush: a later push is only visible once the regression was processed.
    peer.send(push("p9", "c1", 59)).await;
    let after = wait_view(&mut view, |v| v.messages.len() == 3).await;
    assert_eq!(after.messages[1].status, DeliveryStatus::Read);
}
