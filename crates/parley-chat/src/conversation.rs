//! State of the one active conversation.
//!
//! The store never performs I/O. Asynchronous loads are split in two: a
//! `load_*` call returns a [`HistoryRequest`] carrying a [`PageTicket`], and
//! the caller hands the fetched page back through [`ConversationStore::apply_page`].
//! Tickets are checked against the store's epoch (bumped on every
//! conversation switch or reset) and against the latest request of their
//! kind, so a result that resolves after the context moved on is dropped.

use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use tracing::{debug, info, warn};

use parley_shared::protocol::{HistoryPage, WireMessage};
use parley_shared::types::{ConversationId, DeliveryStatus, MessageId, ParticipantRef, UserId};

use crate::error::{ChatError, RemoteError, Result};
use crate::mapper::{classify, ChatMessage, MessageMapper};

/// Pagination cursor: timestamp of the oldest loaded message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cursor {
    /// Nothing loaded yet.
    Start,
    Before(DateTime<FixedOffset>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PageKind {
    Initial,
    Older,
}

/// Identifies one outstanding history request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTicket {
    epoch: u64,
    request: u64,
    kind: PageKind,
}

/// What the caller must fetch from the remote service.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRequest {
    pub ticket: PageTicket,
    pub conversation_id: ConversationId,
    pub limit: usize,
    /// Exclusive upper boundary (RFC 3339) for older pages.
    pub before: Option<String>,
}

/// Enough for the presentation layer to keep the previously visible
/// messages in place after a prepend: measure content height before and
/// after, and shift the scroll offset by the difference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrollAnchor {
    /// The message that was oldest before the prepend.
    pub anchor: Option<MessageId>,
    pub prepended: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Initial { loaded: usize },
    Older(ScrollAnchor),
    /// The result belonged to a superseded request and was discarded.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// Replaced the optimistic copy in place.
    Replaced,
    /// No optimistic copy was left; the server record was appended.
    Appended,
    /// The server record was already present (its push echo won the race).
    AlreadyPresent,
}

/// Read-only snapshot for the presentation layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConversationView {
    pub conversation_id: Option<ConversationId>,
    pub participant: Option<ParticipantRef>,
    pub messages: Vec<ChatMessage>,
    pub has_more_older: bool,
    pub loading_initial: bool,
    pub loading_older: bool,
}

struct Conversation {
    id: ConversationId,
    messages: Vec<ChatMessage>,
    cursor: Cursor,
    has_more_older: bool,
    participant: Option<ParticipantRef>,
    participant_hint: Option<ParticipantRef>,
    initial_request: Option<u64>,
    older_request: Option<u64>,
    older_boundary: Option<DateTime<FixedOffset>>,
}

impl Conversation {
    fn new(id: ConversationId, hint: Option<ParticipantRef>) -> Self {
        Self {
            id,
            messages: Vec::new(),
            cursor: Cursor::Start,
            has_more_older: false,
            participant: hint.clone(),
            participant_hint: hint,
            initial_request: None,
            older_request: None,
            older_boundary: None,
        }
    }

    fn position(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| m.matches(id))
    }

    fn contains(&self, message: &ChatMessage) -> bool {
        self.messages.iter().any(|m| {
            m.matches(&message.id) || message.local_id.as_ref().is_some_and(|l| m.matches(l))
        })
    }

    fn refresh_cursor(&mut self) {
        self.cursor = match self.messages.first() {
            Some(oldest) => Cursor::Before(oldest.created_at),
            None => Cursor::Start,
        };
    }
}

pub struct ConversationStore {
    mapper: MessageMapper,
    page_size: usize,
    epoch: u64,
    next_request: u64,
    active: Option<Conversation>,
}

impl ConversationStore {
    pub fn new(mapper: MessageMapper, page_size: usize) -> Self {
        Self {
            mapper,
            page_size: page_size.max(1),
            epoch: 0,
            next_request: 0,
            active: None,
        }
    }

    pub fn mapper(&self) -> &MessageMapper {
        &self.mapper
    }

    pub fn viewer(&self) -> &UserId {
        self.mapper.viewer()
    }

    /// Incremented on every conversation switch and reset.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    // -----------------------------------------------------------------------
    // Loading
    // -----------------------------------------------------------------------

    /// Select `conversation_id` as the active conversation and request its
    /// newest page. Switching conversations resets the store first; calling
    /// again for the same conversation supersedes any earlier initial load.
    pub fn load_initial(
        &mut self,
        conversation_id: ConversationId,
        participant_hint: Option<ParticipantRef>,
    ) -> HistoryRequest {
        let switching = self
            .active
            .as_ref()
            .map_or(true, |c| c.id != conversation_id);

        if switching {
            self.reset();
            info!(conversation = %conversation_id, "Conversation selected");
            self.active = Some(Conversation::new(conversation_id.clone(), participant_hint));
        } else if let Some(hint) = participant_hint {
            if let Some(conv) = self.active.as_mut() {
                conv.participant_hint = Some(hint);
            }
        }

        let request = self.bump_request();
        let epoch = self.epoch;
        let limit = self.page_size;

        if let Some(conv) = self.active.as_mut() {
            conv.initial_request = Some(request);
            conv.older_request = None;
            conv.older_boundary = None;
        }

        HistoryRequest {
            ticket: PageTicket {
                epoch,
                request,
                kind: PageKind::Initial,
            },
            conversation_id,
            limit,
            before: None,
        }
    }

    /// Request the page preceding the oldest loaded message. Returns `None`
    /// when there is nothing older, a load is in flight, or nothing is loaded.
    pub fn load_older(&mut self) -> Option<HistoryRequest> {
        let request = self.next_request + 1;
        let epoch = self.epoch;
        let limit = self.page_size;
        let conv = self.active.as_mut()?;

        if !conv.has_more_older
            || conv.initial_request.is_some()
            || conv.older_request.is_some()
            || conv.messages.is_empty()
        {
            return None;
        }

        let boundary = conv.messages.first()?.created_at;
        conv.older_request = Some(request);
        conv.older_boundary = Some(boundary);
        let conversation_id = conv.id.clone();
        self.next_request = request;

        debug!(conversation = %conversation_id, before = %boundary, "Requesting older page");

        Some(HistoryRequest {
            ticket: PageTicket {
                epoch,
                request,
                kind: PageKind::Older,
            },
            conversation_id,
            limit,
            before: Some(boundary.to_rfc3339_opts(SecondsFormat::Millis, true)),
        })
    }

    /// Apply a fetched page. Stale results are discarded silently; a failed
    /// fetch clears the loading flag and leaves the sequence untouched.
    pub fn apply_page(
        &mut self,
        ticket: PageTicket,
        result: std::result::Result<HistoryPage, RemoteError>,
    ) -> Result<Applied> {
        if ticket.epoch != self.epoch {
            debug!(epoch = ticket.epoch, current = self.epoch, "Dropping page from old epoch");
            return Ok(Applied::Stale);
        }
        let Some(conv) = self.active.as_mut() else {
            return Ok(Applied::Stale);
        };

        let in_flight = match ticket.kind {
            PageKind::Initial => &mut conv.initial_request,
            PageKind::Older => &mut conv.older_request,
        };
        if *in_flight != Some(ticket.request) {
            debug!(request = ticket.request, "Dropping superseded page");
            return Ok(Applied::Stale);
        }
        *in_flight = None;

        let page = result.map_err(ChatError::History)?;
        let mut batch = map_batch(&self.mapper, &page.messages);

        match ticket.kind {
            PageKind::Initial => {
                dedupe(&mut batch);
                conv.participant = resolve_participant(
                    page.messages.first(),
                    self.mapper.viewer(),
                    conv.participant_hint.as_ref(),
                );
                // Keep what arrived while the fetch was in flight: unconfirmed
                // sends, and pushes newer than the snapshot.
                let newest = batch.last().map(|m| m.created_at);
                let carried: Vec<ChatMessage> = std::mem::take(&mut conv.messages)
                    .into_iter()
                    .filter(|m| m.id.is_local() || newest.map_or(true, |n| m.created_at > n))
                    .filter(|m| {
                        !batch.iter().any(|b| {
                            b.matches(&m.id) || m.local_id.as_ref().is_some_and(|l| b.matches(l))
                        })
                    })
                    .collect();
                if !carried.is_empty() {
                    debug!(carried = carried.len(), "Keeping messages added during initial load");
                }
                batch.extend(carried);
                conv.messages = batch;
                conv.has_more_older = page.has_more;
                conv.refresh_cursor();

                info!(
                    conversation = %conv.id,
                    loaded = conv.messages.len(),
                    has_more = conv.has_more_older,
                    "Initial page applied"
                );
                Ok(Applied::Initial {
                    loaded: conv.messages.len(),
                })
            }
            PageKind::Older => {
                // Anything at or after the boundary would break ordering, and
                // anything already loaded would be a duplicate.
                let boundary = conv.older_boundary.take();
                batch.retain(|m| boundary.map_or(true, |b| m.created_at <= b));
                batch.retain(|m| !conv.contains(m));
                dedupe(&mut batch);

                let anchor = conv.messages.first().map(|m| m.id.clone());
                let prepended = batch.len();
                batch.append(&mut conv.messages);
                conv.messages = batch;
                conv.has_more_older = page.has_more;
                conv.refresh_cursor();

                debug!(
                    conversation = %conv.id,
                    prepended,
                    has_more = conv.has_more_older,
                    "Older page applied"
                );
                Ok(Applied::Older(ScrollAnchor { anchor, prepended }))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Live updates
    // -----------------------------------------------------------------------

    /// Append a pushed message to the active conversation. Returns `false`
    /// when the push belongs to another conversation or is a duplicate.
    pub fn append_incoming(&mut self, conversation_id: &ConversationId, message: ChatMessage) -> bool {
        let Some(conv) = self.active.as_mut() else {
            return false;
        };
        if conv.id != *conversation_id {
            debug!(conversation = %conversation_id, "Ignoring push for inactive conversation");
            return false;
        }
        if conv.contains(&message) {
            debug!(message = %message.id, "Ignoring duplicate push");
            return false;
        }

        if conv.participant.is_none() && !message.is_own {
            conv.participant = Some(ParticipantRef::bare(message.sender.clone()));
        }
        conv.messages.push(message);
        if conv.messages.len() == 1 {
            conv.refresh_cursor();
        }
        true
    }

    /// Show an outgoing message before the server has confirmed it.
    pub fn push_optimistic(
        &mut self,
        text: Option<String>,
        media_url: Option<String>,
        file_name: Option<String>,
    ) -> Result<ChatMessage> {
        let viewer = self.mapper.viewer().clone();
        let kind = classify(None, media_url.as_deref());
        let media_url = media_url.map(|m| self.mapper.gateway().resolve(&m));
        let conv = self.active.as_mut().ok_or(ChatError::NoActiveConversation)?;
        let receiver = conv
            .participant
            .as_ref()
            .map(|p| p.id.clone())
            .ok_or(ChatError::NoRecipient)?;

        let id = MessageId::local();
        let message = ChatMessage {
            id: id.clone(),
            local_id: Some(id),
            sender: viewer,
            receiver,
            kind,
            text,
            media_url,
            status: DeliveryStatus::Sent,
            created_at: Utc::now().fixed_offset(),
            is_own: true,
            file_name,
            file_size: None,
            send_failed: false,
        };

        conv.messages.push(message.clone());
        if conv.messages.len() == 1 {
            conv.refresh_cursor();
        }
        Ok(message)
    }

    /// Replace the optimistic message `temp_id` with its server record,
    /// keeping its position. Never drops the server record.
    pub fn reconcile_optimistic(&mut self, temp_id: &MessageId, server: ChatMessage) -> Result<Reconciled> {
        let conv = self.active.as_mut().ok_or(ChatError::NoActiveConversation)?;
        let mut server = server;
        server.local_id = Some(temp_id.clone());

        let Some(mut position) = conv.position(temp_id) else {
            if let Some(existing) = conv.messages.iter_mut().find(|m| m.id == server.id) {
                existing.local_id = Some(temp_id.clone());
                existing.status = existing.status.max(server.status);
                return Ok(Reconciled::AlreadyPresent);
            }
            warn!(temp = %temp_id, message = %server.id, "Optimistic copy gone, appending server record");
            conv.messages.push(server);
            conv.refresh_cursor();
            return Ok(Reconciled::Appended);
        };

        // The push echo may have landed before the send response.
        if let Some(echo) = conv
            .messages
            .iter()
            .position(|m| m.id == server.id && !m.matches(temp_id))
        {
            let echo_message = conv.messages.remove(echo);
            server.status = server.status.max(echo_message.status);
            if echo < position {
                position -= 1;
            }
        }

        server.status = server.status.max(conv.messages[position].status);
        conv.messages[position] = server;
        conv.refresh_cursor();
        Ok(Reconciled::Replaced)
    }

    /// Flag an optimistic message whose send failed so it can be retried.
    pub fn mark_send_failed(&mut self, temp_id: &MessageId) -> bool {
        let Some(conv) = self.active.as_mut() else {
            return false;
        };
        match conv.messages.iter_mut().find(|m| m.id == *temp_id) {
            Some(message) => {
                message.send_failed = true;
                true
            }
            None => false,
        }
    }

    /// Clear the failure flag of an optimistic message so it can be sent
    /// again. Returns the message to resend.
    pub fn retry_failed(&mut self, temp_id: &MessageId) -> Option<ChatMessage> {
        let conv = self.active.as_mut()?;
        let message = conv
            .messages
            .iter_mut()
            .find(|m| m.id == *temp_id && m.send_failed)?;
        message.send_failed = false;
        Some(message.clone())
    }

    /// Advance a message's delivery status. Regressions are ignored.
    pub fn update_status(&mut self, id: &MessageId, status: DeliveryStatus) -> bool {
        let Some(conv) = self.active.as_mut() else {
            return false;
        };
        let Some(message) = conv.messages.iter_mut().find(|m| m.matches(id)) else {
            return false;
        };
        match message.status.advance(status) {
            Some(next) => {
                message.status = next;
                true
            }
            None => false,
        }
    }

    pub fn mark_seen(&mut self, id: &MessageId) -> bool {
        self.update_status(id, DeliveryStatus::Read)
    }

    /// Remove a message after the remote service confirmed its removal.
    pub fn remove(&mut self, id: &MessageId) -> Option<ChatMessage> {
        let conv = self.active.as_mut()?;
        let position = conv.position(id)?;
        let removed = conv.messages.remove(position);
        conv.refresh_cursor();
        Some(removed)
    }

    /// Drop all state. Outstanding loads become stale.
    pub fn reset(&mut self) {
        self.epoch += 1;
        if let Some(conv) = self.active.take() {
            debug!(conversation = %conv.id, epoch = self.epoch, "Conversation store reset");
        }
    }

    // -----------------------------------------------------------------------
    // Read access
    // -----------------------------------------------------------------------

    pub fn active_conversation(&self) -> Option<&ConversationId> {
        self.active.as_ref().map(|c| &c.id)
    }

    pub fn messages(&self) -> &[ChatMessage] {
        self.active.as_ref().map_or(&[], |c| c.messages.as_slice())
    }

    pub fn message(&self, id: &MessageId) -> Option<&ChatMessage> {
        self.messages().iter().find(|m| m.matches(id))
    }

    pub fn participant(&self) -> Option<&ParticipantRef> {
        self.active.as_ref().and_then(|c| c.participant.as_ref())
    }

    pub fn cursor(&self) -> Cursor {
        self.active.as_ref().map_or(Cursor::Start, |c| c.cursor)
    }

    pub fn has_more_older(&self) -> bool {
        self.active.as_ref().is_some_and(|c| c.has_more_older)
    }

    pub fn is_loading_initial(&self) -> bool {
        self.active.as_ref().is_some_and(|c| c.initial_request.is_some())
    }

    pub fn is_loading_older(&self) -> bool {
        self.active.as_ref().is_some_and(|c| c.older_request.is_some())
    }

    pub fn view(&self) -> ConversationView {
        ConversationView {
            conversation_id: self.active_conversation().cloned(),
            participant: self.participant().cloned(),
            messages: self.messages().to_vec(),
            has_more_older: self.has_more_older(),
            loading_initial: self.is_loading_initial(),
            loading_older: self.is_loading_older(),
        }
    }

    fn bump_request(&mut self) -> u64 {
        self.next_request += 1;
        self.next_request
    }
}

fn map_batch(mapper: &MessageMapper, records: &[WireMessage]) -> Vec<ChatMessage> {
    let mut batch: Vec<ChatMessage> = records
        .iter()
        .filter_map(|raw| match mapper.map(raw) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(message = %raw.id, error = %e, "Skipping unmappable history record");
                None
            }
        })
        .collect();
    // Stable: equal timestamps keep the service's relative order.
    batch.sort_by_key(|m| m.created_at);
    batch
}

fn dedupe(batch: &mut Vec<ChatMessage>) {
    let mut seen = std::collections::HashSet::new();
    batch.retain(|m| seen.insert(m.id.clone()));
}

fn resolve_participant(
    first: Option<&WireMessage>,
    viewer: &UserId,
    hint: Option<&ParticipantRef>,
) -> Option<ParticipantRef> {
    let Some(first) = first else {
        return hint.cloned();
    };

    let other = if first.sender.id() == viewer {
        &first.receiver
    } else {
        &first.sender
    };

    if let Some(snapshot) = other.snapshot() {
        return Some(snapshot.to_ref());
    }
    match hint {
        Some(hint) if hint.id == *other.id() => Some(hint.clone()),
        _ => Some(ParticipantRef::bare(other.id().clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::MediaGateway;
    use parley_shared::protocol::{ParticipantSnapshot, PartyField};

    const VIEWER: &str = "me";
    const PEER: &str = "alice";

    fn store(page_size: usize) -> ConversationStore {
        ConversationStore::new(
            MessageMapper::new(UserId::new(VIEWER), MediaGateway::default()),
            page_size,
        )
    }

    fn conv() -> ConversationId {
        ConversationId::new("c1")
    }

    fn timestamp(minute: u32) -> String {
        format!("2024-05-01T10:{minute:02}:00.000Z")
    }

    fn wire(id: &str, minute: u32) -> WireMessage {
        WireMessage {
            id: MessageId::new(id),
            conversation_id: Some(conv()),
            sender: PartyField::Id(UserId::new(PEER)),
            receiver: PartyField::Id(UserId::new(VIEWER)),
            message: Some(format!("message {id}")),
            media_url: None,
            kind: None,
            status: DeliveryStatus::Delivered,
            created_at: timestamp(minute),
            file_name: None,
            file_size: None,
        }
    }

    /// All 25 messages of a conversation, oldest first, one per minute.
    fn history() -> Vec<WireMessage> {
        (0..25).map(|i| wire(&format!("m{i:02}"), i)).collect()
    }

    /// Serve a page the way the remote service does: newest first, strictly
    /// before the boundary.
    fn serve(request: &HistoryRequest) -> HistoryPage {
        let all = history();
        let eligible: Vec<WireMessage> = all
            .into_iter()
            .filter(|m| match &request.before {
                Some(before) => {
                    parse(&m.created_at) < parse(before)
                }
                None => true,
            })
            .collect();
        let has_more = eligible.len() > request.limit;
        let messages = eligible.into_iter().rev().take(request.limit).collect();
        HistoryPage { messages, has_more }
    }

    fn parse(raw: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(raw).unwrap()
    }

    fn incoming(id: &str, minute: u32) -> ChatMessage {
        store(10).mapper().map(&wire(id, minute)).unwrap()
    }

    fn ids(store: &ConversationStore) -> Vec<String> {
        store.messages().iter().map(|m| m.id.to_string()).collect()
    }

    fn assert_non_decreasing(store: &ConversationStore) {
        assert!(store
            .messages()
            .windows(2)
            .all(|w| w[0].created_at <= w[1].created_at));
    }

    #[test]
    fn test_pagination_scenario() {
        let mut store = store(10);
        let request = store.load_initial(conv(), None);
        assert!(store.is_loading_initial());
        let applied = store.apply_page(request.ticket, Ok(serve(&request))).unwrap();
        assert_eq!(applied, Applied::Initial { loaded: 10 });
        assert!(store.has_more_older());
        assert_eq!(store.messages().first().unwrap().id, MessageId::new("m15"));

        let older = store.load_older().unwrap();
        let applied = store.apply_page(older.ticket, Ok(serve(&older))).unwrap();
        assert_eq!(
            applied,
            Applied::Older(ScrollAnchor {
                anchor: Some(MessageId::new("m15")),
                prepended: 10
            })
        );
        assert!(store.has_more_older());

        let older = store.load_older().unwrap();
        let Applied::Older(anchor) = store.apply_page(older.ticket, Ok(serve(&older))).unwrap()
        else {
            panic!("expected older page");
        };
        assert_eq!(anchor.prepended, 5);
        assert!(!store.has_more_older());
        assert_eq!(store.messages().len(), 25);
        assert_non_decreasing(&store);
        assert_eq!(store.cursor(), Cursor::Before(parse(&timestamp(0))));

        assert!(store.load_older().is_none());
    }

    #[test]
    fn test_load_older_noop_conditions() {
        let mut store = store(10);
        assert!(store.load_older().is_none());

        let request = store.load_initial(conv(), None);
        assert!(store.load_older().is_none(), "initial load in flight");

        store
            .apply_page(request.ticket, Ok(serve(&request)))
            .unwrap();
        let first = store.load_older();
        assert!(first.is_some());
        assert!(store.load_older().is_none(), "older load in flight");
    }

    #[test]
    fn test_load_older_on_empty_conversation_is_noop() {
        let mut store = store(10);
        let request = store.load_initial(conv(), None);
        store
            .apply_page(
                request.ticket,
                Ok(HistoryPage {
                    messages: vec![],
                    has_more: true,
                }),
            )
            .unwrap();
        assert!(store.load_older().is_none());
    }

    #[test]
    fn test_prepend_survives_interleaved_pushes() {
        let mut store = store(10);
        let request = store.load_initial(conv(), None);
        store.apply_page(request.ticket, Ok(serve(&request))).unwrap();

        let older = store.load_older().unwrap();
        assert!(store.append_incoming(&conv(), incoming("m90", 59)));
        store.apply_page(older.ticket, Ok(serve(&older))).unwrap();

        assert_eq!(store.messages().len(), 21);
        assert_eq!(store.messages().last().unwrap().id, MessageId::new("m90"));
        assert_eq!(store.messages().first().unwrap().id, MessageId::new("m05"));
        assert_non_decreasing(&store);
    }

    #[test]
    fn test_last_requested_initial_load_wins() {
        let mut store = store(10);
        let first = store.load_initial(conv(), None);
        let second = store.load_initial(conv(), None);

        let mut page = serve(&first);
        page.messages.truncate(3);
        assert_eq!(store.apply_page(first.ticket, Ok(page)).unwrap(), Applied::Stale);
        assert!(store.messages().is_empty());

        store.apply_page(second.ticket, Ok(serve(&second))).unwrap();
        assert_eq!(store.messages().len(), 10);
    }

    #[test]
    fn test_initial_load_is_idempotent() {
        let mut store = store(10);
        let request = store.load_initial(conv(), None);
        store.apply_page(request.ticket, Ok(serve(&request))).unwrap();
        let before = ids(&store);

        let again = store.load_initial(conv(), None);
        store.apply_page(again.ticket, Ok(serve(&again))).unwrap();
        assert_eq!(ids(&store), before);
    }

    #[test]
    fn test_result_after_reset_is_discarded() {
        let mut store = store(10);
        let request = store.load_initial(conv(), None);
        store.reset();
        assert_eq!(
            store.apply_page(request.ticket, Ok(serve(&request))).unwrap(),
            Applied::Stale
        );
        assert!(store.active_conversation().is_none());
    }

    #[test]
    fn test_result_after_switch_is_discarded() {
        let mut store = store(10);
        let request = store.load_initial(conv(), None);
        let other = store.load_initial(ConversationId::new("c2"), None);

        assert_eq!(
            store.apply_page(request.ticket, Ok(serve(&request))).unwrap(),
            Applied::Stale
        );
        assert!(store.messages().is_empty());
        assert_eq!(store.active_conversation(), Some(&other.conversation_id));
    }

    #[test]
    fn test_failed_fetch_leaves_state_unchanged() {
        let mut store = store(10);
        let request = store.load_initial(conv(), None);
        store.apply_page(request.ticket, Ok(serve(&request))).unwrap();
        let before = ids(&store);

        let older = store.load_older().unwrap();
        let err = store
            .apply_page(
                older.ticket,
                Err(RemoteError::Rejected {
                    status: 503,
                    message: "unavailable".into(),
                }),
            )
            .unwrap_err();
        assert!(matches!(err, ChatError::History(_)));
        assert_eq!(ids(&store), before);
        assert!(!store.is_loading_older());
        assert!(store.load_older().is_some(), "retry is possible");
    }

    #[test]
    fn test_append_incoming_dedupes() {
        let mut store = store(10);
        store.load_initial(conv(), None);
        assert!(store.append_incoming(&conv(), incoming("p1", 1)));
        assert!(!store.append_incoming(&conv(), incoming("p1", 1)));
        assert_eq!(store.messages().len(), 1);
    }

    #[test]
    fn test_append_incoming_scoped_to_active_conversation() {
        let mut store = store(10);
        store.load_initial(conv(), None);
        assert!(!store.append_incoming(&ConversationId::new("c9"), incoming("p1", 1)));
        assert!(store.messages().is_empty());
    }

    #[test]
    fn test_optimistic_reconciliation_keeps_position() {
        let mut store = store(10);
        let hint = ParticipantRef::bare(UserId::new(PEER));
        store.load_initial(conv(), Some(hint));

        let temp = store.push_optimistic(Some("hi".into()), None, None).unwrap();
        assert!(temp.id.is_local());
        store.append_incoming(&conv(), incoming("p1", 30));

        let mut server = incoming("s1", 20);
        server.sender = UserId::new(VIEWER);
        server.is_own = true;
        assert_eq!(
            store.reconcile_optimistic(&temp.id, server).unwrap(),
            Reconciled::Replaced
        );

        assert_eq!(ids(&store), vec!["s1", "p1"]);
        assert!(store.message(&temp.id).is_some(), "temp id still resolves");
    }

    #[test]
    fn test_reconcile_after_echo_push_keeps_one_copy() {
        let mut store = store(10);
        store.load_initial(conv(), Some(ParticipantRef::bare(UserId::new(PEER))));
        let temp = store.push_optimistic(Some("hi".into()), None, None).unwrap();
        store.append_incoming(&conv(), incoming("p1", 30));
        store.append_incoming(&conv(), incoming("s1", 31));

        store
            .reconcile_optimistic(&temp.id, incoming("s1", 31))
            .unwrap();
        assert_eq!(ids(&store), vec!["s1", "p1"]);

        // A late echo of the same record is a duplicate.
        assert!(!store.append_incoming(&conv(), incoming("s1", 31)));
    }

    #[test]
    fn test_reconcile_without_optimistic_copy_appends() {
        let mut store = store(10);
        store.load_initial(conv(), None);
        let outcome = store
            .reconcile_optimistic(&MessageId::local(), incoming("s1", 5))
            .unwrap();
        assert_eq!(outcome, Reconciled::Appended);
        assert_eq!(ids(&store), vec!["s1"]);
        assert_eq!(store.cursor(), Cursor::Before(parse(&timestamp(5))));
    }

    #[test]
    fn test_initial_page_keeps_messages_added_while_loading() {
        let mut store = store(10);
        let request = store.load_initial(conv(), Some(ParticipantRef::bare(UserId::new(PEER))));
        let temp = store.push_optimistic(Some("hello".into()), None, None).unwrap();
        assert!(store.append_incoming(&conv(), incoming("p9", 59)));
        // Older than the snapshot's newest and already part of it.
        assert!(store.append_incoming(&conv(), incoming("m1", 1)));

        store
            .apply_page(
                request.ticket,
                Ok(HistoryPage {
                    messages: vec![wire("m2", 2), wire("m1", 1)],
                    has_more: false,
                }),
            )
            .unwrap();

        let loaded = ids(&store);
        assert_eq!(&loaded[..2], &["m1", "m2"]);
        assert_eq!(loaded.len(), 4);
        assert!(loaded.contains(&temp.id.to_string()));
        assert!(loaded.contains(&"p9".to_string()));

        assert!(store.mark_send_failed(&temp.id));
        assert!(store.retry_failed(&temp.id).is_some());
        assert_eq!(store.cursor(), Cursor::Before(parse(&timestamp(1))));
    }

    #[test]
    fn test_status_is_monotonic() {
        let mut store = store(10);
        store.load_initial(conv(), None);
        store.append_incoming(&conv(), incoming("p1", 1));

        assert!(store.mark_seen(&MessageId::new("p1")));
        assert!(!store.update_status(&MessageId::new("p1"), DeliveryStatus::Delivered));
        assert!(!store.mark_seen(&MessageId::new("p1")));
        assert_eq!(store.messages()[0].status, DeliveryStatus::Read);
    }

    #[test]
    fn test_participant_from_embedded_snapshot() {
        let mut store = store(10);
        let request = store.load_initial(conv(), None);
        let mut first = wire("m1", 1);
        first.sender = PartyField::Snapshot(ParticipantSnapshot {
            id: UserId::new(PEER),
            full_name: Some("Alice Johnson".into()),
            username: Some("alice".into()),
            profile_image: None,
        });
        store
            .apply_page(
                request.ticket,
                Ok(HistoryPage {
                    messages: vec![first],
                    has_more: false,
                }),
            )
            .unwrap();

        let participant = store.participant().unwrap();
        assert_eq!(participant.display_name, "Alice Johnson");
        assert_eq!(participant.handle, "alice");
    }

    #[test]
    fn test_participant_from_hint_when_empty() {
        let mut store = store(10);
        let hint = ParticipantRef {
            id: UserId::new(PEER),
            display_name: "Alice".into(),
            handle: "alice".into(),
            avatar: None,
        };
        let request = store.load_initial(conv(), Some(hint.clone()));
        store
            .apply_page(
                request.ticket,
                Ok(HistoryPage {
                    messages: vec![],
                    has_more: false,
                }),
            )
            .unwrap();
        assert_eq!(store.participant(), Some(&hint));
        assert_eq!(store.cursor(), Cursor::Start);
    }

    #[test]
    fn test_remove_only_targets_one_message() {
        let mut store = store(10);
        store.load_initial(conv(), None);
        store.append_incoming(&conv(), incoming("p1", 1));
        store.append_incoming(&conv(), incoming("p2", 2));

        assert!(store.remove(&MessageId::new("p1")).is_some());
        assert_eq!(ids(&store), vec!["p2"]);
        assert!(store.remove(&MessageId::new("p1")).is_none());
    }

    #[test]
    fn test_failed_send_can_be_retried() {
        let mut store = store(10);
        store.load_initial(conv(), Some(ParticipantRef::bare(UserId::new(PEER))));
        let temp = store
            .push_optimistic(None, Some("uploads/cat.png".into()), Some("cat.png".into()))
            .unwrap();
        assert_eq!(temp.kind, parley_shared::types::ContentKind::Image);
        assert!(store.retry_failed(&temp.id).is_none(), "not failed yet");

        assert!(store.mark_send_failed(&temp.id));
        assert!(store.messages()[0].send_failed);
        let again = store.retry_failed(&temp.id).unwrap();
        assert!(!again.send_failed);
        assert!(!store.messages()[0].send_failed);
    }

    #[test]
    fn test_send_without_recipient_fails() {
        let mut store = store(10);
        assert!(matches!(
            store.push_optimistic(Some("x".into()), None, None),
            Err(ChatError::NoActiveConversation)
        ));
        store.load_initial(conv(), None);
        assert!(matches!(
            store.push_optimistic(Some("x".into()), None, None),
            Err(ChatError::NoRecipient)
        ));
    }
}
