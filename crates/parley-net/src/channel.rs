//! Reconnectable event channel with the tokio mpsc command pattern.
//!
//! The connection is owned by a dedicated task. [`EventChannel`] handles are
//! cheap clones that talk to it through a command queue, so the conversation
//! sync task and the call controller can share one connection while owning
//! disjoint event names.
//!
//! Delivery to subscribers is at-least-once with no deduplication. Server-side
//! memberships are never replayed after a reconnect; owners listen for
//! [`EVENT_RECONNECTED`] and re-establish them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use parley_shared::protocol::Frame;

use crate::connector::{Connector, Link};
use crate::error::ChannelError;

/// Synthesized locally whenever a connection is established.
pub const EVENT_CONNECTED: &str = "channel:connected";
/// Synthesized locally when a connection is re-established after a loss.
pub const EVENT_RECONNECTED: &str = "channel:reconnected";
/// Synthesized locally when the live connection drops or is closed on request.
pub const EVENT_DISCONNECTED: &str = "channel:disconnected";

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// First reconnect delay; doubles per failed attempt.
    pub initial_backoff: Duration,
    /// Upper bound for the reconnect delay.
    pub max_backoff: Duration,
    /// How long `emit_with_ack` waits for the server's reply.
    pub ack_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            ack_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// A named event delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub name: String,
    pub payload: Value,
}

impl ChannelEvent {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Receiving end of a subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<ChannelEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ChannelEvent> {
        self.rx.try_recv().ok()
    }
}

enum ChannelCommand {
    Connect(oneshot::Sender<Result<(), ChannelError>>),
    Disconnect(oneshot::Sender<()>),
    Subscribe {
        id: SubscriptionId,
        events: HashSet<String>,
        tx: mpsc::UnboundedSender<ChannelEvent>,
    },
    Unsubscribe(SubscriptionId),
    Emit {
        frame: Frame,
        reply: oneshot::Sender<Result<(), ChannelError>>,
    },
    EmitWithAck {
        frame: Frame,
        reply: oneshot::Sender<Result<Value, ChannelError>>,
    },
    Shutdown,
}

/// Handle to the shared event channel.
#[derive(Clone)]
pub struct EventChannel {
    cmd_tx: mpsc::Sender<ChannelCommand>,
    next_subscription: Arc<AtomicU64>,
}

impl EventChannel {
    /// Spawn the channel task. No connection is opened until `connect` or the
    /// first `emit`.
    pub fn spawn<C: Connector>(connector: C, config: ChannelConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);

        let task = ChannelTask {
            connector,
            config,
            link: None,
            subscribers: Vec::new(),
            wanted: false,
            has_connected: false,
            attempts: 0,
            retry_at: None,
            pending_acks: HashMap::new(),
            next_ack: 1,
        };
        tokio::spawn(task.run(cmd_rx));

        Self {
            cmd_tx,
            next_subscription: Arc::new(AtomicU64::new(1)),
        }
    }

    pub async fn connect(&self) -> Result<(), ChannelError> {
        let (reply, rx) = oneshot::channel();
        self.send(ChannelCommand::Connect(reply)).await?;
        rx.await.map_err(|_| ChannelError::Closed)?
    }

    /// Close the connection and stop reconnecting. Subscriptions stay
    /// registered for the next connect.
    pub async fn disconnect(&self) -> Result<(), ChannelError> {
        let (reply, rx) = oneshot::channel();
        self.send(ChannelCommand::Disconnect(reply)).await?;
        rx.await.map_err(|_| ChannelError::Closed)
    }

    /// Subscribe to one or more event names. Several subscriptions may
    /// cover the same name; each receives its own copy.
    pub async fn subscribe(&self, events: &[&str]) -> Result<Subscription, ChannelError> {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.send(ChannelCommand::Subscribe {
            id,
            events: events.iter().map(|e| e.to_string()).collect(),
            tx,
        })
        .await?;
        Ok(Subscription { id, rx })
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<(), ChannelError> {
        self.send(ChannelCommand::Unsubscribe(id)).await
    }

    /// Send an event, connecting first if needed.
    pub async fn emit<T: Serialize>(&self, event: &str, payload: &T) -> Result<(), ChannelError> {
        let frame = Frame::new(event, serde_json::to_value(payload)?);
        let (reply, rx) = oneshot::channel();
        self.send(ChannelCommand::Emit { frame, reply }).await?;
        rx.await.map_err(|_| ChannelError::Closed)?
    }

    /// Send an event and wait for the server's acknowledgement payload.
    pub async fn emit_with_ack<T: Serialize>(
        &self,
        event: &str,
        payload: &T,
    ) -> Result<Value, ChannelError> {
        let frame = Frame::new(event, serde_json::to_value(payload)?);
        let (reply, rx) = oneshot::channel();
        self.send(ChannelCommand::EmitWithAck { frame, reply }).await?;
        rx.await.map_err(|_| ChannelError::Closed)?
    }

    /// Stop the channel task and drop the connection.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(ChannelCommand::Shutdown).await;
    }

    async fn send(&self, cmd: ChannelCommand) -> Result<(), ChannelError> {
        self.cmd_tx.send(cmd).await.map_err(|_| ChannelError::Closed)
    }
}

// ---------------------------------------------------------------------------
// Channel task
// ---------------------------------------------------------------------------

struct Subscriber {
    id: SubscriptionId,
    events: HashSet<String>,
    tx: mpsc::UnboundedSender<ChannelEvent>,
}

struct PendingAck {
    event: String,
    deadline: Instant,
    reply: oneshot::Sender<Result<Value, ChannelError>>,
}

struct ChannelTask<C> {
    connector: C,
    config: ChannelConfig,
    link: Option<Link>,
    subscribers: Vec<Subscriber>,
    /// Whether the owner wants a live connection (set by connect/emit,
    /// cleared by disconnect). Reconnects only happen while set.
    wanted: bool,
    has_connected: bool,
    attempts: u32,
    retry_at: Option<Instant>,
    pending_acks: HashMap<u64, PendingAck>,
    next_ack: u64,
}

impl<C: Connector> ChannelTask<C> {
    async fn run(mut self, mut cmd_rx: mpsc::Receiver<ChannelCommand>) {
        loop {
            let ack_deadline = self.pending_acks.values().map(|p| p.deadline).min();

            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ChannelCommand::Shutdown) | None => {
                            info!("Event channel shutting down");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }

                frame = next_frame(&mut self.link) => {
                    match frame {
                        Some(frame) => self.dispatch(frame),
                        None => self.on_link_lost(),
                    }
                }

                _ = sleep_until(self.retry_at) => {
                    self.retry_at = None;
                    if self.wanted && self.link.is_none() {
                        if let Err(e) = self.ensure_connected().await {
                            warn!(error = %e, attempt = self.attempts, "Reconnect failed");
                        }
                    }
                }

                _ = sleep_until(ack_deadline) => self.expire_acks(),
            }
        }

        self.link = None;
        self.fail_pending_acks();
    }

    async fn handle_command(&mut self, cmd: ChannelCommand) {
        match cmd {
            ChannelCommand::Connect(reply) => {
                self.wanted = true;
                let _ = reply.send(self.ensure_connected().await);
            }
            ChannelCommand::Disconnect(reply) => {
                self.wanted = false;
                self.retry_at = None;
                self.attempts = 0;
                if self.link.take().is_some() {
                    info!("Event channel disconnected on request");
                    self.publish(EVENT_DISCONNECTED, Value::Null);
                }
                self.fail_pending_acks();
                let _ = reply.send(());
            }
            ChannelCommand::Subscribe { id, events, tx } => {
                debug!(subscription = id.0, events = ?events, "Subscriber added");
                self.subscribers.push(Subscriber { id, events, tx });
            }
            ChannelCommand::Unsubscribe(id) => {
                self.subscribers.retain(|s| s.id != id);
            }
            ChannelCommand::Emit { frame, reply } => {
                let _ = reply.send(self.write(frame).await);
            }
            ChannelCommand::EmitWithAck { mut frame, reply } => {
                let ack = self.next_ack;
                self.next_ack += 1;
                frame.ack = Some(ack);
                let event = frame.event.clone();

                match self.write(frame).await {
                    Ok(()) => {
                        self.pending_acks.insert(
                            ack,
                            PendingAck {
                                event,
                                deadline: Instant::now() + self.config.ack_timeout,
                                reply,
                            },
                        );
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            ChannelCommand::Shutdown => {}
        }
    }

    async fn write(&mut self, frame: Frame) -> Result<(), ChannelError> {
        self.wanted = true;
        self.ensure_connected().await?;

        let Some(link) = self.link.as_ref() else {
            return Err(ChannelError::NotConnected);
        };

        let event = frame.event.clone();
        if link.outbound.send(frame).await.is_err() {
            self.on_link_lost();
            return Err(ChannelError::NotConnected);
        }
        debug!(event = %event, "Frame emitted");
        Ok(())
    }

    async fn ensure_connected(&mut self) -> Result<(), ChannelError> {
        if self.link.is_some() {
            return Ok(());
        }

        match self.connector.connect().await {
            Ok(link) => {
                self.link = Some(link);
                self.attempts = 0;
                self.retry_at = None;
                info!(reconnect = self.has_connected, "Event channel connected");

                self.publish(EVENT_CONNECTED, Value::Null);
                if self.has_connected {
                    self.publish(EVENT_RECONNECTED, Value::Null);
                }
                self.has_connected = true;
                Ok(())
            }
            Err(e) => {
                self.schedule_retry();
                Err(e)
            }
        }
    }

    fn on_link_lost(&mut self) {
        if self.link.take().is_none() {
            return;
        }
        warn!("Event channel connection lost");
        self.publish(EVENT_DISCONNECTED, Value::Null);
        self.fail_pending_acks();
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        if !self.wanted {
            return;
        }
        self.attempts = self.attempts.saturating_add(1);

        let exponent = self.attempts.saturating_sub(1).min(16);
        let base = self
            .config
            .initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.config.max_backoff);
        let jitter_ms = rand::thread_rng().gen_range(0..=(base.as_millis() as u64 / 4));
        let delay = base + Duration::from_millis(jitter_ms);

        debug!(attempt = self.attempts, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
        self.retry_at = Some(Instant::now() + delay);
    }

    fn dispatch(&mut self, frame: Frame) {
        if let Some(ack) = frame.ack {
            if let Some(pending) = self.pending_acks.remove(&ack) {
                let _ = pending.reply.send(Ok(frame.data));
                return;
            }
        }
        self.publish(&frame.event, frame.data);
    }

    fn publish(&mut self, name: &str, payload: Value) {
        let event = ChannelEvent {
            name: name.to_string(),
            payload,
        };
        // Closed receivers are pruned as a side effect.
        self.subscribers.retain(|sub| {
            if !sub.events.contains(name) {
                return !sub.tx.is_closed();
            }
            sub.tx.send(event.clone()).is_ok()
        });
    }

    fn expire_acks(&mut self) {
        let now = Instant::now();
        let expired: Vec<u64> = self
            .pending_acks
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(pending) = self.pending_acks.remove(&id) {
                warn!(event = %pending.event, "Acknowledgement timed out");
                let _ = pending.reply.send(Err(ChannelError::AckTimeout(pending.event)));
            }
        }
    }

    fn fail_pending_acks(&mut self) {
        for (_, pending) in self.pending_acks.drain() {
            let _ = pending.reply.send(Err(ChannelError::NotConnected));
        }
    }
}

async fn next_frame(link: &mut Option<Link>) -> Option<Frame> {
    match link {
        Some(link) => link.inbound.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::memory_transport;
    use serde_json::json;

    fn fast_config() -> ChannelConfig {
        ChannelConfig {
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            ack_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_lazy_connect_on_first_emit() {
        let (connector, mut server) = memory_transport();
        let channel = EventChannel::spawn(connector, fast_config());

        channel.emit("register-user", &"u1").await.unwrap();

        let mut peer = server.accept().await.unwrap();
        let frame = peer.recv().await.unwrap();
        assert_eq!(frame.event, "register-user");
        assert_eq!(frame.data, json!("u1"));
    }

    #[tokio::test]
    async fn test_fan_out_to_every_subscriber() {
        let (connector, mut server) = memory_transport();
        let channel = EventChannel::spawn(connector, fast_config());

        let mut first = channel.subscribe(&["message:new"]).await.unwrap();
        let mut second = channel.subscribe(&["message:new", "typing:start"]).await.unwrap();
        channel.connect().await.unwrap();

        let peer = server.accept().await.unwrap();
        peer.send(Frame::new("message:new", json!({"n": 1}))).await;
        peer.send(Frame::new("typing:start", json!({}))).await;

        assert_eq!(first.recv().await.unwrap().payload, json!({"n": 1}));
        assert_eq!(second.recv().await.unwrap().name, "message:new");
        assert_eq!(second.recv().await.unwrap().name, "typing:start");
        assert!(first.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_duplicates_are_delivered_twice() {
        let (connector, mut server) = memory_transport();
        let channel = EventChannel::spawn(connector, fast_config());
        let mut sub = channel.subscribe(&["message:new"]).await.unwrap();
        channel.connect().await.unwrap();

        let peer = server.accept().await.unwrap();
        let frame = Frame::new("message:new", json!({"id": "m1"}));
        peer.send(frame.clone()).await;
        peer.send(frame).await;

        assert!(sub.recv().await.is_some());
        assert!(sub.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let (connector, mut server) = memory_transport();
        let channel = EventChannel::spawn(connector, fast_config());
        let mut kept = channel.subscribe(&["user:status"]).await.unwrap();
        let mut dropped = channel.subscribe(&["user:status"]).await.unwrap();
        channel.unsubscribe(dropped.id()).await.unwrap();
        channel.connect().await.unwrap();

        let peer = server.accept().await.unwrap();
        peer.send(Frame::new("user:status", json!({"userId": "u2", "online": true})))
            .await;

        assert!(kept.recv().await.is_some());
        assert!(dropped.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_reconnect_is_surfaced_as_event() {
        let (connector, mut server) = memory_transport();
        let channel = EventChannel::spawn(connector, fast_config());
        let mut lifecycle = channel
            .subscribe(&[EVENT_CONNECTED, EVENT_DISCONNECTED, EVENT_RECONNECTED])
            .await
            .unwrap();

        channel.connect().await.unwrap();
        assert_eq!(lifecycle.recv().await.unwrap().name, EVENT_CONNECTED);

        let first = server.accept().await.unwrap();
        drop(first);
        assert_eq!(lifecycle.recv().await.unwrap().name, EVENT_DISCONNECTED);

        let _second = server.accept().await.unwrap();
        assert_eq!(lifecycle.recv().await.unwrap().name, EVENT_CONNECTED);
        assert_eq!(lifecycle.recv().await.unwrap().name, EVENT_RECONNECTED);
    }

    #[tokio::test]
    async fn test_requested_disconnect_is_surfaced_once() {
        let (connector, mut server) = memory_transport();
        let channel = EventChannel::spawn(connector, fast_config());
        let mut lifecycle = channel
            .subscribe(&[EVENT_CONNECTED, EVENT_DISCONNECTED])
            .await
            .unwrap();

        channel.connect().await.unwrap();
        let _peer = server.accept().await.unwrap();
        assert_eq!(lifecycle.recv().await.unwrap().name, EVENT_CONNECTED);

        channel.disconnect().await.unwrap();
        channel.disconnect().await.unwrap();
        assert_eq!(lifecycle.recv().await.unwrap().name, EVENT_DISCONNECTED);
        let extra = tokio::time::timeout(Duration::from_millis(50), lifecycle.recv()).await;
        assert!(extra.is_err());
    }

    #[tokio::test]
    async fn test_emit_fails_when_refused() {
        let (connector, _server) = memory_transport();
        connector.set_refusing(true);
        let channel = EventChannel::spawn(connector, fast_config());

        let result = channel.emit("call:request", &json!({})).await;
        assert!(matches!(result, Err(ChannelError::Connect(_))));
    }

    #[tokio::test]
    async fn test_emit_with_ack() {
        let (connector, mut server) = memory_transport();
        let channel = EventChannel::spawn(connector, fast_config());

        let requester = channel.clone();
        let request = tokio::spawn(async move {
            requester.emit_with_ack("user:check-status", &"u2").await
        });

        let mut peer = server.accept().await.unwrap();
        let frame = peer.recv().await.unwrap();
        assert_eq!(frame.event, "user:check-status");
        let mut reply = Frame::new("user:check-status", json!(true));
        reply.ack = frame.ack;
        peer.send(reply).await;

        assert_eq!(request.await.unwrap().unwrap(), json!(true));
    }

    #[tokio::test]
    async fn test_ack_times_out() {
        let (connector, mut server) = memory_transport();
        let channel = EventChannel::spawn(connector, fast_config());

        let requester = channel.clone();
        let request = tokio::spawn(async move {
            requester.emit_with_ack("user:check-status", &"u2").await
        });
        let _peer = server.accept().await.unwrap();

        assert!(matches!(
            request.await.unwrap(),
            Err(ChannelError::AckTimeout(_))
        ));
    }
}
