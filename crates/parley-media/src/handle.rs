//! Runs a [`CallController`] in its own task.
//!
//! The task owns the controller and multiplexes user commands, call signals
//! from the shared event channel, peer-connection events and the ring timer.
//! Losing the event channel ends any call that has not connected yet.

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{info, warn};

use parley_net::{EventChannel, EVENT_DISCONNECTED};
use parley_shared::protocol::{SignalMessage, CALL_EVENTS};
use parley_shared::types::UserId;

use crate::call::{CallConfig, CallController};
use crate::error::{CallError, Result};
use crate::media::MediaBackend;
use crate::session::CallStatus;

enum CallCommand {
    Initiate(UserId, oneshot::Sender<Result<()>>),
    Accept(oneshot::Sender<Result<()>>),
    Decline(oneshot::Sender<Result<()>>),
    Hangup(oneshot::Sender<Result<()>>),
    Dismiss,
    Shutdown,
}

#[derive(Clone)]
pub struct CallHandle {
    cmd_tx: mpsc::Sender<CallCommand>,
    status_rx: watch::Receiver<CallStatus>,
}

impl CallHandle {
    pub async fn initiate(&self, peer: UserId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(CallCommand::Initiate(peer, reply), rx).await
    }

    pub async fn accept(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(CallCommand::Accept(reply), rx).await
    }

    pub async fn decline(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(CallCommand::Decline(reply), rx).await
    }

    pub async fn hangup(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(CallCommand::Hangup(reply), rx).await
    }

    pub async fn dismiss(&self) {
        let _ = self.cmd_tx.send(CallCommand::Dismiss).await;
    }

    /// Hang up any call in progress and stop the task.
    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(CallCommand::Shutdown).await;
    }

    pub fn status(&self) -> watch::Receiver<CallStatus> {
        self.status_rx.clone()
    }

    async fn request(
        &self,
        cmd: CallCommand,
        rx: oneshot::Receiver<Result<()>>,
    ) -> Result<()> {
        self.cmd_tx.send(cmd).await.map_err(|_| CallError::Closed)?;
        rx.await.map_err(|_| CallError::Closed)?
    }
}

/// Subscribe to the call events on `channel` and spawn the controller task.
pub async fn spawn_call_controller<B: MediaBackend>(
    channel: EventChannel,
    backend: B,
    local: UserId,
    config: CallConfig,
) -> Result<CallHandle> {
    let mut events = CALL_EVENTS.to_vec();
    events.push(EVENT_DISCONNECTED);
    let mut signals = channel.subscribe(&events).await?;
    let (mut controller, mut peer_rx) = CallController::new(local, channel, backend, config);
    let status_rx = controller.subscribe();
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<CallCommand>(64);

    tokio::spawn(async move {
        loop {
            let ring_deadline = controller.ring_deadline();

            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(CallCommand::Initiate(peer, reply)) => {
                            let _ = reply.send(controller.initiate(peer).await);
                        }
                        Some(CallCommand::Accept(reply)) => {
                            let _ = reply.send(controller.accept().await);
                        }
                        Some(CallCommand::Decline(reply)) => {
                            let _ = reply.send(controller.decline().await);
                        }
                        Some(CallCommand::Hangup(reply)) => {
                            let _ = reply.send(controller.hangup().await);
                        }
                        Some(CallCommand::Dismiss) => controller.dismiss(),
                        Some(CallCommand::Shutdown) | None => {
                            info!("Call controller shutting down");
                            let _ = controller.hangup().await;
                            break;
                        }
                    }
                }

                Some(event) = signals.recv() => {
                    if event.name == EVENT_DISCONNECTED {
                        controller.on_channel_lost().await;
                        continue;
                    }
                    match SignalMessage::from_event(&event.name, &event.payload) {
                        Ok(message) => controller.handle_signal(message).await,
                        Err(e) => {
                            warn!(event = %event.name, error = %e, "Malformed call signal");
                            let from = event
                                .payload
                                .get("from")
                                .and_then(Value::as_str)
                                .map(UserId::new);
                            controller.handle_malformed(from, e).await;
                        }
                    }
                }

                Some((session, event)) = peer_rx.recv() => {
                    controller.handle_peer_event(session, event).await;
                }

                _ = sleep_until(ring_deadline) => controller.on_ring_timeout().await,
            }
        }
    });

    Ok(CallHandle { cmd_tx, status_rx })
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
