//! In-process transport. Lets tests and local demos run the real event
//! channel without a server: each `connect` hands the "server side" of the
//! link to a [`MemoryServer`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use parley_shared::protocol::Frame;

use crate::connector::{Connector, Link};
use crate::error::ChannelError;

const LINK_BUFFER: usize = 256;

#[derive(Clone)]
pub struct MemoryConnector {
    accept_tx: mpsc::UnboundedSender<MemoryPeer>,
    refusing: Arc<AtomicBool>,
}

pub struct MemoryServer {
    accept_rx: mpsc::UnboundedReceiver<MemoryPeer>,
}

/// Server-side end of one in-memory connection. Dropping it drops the
/// connection for the client.
pub struct MemoryPeer {
    received: mpsc::Receiver<Frame>,
    sender: mpsc::Sender<Frame>,
}

pub fn memory_transport() -> (MemoryConnector, MemoryServer) {
    let (accept_tx, accept_rx) = mpsc::unbounded_channel();
    (
        MemoryConnector {
            accept_tx,
            refusing: Arc::new(AtomicBool::new(false)),
        },
        MemoryServer { accept_rx },
    )
}

impl MemoryConnector {
    /// Make subsequent connection attempts fail.
    pub fn set_refusing(&self, refusing: bool) {
        self.refusing.store(refusing, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Link, ChannelError> {
        if self.refusing.load(Ordering::SeqCst) {
            return Err(ChannelError::Connect("connection refused".into()));
        }

        let (client_tx, server_rx) = mpsc::channel(LINK_BUFFER);
        let (server_tx, client_rx) = mpsc::channel(LINK_BUFFER);

        self.accept_tx
            .send(MemoryPeer {
                received: server_rx,
                sender: server_tx,
            })
            .map_err(|_| ChannelError::Connect("memory server gone".into()))?;

        Ok(Link {
            outbound: client_tx,
            inbound: client_rx,
        })
    }
}

impl MemoryServer {
    pub async fn accept(&mut self) -> Option<MemoryPeer> {
        self.accept_rx.recv().await
    }
}

impl MemoryPeer {
    pub async fn recv(&mut self) -> Option<Frame> {
        self.received.recv().await
    }

    pub async fn send(&self, frame: Frame) -> bool {
        self.sender.send(frame).await.is_ok()
    }
}

/// Relay every frame a peer sends to all other connected peers, the way the
/// event server fans out call signals. Ack requests are not answered.
pub fn spawn_broadcast_relay(mut server: MemoryServer) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<(usize, Frame)>();
        let mut outlets: Vec<mpsc::Sender<Frame>> = Vec::new();

        loop {
            tokio::select! {
                peer = server.accept() => {
                    let Some(MemoryPeer { mut received, sender }) = peer else { break };
                    let index = outlets.len();
                    outlets.push(sender);
                    let frame_tx = frame_tx.clone();
                    tokio::spawn(async move {
                        while let Some(frame) = received.recv().await {
                            if frame_tx.send((index, frame)).is_err() {
                                break;
                            }
                        }
                    });
                    debug!(peer = index, "Relay accepted peer");
                }
                Some((origin, frame)) = frame_rx.recv() => {
                    for (index, outlet) in outlets.iter().enumerate() {
                        if index != origin {
                            let _ = outlet.send(frame.clone()).await;
                        }
                    }
                }
            }
        }
    })
}
