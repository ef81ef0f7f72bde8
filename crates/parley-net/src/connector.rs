//! Transport seam for the event channel.
//!
//! A [`Connector`] opens one physical connection and hands back a [`Link`]:
//! a pair of frame queues. The link is considered lost as soon as its
//! inbound queue closes.

use async_trait::async_trait;
use tokio::sync::mpsc;

use parley_shared::protocol::Frame;

use crate::error::ChannelError;

/// One live connection, expressed as frame queues.
pub struct Link {
    /// Frames to write to the server.
    pub outbound: mpsc::Sender<Frame>,
    /// Frames read from the server. Closes when the connection drops.
    pub inbound: mpsc::Receiver<Frame>,
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self) -> Result<Link, ChannelError>;
}
