// Event Channel Adapter: one reconnectable, server-relayed event stream.

pub mod channel;
pub mod connector;
pub mod error;
pub mod memory;
pub mod websocket;

pub use channel::{
    ChannelConfig, ChannelEvent, EventChannel, Subscription, SubscriptionId, EVENT_CONNECTED,
    EVENT_DISCONNECTED, EVENT_RECONNECTED,
};
pub use connector::{Connector, Link};
pub use error::ChannelError;
pub use memory::{memory_transport, spawn_broadcast_relay, MemoryConnector, MemoryPeer, MemoryServer};
pub use websocket::WsConnector;
