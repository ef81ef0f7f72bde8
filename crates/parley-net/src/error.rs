use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Event channel task stopped")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("No acknowledgement for {0}")]
    AckTimeout(String),
}
