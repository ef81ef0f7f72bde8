use thiserror::Error;

use parley_net::ChannelError;
use parley_shared::ProtocolError;

/// Local device and peer-connection failures.
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("No input device available")]
    NoInputDevice,

    #[error("Audio device error: {0}")]
    Device(String),

    #[error("Audio stream error: {0}")]
    Stream(String),

    #[error("Peer connection error: {0}")]
    Peer(String),
}

impl From<webrtc::Error> for MediaError {
    fn from(e: webrtc::Error) -> Self {
        MediaError::Peer(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum CallError {
    #[error("A call is already in progress")]
    Busy,

    #[error("No incoming call to answer")]
    NoIncomingCall,

    #[error("Cannot call yourself")]
    InvalidPeer,

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Signaling error: {0}")]
    Signal(#[from] ChannelError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Call controller stopped")]
    Closed,
}

pub type Result<T> = std::result::Result<T, CallError>;
