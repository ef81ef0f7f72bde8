//! # parley-media
//!
//! One-to-one audio calls: the signaling state machine, the session it
//! drives, and the device and peer-connection backends behind it.

pub mod audio;
pub mod call;
pub mod handle;
pub mod media;
pub mod session;
pub mod webrtc_peer;

mod error;

pub use call::{CallConfig, CallController};
pub use error::{CallError, MediaError, Result};
pub use handle::{spawn_call_controller, CallHandle};
pub use media::{
    LocalMedia, MediaBackend, PeerEvent, PeerEvents, PeerLink, RemoteMedia, SdpKind, SessionId,
    Signaler,
};
pub use session::{CallRole, CallSession, CallState, CallStatus};
pub use webrtc_peer::WebRtcBackend;
