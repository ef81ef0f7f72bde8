use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("Malformed {event} payload: {reason}")]
    Malformed { event: String, reason: String },

    #[error("Timestamp parse error: {0}")]
    Timestamp(#[from] chrono::ParseError),
}
