/// Application name
pub const APP_NAME: &str = "Parley";

/// Messages requested per history page unless configured otherwise
pub const DEFAULT_PAGE_SIZE: usize = 10;

/// Seconds a caller waits for the callee to answer before giving up
pub const DEFAULT_RING_TIMEOUT_SECS: u64 = 30;

/// Base used to resolve media references that are not already absolute URLs
pub const DEFAULT_MEDIA_GATEWAY: &str = "http://127.0.0.1:8080/media";

/// Default event stream endpoint
pub const DEFAULT_EVENTS_URL: &str = "ws://127.0.0.1:8080/events";

/// Default REST base for history and send
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8080/api";

/// Public STUN server used when none are configured
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Prefix of locally generated (optimistic) message identifiers
pub const LOCAL_ID_PREFIX: &str = "local-";
