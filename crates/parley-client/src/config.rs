//! Client configuration loaded from environment variables.
//!
//! Every setting has a default so the client starts against a local
//! development server with zero configuration.

use std::time::Duration;

use parley_shared::constants::{
    DEFAULT_API_URL, DEFAULT_EVENTS_URL, DEFAULT_MEDIA_GATEWAY, DEFAULT_PAGE_SIZE,
    DEFAULT_RING_TIMEOUT_SECS, DEFAULT_STUN_SERVER,
};
use parley_shared::types::UserId;

use crate::theme::Theme;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Event stream endpoint.
    /// Env: `PARLEY_SERVER_URL`
    pub server_url: String,

    /// Base for history, send and unsend.
    /// Env: `PARLEY_API_URL`
    pub api_url: String,

    /// Bearer token for the remote service.
    /// Env: `PARLEY_API_TOKEN`
    pub api_token: Option<String>,

    /// Base that relative media references resolve against.
    /// Env: `PARLEY_MEDIA_GATEWAY`
    pub media_gateway: String,

    /// Env: `PARLEY_USER_ID`
    pub user_id: UserId,

    /// Shown to the callee when we ring them.
    /// Env: `PARLEY_DISPLAY_NAME`
    pub display_name: Option<String>,

    /// Env: `PARLEY_PAGE_SIZE`
    pub page_size: usize,

    /// Env: `PARLEY_RING_TIMEOUT_SECS`
    pub ring_timeout: Duration,

    /// Comma-separated.
    /// Env: `PARLEY_STUN_URLS`
    pub stun_urls: Vec<String>,

    /// Env: `PARLEY_THEME`
    pub theme: Theme,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_EVENTS_URL.to_string(),
            api_url: DEFAULT_API_URL.to_string(),
            api_token: None,
            media_gateway: DEFAULT_MEDIA_GATEWAY.to_string(),
            user_id: UserId::new("anonymous"),
            display_name: None,
            page_size: DEFAULT_PAGE_SIZE,
            ring_timeout: Duration::from_secs(DEFAULT_RING_TIMEOUT_SECS),
            stun_urls: vec![DEFAULT_STUN_SERVER.to_string()],
            theme: Theme::Default,
        }
    }
}

impl ClientConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(url) = lookup("PARLEY_SERVER_URL") {
            config.server_url = url;
        }

        if let Some(url) = lookup("PARLEY_API_URL") {
            config.api_url = url;
        }

        if let Some(token) = lookup("PARLEY_API_TOKEN") {
            if !token.is_empty() {
                config.api_token = Some(token);
            }
        }

        if let Some(gateway) = lookup("PARLEY_MEDIA_GATEWAY") {
            config.media_gateway = gateway;
        }

        if let Some(id) = lookup("PARLEY_USER_ID") {
            if id.trim().is_empty() {
                tracing::warn!("Empty PARLEY_USER_ID, using default");
            } else {
                config.user_id = UserId::new(id.trim());
            }
        }

        if let Some(name) = lookup("PARLEY_DISPLAY_NAME") {
            if !name.trim().is_empty() {
                config.display_name = Some(name.trim().to_string());
            }
        }

        if let Some(val) = lookup("PARLEY_PAGE_SIZE") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.page_size = n,
                _ => tracing::warn!(value = %val, "Invalid PARLEY_PAGE_SIZE, using default"),
            }
        }

        if let Some(val) = lookup("PARLEY_RING_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(secs) if secs > 0 => config.ring_timeout = Duration::from_secs(secs),
                _ => tracing::warn!(
                    value = %val,
                    "Invalid PARLEY_RING_TIMEOUT_SECS, using default"
                ),
            }
        }

        if let Some(val) = lookup("PARLEY_STUN_URLS") {
            config.stun_urls = parse_url_list(&val);
        }

        if let Some(val) = lookup("PARLEY_THEME") {
            match val.parse::<Theme>() {
                Ok(theme) => config.theme = theme,
                Err(e) => tracing::warn!(error = %e, "Invalid PARLEY_THEME, using default"),
            }
        }

        // RUST_LOG is read by tracing-subscriber's EnvFilter directly.

        config
    }
}

fn parse_url_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(String::from)
        .collect()
}
