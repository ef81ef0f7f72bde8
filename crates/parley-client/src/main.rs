//! # parley-client
//!
//! Terminal chat client. One event channel carries both the conversation
//! sync traffic and the call signaling; history and sends go through the
//! remote HTTP service.

mod command;
mod config;
mod render;
mod scroll;
mod theme;

use anyhow::Context;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use parley_chat::{
    spawn_chat_sync, ChatConfig, ChatHandle, ChatNotice, ConversationView, HttpRemote,
    MediaGateway, PresenceTracker, ScrollAnchor,
};
use parley_media::{spawn_call_controller, CallConfig, CallHandle, CallState, WebRtcBackend};
use parley_net::{ChannelConfig, EventChannel, WsConnector};
use parley_shared::constants::APP_NAME;
use parley_shared::types::ParticipantRef;

use crate::command::{Input, HELP};
use crate::config::ClientConfig;
use crate::scroll::ScrollManager;
use crate::theme::Theme;

const DEFAULT_FILTER: &str =
    "parley_client=debug,parley_chat=debug,parley_media=debug,parley_net=info,warn";
const VIEWPORT_LINES: usize = 20;
const SCROLL_STEP: usize = 5;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG). Stdout belongs to the UI.
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)),
        )
        .init();

    info!("Starting {} client v{}", APP_NAME, env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ClientConfig::from_env();
    info!(
        user = %config.user_id,
        server = %config.server_url,
        api = %config.api_url,
        page_size = config.page_size,
        theme = %config.theme,
        "Loaded configuration"
    );

    // -----------------------------------------------------------------------
    // 3. Shared event channel
    // -----------------------------------------------------------------------
    let channel = EventChannel::spawn(
        WsConnector::new(config.server_url.clone()),
        ChannelConfig::default(),
    );

    // -----------------------------------------------------------------------
    // 4. Conversation sync and call controller
    // -----------------------------------------------------------------------
    let remote = HttpRemote::new(config.api_url.clone(), config.api_token.clone());
    let (chat, mut notices) = spawn_chat_sync(
        remote,
        channel.clone(),
        config.user_id.clone(),
        ChatConfig {
            page_size: config.page_size,
            gateway: MediaGateway::new(config.media_gateway.clone()),
        },
    )
    .await
    .context("starting conversation sync")?;

    let calls = spawn_call_controller(
        channel.clone(),
        WebRtcBackend::new(config.stun_urls.clone()),
        config.user_id.clone(),
        CallConfig {
            ring_timeout: config.ring_timeout,
            display_name: config.display_name.clone(),
        },
    )
    .await
    .context("starting call controller")?;

    // Both owners are subscribed, so the connect handshake reaches them.
    if let Err(e) = channel.connect().await {
        warn!(error = %e, "Event channel unavailable, will keep retrying");
    }

    // -----------------------------------------------------------------------
    // 5. Terminal loop
    // -----------------------------------------------------------------------
    println!("{HELP}");

    let mut screen = Screen::new(config.theme);
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut view_rx = chat.view();
    let mut presence_rx = chat.presence();
    let mut call_rx = calls.status();

    loop {
        tokio::select! {
            line = stdin.next_line() => {
                let Some(line) = line.context("reading stdin")? else { break };
                match command::parse(&line) {
                    Ok(Some(Input::Quit)) => break,
                    Ok(Some(input)) => {
                        if let Err(e) = handle_input(input, &chat, &calls, &mut screen).await {
                            println!("! {e}");
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("! {e}"),
                }
            }

            changed = view_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = view_rx.borrow_and_update().clone();
                screen.set_view(view);
                screen.draw();
            }

            changed = presence_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                screen.presence = presence_rx.borrow_and_update().clone();
            }

            changed = call_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let status = call_rx.borrow_and_update().clone();
                if let Some(banner) = render::call_banner(&status) {
                    println!("{banner}");
                }
                if status.state == CallState::Ringing {
                    println!("  /accept or /decline");
                }
            }

            Some(notice) = notices.recv() => match notice {
                ChatNotice::Failed(e) => println!("! {e}"),
                ChatNotice::OlderLoaded(anchor) => {
                    // The view is published before the notice.
                    let view = view_rx.borrow_and_update().clone();
                    screen.set_view(view);
                    screen.keep_anchor(&anchor);
                    screen.draw();
                }
                ChatNotice::Unsent(id) => println!("- message {id} removed"),
                ChatNotice::Reconnected => println!("- reconnected"),
            },
        }
    }

    info!("Shutting down");
    calls.shutdown().await;
    chat.shutdown().await;
    channel.shutdown().await;
    Ok(())
}

async fn handle_input(
    input: Input,
    chat: &ChatHandle,
    calls: &CallHandle,
    screen: &mut Screen,
) -> anyhow::Result<()> {
    match input {
        Input::Open { conversation, peer } => {
            screen.scroll.reset();
            chat.select(conversation, peer.map(ParticipantRef::bare))
                .await?;
        }
        Input::Older => {
            screen.scroll.scroll_up(usize::MAX);
            chat.load_older().await?;
        }
        Input::Send(text) => {
            let temp_id = chat.send_text(text).await?;
            debug!(id = %temp_id, "Message queued");
        }
        Input::Media { url, caption } => {
            let file_name = url.rsplit('/').next().map(String::from);
            chat.send_media(url, file_name, caption).await?;
        }
        Input::Seen(id) => chat.mark_seen(id).await?,
        Input::Unsend(id) => chat.unsend(id).await?,
        Input::Retry(id) => chat.retry(id).await?,
        Input::Online(user) => {
            let online = chat.check_online(user.clone()).await?;
            println!("- {user} is {}", if online { "online" } else { "offline" });
        }
        Input::Theme(theme) => {
            screen.theme = theme;
            screen.rebuild();
            screen.draw();
        }
        Input::Call(peer) => calls.initiate(peer).await?,
        Input::Accept => calls.accept().await?,
        Input::Decline => calls.decline().await?,
        Input::Hangup => calls.hangup().await?,
        Input::Dismiss => calls.dismiss().await,
        Input::Up => {
            screen.scroll.scroll_up(SCROLL_STEP);
            if screen.scroll.is_at_top() && screen.view.has_more_older {
                chat.load_older().await?;
            }
            screen.draw();
        }
        Input::Down => {
            screen.scroll.scroll_down(SCROLL_STEP);
            screen.draw();
        }
        Input::Help => println!("{HELP}"),
        Input::Quit => {}
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Transcript
// ---------------------------------------------------------------------------

struct Screen {
    theme: Theme,
    scroll: ScrollManager,
    view: ConversationView,
    presence: PresenceTracker,
    lines: Vec<String>,
}

impl Screen {
    fn new(theme: Theme) -> Self {
        Self {
            theme,
            scroll: ScrollManager::new(VIEWPORT_LINES),
            view: ConversationView::default(),
            presence: PresenceTracker::new(),
            lines: Vec::new(),
        }
    }

    fn set_view(&mut self, view: ConversationView) {
        self.view = view;
        self.rebuild();
    }

    fn rebuild(&mut self) {
        let now = Utc::now();
        self.lines = self
            .view
            .messages
            .iter()
            .map(|m| render::message_line(m, self.theme, now))
            .collect();
        self.scroll.set_content_height(self.lines.len());
    }

    /// One line per message, so the anchor's index is the prepended height.
    fn keep_anchor(&mut self, anchor: &ScrollAnchor) {
        let prepended = anchor
            .anchor
            .as_ref()
            .and_then(|id| self.view.messages.iter().position(|m| m.matches(id)))
            .unwrap_or(anchor.prepended);
        self.scroll.keep_anchor(prepended);
    }

    fn draw(&self) {
        let Some(conversation) = &self.view.conversation_id else {
            return;
        };
        let title = self
            .view
            .participant
            .as_ref()
            .map(|p| p.display_name.clone())
            .unwrap_or_else(|| conversation.to_string());

        let mut status = Vec::new();
        if let Some(peer) = &self.view.participant {
            match self.presence.is_online(&peer.id) {
                Some(true) => status.push("online"),
                Some(false) => status.push("offline"),
                None => {}
            }
            if self.presence.is_typing(conversation, &peer.id) {
                status.push("typing...");
            }
        }
        if self.view.loading_initial || self.view.loading_older {
            status.push("loading");
        }

        println!();
        println!("== {title} {} ==", status.join(", "));
        if self.view.has_more_older && self.scroll.is_at_top() {
            println!("   (/older for earlier messages)");
        }
        for line in &self.lines[self.scroll.visible()] {
            println!("{line}");
        }
    }
}
