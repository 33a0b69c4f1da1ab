//! Wraps the `irc` crate: out of scope is the wire parsing itself, in
//! scope is turning its structured messages into `InboundEvent`s and
//! enforcing the outbound limit (spec §6, §9).
//!
//! Moderation semantics (`delete`, `timeout_or_ban`, `clear_all`) ride
//! on the IRCv3 tags and the `CLEARMSG`/`CLEARCHAT` commands a Twitch-
//! style gateway sends; badges (`broadcaster`, `moderator`) likewise
//! come from the `badges` message tag.

use crate::error::IrcError;
use crate::models::{metric_kind, Badge, EventKind, InboundEvent, Metric};
use crate::processor::ChannelQueue;
use crate::store::StoreHandle;
use chrono::Utc;
use futures::stream::StreamExt;
use irc::client::prelude::*;
use irc::proto::Command;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(300);
const OUTBOUND_LIMIT: usize = 500;

pub struct IrcAdapter {
    irc_config: IrcConfig,
    queues: HashMap<String, Arc<ChannelQueue>>,
    banned_channels: Mutex<HashSet<String>>,
    client: Mutex<Option<Client>>,
    store: StoreHandle,
}

/// The subset of global `Config` the adapter needs, named distinctly so
/// this module doesn't re-export the whole app config.
pub struct IrcConfig {
    pub server: String,
    pub port: u16,
    pub use_tls: bool,
    pub nickname: String,
    pub channels: Vec<String>,
}

impl IrcAdapter {
    pub fn new(
        irc_config: IrcConfig,
        queues: HashMap<String, Arc<ChannelQueue>>,
        store: StoreHandle,
    ) -> Self {
        IrcAdapter {
            irc_config,
            queues,
            banned_channels: Mutex::new(HashSet::new()),
            client: Mutex::new(None),
            store,
        }
    }

    fn client_config(&self, token: &str) -> irc::client::data::Config {
        irc::client::data::Config {
            nickname: Some(self.irc_config.nickname.clone()),
            server: Some(self.irc_config.server.clone()),
            port: Some(self.irc_config.port),
            use_tls: Some(self.irc_config.use_tls),
            password: Some(format!("oauth:{token}")),
            channels: self.irc_config.channels.clone(),
            ..irc::client::data::Config::default()
        }
    }

    /// Connects, joins channels that are not permanently banned, and
    /// processes the message stream until disconnected or `shutdown`
    /// fires. Reconnects with exponential backoff capped at 5 minutes,
    /// resetting the backoff after any successful connection.
    pub async fn run(self: Arc<Self>, access_token: String, shutdown: CancellationToken) {
        let mut backoff = Duration::from_secs(1);
        loop {
            if shutdown.is_cancelled() {
                return;
            }

            let result = self.connect_and_drain(&access_token, &shutdown).await;
            *self.client.lock().await = None;
            match result {
                Ok(()) => return, // shutdown requested mid-stream
                Err(e) => {
                    warn!(error = %e, "irc connection lost, reconnecting");
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }

    async fn connect_and_drain(
        &self,
        access_token: &str,
        shutdown: &CancellationToken,
    ) -> Result<(), IrcError> {
        let mut client = Client::from_config(self.client_config(access_token))
            .await
            .map_err(|e| IrcError::Transport(e.to_string()))?;
        client
            .identify()
            .map_err(|e| IrcError::Transport(e.to_string()))?;

        *self.client.lock().await = Some(client.clone());

        {
            let banned = self.banned_channels.lock().await;
            for channel in &self.irc_config.channels {
                if !banned.contains(channel) {
                    let _ = client.send_join(channel);
                }
            }
        }

        let mut stream = client
            .stream()
            .map_err(|e| IrcError::Transport(e.to_string()))?;

        info!("irc connected");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                next = stream.next() => {
                    let message = match next {
                        Some(Ok(m)) => m,
                        Some(Err(e)) => return Err(IrcError::Transport(e.to_string())),
                        None => return Err(IrcError::Transport("stream ended".into())),
                    };
                    self.dispatch(&message).await;
                }
            }
        }
    }

    async fn dispatch(&self, message: &Message) {
        if let Command::NOTICE(target, text) = &message.command {
            let tags = tag_map(message);
            let is_ban_notice = tags.get("msg-id").map(String::as_str)
                == Some("msg_banned")
                || text.eq_ignore_ascii_case("You are permanently banned from talking in this channel.");
            if is_ban_notice {
                warn!(channel = %target, "bot is banned from this channel, will not retry");
                self.mark_banned(target).await;
                return;
            }
        }

        if let Some((channel, event)) = to_inbound_event(message) {
            if let Some(queue) = self.queues.get(&channel) {
                if queue.push(event) {
                    let store = self.store.clone();
                    let metric = Metric {
                        channel,
                        kind: metric_kind::QUEUE_DROP.to_string(),
                        value: 1.0,
                        timestamp: Utc::now(),
                    };
                    tokio::spawn(async move {
                        let _ = store.record_metric(metric).await;
                    });
                }
            }
        }
    }

    pub async fn mark_banned(&self, channel: &str) {
        self.banned_channels.lock().await.insert(channel.to_string());
    }

    /// Sends sanitized text to `channel`: no newlines, no formatting
    /// markers, truncated to 500 bytes on a char boundary.
    pub async fn send(&self, channel: &str, text: &str) {
        let sanitized = sanitize_outbound(text);
        let guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            let _ = client.send_privmsg(channel, &sanitized);
        }
    }
}

fn sanitize_outbound(text: &str) -> String {
    let no_newlines: String = text
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .filter(|c| !matches!(c, '*' | '_' | '`' | '~'))
        .collect();
    let trimmed = no_newlines.trim();

    if trimmed.len() <= OUTBOUND_LIMIT {
        return trimmed.to_string();
    }
    let mut end = OUTBOUND_LIMIT;
    while !trimmed.is_char_boundary(end) {
        end -= 1;
    }
    trimmed[..end].to_string()
}

fn to_inbound_event(message: &Message) -> Option<(String, InboundEvent)> {
    let timestamp = chrono::Utc::now();
    let tags = tag_map(message);

    match &message.command {
        Command::PRIVMSG(target, content) => {
            let author_id = tags.get("user-id").cloned();
            let author_display_name = tags
                .get("display-name")
                .cloned()
                .or_else(|| message.source_nickname().map(|s| s.to_string()));
            let message_id = tags.get("id").cloned();
            let badges = parse_badges(tags.get("badges").map(|s| s.as_str()).unwrap_or(""));

            Some((
                target.clone(),
                InboundEvent {
                    channel: target.clone(),
                    author_id,
                    author_display_name,
                    author_badges: badges,
                    message_id,
                    content: content.clone(),
                    timestamp,
                    kind: EventKind::Message,
                },
            ))
        }
        Command::Raw(cmd, args) if cmd == "CLEARMSG" => {
            let channel = args.first().cloned()?;
            let message_id = tags.get("target-msg-id").cloned()?;
            Some((
                channel.clone(),
                InboundEvent {
                    channel,
                    author_id: None,
                    author_display_name: None,
                    author_badges: Default::default(),
                    message_id: None,
                    content: String::new(),
                    timestamp,
                    kind: EventKind::Delete { message_id },
                },
            ))
        }
        Command::Raw(cmd, args) if cmd == "CLEARCHAT" => {
            let channel = args.first().cloned()?;
            let kind = match tags.get("target-user-id") {
                Some(user_id) => EventKind::UserClear {
                    user_id: user_id.clone(),
                },
                None => EventKind::ChannelClear,
            };
            Some((
                channel.clone(),
                InboundEvent {
                    channel,
                    author_id: None,
                    author_display_name: None,
                    author_badges: Default::default(),
                    message_id: None,
                    content: String::new(),
                    timestamp,
                    kind,
                },
            ))
        }
        _ => None,
    }
}

fn tag_map(message: &Message) -> HashMap<String, String> {
    message
        .tags
        .as_ref()
        .map(|tags| {
            tags.iter()
                .filter_map(|t| t.1.clone().map(|v| (t.0.clone(), v)))
                .collect()
        })
        .unwrap_or_default()
}

fn parse_badges(raw: &str) -> HashSet<Badge> {
    let mut badges = HashSet::new();
    for entry in raw.split(',') {
        if entry.starts_with("broadcaster/") {
            badges.insert(Badge::Broadcaster);
        } else if entry.starts_with("moderator/") {
            badges.insert(Badge::Moderator);
        }
    }
    badges
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_newlines_and_markers() {
        let out = sanitize_outbound("hello\n*world*\r_foo_");
        assert!(!out.contains('\n'));
        assert!(!out.contains('*'));
        assert_eq!(out, "hello world foo");
    }

    #[test]
    fn sanitize_truncates_at_500_bytes() {
        let long = "a".repeat(600);
        let out = sanitize_outbound(&long);
        assert_eq!(out.len(), 500);
    }

    #[test]
    fn parse_badges_recognises_broadcaster_and_moderator() {
        let badges = parse_badges("broadcaster/1,subscriber/12");
        assert!(badges.contains(&Badge::Broadcaster));
        assert!(!badges.contains(&Badge::Moderator));
    }
}
