//! Domain entities (spec §3) and the inbound event shape (spec §6).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A stored chat message. Created only when an inbound user message
/// passes input filtering (invariant 5); destroyed only by moderation
/// deletion or retention cleanup (invariant 7).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    pub message_id: String,
    pub channel: String,
    pub user_id: String,
    pub user_display_name: String,
    pub content: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Per-channel configuration. Created lazily from global defaults on
/// first event for a channel (spec §3).
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChannelConfig {
    pub channel: String,
    pub message_threshold: u32,
    pub spontaneous_cooldown_s: u64,
    pub response_cooldown_s: u64,
    pub context_limit: u32,
    pub model_name: Option<String>,
    pub message_count: u32,
    pub last_spontaneous_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl ChannelConfig {
    pub fn defaults(channel: &str, defaults: &crate::config::DefaultThresholds) -> Self {
        ChannelConfig {
            channel: channel.to_string(),
            message_threshold: defaults.message_threshold,
            spontaneous_cooldown_s: defaults.spontaneous_cooldown_s,
            response_cooldown_s: defaults.response_cooldown_s,
            context_limit: defaults.context_limit,
            model_name: None,
            message_count: 0,
            last_spontaneous_at: None,
        }
    }
}

/// Per-user, per-channel cooldown on mention responses. Uniquely keyed
/// by `(channel, user_id)`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct UserResponseCooldown {
    pub channel: String,
    pub user_id: String,
    pub last_response_at: chrono::DateTime<chrono::Utc>,
}

/// OAuth credentials for the chat connection. At most one record exists;
/// sensitive fields are stored encrypted at rest (spec §9).
#[derive(Debug, Clone)]
pub struct AuthMaterial {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub bot_username: String,
}

/// An append-only counter/gauge sample (spec §3), aggregated on read.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Metric {
    pub channel: String,
    pub kind: String,
    pub value: f64,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Well-known metric kinds recorded by the Processor and Supervisor.
pub mod metric_kind {
    pub const FILTER_BLOCK_INPUT: &str = "filter_block_input";
    pub const FILTER_BLOCK_OUTPUT: &str = "filter_block_output";
    pub const GENERATOR_UNAVAILABLE: &str = "generator_unavailable";
    pub const GENERATOR_INVALID: &str = "generator_invalid";
    pub const SPONTANEOUS_EMITTED: &str = "spontaneous_emitted";
    pub const RESPONSE_EMITTED: &str = "response_emitted";
    pub const QUEUE_DROP: &str = "queue_drop";
}

/// Capability tags carried on an inbound event's author (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Badge {
    Broadcaster,
    Moderator,
}

/// The kind of an inbound event (spec §6).
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Message,
    Delete { message_id: String },
    UserClear { user_id: String },
    ChannelClear,
    System,
}

/// Structured inbound event, as yielded by the `IrcAdapter` (spec §6).
/// The low-level IRC wire parsing that produces this shape is explicitly
/// out of scope for the core.
#[derive(Debug, Clone)]
pub struct InboundEvent {
    pub channel: String,
    pub author_id: Option<String>,
    pub author_display_name: Option<String>,
    pub author_badges: HashSet<Badge>,
    pub message_id: Option<String>,
    pub content: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub kind: EventKind,
}
