//! Typed configuration over the closed key set of spec §6.
//!
//! Follows the teacher's `RateLimitConfig::from_env` shape: a struct with
//! a `Default` impl for the baked-in defaults, and a loader that
//! overrides fields from environment variables. Keys better expressed as
//! structured data (channel list, known-other-bots, thresholds) can also
//! come from an optional TOML file; env vars always win over the file,
//! matching the teacher's env-first precedence.

use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DefaultThresholds {
    pub message_threshold: u32,
    pub spontaneous_cooldown_s: u64,
    pub response_cooldown_s: u64,
    pub context_limit: u32,
}

impl Default for DefaultThresholds {
    fn default() -> Self {
        DefaultThresholds {
            message_threshold: 30,
            spontaneous_cooldown_s: 600,
            response_cooldown_s: 60,
            context_limit: 100,
        }
    }
}

/// Global configuration, composed once in the Supervisor and handed to
/// every component at construction time (spec §9: no global singleton).
#[derive(Debug, Clone)]
pub struct Config {
    pub store_backend: StoreBackend,
    pub store_path: String,
    pub store_conn_string: Option<String>,

    pub generator_base_url: String,
    pub generator_default_model: String,
    pub generator_timeout_secs: u64,

    pub chat_client_id: String,
    pub chat_client_secret: String,
    pub chat_token_url: String,
    pub irc_server: String,
    pub irc_port: u16,
    pub irc_use_tls: bool,
    pub bot_username: String,
    pub channels: Vec<String>,
    pub known_other_bots: Vec<String>,

    pub filter_enabled: bool,
    pub blocked_terms_path: String,
    pub filter_strict: bool,

    pub default_thresholds: DefaultThresholds,

    pub retention_message_days: u32,
    pub retention_metric_days: u32,
    pub cleanup_interval_minutes: u64,

    pub token_encryption_key: Option<String>,

    pub log_level: String,
    pub log_format: LogFormat,
    pub log_file: Option<String>,

    pub reset_confirm_window_secs: u64,
    pub channel_queue_depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Structured subset of configuration that is more naturally expressed
/// as a file than as flat env vars (spec §6: channel list, known-other-
/// bots, default thresholds).
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    #[serde(default)]
    channels: Vec<String>,
    #[serde(default)]
    known_other_bots: Vec<String>,
    #[serde(default)]
    default_thresholds: Option<DefaultThresholds>,
}

impl Config {
    /// Load configuration: environment variables first, then an
    /// optional TOML file named by `CLANK_CONFIG` fills in anything the
    /// environment didn't set for the structured keys.
    pub fn load() -> Result<Self, String> {
        let file = env::var("CLANK_CONFIG")
            .ok()
            .map(|path| {
                let raw = std::fs::read_to_string(&path)
                    .map_err(|e| format!("reading {path}: {e}"))?;
                toml::from_str::<FileConfig>(&raw).map_err(|e| format!("parsing {path}: {e}"))
            })
            .transpose()?
            .unwrap_or_default();

        let store_backend = match env::var("STORE_BACKEND").as_deref() {
            Ok("postgres") => StoreBackend::Postgres,
            _ => StoreBackend::Sqlite,
        };

        let channels = env_csv("CHANNELS").unwrap_or(file.channels);
        let known_other_bots =
            env_csv("KNOWN_OTHER_BOTS").unwrap_or(file.known_other_bots);

        let default_thresholds = file.default_thresholds.unwrap_or_default();
        let mut default_thresholds = default_thresholds;
        if let Some(v) = env_parse("DEFAULT_MESSAGE_THRESHOLD") {
            default_thresholds.message_threshold = v;
        }
        if let Some(v) = env_parse("DEFAULT_SPONTANEOUS_COOLDOWN_S") {
            default_thresholds.spontaneous_cooldown_s = v;
        }
        if let Some(v) = env_parse("DEFAULT_RESPONSE_COOLDOWN_S") {
            default_thresholds.response_cooldown_s = v;
        }
        if let Some(v) = env_parse("DEFAULT_CONTEXT_LIMIT") {
            default_thresholds.context_limit = v;
        }

        let log_format = match env::var("LOG_FORMAT").as_deref() {
            Ok("json") => LogFormat::Json,
            _ => LogFormat::Text,
        };

        Ok(Config {
            store_backend,
            store_path: env::var("STORE_PATH").unwrap_or_else(|_| "data/clank.db".to_string()),
            store_conn_string: env::var("STORE_CONN_STRING").ok(),

            generator_base_url: env::var("GENERATOR_BASE_URL")
                .map_err(|_| "GENERATOR_BASE_URL is required".to_string())?,
            generator_default_model: env::var("GENERATOR_DEFAULT_MODEL")
                .map_err(|_| "GENERATOR_DEFAULT_MODEL is required".to_string())?,
            generator_timeout_secs: env_parse("GENERATOR_TIMEOUT_SECS").unwrap_or(30),

            chat_client_id: env::var("CHAT_CLIENT_ID").unwrap_or_default(),
            chat_client_secret: env::var("CHAT_CLIENT_SECRET").unwrap_or_default(),
            chat_token_url: env::var("CHAT_TOKEN_URL")
                .unwrap_or_else(|_| "https://id.twitch.tv/oauth2/token".to_string()),
            irc_server: env::var("IRC_SERVER").unwrap_or_else(|_| "irc.chat.twitch.tv".to_string()),
            irc_port: env_parse("IRC_PORT").unwrap_or(6697),
            irc_use_tls: env_parse::<u8>("IRC_USE_TLS").map(|v| v != 0).unwrap_or(true),
            bot_username: env::var("BOT_USERNAME")
                .map_err(|_| "BOT_USERNAME is required".to_string())?,
            channels,
            known_other_bots,

            filter_enabled: env_parse::<u8>("FILTER_ENABLED").map(|v| v != 0).unwrap_or(true),
            blocked_terms_path: env::var("BLOCKED_TERMS_PATH")
                .unwrap_or_else(|_| "config/blocked_terms.txt".to_string()),
            filter_strict: env_parse::<u8>("FILTER_STRICT").map(|v| v != 0).unwrap_or(false),

            default_thresholds,

            retention_message_days: env_parse("RETENTION_MESSAGE_DAYS").unwrap_or(30),
            retention_metric_days: env_parse("RETENTION_METRIC_DAYS").unwrap_or(14),
            cleanup_interval_minutes: env_parse("CLEANUP_INTERVAL_MINUTES").unwrap_or(60),

            token_encryption_key: env::var("CLANK_TOKEN_KEY").ok(),

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            log_format,
            log_file: env::var("LOG_FILE").ok(),

            reset_confirm_window_secs: env_parse("RESET_CONFIRM_WINDOW_SECS").unwrap_or(60),
            channel_queue_depth: env_parse("CHANNEL_QUEUE_DEPTH").unwrap_or(256),
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse::<T>().ok())
}

fn env_csv(key: &str) -> Option<Vec<String>> {
    env::var(key).ok().map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}
