//! `!clank <key> [value]` privileged command surface (spec §4.E).
//!
//! Recognised only from senders carrying the broadcaster or moderator
//! capability; anyone else's command is dropped silently. Confirmation
//! and error lines go through `Egress` directly — operator output, not
//! generated content, so it is never run through the Filter and never
//! touches counters or cooldowns.

use crate::channel_state::ChannelStateTable;
use crate::egress::Egress;
use crate::generator::GeneratorClient;
use crate::models::{Badge, InboundEvent};
use crate::store::ConfigField;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

const COMMAND_PREFIX: &str = "!clank";

struct PendingReset {
    user_id: String,
    requested_at: DateTime<Utc>,
}

pub struct CommandHandler {
    channel_state: std::sync::Arc<ChannelStateTable>,
    generator: std::sync::Arc<GeneratorClient>,
    reset_confirm_window_secs: u64,
    pending_resets: Mutex<HashMap<String, PendingReset>>,
}

impl CommandHandler {
    pub fn new(
        channel_state: std::sync::Arc<ChannelStateTable>,
        generator: std::sync::Arc<GeneratorClient>,
        reset_confirm_window_secs: u64,
    ) -> Self {
        CommandHandler {
            channel_state,
            generator,
            reset_confirm_window_secs,
            pending_resets: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if `event` was recognised and fully handled as a
    /// command (including silently-dropped cases) — the Processor must
    /// not continue on to the user-message path. Returns `false` if the
    /// content does not match the command form at all.
    pub async fn try_handle(&self, event: &InboundEvent, egress: &dyn Egress) -> bool {
        let Some((key, value)) = parse_command(&event.content) else {
            return false;
        };

        let privileged = event.author_badges.contains(&Badge::Broadcaster)
            || event.author_badges.contains(&Badge::Moderator);
        if !privileged {
            return true;
        }

        let Some(author_id) = event.author_id.as_deref() else {
            return true;
        };

        self.dispatch(&event.channel, author_id, &key, value.as_deref(), egress)
            .await;
        true
    }

    async fn dispatch(
        &self,
        channel: &str,
        author_id: &str,
        key: &str,
        value: Option<&str>,
        egress: &dyn Egress,
    ) {
        match key {
            "threshold" => {
                self.numeric_field(channel, value, 5, 200, egress, |v| {
                    ConfigField::MessageThreshold(v)
                }, |s| s.message_threshold, "threshold")
                .await
            }
            "spontaneous" => {
                self.numeric_field(channel, value, 60, 3600, egress, |v| {
                    ConfigField::SpontaneousCooldownS(v as u64)
                }, |s| s.spontaneous_cooldown_s as u32, "spontaneous")
                .await
            }
            "response" => {
                self.numeric_field(channel, value, 10, 1800, egress, |v| {
                    ConfigField::ResponseCooldownS(v as u64)
                }, |s| s.response_cooldown_s as u32, "response")
                .await
            }
            "context" => {
                self.numeric_field(channel, value, 50, 500, egress, |v| {
                    ConfigField::ContextLimit(v)
                }, |s| s.context_limit, "context")
                .await
            }
            "model" => self.model_command(channel, value, egress).await,
            "models" => self.models_command(channel, egress).await,
            "status" => self.status_command(channel, egress).await,
            "reset" => {
                self.reset_command(channel, author_id, value, egress)
                    .await
            }
            _ => {
                egress
                    .send(channel, &format!("unknown command key {key:?}"))
                    .await
            }
        }
    }

    async fn numeric_field(
        &self,
        channel: &str,
        value: Option<&str>,
        min: u32,
        max: u32,
        egress: &dyn Egress,
        to_field: impl FnOnce(u32) -> ConfigField,
        current: impl FnOnce(&crate::channel_state::ChannelStateEntry) -> u32,
        name: &str,
    ) {
        let Some(snapshot) = self.channel_state.snapshot(channel) else {
            egress.send(channel, "channel not yet known").await;
            return;
        };

        match value {
            None => {
                egress
                    .send(channel, &format!("{name} = {}", current(&snapshot)))
                    .await;
            }
            Some(raw) => match raw.parse::<u32>() {
                Ok(v) if v >= min && v <= max => {
                    match self.channel_state.set_field(channel, to_field(v)).await {
                        Ok(()) => egress.send(channel, &format!("{name} set to {v}")).await,
                        Err(_) => egress.send(channel, "failed to persist setting").await,
                    }
                }
                Ok(v) => {
                    egress
                        .send(
                            channel,
                            &format!("{name} must be between {min} and {max} (got {v})"),
                        )
                        .await
                }
                Err(_) => {
                    egress
                        .send(channel, &format!("{name} requires a numeric value"))
                        .await
                }
            },
        }
    }

    async fn model_command(&self, channel: &str, value: Option<&str>, egress: &dyn Egress) {
        let Some(snapshot) = self.channel_state.snapshot(channel) else {
            egress.send(channel, "channel not yet known").await;
            return;
        };

        match value {
            None => {
                let current = snapshot.model_name.unwrap_or_else(|| "default".to_string());
                egress.send(channel, &format!("model = {current}")).await;
            }
            Some(name) => match self.generator.list_models().await {
                Ok(catalog) => {
                    if catalog.iter().any(|m| m == name) {
                        match self
                            .channel_state
                            .set_field(channel, ConfigField::ModelName(Some(name.to_string())))
                            .await
                        {
                            Ok(()) => egress.send(channel, &format!("model set to {name}")).await,
                            Err(_) => egress.send(channel, "failed to persist setting").await,
                        }
                    } else {
                        egress
                            .send(channel, &format!("model {name:?} is not in the catalog"))
                            .await;
                    }
                }
                Err(_) => egress.send(channel, "generator catalog is unavailable").await,
            },
        }
    }

    async fn models_command(&self, channel: &str, egress: &dyn Egress) {
        match self.generator.list_models().await {
            Ok(catalog) => egress.send(channel, &catalog.join(", ")).await,
            Err(_) => egress.send(channel, "generator catalog is unavailable").await,
        }
    }

    async fn status_command(&self, channel: &str, egress: &dyn Egress) {
        let Some(snapshot) = self.channel_state.snapshot(channel) else {
            egress.send(channel, "channel not yet known").await;
            return;
        };
        let generator_available = self.generator.is_available().await;
        egress
            .send(
                channel,
                &format!(
                    "messages {}/{}, model {}, generator {}",
                    snapshot.message_count,
                    snapshot.message_threshold,
                    snapshot.model_name.as_deref().unwrap_or("default"),
                    if generator_available { "up" } else { "down" }
                ),
            )
            .await;
    }

    async fn reset_command(
        &self,
        channel: &str,
        author_id: &str,
        value: Option<&str>,
        egress: &dyn Egress,
    ) {
        match value {
            Some(v) if v.eq_ignore_ascii_case("confirm") => {
                let pending = self.pending_resets.lock().unwrap().remove(channel);
                let window = chrono::Duration::seconds(self.reset_confirm_window_secs as i64);
                match pending {
                    Some(p) if p.user_id == author_id && Utc::now() - p.requested_at <= window => {
                        let defaults = crate::config::DefaultThresholds::default();
                        let fields = [
                            ConfigField::MessageThreshold(defaults.message_threshold),
                            ConfigField::SpontaneousCooldownS(defaults.spontaneous_cooldown_s),
                            ConfigField::ResponseCooldownS(defaults.response_cooldown_s),
                            ConfigField::ContextLimit(defaults.context_limit),
                            ConfigField::ModelName(None),
                        ];
                        let mut failed = false;
                        for field in fields {
                            if self.channel_state.set_field(channel, field).await.is_err() {
                                failed = true;
                                break;
                            }
                        }
                        if failed {
                            egress.send(channel, "failed to reset channel").await;
                        } else {
                            egress.send(channel, "channel reset to defaults").await;
                        }
                    }
                    _ => {
                        egress
                            .send(channel, "no pending reset to confirm, or it expired")
                            .await;
                    }
                }
            }
            Some(_) => {
                egress
                    .send(channel, "reset accepts no value other than \"confirm\"")
                    .await;
            }
            None => {
                self.pending_resets.lock().unwrap().insert(
                    channel.to_string(),
                    PendingReset {
                        user_id: author_id.to_string(),
                        requested_at: Utc::now(),
                    },
                );
                egress
                    .send(
                        channel,
                        &format!(
                            "send \"{COMMAND_PREFIX} reset confirm\" within \
                             {}s to confirm",
                            self.reset_confirm_window_secs
                        ),
                    )
                    .await;
            }
        }
    }
}

/// Parses `!clank <key> [value]` into `(key, value)`. Returns `None` if
/// `text` does not start with the command prefix.
fn parse_command(text: &str) -> Option<(String, Option<String>)> {
    let mut tokens = text.trim().split_whitespace();
    let head = tokens.next()?;
    if !head.eq_ignore_ascii_case(COMMAND_PREFIX) {
        return None;
    }
    let key = tokens.next()?.to_lowercase();
    let rest: Vec<&str> = tokens.collect();
    let value = if rest.is_empty() {
        None
    } else {
        Some(rest.join(" "))
    };
    Some((key, value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_and_value() {
        let (key, value) = parse_command("!clank threshold 42").unwrap();
        assert_eq!(key, "threshold");
        assert_eq!(value.as_deref(), Some("42"));
    }

    #[test]
    fn parses_get_form_with_no_value() {
        let (key, value) = parse_command("!clank status").unwrap();
        assert_eq!(key, "status");
        assert_eq!(value, None);
    }

    #[test]
    fn non_command_text_is_not_recognised() {
        assert_eq!(parse_command("hey clank, how are you"), None);
    }

    #[test]
    fn reset_confirm_is_two_word_value() {
        let (key, value) = parse_command("!clank reset confirm").unwrap();
        assert_eq!(key, "reset");
        assert_eq!(value.as_deref(), Some("confirm"));
    }
}
