//! The central coordinator (spec §4.F). One `Processor` per channel;
//! channels are independent and may run concurrently, but within a
//! channel events are handled in arrival order from this channel's
//! own bounded queue.

use crate::channel_state::ChannelStateTable;
use crate::commands::CommandHandler;
use crate::config::DefaultThresholds;
use crate::egress::Egress;
use crate::filter::{Filter, Verdict};
use crate::generator::GeneratorClient;
use crate::models::{EventKind, InboundEvent, Message, Metric, metric_kind};
use crate::store::StoreHandle;
use chrono::Utc;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex as AsyncMutex, Notify, RwLock};
use tracing::warn;
use uuid::Uuid;

/// Bounded per-channel event queue with a drop-oldest backpressure
/// policy (spec §5): the newest event always wins a spot, the oldest
/// queued event is evicted when the queue is full.
pub struct ChannelQueue {
    inner: std::sync::Mutex<VecDeque<InboundEvent>>,
    notify: Notify,
    depth: usize,
}

impl ChannelQueue {
    pub fn new(depth: usize) -> Self {
        ChannelQueue {
            inner: std::sync::Mutex::new(VecDeque::with_capacity(depth)),
            notify: Notify::new(),
            depth,
        }
    }

    /// Returns `true` if an older event was dropped to make room.
    pub fn push(&self, event: InboundEvent) -> bool {
        let mut dropped = false;
        {
            let mut queue = self.inner.lock().unwrap();
            if queue.len() >= self.depth {
                queue.pop_front();
                dropped = true;
            }
            queue.push_back(event);
        }
        self.notify.notify_one();
        dropped
    }

    pub async fn pop(&self) -> InboundEvent {
        loop {
            if let Some(event) = self.inner.lock().unwrap().pop_front() {
                return event;
            }
            self.notify.notified().await;
        }
    }
}

pub struct Processor {
    channel: String,
    bot_username: String,
    known_other_bots: HashSet<String>,
    store: StoreHandle,
    channel_state: Arc<ChannelStateTable>,
    filter: Arc<RwLock<Filter>>,
    generator: Arc<GeneratorClient>,
    commands: Arc<CommandHandler>,
    egress: Arc<dyn Egress>,
    defaults: DefaultThresholds,
    serialize: AsyncMutex<()>,
}

impl Processor {
    pub fn new(
        channel: String,
        bot_username: String,
        known_other_bots: &[String],
        store: StoreHandle,
        channel_state: Arc<ChannelStateTable>,
        filter: Arc<RwLock<Filter>>,
        generator: Arc<GeneratorClient>,
        commands: Arc<CommandHandler>,
        egress: Arc<dyn Egress>,
        defaults: DefaultThresholds,
    ) -> Self {
        Processor {
            channel,
            bot_username: bot_username.to_lowercase(),
            known_other_bots: known_other_bots.iter().map(|s| s.to_lowercase()).collect(),
            store,
            channel_state,
            filter,
            generator,
            commands,
            egress,
            defaults,
            serialize: AsyncMutex::new(()),
        }
    }

    /// Drains `queue` until `shutdown` fires, handling one event at a
    /// time in arrival order.
    pub async fn run(self: Arc<Self>, queue: Arc<ChannelQueue>, shutdown: tokio_util::sync::CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = queue.pop() => {
                    self.handle_event(event).await;
                }
            }
        }
    }

    pub async fn handle_event(&self, event: InboundEvent) {
        match &event.kind {
            EventKind::Delete { message_id } => {
                let _ = self.store.delete_by_message_id(message_id.clone()).await;
                return;
            }
            EventKind::UserClear { user_id } => {
                let _ = self
                    .store
                    .delete_by_user(self.channel.clone(), user_id.clone())
                    .await;
                return;
            }
            EventKind::ChannelClear => {
                let _ = self.store.clear_channel(self.channel.clone()).await;
                return;
            }
            EventKind::System => return,
            EventKind::Message => {}
        }

        let Some(author_display) = event.author_display_name.as_deref() else {
            return;
        };
        if author_display.eq_ignore_ascii_case(&self.bot_username)
            || self.known_other_bots.contains(&author_display.to_lowercase())
        {
            return;
        }

        let Some(author_id) = event.author_id.clone() else {
            return;
        };

        if self.commands.try_handle(&event, self.egress.as_ref()).await {
            return;
        }

        self.handle_user_message(event, author_id).await;
    }

    async fn handle_user_message(&self, event: InboundEvent, author_id: String) {
        let verdict = self.filter.read().await.classify(&event.content);
        if verdict == Verdict::Blocked {
            self.record_metric(metric_kind::FILTER_BLOCK_INPUT, 1.0).await;
            return;
        }

        let mention = is_mentioned(&event.content, &self.bot_username);

        let message = Message {
            message_id: event
                .message_id
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            channel: self.channel.clone(),
            user_id: author_id.clone(),
            user_display_name: event
                .author_display_name
                .clone()
                .unwrap_or_else(|| author_id.clone()),
            content: event.content.clone(),
            timestamp: event.timestamp,
        };

        let message_count = {
            let _guard = self.serialize.lock().await;
            match self
                .store
                .append_message(message.clone(), self.defaults)
                .await
            {
                Ok(outcome) => match outcome {
                    crate::store::AppendOutcome::Inserted { message_count } => {
                        self.channel_state
                            .observe_message_count(&self.channel, message_count);
                        message_count
                    }
                    crate::store::AppendOutcome::Duplicate => return,
                },
                Err(_) => return,
            }
        };

        let Some(state) = self.channel_state.snapshot(&self.channel) else {
            return;
        };

        let mut mention_path_taken = false;
        if mention {
            let last = self
                .store
                .get_user_cooldown(self.channel.clone(), author_id.clone())
                .await
                .unwrap_or(None);
            let elapsed = match last {
                Some(t) => {
                    Utc::now().signed_duration_since(t).num_seconds()
                        >= state.response_cooldown_s as i64
                }
                None => true,
            };
            if elapsed {
                mention_path_taken = true;
                self.try_response(&state, &author_id, &message).await;
            }
        }

        if !mention || !mention_path_taken {
            self.try_spontaneous(&state, message_count).await;
        }
    }

    async fn try_response(
        &self,
        state: &crate::channel_state::ChannelStateEntry,
        author_id: &str,
        incoming: &Message,
    ) {
        if state.context_limit == 0 {
            return;
        }
        let recent = self
            .store
            .recent_messages(self.channel.clone(), state.context_limit)
            .await
            .unwrap_or_default();
        let model = state.model_name.clone().unwrap_or_default();

        let sent = match self
            .generator
            .generate_response(
                &model,
                &recent,
                &incoming.user_display_name,
                &incoming.content,
                500,
            )
            .await
        {
            Ok(text) => self.emit(&text, metric_kind::RESPONSE_EMITTED).await,
            Err(crate::error::GeneratorError::Invalid) => {
                self.record_metric(metric_kind::GENERATOR_INVALID, 1.0).await;
                return;
            }
            Err(_) => {
                self.record_metric(metric_kind::GENERATOR_UNAVAILABLE, 1.0)
                    .await;
                return;
            }
        };

        if !sent {
            return;
        }

        let _guard = self.serialize.lock().await;
        let _ = self
            .store
            .stamp_user_cooldown(self.channel.clone(), author_id.to_string(), Utc::now())
            .await;
    }

    async fn try_spontaneous(&self, state: &crate::channel_state::ChannelStateEntry, message_count: u32) {
        if state.context_limit == 0 {
            return;
        }
        if message_count < state.message_threshold {
            return;
        }
        if let Some(last) = state.last_spontaneous_at {
            if Utc::now().signed_duration_since(last).num_seconds()
                < state.spontaneous_cooldown_s as i64
            {
                return;
            }
        }
        let available = self
            .store
            .count_recent(self.channel.clone())
            .await
            .unwrap_or(0);
        if available < 10 {
            return;
        }

        let recent = self
            .store
            .recent_messages(self.channel.clone(), state.context_limit)
            .await
            .unwrap_or_default();
        let model = state.model_name.clone().unwrap_or_default();

        let text = match self
            .generator
            .generate_spontaneous(&model, &recent, 500)
            .await
        {
            Ok(text) => text,
            Err(crate::error::GeneratorError::Invalid) => {
                self.record_metric(metric_kind::GENERATOR_INVALID, 1.0).await;
                return;
            }
            Err(_) => {
                self.record_metric(metric_kind::GENERATOR_UNAVAILABLE, 1.0)
                    .await;
                return;
            }
        };

        let sent = self.emit(&text, metric_kind::SPONTANEOUS_EMITTED).await;
        if sent {
            let _guard = self.serialize.lock().await;
            let now = Utc::now();
            let _ = self
                .channel_state
                .stamp_last_spontaneous(&self.channel, now)
                .await;
            let _ = self.channel_state.reset_message_count(&self.channel).await;
        }
    }

    /// Output-filters `text` before sending; returns whether it was
    /// actually sent.
    async fn emit(&self, text: &str, success_metric: &str) -> bool {
        let verdict = self.filter.read().await.classify(text);
        if verdict == Verdict::Blocked {
            warn!(channel = %self.channel, content = %text, "blocked generated output on egress");
            self.record_metric(metric_kind::FILTER_BLOCK_OUTPUT, 1.0)
                .await;
            return false;
        }
        self.egress.send(&self.channel, text).await;
        self.record_metric(success_metric, 1.0).await;
        true
    }

    async fn record_metric(&self, kind: &str, value: f64) {
        let metric = Metric {
            channel: self.channel.clone(),
            kind: kind.to_string(),
            value,
            timestamp: Utc::now(),
        };
        let _ = self.store.record_metric(metric).await;
    }
}

/// `@<bot>` at the start, or `<bot>` as the first token, case-insensitive.
fn is_mentioned(content: &str, bot_username_lower: &str) -> bool {
    let Some(first) = content.trim().split_whitespace().next() else {
        return false;
    };
    let first_lower = first.to_lowercase();
    if let Some(stripped) = first_lower.strip_prefix('@') {
        stripped.trim_end_matches(|c: char| !c.is_alphanumeric() && c != '_') == bot_username_lower
    } else {
        first_lower.trim_end_matches(|c: char| !c.is_alphanumeric() && c != '_') == bot_username_lower
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mention_matches_at_prefix_case_insensitive() {
        assert!(is_mentioned("@Clank hi there", "clank"));
    }

    #[test]
    fn mention_matches_leading_token_with_punctuation() {
        assert!(is_mentioned("clank, how are you", "clank"));
    }

    #[test]
    fn non_leading_mention_does_not_count() {
        assert!(!is_mentioned("hey have you seen clank", "clank"));
    }

    #[test]
    fn queue_drops_oldest_when_full() {
        let q = ChannelQueue::new(1);
        let e1 = InboundEvent {
            channel: "c".into(),
            author_id: Some("u1".into()),
            author_display_name: Some("u1".into()),
            author_badges: Default::default(),
            message_id: Some("1".into()),
            content: "first".into(),
            timestamp: Utc::now(),
            kind: EventKind::Message,
        };
        let mut e2 = e1.clone();
        e2.message_id = Some("2".into());
        e2.content = "second".into();

        assert!(!q.push(e1));
        assert!(q.push(e2));
    }
}
