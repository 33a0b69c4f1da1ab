//! Durable persistence (spec §4.A).
//!
//! One interface, two backends selected by configuration with no
//! runtime auto-fallback: an embedded SQLite file (default) and a
//! networked PostgreSQL connection. Both keep the teacher's concurrency
//! shape — a blocking connection behind a `Mutex`, with the async
//! boundary crossed via `spawn_blocking` rather than a second,
//! connection-pooled async driver — so Store I/O stays a single,
//! well-understood suspension point for the Processor.

mod postgres_store;
mod sqlite_store;

pub use postgres_store::PostgresStore;
pub use sqlite_store::SqliteStore;

use crate::config::DefaultThresholds;
use crate::error::StoreError;
use crate::models::{AuthMaterial, ChannelConfig, Message, Metric};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Result of an `append_message` call (spec §4.A: idempotent on
/// `message_id`). Carries the post-increment counter so the Processor
/// doesn't need a second round trip (invariant 2: atomic with append).
#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Inserted { message_count: u32 },
    Duplicate,
}

/// A single typed configuration field, as set by the Command Handler.
#[derive(Debug, Clone)]
pub enum ConfigField {
    MessageThreshold(u32),
    SpontaneousCooldownS(u64),
    ResponseCooldownS(u64),
    ContextLimit(u32),
    ModelName(Option<String>),
}

#[derive(Debug, Clone, Default)]
pub struct CleanupResult {
    pub messages_deleted: u64,
    pub metrics_deleted: u64,
}

/// Synchronous storage contract. Implementors serialize access
/// internally (a single connection behind a mutex); callers on the
/// async side must not invoke these from within a held async lock —
/// see `StoreHandle` for the `spawn_blocking` wrapper used everywhere
/// else in the crate.
pub trait Store: Send + Sync {
    fn append_message(
        &self,
        msg: &Message,
        defaults: &DefaultThresholds,
    ) -> Result<AppendOutcome, StoreError>;

    fn recent_messages(&self, channel: &str, limit: u32) -> Result<Vec<Message>, StoreError>;
    fn count_recent(&self, channel: &str) -> Result<u32, StoreError>;

    fn delete_by_message_id(&self, message_id: &str) -> Result<(), StoreError>;
    fn delete_by_user(&self, channel: &str, user_id: &str) -> Result<(), StoreError>;
    fn clear_channel(&self, channel: &str) -> Result<(), StoreError>;

    fn get_channel_config(
        &self,
        channel: &str,
        defaults: &DefaultThresholds,
    ) -> Result<ChannelConfig, StoreError>;
    fn set_channel_config_field(
        &self,
        channel: &str,
        field: ConfigField,
        defaults: &DefaultThresholds,
    ) -> Result<(), StoreError>;
    fn reset_message_count(&self, channel: &str) -> Result<(), StoreError>;
    fn stamp_last_spontaneous(&self, channel: &str, at: DateTime<Utc>) -> Result<(), StoreError>;
    fn list_configured_channels(&self) -> Result<Vec<String>, StoreError>;

    fn get_user_cooldown(
        &self,
        channel: &str,
        user_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;
    fn stamp_user_cooldown(
        &self,
        channel: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError>;
    fn prune_cooldowns(&self, older_than_days: u32) -> Result<u64, StoreError>;

    fn get_auth(&self) -> Result<Option<AuthMaterial>, StoreError>;
    fn put_auth(&self, auth: &AuthMaterial) -> Result<(), StoreError>;

    fn record_metric(&self, metric: &Metric) -> Result<(), StoreError>;
    fn aggregate(&self, channel: &str, kind: &str, window_secs: i64) -> Result<f64, StoreError>;

    fn cleanup(
        &self,
        retention_messages_days: u32,
        retention_metrics_days: u32,
    ) -> Result<CleanupResult, StoreError>;
}

/// Async-friendly wrapper around a `Store`: every call is dispatched to
/// the blocking thread pool so the per-channel serialization token is
/// never held across real I/O, per spec §5.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<dyn Store>,
}

impl StoreHandle {
    pub fn new(inner: Arc<dyn Store>) -> Self {
        StoreHandle { inner }
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Store) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = self.inner.clone();
        match tokio::task::spawn_blocking(move || f(inner.as_ref())).await {
            Ok(result) => result,
            Err(e) => Err(StoreError::Unavailable(format!("store task panicked: {e}"))),
        }
    }

    pub async fn append_message(
        &self,
        msg: Message,
        defaults: DefaultThresholds,
    ) -> Result<AppendOutcome, StoreError> {
        self.run(move |s| s.append_message(&msg, &defaults)).await
    }

    pub async fn recent_messages(
        &self,
        channel: String,
        limit: u32,
    ) -> Result<Vec<Message>, StoreError> {
        self.run(move |s| s.recent_messages(&channel, limit)).await
    }

    pub async fn count_recent(&self, channel: String) -> Result<u32, StoreError> {
        self.run(move |s| s.count_recent(&channel)).await
    }

    pub async fn delete_by_message_id(&self, message_id: String) -> Result<(), StoreError> {
        self.run(move |s| s.delete_by_message_id(&message_id)).await
    }

    pub async fn delete_by_user(&self, channel: String, user_id: String) -> Result<(), StoreError> {
        self.run(move |s| s.delete_by_user(&channel, &user_id)).await
    }

    pub async fn clear_channel(&self, channel: String) -> Result<(), StoreError> {
        self.run(move |s| s.clear_channel(&channel)).await
    }

    pub async fn get_channel_config(
        &self,
        channel: String,
        defaults: DefaultThresholds,
    ) -> Result<ChannelConfig, StoreError> {
        self.run(move |s| s.get_channel_config(&channel, &defaults))
            .await
    }

    pub async fn set_channel_config_field(
        &self,
        channel: String,
        field: ConfigField,
        defaults: DefaultThresholds,
    ) -> Result<(), StoreError> {
        self.run(move |s| s.set_channel_config_field(&channel, field, &defaults))
            .await
    }

    pub async fn reset_message_count(&self, channel: String) -> Result<(), StoreError> {
        self.run(move |s| s.reset_message_count(&channel)).await
    }

    pub async fn stamp_last_spontaneous(
        &self,
        channel: String,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.run(move |s| s.stamp_last_spontaneous(&channel, at))
            .await
    }

    pub async fn list_configured_channels(&self) -> Result<Vec<String>, StoreError> {
        self.run(|s| s.list_configured_channels()).await
    }

    pub async fn get_user_cooldown(
        &self,
        channel: String,
        user_id: String,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.run(move |s| s.get_user_cooldown(&channel, &user_id))
            .await
    }

    pub async fn stamp_user_cooldown(
        &self,
        channel: String,
        user_id: String,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.run(move |s| s.stamp_user_cooldown(&channel, &user_id, at))
            .await
    }

    pub async fn prune_cooldowns(&self, older_than_days: u32) -> Result<u64, StoreError> {
        self.run(move |s| s.prune_cooldowns(older_than_days)).await
    }

    pub async fn get_auth(&self) -> Result<Option<AuthMaterial>, StoreError> {
        self.run(|s| s.get_auth()).await
    }

    pub async fn put_auth(&self, auth: AuthMaterial) -> Result<(), StoreError> {
        self.run(move |s| s.put_auth(&auth)).await
    }

    pub async fn record_metric(&self, metric: Metric) -> Result<(), StoreError> {
        self.run(move |s| s.record_metric(&metric)).await
    }

    pub async fn aggregate(
        &self,
        channel: String,
        kind: String,
        window_secs: i64,
    ) -> Result<f64, StoreError> {
        self.run(move |s| s.aggregate(&channel, &kind, window_secs))
            .await
    }

    pub async fn cleanup(
        &self,
        retention_messages_days: u32,
        retention_metrics_days: u32,
    ) -> Result<CleanupResult, StoreError> {
        self.run(move |s| s.cleanup(retention_messages_days, retention_metrics_days))
            .await
    }
}
