//! Networked PostgreSQL backend. Same schema and contract as the
//! embedded store; kept behind a blocking `Mutex<postgres::Client>` so
//! it shares the embedded backend's concurrency shape rather than
//! introducing a pooled async driver as a second concurrency model.

use super::{AppendOutcome, CleanupResult, ConfigField, Store};
use crate::config::DefaultThresholds;
use crate::error::StoreError;
use crate::models::{AuthMaterial, ChannelConfig, Message, Metric};
use chrono::{DateTime, Utc};
use postgres::{Client, NoTls};
use std::sync::Mutex;

pub struct PostgresStore {
    client: Mutex<Client>,
}

impl PostgresStore {
    pub fn connect(conn_string: &str) -> Result<Self, StoreError> {
        let client = Client::connect(conn_string, NoTls)
            .map_err(|e| StoreError::Unavailable(format!("connecting: {e}")))?;
        let store = PostgresStore {
            client: Mutex::new(client),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let mut client = self.client.lock().unwrap();
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);

                CREATE TABLE IF NOT EXISTS messages (
                    message_id TEXT PRIMARY KEY,
                    channel TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    user_display_name TEXT NOT NULL,
                    content TEXT NOT NULL,
                    timestamp TIMESTAMPTZ NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_messages_channel_ts ON messages(channel, timestamp);
                CREATE INDEX IF NOT EXISTS idx_messages_user ON messages(channel, user_id);

                CREATE TABLE IF NOT EXISTS channel_configs (
                    channel TEXT PRIMARY KEY,
                    message_threshold INTEGER NOT NULL,
                    spontaneous_cooldown_s BIGINT NOT NULL,
                    response_cooldown_s BIGINT NOT NULL,
                    context_limit INTEGER NOT NULL,
                    model_name TEXT,
                    message_count INTEGER NOT NULL DEFAULT 0,
                    last_spontaneous_at TIMESTAMPTZ
                );

                CREATE TABLE IF NOT EXISTS user_cooldowns (
                    channel TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    last_response_at TIMESTAMPTZ NOT NULL,
                    PRIMARY KEY (channel, user_id)
                );

                CREATE TABLE IF NOT EXISTS auth_material (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    access_token BYTEA NOT NULL,
                    refresh_token BYTEA NOT NULL,
                    expires_at TIMESTAMPTZ NOT NULL,
                    bot_username TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS metrics (
                    channel TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    value DOUBLE PRECISION NOT NULL,
                    timestamp TIMESTAMPTZ NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_metrics_channel_kind_ts ON metrics(channel, kind, timestamp);
                ",
            )
            .map_err(|e| StoreError::Migration(e.to_string()))?;

        client
            .execute(
                "INSERT INTO schema_version (version)
                 SELECT 1 WHERE NOT EXISTS (SELECT 1 FROM schema_version)",
                &[],
            )
            .ok();
        Ok(())
    }

    fn ensure_channel_row(
        client: &mut Client,
        channel: &str,
        defaults: &DefaultThresholds,
    ) -> Result<(), StoreError> {
        client
            .execute(
                "INSERT INTO channel_configs
                 (channel, message_threshold, spontaneous_cooldown_s, response_cooldown_s, context_limit, model_name, message_count, last_spontaneous_at)
                 VALUES ($1, $2, $3, $4, $5, NULL, 0, NULL)
                 ON CONFLICT (channel) DO NOTHING",
                &[
                    &channel,
                    &(defaults.message_threshold as i32),
                    &(defaults.spontaneous_cooldown_s as i64),
                    &(defaults.response_cooldown_s as i64),
                    &(defaults.context_limit as i32),
                ],
            )
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

impl Store for PostgresStore {
    fn append_message(
        &self,
        msg: &Message,
        defaults: &DefaultThresholds,
    ) -> Result<AppendOutcome, StoreError> {
        let mut client = self.client.lock().unwrap();
        let mut tx = client
            .transaction()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Self::ensure_channel_row_tx(&mut tx, &msg.channel, defaults)?;

        let inserted = tx
            .execute(
                "INSERT INTO messages (message_id, channel, user_id, user_display_name, content, timestamp)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (message_id) DO NOTHING",
                &[
                    &msg.message_id,
                    &msg.channel,
                    &msg.user_id,
                    &msg.user_display_name,
                    &msg.content,
                    &msg.timestamp,
                ],
            )
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        if inserted == 0 {
            tx.commit().ok();
            return Ok(AppendOutcome::Duplicate);
        }

        tx.execute(
            "UPDATE channel_configs SET message_count = message_count + 1 WHERE channel = $1",
            &[&msg.channel],
        )
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let row = tx
            .query_one(
                "SELECT message_count FROM channel_configs WHERE channel = $1",
                &[&msg.channel],
            )
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let message_count: i32 = row.get(0);

        tx.commit().map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(AppendOutcome::Inserted {
            message_count: message_count as u32,
        })
    }

    fn recent_messages(&self, channel: &str, limit: u32) -> Result<Vec<Message>, StoreError> {
        let mut client = self.client.lock().unwrap();
        let rows = client
            .query(
                "SELECT message_id, channel, user_id, user_display_name, content, timestamp
                 FROM messages WHERE channel = $1 ORDER BY timestamp DESC LIMIT $2",
                &[&channel, &(limit as i64)],
            )
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut out: Vec<Message> = rows
            .iter()
            .map(|row| Message {
                message_id: row.get(0),
                channel: row.get(1),
                user_id: row.get(2),
                user_display_name: row.get(3),
                content: row.get(4),
                timestamp: row.get(5),
            })
            .collect();
        out.reverse();
        Ok(out)
    }

    fn count_recent(&self, channel: &str) -> Result<u32, StoreError> {
        let mut client = self.client.lock().unwrap();
        let row = client
            .query_one("SELECT COUNT(*) FROM messages WHERE channel = $1", &[&channel])
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let count: i64 = row.get(0);
        Ok(count as u32)
    }

    fn delete_by_message_id(&self, message_id: &str) -> Result<(), StoreError> {
        let mut client = self.client.lock().unwrap();
        client
            .execute("DELETE FROM messages WHERE message_id = $1", &[&message_id])
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn delete_by_user(&self, channel: &str, user_id: &str) -> Result<(), StoreError> {
        let mut client = self.client.lock().unwrap();
        client
            .execute(
                "DELETE FROM messages WHERE channel = $1 AND user_id = $2",
                &[&channel, &user_id],
            )
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn clear_channel(&self, channel: &str) -> Result<(), StoreError> {
        let mut client = self.client.lock().unwrap();
        client
            .execute("DELETE FROM messages WHERE channel = $1", &[&channel])
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn get_channel_config(
        &self,
        channel: &str,
        defaults: &DefaultThresholds,
    ) -> Result<ChannelConfig, StoreError> {
        let mut client = self.client.lock().unwrap();
        let row = client
            .query_opt(
                "SELECT channel, message_threshold, spontaneous_cooldown_s, response_cooldown_s,
                        context_limit, model_name, message_count, last_spontaneous_at
                 FROM channel_configs WHERE channel = $1",
                &[&channel],
            )
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(match row {
            Some(row) => {
                let threshold: i32 = row.get(1);
                let spontaneous: i64 = row.get(2);
                let response: i64 = row.get(3);
                let context: i32 = row.get(4);
                let count: i32 = row.get(6);
                let last_spontaneous_at: Option<DateTime<Utc>> = row.get(7);
                ChannelConfig {
                    channel: row.get(0),
                    message_threshold: threshold as u32,
                    spontaneous_cooldown_s: spontaneous as u64,
                    response_cooldown_s: response as u64,
                    context_limit: context as u32,
                    model_name: row.get(5),
                    message_count: count as u32,
                    last_spontaneous_at,
                }
            }
            None => ChannelConfig::defaults(channel, defaults),
        })
    }

    fn set_channel_config_field(
        &self,
        channel: &str,
        field: ConfigField,
        defaults: &DefaultThresholds,
    ) -> Result<(), StoreError> {
        let mut client = self.client.lock().unwrap();
        Self::ensure_channel_row(&mut client, channel, defaults)?;

        match field {
            ConfigField::MessageThreshold(v) => client.execute(
                "UPDATE channel_configs SET message_threshold = $1 WHERE channel = $2",
                &[&(v as i32), &channel],
            ),
            ConfigField::SpontaneousCooldownS(v) => client.execute(
                "UPDATE channel_configs SET spontaneous_cooldown_s = $1 WHERE channel = $2",
                &[&(v as i64), &channel],
            ),
            ConfigField::ResponseCooldownS(v) => client.execute(
                "UPDATE channel_configs SET response_cooldown_s = $1 WHERE channel = $2",
                &[&(v as i64), &channel],
            ),
            ConfigField::ContextLimit(v) => client.execute(
                "UPDATE channel_configs SET context_limit = $1 WHERE channel = $2",
                &[&(v as i32), &channel],
            ),
            ConfigField::ModelName(v) => client.execute(
                "UPDATE channel_configs SET model_name = $1 WHERE channel = $2",
                &[&v, &channel],
            ),
        }
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn reset_message_count(&self, channel: &str) -> Result<(), StoreError> {
        let mut client = self.client.lock().unwrap();
        client
            .execute(
                "UPDATE channel_configs SET message_count = 0 WHERE channel = $1",
                &[&channel],
            )
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn stamp_last_spontaneous(&self, channel: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut client = self.client.lock().unwrap();
        client
            .execute(
                "UPDATE channel_configs SET last_spontaneous_at = $1 WHERE channel = $2
                 AND (last_spontaneous_at IS NULL OR last_spontaneous_at < $1)",
                &[&at, &channel],
            )
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn list_configured_channels(&self) -> Result<Vec<String>, StoreError> {
        let mut client = self.client.lock().unwrap();
        let rows = client
            .query("SELECT channel FROM channel_configs", &[])
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    fn get_user_cooldown(
        &self,
        channel: &str,
        user_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let mut client = self.client.lock().unwrap();
        let row = client
            .query_opt(
                "SELECT last_response_at FROM user_cooldowns WHERE channel = $1 AND user_id = $2",
                &[&channel, &user_id],
            )
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(row.map(|r| r.get(0)))
    }

    fn stamp_user_cooldown(
        &self,
        channel: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut client = self.client.lock().unwrap();
        client
            .execute(
                "INSERT INTO user_cooldowns (channel, user_id, last_response_at) VALUES ($1, $2, $3)
                 ON CONFLICT (channel, user_id) DO UPDATE SET last_response_at = excluded.last_response_at",
                &[&channel, &user_id, &at],
            )
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn prune_cooldowns(&self, older_than_days: u32) -> Result<u64, StoreError> {
        let mut client = self.client.lock().unwrap();
        let cutoff = Utc::now() - chrono::Duration::days(older_than_days as i64);
        let n = client
            .execute("DELETE FROM user_cooldowns WHERE last_response_at < $1", &[&cutoff])
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(n)
    }

    fn get_auth(&self) -> Result<Option<AuthMaterial>, StoreError> {
        let mut client = self.client.lock().unwrap();
        let row = client
            .query_opt(
                "SELECT access_token, refresh_token, expires_at, bot_username FROM auth_material WHERE id = 1",
                &[],
            )
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        row.map(|row| {
            let access_token: Vec<u8> = row.get(0);
            let refresh_token: Vec<u8> = row.get(1);
            Ok(AuthMaterial {
                access_token: String::from_utf8(access_token)
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?,
                refresh_token: String::from_utf8(refresh_token)
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?,
                expires_at: row.get(2),
                bot_username: row.get(3),
            })
        })
        .transpose()
    }

    fn put_auth(&self, auth: &AuthMaterial) -> Result<(), StoreError> {
        let mut client = self.client.lock().unwrap();
        client
            .execute(
                "INSERT INTO auth_material (id, access_token, refresh_token, expires_at, bot_username)
                 VALUES (1, $1, $2, $3, $4)
                 ON CONFLICT (id) DO UPDATE SET access_token = excluded.access_token,
                     refresh_token = excluded.refresh_token, expires_at = excluded.expires_at,
                     bot_username = excluded.bot_username",
                &[
                    &auth.access_token.as_bytes(),
                    &auth.refresh_token.as_bytes(),
                    &auth.expires_at,
                    &auth.bot_username,
                ],
            )
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn record_metric(&self, metric: &Metric) -> Result<(), StoreError> {
        let mut client = self.client.lock().unwrap();
        client
            .execute(
                "INSERT INTO metrics (channel, kind, value, timestamp) VALUES ($1, $2, $3, $4)",
                &[&metric.channel, &metric.kind, &metric.value, &metric.timestamp],
            )
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn aggregate(&self, channel: &str, kind: &str, window_secs: i64) -> Result<f64, StoreError> {
        let mut client = self.client.lock().unwrap();
        let cutoff = Utc::now() - chrono::Duration::seconds(window_secs);
        let row = client
            .query_one(
                "SELECT COALESCE(SUM(value), 0.0) FROM metrics
                 WHERE channel = $1 AND kind = $2 AND timestamp >= $3",
                &[&channel, &kind, &cutoff],
            )
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(row.get(0))
    }

    fn cleanup(
        &self,
        retention_messages_days: u32,
        retention_metrics_days: u32,
    ) -> Result<CleanupResult, StoreError> {
        let mut client = self.client.lock().unwrap();
        let msg_cutoff = Utc::now() - chrono::Duration::days(retention_messages_days as i64);
        let metric_cutoff = Utc::now() - chrono::Duration::days(retention_metrics_days as i64);

        let mut messages_deleted = 0u64;
        loop {
            let n = client
                .execute(
                    "DELETE FROM messages WHERE message_id IN (
                        SELECT message_id FROM messages WHERE timestamp < $1 LIMIT 500
                    )",
                    &[&msg_cutoff],
                )
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            messages_deleted += n;
            if n < 500 {
                break;
            }
        }

        let metrics_deleted = client
            .execute("DELETE FROM metrics WHERE timestamp < $1", &[&metric_cutoff])
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(CleanupResult {
            messages_deleted,
            metrics_deleted,
        })
    }
}

impl PostgresStore {
    fn ensure_channel_row_tx(
        tx: &mut postgres::Transaction,
        channel: &str,
        defaults: &DefaultThresholds,
    ) -> Result<(), StoreError> {
        tx.execute(
            "INSERT INTO channel_configs
             (channel, message_threshold, spontaneous_cooldown_s, response_cooldown_s, context_limit, model_name, message_count, last_spontaneous_at)
             VALUES ($1, $2, $3, $4, $5, NULL, 0, NULL)
             ON CONFLICT (channel) DO NOTHING",
            &[
                &channel,
                &(defaults.message_threshold as i32),
                &(defaults.spontaneous_cooldown_s as i64),
                &(defaults.response_cooldown_s as i64),
                &(defaults.context_limit as i32),
            ],
        )
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }
}
