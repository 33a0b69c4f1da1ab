//! Embedded SQLite backend — the default Store. Schema and migration
//! style are carried over directly from the teacher's `db.rs`: a single
//! connection behind a `Mutex`, WAL mode, and additive `ALTER TABLE`
//! statements guarded with `.ok()` so repeated startups are idempotent.

use super::{AppendOutcome, CleanupResult, ConfigField, Store};
use crate::config::DefaultThresholds;
use crate::error::StoreError;
use crate::models::{AuthMaterial, ChannelConfig, Message, Metric};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Mutex;

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)
            .map_err(|e| StoreError::Unavailable(format!("opening {path}: {e}")))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let store = SqliteStore {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);

            CREATE TABLE IF NOT EXISTS messages (
                message_id TEXT PRIMARY KEY,
                channel TEXT NOT NULL,
                user_id TEXT NOT NULL,
                user_display_name TEXT NOT NULL,
                content TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_channel_ts ON messages(channel, timestamp);
            CREATE INDEX IF NOT EXISTS idx_messages_user ON messages(channel, user_id);

            CREATE TABLE IF NOT EXISTS channel_configs (
                channel TEXT PRIMARY KEY,
                message_threshold INTEGER NOT NULL,
                spontaneous_cooldown_s INTEGER NOT NULL,
                response_cooldown_s INTEGER NOT NULL,
                context_limit INTEGER NOT NULL,
                model_name TEXT,
                message_count INTEGER NOT NULL DEFAULT 0,
                last_spontaneous_at TEXT
            );

            CREATE TABLE IF NOT EXISTS user_cooldowns (
                channel TEXT NOT NULL,
                user_id TEXT NOT NULL,
                last_response_at TEXT NOT NULL,
                PRIMARY KEY (channel, user_id)
            );
            CREATE INDEX IF NOT EXISTS idx_cooldowns_last ON user_cooldowns(last_response_at);

            CREATE TABLE IF NOT EXISTS auth_material (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                access_token BLOB NOT NULL,
                refresh_token BLOB NOT NULL,
                nonce BLOB NOT NULL,
                encrypted INTEGER NOT NULL,
                expires_at TEXT NOT NULL,
                bot_username TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS metrics (
                channel TEXT NOT NULL,
                kind TEXT NOT NULL,
                value REAL NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_metrics_channel_kind_ts ON metrics(channel, kind, timestamp);
            ",
        )
        .map_err(|e| StoreError::Migration(e.to_string()))?;

        conn.execute(
            "INSERT INTO schema_version (version) SELECT 1 WHERE NOT EXISTS (SELECT 1 FROM schema_version)",
            [],
        )
        .ok();

        Ok(())
    }

    fn ensure_channel_row(
        conn: &Connection,
        channel: &str,
        defaults: &DefaultThresholds,
    ) -> Result<(), StoreError> {
        conn.execute(
            "INSERT OR IGNORE INTO channel_configs
             (channel, message_threshold, spontaneous_cooldown_s, response_cooldown_s, context_limit, model_name, message_count, last_spontaneous_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, 0, NULL)",
            params![
                channel,
                defaults.message_threshold,
                defaults.spontaneous_cooldown_s as i64,
                defaults.response_cooldown_s as i64,
                defaults.context_limit,
            ],
        )
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn row_to_channel_config(row: &rusqlite::Row) -> rusqlite::Result<ChannelConfig> {
        let last_spontaneous_at: Option<String> = row.get(7)?;
        Ok(ChannelConfig {
            channel: row.get(0)?,
            message_threshold: row.get(1)?,
            spontaneous_cooldown_s: {
                let v: i64 = row.get(2)?;
                v as u64
            },
            response_cooldown_s: {
                let v: i64 = row.get(3)?;
                v as u64
            },
            context_limit: row.get(4)?,
            model_name: row.get(5)?,
            message_count: row.get(6)?,
            last_spontaneous_at: last_spontaneous_at
                .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
                .map(|d| d.with_timezone(&Utc)),
        })
    }
}

impl Store for SqliteStore {
    fn append_message(
        &self,
        msg: &Message,
        defaults: &DefaultThresholds,
    ) -> Result<AppendOutcome, StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Self::ensure_channel_row(&tx, &msg.channel, defaults)?;

        let inserted = tx
            .execute(
                "INSERT OR IGNORE INTO messages (message_id, channel, user_id, user_display_name, content, timestamp)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    msg.message_id,
                    msg.channel,
                    msg.user_id,
                    msg.user_display_name,
                    msg.content,
                    msg.timestamp.to_rfc3339(),
                ],
            )
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        if inserted == 0 {
            tx.commit().ok();
            return Ok(AppendOutcome::Duplicate);
        }

        tx.execute(
            "UPDATE channel_configs SET message_count = message_count + 1 WHERE channel = ?1",
            params![msg.channel],
        )
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let message_count: u32 = tx
            .query_row(
                "SELECT message_count FROM channel_configs WHERE channel = ?1",
                params![msg.channel],
                |r| r.get(0),
            )
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        tx.commit().map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(AppendOutcome::Inserted { message_count })
    }

    fn recent_messages(&self, channel: &str, limit: u32) -> Result<Vec<Message>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT message_id, channel, user_id, user_display_name, content, timestamp
                 FROM messages WHERE channel = ?1 ORDER BY timestamp DESC LIMIT ?2",
            )
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut rows = stmt
            .query_map(params![channel, limit], |row| {
                let ts: String = row.get(5)?;
                Ok(Message {
                    message_id: row.get(0)?,
                    channel: row.get(1)?,
                    user_id: row.get(2)?,
                    user_display_name: row.get(3)?,
                    content: row.get(4)?,
                    timestamp: DateTime::parse_from_rfc3339(&ts)
                        .unwrap_or_default()
                        .with_timezone(&Utc),
                })
            })
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
            .filter_map(|r| r.ok())
            .collect::<Vec<_>>();

        rows.reverse(); // newest-last, per contract
        Ok(rows)
    }

    fn count_recent(&self, channel: &str) -> Result<u32, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE channel = ?1",
            params![channel],
            |r| r.get(0),
        )
        .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn delete_by_message_id(&self, message_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM messages WHERE message_id = ?1", params![message_id])
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn delete_by_user(&self, channel: &str, user_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM messages WHERE channel = ?1 AND user_id = ?2",
            params![channel, user_id],
        )
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn clear_channel(&self, channel: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM messages WHERE channel = ?1", params![channel])
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn get_channel_config(
        &self,
        channel: &str,
        defaults: &DefaultThresholds,
    ) -> Result<ChannelConfig, StoreError> {
        let conn = self.conn.lock().unwrap();
        let existing = conn
            .query_row(
                "SELECT channel, message_threshold, spontaneous_cooldown_s, response_cooldown_s,
                        context_limit, model_name, message_count, last_spontaneous_at
                 FROM channel_configs WHERE channel = ?1",
                params![channel],
                Self::row_to_channel_config,
            )
            .optional()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(existing.unwrap_or_else(|| ChannelConfig::defaults(channel, defaults)))
    }

    fn set_channel_config_field(
        &self,
        channel: &str,
        field: ConfigField,
        defaults: &DefaultThresholds,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::ensure_channel_row(&conn, channel, defaults)?;

        match field {
            ConfigField::MessageThreshold(v) => conn.execute(
                "UPDATE channel_configs SET message_threshold = ?1 WHERE channel = ?2",
                params![v, channel],
            ),
            ConfigField::SpontaneousCooldownS(v) => conn.execute(
                "UPDATE channel_configs SET spontaneous_cooldown_s = ?1 WHERE channel = ?2",
                params![v as i64, channel],
            ),
            ConfigField::ResponseCooldownS(v) => conn.execute(
                "UPDATE channel_configs SET response_cooldown_s = ?1 WHERE channel = ?2",
                params![v as i64, channel],
            ),
            ConfigField::ContextLimit(v) => conn.execute(
                "UPDATE channel_configs SET context_limit = ?1 WHERE channel = ?2",
                params![v, channel],
            ),
            ConfigField::ModelName(v) => conn.execute(
                "UPDATE channel_configs SET model_name = ?1 WHERE channel = ?2",
                params![v, channel],
            ),
        }
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn reset_message_count(&self, channel: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE channel_configs SET message_count = 0 WHERE channel = ?1",
            params![channel],
        )
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn stamp_last_spontaneous(&self, channel: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE channel_configs SET last_spontaneous_at = ?1 WHERE channel = ?2
             AND (last_spontaneous_at IS NULL OR last_spontaneous_at < ?1)",
            params![at.to_rfc3339(), channel],
        )
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn list_configured_channels(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare("SELECT channel FROM channel_configs")
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let rows = stmt
            .query_map([], |r| r.get(0))
            .map_err(|e| StoreError::Unavailable(e.to_string()))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    fn get_user_cooldown(
        &self,
        channel: &str,
        user_id: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let ts: Option<String> = conn
            .query_row(
                "SELECT last_response_at FROM user_cooldowns WHERE channel = ?1 AND user_id = ?2",
                params![channel, user_id],
                |r| r.get(0),
            )
            .optional()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(ts
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc)))
    }

    fn stamp_user_cooldown(
        &self,
        channel: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO user_cooldowns (channel, user_id, last_response_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(channel, user_id) DO UPDATE SET last_response_at = excluded.last_response_at",
            params![channel, user_id, at.to_rfc3339()],
        )
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn prune_cooldowns(&self, older_than_days: u32) -> Result<u64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let cutoff = (Utc::now() - chrono::Duration::days(older_than_days as i64)).to_rfc3339();
        let n = conn
            .execute(
                "DELETE FROM user_cooldowns WHERE last_response_at < ?1",
                params![cutoff],
            )
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(n as u64)
    }

    fn get_auth(&self) -> Result<Option<AuthMaterial>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT access_token, refresh_token, nonce, encrypted, expires_at, bot_username
             FROM auth_material WHERE id = 1",
            [],
            |row| {
                let access_token: Vec<u8> = row.get(0)?;
                let refresh_token: Vec<u8> = row.get(1)?;
                let expires_at: String = row.get(4)?;
                let bot_username: String = row.get(5)?;
                Ok((access_token, refresh_token, expires_at, bot_username))
            },
        )
        .optional()
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
        .map(|(access_token, refresh_token, expires_at, bot_username)| {
            Ok(AuthMaterial {
                access_token: String::from_utf8(access_token)
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?,
                refresh_token: String::from_utf8(refresh_token)
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?,
                expires_at: DateTime::parse_from_rfc3339(&expires_at)
                    .map_err(|e| StoreError::Unavailable(e.to_string()))?
                    .with_timezone(&Utc),
                bot_username,
            })
        })
        .transpose()
    }

    fn put_auth(&self, auth: &AuthMaterial) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        // Encryption is applied by the caller (auth module); here the
        // token fields already carry whatever bytes should be stored.
        conn.execute(
            "INSERT INTO auth_material (id, access_token, refresh_token, nonce, encrypted, expires_at, bot_username)
             VALUES (1, ?1, ?2, x'', 0, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET access_token = excluded.access_token,
                 refresh_token = excluded.refresh_token, expires_at = excluded.expires_at,
                 bot_username = excluded.bot_username",
            params![
                auth.access_token.as_bytes(),
                auth.refresh_token.as_bytes(),
                auth.expires_at.to_rfc3339(),
                auth.bot_username,
            ],
        )
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn record_metric(&self, metric: &Metric) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO metrics (channel, kind, value, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![metric.channel, metric.kind, metric.value, metric.timestamp.to_rfc3339()],
        )
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    fn aggregate(&self, channel: &str, kind: &str, window_secs: i64) -> Result<f64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let cutoff = (Utc::now() - chrono::Duration::seconds(window_secs)).to_rfc3339();
        conn.query_row(
            "SELECT COALESCE(SUM(value), 0.0) FROM metrics
             WHERE channel = ?1 AND kind = ?2 AND timestamp >= ?3",
            params![channel, kind, cutoff],
            |r| r.get(0),
        )
        .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn cleanup(
        &self,
        retention_messages_days: u32,
        retention_metrics_days: u32,
    ) -> Result<CleanupResult, StoreError> {
        let conn = self.conn.lock().unwrap();
        let msg_cutoff =
            (Utc::now() - chrono::Duration::days(retention_messages_days as i64)).to_rfc3339();
        let metric_cutoff =
            (Utc::now() - chrono::Duration::days(retention_metrics_days as i64)).to_rfc3339();

        // Bounded batches to avoid long locks, per spec §4.A.
        let mut messages_deleted = 0u64;
        loop {
            let n = conn
                .execute(
                    "DELETE FROM messages WHERE message_id IN (
                        SELECT message_id FROM messages WHERE timestamp < ?1 LIMIT 500
                    )",
                    params![msg_cutoff],
                )
                .map_err(|e| StoreError::Unavailable(e.to_string()))?;
            messages_deleted += n as u64;
            if n < 500 {
                break;
            }
        }

        let metrics_deleted = conn
            .execute("DELETE FROM metrics WHERE timestamp < ?1", params![metric_cutoff])
            .map_err(|e| StoreError::Unavailable(e.to_string()))? as u64;

        Ok(CleanupResult {
            messages_deleted,
            metrics_deleted,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SqliteStore {
        SqliteStore::open(":memory:").unwrap()
    }

    fn defaults() -> DefaultThresholds {
        DefaultThresholds::default()
    }

    fn msg(channel: &str, id: &str, user: &str) -> Message {
        Message {
            message_id: id.to_string(),
            channel: channel.to_string(),
            user_id: user.to_string(),
            user_display_name: user.to_string(),
            content: "hello".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn append_is_idempotent_on_message_id() {
        let s = store();
        let m = msg("c1", "m1", "u1");
        let first = s.append_message(&m, &defaults()).unwrap();
        assert_eq!(first, AppendOutcome::Inserted { message_count: 1 });
        let second = s.append_message(&m, &defaults()).unwrap();
        assert_eq!(second, AppendOutcome::Duplicate);
        assert_eq!(s.count_recent("c1").unwrap(), 1);
    }

    #[test]
    fn channel_isolation_holds() {
        let s = store();
        s.append_message(&msg("c1", "m1", "u1"), &defaults()).unwrap();
        s.append_message(&msg("c2", "m2", "u1"), &defaults()).unwrap();
        assert_eq!(s.recent_messages("c1", 10).unwrap().len(), 1);
        assert_eq!(s.recent_messages("c2", 10).unwrap().len(), 1);
        assert_eq!(s.count_recent("c1").unwrap(), 1);
    }

    #[test]
    fn delete_by_message_id_removes_it_permanently() {
        let s = store();
        s.append_message(&msg("c1", "m1", "u1"), &defaults()).unwrap();
        s.delete_by_message_id("m1").unwrap();
        assert!(s.recent_messages("c1", 10).unwrap().is_empty());
    }

    #[test]
    fn delete_by_user_purges_only_that_user() {
        let s = store();
        s.append_message(&msg("c1", "m1", "u1"), &defaults()).unwrap();
        s.append_message(&msg("c1", "m2", "u2"), &defaults()).unwrap();
        s.delete_by_user("c1", "u1").unwrap();
        let remaining = s.recent_messages("c1", 10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].user_id, "u2");
    }

    #[test]
    fn unknown_channel_config_synthesizes_defaults_without_persisting() {
        let s = store();
        let cfg = s.get_channel_config("never-seen", &defaults()).unwrap();
        assert_eq!(cfg.message_threshold, defaults().message_threshold);
        assert!(s.list_configured_channels().unwrap().is_empty());
    }

    #[test]
    fn set_config_field_persists_on_first_write() {
        let s = store();
        s.set_channel_config_field("c1", ConfigField::MessageThreshold(50), &defaults())
            .unwrap();
        let cfg = s.get_channel_config("c1", &defaults()).unwrap();
        assert_eq!(cfg.message_threshold, 50);
    }

    #[test]
    fn last_spontaneous_is_monotonic() {
        let s = store();
        s.append_message(&msg("c1", "m1", "u1"), &defaults()).unwrap();
        let t1 = Utc::now();
        let t0 = t1 - chrono::Duration::seconds(100);
        s.stamp_last_spontaneous("c1", t1).unwrap();
        s.stamp_last_spontaneous("c1", t0).unwrap();
        let cfg = s.get_channel_config("c1", &defaults()).unwrap();
        assert_eq!(cfg.last_spontaneous_at.unwrap().timestamp(), t1.timestamp());
    }

    #[test]
    fn user_cooldown_upsert() {
        let s = store();
        let t0 = Utc::now();
        s.stamp_user_cooldown("c1", "u1", t0).unwrap();
        assert_eq!(
            s.get_user_cooldown("c1", "u1").unwrap().unwrap().timestamp(),
            t0.timestamp()
        );
        let t1 = t0 + chrono::Duration::seconds(30);
        s.stamp_user_cooldown("c1", "u1", t1).unwrap();
        assert_eq!(
            s.get_user_cooldown("c1", "u1").unwrap().unwrap().timestamp(),
            t1.timestamp()
        );
    }

    #[test]
    fn cleanup_respects_retention_window() {
        let s = store();
        let old_msg = Message {
            timestamp: Utc::now() - chrono::Duration::days(40),
            ..msg("c1", "old", "u1")
        };
        s.append_message(&old_msg, &defaults()).unwrap();
        s.append_message(&msg("c1", "new", "u1"), &defaults()).unwrap();
        let result = s.cleanup(30, 30).unwrap();
        assert_eq!(result.messages_deleted, 1);
        let remaining = s.recent_messages("c1", 10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].message_id, "new");
    }
}
