//! Lifecycle: startup validation, reconnection policy, signal-driven
//! graceful shutdown, periodic cleanup (spec §4.G).

use crate::auth::AuthManager;
use crate::channel_state::ChannelStateTable;
use crate::commands::CommandHandler;
use crate::config::{Config, StoreBackend};
use crate::egress::Egress;
use crate::error::StartupError;
use crate::filter::Filter;
use crate::generator::GeneratorClient;
use crate::irc_adapter::{IrcAdapter, IrcConfig};
use crate::processor::{ChannelQueue, Processor};
use crate::store::{PostgresStore, SqliteStore, Store, StoreHandle};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

struct IrcEgress {
    adapter: Arc<IrcAdapter>,
}

#[async_trait]
impl Egress for IrcEgress {
    async fn send(&self, channel: &str, text: &str) {
        self.adapter.send(channel, text).await;
    }
}

pub struct Supervisor {
    config: Config,
}

impl Supervisor {
    pub fn new(config: Config) -> Self {
        Supervisor { config }
    }

    pub async fn run(self) -> Result<(), StartupError> {
        let config = self.config;

        // Step 1: global defaults are already folded into `config`.
        let defaults = config.default_thresholds;

        // Step 2: open Store, verify schema, run migrations.
        let store: Arc<dyn Store> = match config.store_backend {
            StoreBackend::Sqlite => Arc::new(SqliteStore::open(&config.store_path)?),
            StoreBackend::Postgres => Arc::new(PostgresStore::connect(
                config
                    .store_conn_string
                    .as_deref()
                    .ok_or_else(|| StartupError::Config("STORE_CONN_STRING is required for postgres".to_string()))?,
            )?),
        };
        let store = StoreHandle::new(store);
        info!(backend = ?config.store_backend, "store ready");

        // Step 3: load AuthMaterial, refresh once if expired.
        let auth_manager = AuthManager::new(store.clone(), &config)?;
        let auth = auth_manager.load_or_refresh().await?;
        info!(bot = %auth.bot_username, "auth material ready");

        // Step 4: probe Generator, validate the default model.
        let generator = Arc::new(GeneratorClient::new(
            &config.generator_base_url,
            config.generator_timeout_secs,
        ));
        generator
            .validate_startup_model(&config.generator_default_model)
            .await?;
        info!(model = %config.generator_default_model, "generator catalog validated");

        let filter = Arc::new(RwLock::new(Filter::load(
            std::path::Path::new(&config.blocked_terms_path),
            config.filter_strict,
            config.filter_enabled,
        )));

        let channel_state = Arc::new(ChannelStateTable::new(store.clone(), defaults));
        channel_state.restore(&config.channels).await?;

        let command_handler = Arc::new(CommandHandler::new(
            channel_state.clone(),
            generator.clone(),
            config.reset_confirm_window_secs,
        ));

        // Step 5/6: connect to chat, join channels, per-channel queues.
        let mut queues = HashMap::new();
        for channel in &config.channels {
            queues.insert(channel.clone(), Arc::new(ChannelQueue::new(config.channel_queue_depth)));
        }

        let irc_adapter = Arc::new(IrcAdapter::new(
            IrcConfig {
                server: config.irc_server.clone(),
                port: config.irc_port,
                use_tls: config.irc_use_tls,
                nickname: config.bot_username.clone(),
                channels: config.channels.clone(),
            },
            queues.clone(),
            store.clone(),
        ));

        let egress: Arc<dyn Egress> = Arc::new(IrcEgress {
            adapter: irc_adapter.clone(),
        });

        let shutdown = CancellationToken::new();

        let irc_handle = {
            let adapter = irc_adapter.clone();
            let token = auth.access_token.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { adapter.run(token, shutdown).await })
        };

        // Step 7: periodic cleanup task.
        let cleanup_handle = {
            let store = store.clone();
            let shutdown = shutdown.clone();
            let interval = config.cleanup_interval_minutes;
            let retention_message_days = config.retention_message_days;
            let retention_metric_days = config.retention_metric_days;
            tokio::spawn(async move {
                run_cleanup_loop(store, interval, retention_message_days, retention_metric_days, shutdown).await
            })
        };

        // Step 8: per-channel processing loops.
        let mut processor_handles = Vec::new();
        for channel in &config.channels {
            let processor = Arc::new(Processor::new(
                channel.clone(),
                config.bot_username.clone(),
                &config.known_other_bots,
                store.clone(),
                channel_state.clone(),
                filter.clone(),
                generator.clone(),
                command_handler.clone(),
                egress.clone(),
                defaults,
            ));
            let queue = queues.get(channel).unwrap().clone();
            let shutdown = shutdown.clone();
            processor_handles.push(tokio::spawn(async move { processor.run(queue, shutdown).await }));
        }

        wait_for_shutdown_signal().await;
        info!("shutdown signal received, draining in-flight work");
        shutdown.cancel();

        let _ = irc_handle.await;
        let _ = cleanup_handle.await;
        for handle in processor_handles {
            let _ = handle.await;
        }

        Ok(())
    }
}

async fn run_cleanup_loop(
    store: StoreHandle,
    interval_minutes: u64,
    retention_message_days: u32,
    retention_metric_days: u32,
    shutdown: CancellationToken,
) {
    let interval = std::time::Duration::from_secs(interval_minutes * 60);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(interval) => {}
        }
        match store.cleanup(retention_message_days, retention_metric_days).await {
            Ok(result) => info!(
                messages_deleted = result.messages_deleted,
                metrics_deleted = result.metrics_deleted,
                "retention cleanup completed"
            ),
            Err(e) => error!(error = %e, "retention cleanup failed"),
        }
        let _ = store.prune_cooldowns(retention_message_days).await;
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
