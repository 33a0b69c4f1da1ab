mod support;

use chrono::Utc;
use clank::channel_state::ChannelStateTable;
use clank::commands::CommandHandler;
use clank::config::DefaultThresholds;
use clank::filter::Filter;
use clank::generator::GeneratorClient;
use clank::models::{EventKind, InboundEvent};
use clank::processor::Processor;
use clank::store::{ConfigField, SqliteStore, StoreHandle};
use std::collections::HashSet;
use std::io::Write as _;
use std::sync::Arc;
use support::{CapturingEgress, FakeGenerator, GenBehavior};
use tokio::sync::RwLock;

const CHANNEL: &str = "c1";

fn blocked_terms_file() -> tempfile::NamedTempFile {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    writeln!(f, "badword").unwrap();
    f
}

struct Harness {
    processor: Processor,
    store: StoreHandle,
    channel_state: Arc<ChannelStateTable>,
    egress: Arc<CapturingEgress>,
    generator_server: FakeGenerator,
}

async fn build_harness(generator_behavior: GenBehavior) -> Harness {
    let sqlite = Arc::new(SqliteStore::open(":memory:").unwrap());
    let store = StoreHandle::new(sqlite);
    let defaults = DefaultThresholds::default();

    let channel_state = Arc::new(ChannelStateTable::new(store.clone(), defaults));
    channel_state.restore(&[CHANNEL.to_string()]).await.unwrap();

    let terms_file = blocked_terms_file();
    let filter = Arc::new(RwLock::new(Filter::load(terms_file.path(), false, true)));
    std::mem::forget(terms_file); // keep the tempfile alive for the test's duration

    let generator_server = FakeGenerator::start(vec!["default-model".to_string()], generator_behavior);
    let generator = Arc::new(GeneratorClient::new(&generator_server.base_url, 5));

    let commands = Arc::new(CommandHandler::new(channel_state.clone(), generator.clone(), 60));
    let egress = Arc::new(CapturingEgress::default());

    let processor = Processor::new(
        CHANNEL.to_string(),
        "clank".to_string(),
        &["knownbot".to_string()],
        store.clone(),
        channel_state.clone(),
        filter,
        generator,
        commands,
        egress.clone(),
        defaults,
    );

    Harness {
        processor,
        store,
        channel_state,
        egress,
        generator_server,
    }
}

fn message_event(user: &str, content: &str, message_id: &str) -> InboundEvent {
    InboundEvent {
        channel: CHANNEL.to_string(),
        author_id: Some(user.to_string()),
        author_display_name: Some(user.to_string()),
        author_badges: HashSet::new(),
        message_id: Some(message_id.to_string()),
        content: content.to_string(),
        timestamp: Utc::now(),
        kind: EventKind::Message,
    }
}

#[tokio::test]
async fn threshold_fires_once_context_gate_wins_over_low_threshold() {
    let h = build_harness(GenBehavior::Healthy("a spontaneous remark".to_string())).await;
    h.channel_state
        .set_field(CHANNEL, ConfigField::MessageThreshold(5))
        .await
        .unwrap();
    h.channel_state
        .set_field(CHANNEL, ConfigField::SpontaneousCooldownS(0))
        .await
        .unwrap();
    h.channel_state
        .set_field(CHANNEL, ConfigField::ContextLimit(10))
        .await
        .unwrap();

    for i in 0..10 {
        h.processor
            .handle_event(message_event("alice", "just chatting", &format!("m{i}")))
            .await;
    }

    let sent = h.egress.sent.lock().await;
    assert_eq!(sent.len(), 1);
    drop(sent);

    let snapshot = h.channel_state.snapshot(CHANNEL).unwrap();
    assert_eq!(snapshot.message_count, 0);
    assert!(snapshot.last_spontaneous_at.is_some());
}

#[tokio::test]
async fn mention_bypasses_threshold_and_does_not_touch_spontaneous_state() {
    let h = build_harness(GenBehavior::Healthy("hello to you too".to_string())).await;
    h.channel_state
        .set_field(CHANNEL, ConfigField::MessageThreshold(1000))
        .await
        .unwrap();

    h.processor
        .handle_event(message_event("u1", "@clank hi", "m1"))
        .await;

    let sent = h.egress.sent.lock().await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].1, "hello to you too");
    drop(sent);

    let snapshot = h.channel_state.snapshot(CHANNEL).unwrap();
    assert_eq!(snapshot.message_count, 1);
    assert!(snapshot.last_spontaneous_at.is_none());
}

#[tokio::test]
async fn per_user_response_cooldown_is_independent_across_users() {
    let h = build_harness(GenBehavior::Healthy("reply".to_string())).await;
    h.channel_state
        .set_field(CHANNEL, ConfigField::ResponseCooldownS(60))
        .await
        .unwrap();

    h.processor
        .handle_event(message_event("u1", "@clank first", "m1"))
        .await;
    h.processor
        .handle_event(message_event("u1", "@clank again so soon", "m2"))
        .await;
    h.processor
        .handle_event(message_event("u2", "@clank different user", "m3"))
        .await;

    let sent = h.egress.sent.lock().await;
    assert_eq!(sent.len(), 2);
}

#[tokio::test]
async fn ban_purges_context_without_touching_message_count() {
    let h = build_harness(GenBehavior::Down).await;

    for i in 0..4 {
        h.processor
            .handle_event(message_event("u3", "spam", &format!("u3-{i}")))
            .await;
    }
    let before = h.channel_state.snapshot(CHANNEL).unwrap().message_count;

    h.processor
        .handle_event(InboundEvent {
            channel: CHANNEL.to_string(),
            author_id: None,
            author_display_name: None,
            author_badges: HashSet::new(),
            message_id: None,
            content: String::new(),
            timestamp: Utc::now(),
            kind: EventKind::UserClear {
                user_id: "u3".to_string(),
            },
        })
        .await;

    let recent = h.store.recent_messages(CHANNEL.to_string(), 100).await.unwrap();
    assert!(recent.iter().all(|m| m.user_id != "u3"));

    let after = h.channel_state.snapshot(CHANNEL).unwrap().message_count;
    assert_eq!(before, after);
}

#[tokio::test]
async fn generator_down_yields_zero_emissions_and_records_metric() {
    let h = build_harness(GenBehavior::Down).await;
    h.channel_state
        .set_field(CHANNEL, ConfigField::MessageThreshold(3))
        .await
        .unwrap();
    h.channel_state
        .set_field(CHANNEL, ConfigField::ContextLimit(10))
        .await
        .unwrap();
    h.channel_state
        .set_field(CHANNEL, ConfigField::SpontaneousCooldownS(0))
        .await
        .unwrap();

    // 10 messages: enough to clear both the threshold (3) and the
    // hard-coded minimum-context gate (>= 10 stored messages) so the
    // spontaneous path actually reaches the generator call.
    for i in 0..10 {
        h.processor
            .handle_event(message_event("alice", "hi", &format!("d{i}")))
            .await;
    }

    let sent = h.egress.sent.lock().await;
    assert_eq!(sent.len(), 0);
    drop(sent);

    let snapshot = h.channel_state.snapshot(CHANNEL).unwrap();
    assert!(snapshot.last_spontaneous_at.is_none());

    let recent = h.store.recent_messages(CHANNEL.to_string(), 10).await.unwrap();
    assert_eq!(recent.len(), 10);

    let metric_total = h
        .store
        .aggregate(
            CHANNEL.to_string(),
            clank::models::metric_kind::GENERATOR_UNAVAILABLE.to_string(),
            3600,
        )
        .await
        .unwrap();
    assert!(metric_total >= 1.0);
}

#[tokio::test]
async fn output_filter_blocks_generated_content() {
    let h = build_harness(GenBehavior::Healthy("this contains badword in it".to_string())).await;
    h.channel_state
        .set_field(CHANNEL, ConfigField::MessageThreshold(1))
        .await
        .unwrap();
    h.channel_state
        .set_field(CHANNEL, ConfigField::ContextLimit(10))
        .await
        .unwrap();
    h.channel_state
        .set_field(CHANNEL, ConfigField::SpontaneousCooldownS(0))
        .await
        .unwrap();

    for i in 0..10 {
        h.processor
            .handle_event(message_event("alice", "clean text", &format!("b{i}")))
            .await;
    }

    let sent = h.egress.sent.lock().await;
    assert_eq!(sent.len(), 0);
    drop(sent);

    let snapshot = h.channel_state.snapshot(CHANNEL).unwrap();
    assert!(snapshot.last_spontaneous_at.is_none());
    assert_eq!(snapshot.message_count, 10);

    let _ = &h.generator_server;
}
