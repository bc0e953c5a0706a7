//! Full-stack push channel test: events produced into the store, workers
//! computing, and a subscribed client receiving updates through the
//! broadcaster.

use std::sync::Arc;
use std::time::Duration;

use pulse_engine::config::{FeatureWorkerConfig, PatternWorkerConfig, ProducerConfig, PulseConfig};
use pulse_engine::event::StreamEvent;
use pulse_engine::window::WindowSpec;
use pulse_engine::PulseContext;
use pulse_gateway::{Broadcaster, BroadcasterConfig, Channel, ServerMessage};
use pulse_store::MemoryStore;
use tokio::time::timeout;

fn fast_stack() -> (Arc<PulseContext>, Broadcaster) {
    let config = PulseConfig {
        producer: ProducerConfig {
            flush_interval_ms: 50,
            ..ProducerConfig::default()
        },
        features: FeatureWorkerConfig {
            block_ms: 50,
            windows: vec![WindowSpec::new("5m", 300, 0)],
            ..FeatureWorkerConfig::default()
        },
        patterns: PatternWorkerConfig {
            block_ms: 50,
            ..PatternWorkerConfig::default()
        },
    };
    let context = Arc::new(PulseContext::new(Arc::new(MemoryStore::new()), config));
    let broadcaster = Broadcaster::new(
        context.clone(),
        BroadcasterConfig {
            tick_ms: 20,
            features_interval_ms: 100,
            patterns_interval_ms: 100,
            stats_interval_ms: 100,
            ..BroadcasterConfig::default()
        },
    );
    (context, broadcaster)
}

#[tokio::test]
async fn subscribed_client_receives_computed_features() {
    let (context, broadcaster) = fast_stack();
    context.start_all().await.unwrap();
    broadcaster.start().await;

    let mut rx = broadcaster.connect("dash-1");
    broadcaster.subscribe("dash-1", [Channel::Features]);

    for _ in 0..4 {
        context
            .producer()
            .produce(StreamEvent::operation("memory-service", "recall", 8.0, true))
            .await;
    }

    // Welcome first, then features updates; wait for one carrying data.
    let mut saw_features = false;
    for _ in 0..40 {
        let msg = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        if let ServerMessage::FeaturesUpdate { data, .. } = msg
            && data.get("total_operations_5m").is_some()
        {
            saw_features = true;
            break;
        }
    }
    assert!(saw_features, "no features update with data arrived");

    broadcaster.stop().await;
    context.stop_all().await;
}

#[tokio::test]
async fn stats_channel_reports_store_health_and_worker_status() {
    let (context, broadcaster) = fast_stack();
    context.start_all().await.unwrap();
    broadcaster.start().await;

    let mut rx = broadcaster.connect("ops-1");
    broadcaster.subscribe("ops-1", [Channel::Stats]);

    let mut saw_stats = false;
    for _ in 0..40 {
        let msg = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        if let ServerMessage::SystemStatsUpdate { data, .. } = msg {
            assert_eq!(data["store"]["healthy"], true);
            assert_eq!(data["workers"]["running"], true);
            saw_stats = true;
            break;
        }
    }
    assert!(saw_stats, "no stats update arrived");

    broadcaster.stop().await;
    context.stop_all().await;
}
