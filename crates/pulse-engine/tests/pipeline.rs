//! End-to-end pipeline test over the in-memory store: produce events,
//! flush them into streams, let both workers consume via their consumer
//! groups, and observe features and detections through the query APIs.

use std::sync::Arc;
use std::time::Duration;

use pulse_engine::config::{FeatureWorkerConfig, PatternWorkerConfig, ProducerConfig, PulseConfig};
use pulse_engine::event::{STREAM_OPERATIONS, StreamEvent};
use pulse_engine::features::FeatureValue;
use pulse_engine::patterns::PatternType;
use pulse_engine::window::WindowSpec;
use pulse_engine::PulseContext;
use pulse_store::{MemoryStore, StreamStore};

fn fast_config() -> PulseConfig {
    PulseConfig {
        producer: ProducerConfig {
            buffer_capacity: 100,
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
    }
}

#[tokio::test]
async fn events_flow_from_producer_to_features_and_patterns() {
    let store = Arc::new(MemoryStore::new());
    let ctx = PulseContext::new(store.clone(), fast_config());
    ctx.start_all().await.unwrap();

    // A mixed workload: routine operations, one slow operation, one
    // resource spike.
    for i in 0..10 {
        ctx.producer()
            .produce(StreamEvent::operation(
                "memory-service",
                "recall",
                10.0 + i as f64,
                true,
            ))
            .await;
    }
    ctx.producer()
        .produce(StreamEvent::operation(
            "memory-service",
            "store_memory",
            2500.0,
            true,
        ))
        .await;
    ctx.producer()
        .produce(StreamEvent::metric(
            "host-agent",
            "cpu_percent",
            97.0,
            "percent",
        ))
        .await;

    // Let the periodic flush and both poll loops run a few cycles.
    tokio::time::sleep(Duration::from_millis(600)).await;

    // Everything reached the store.
    let stats = ctx.producer().stats();
    assert_eq!(stats.produced, 12);
    assert_eq!(stats.failed, 0);
    assert_eq!(store.length(STREAM_OPERATIONS).await.unwrap(), 11);

    // The feature worker saw all operation events.
    assert_eq!(ctx.features().messages_processed(), 11);
    let counts = ctx.features().operation_counts();
    assert_eq!(counts["recall"], 10);
    assert_eq!(counts["store_memory"], 1);

    let latest = ctx.features().get_latest();
    assert_eq!(
        latest["total_operations_5m"].value,
        FeatureValue::Scalar(11.0)
    );
    match &latest["operation_distribution_5m"].value {
        FeatureValue::Map(dist) => assert_eq!(dist["recall"], 10.0),
        other => panic!("expected map, got {other:?}"),
    }

    // The pattern worker flagged the slow operation and the spike.
    let detections = ctx.patterns().get_patterns(None);
    let types: Vec<PatternType> = detections.iter().map(|d| d.pattern_type).collect();
    assert!(types.contains(&PatternType::SlowOperation));
    assert!(types.contains(&PatternType::ResourceSpike));

    let slow = detections
        .iter()
        .find(|d| d.pattern_type == PatternType::SlowOperation)
        .unwrap();
    assert_eq!(slow.confidence, 1.0);

    let status = ctx.manager().status();
    assert!(status.running);
    assert!(status.workers["patterns"].items >= 2);

    ctx.stop_all().await;
    assert!(!ctx.manager().status().running);
}

#[tokio::test]
async fn feature_queries_filter_by_name() {
    let store = Arc::new(MemoryStore::new());
    let ctx = PulseContext::new(store.clone(), fast_config());
    ctx.start_all().await.unwrap();

    ctx.producer()
        .produce(StreamEvent::operation("svc", "recall", 5.0, true))
        .await;
    ctx.producer().flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    ctx.stop_all().await;

    let all = ctx.features().get_features(None);
    assert!(all.len() > 1);

    let only_rate = ctx.features().get_features(Some(&["operation_rate_5m"]));
    assert_eq!(only_rate.len(), 1);
    assert!(only_rate.contains_key("operation_rate_5m"));
    assert!(!only_rate["operation_rate_5m"].is_empty());
}

#[tokio::test]
async fn both_groups_see_the_same_operations_stream_independently() {
    // Competing consumer groups: the feature group consuming an entry
    // does not starve the pattern group of it, and vice versa.
    let store = Arc::new(MemoryStore::new());
    let ctx = PulseContext::new(store.clone(), fast_config());
    ctx.start_all().await.unwrap();

    ctx.producer()
        .produce(StreamEvent::operation("svc", "recall", 3000.0, true))
        .await;
    ctx.producer().flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    ctx.stop_all().await;

    assert_eq!(ctx.features().messages_processed(), 1);
    assert_eq!(ctx.patterns().messages_processed(), 1);
    assert_eq!(ctx.patterns().get_patterns(None).len(), 1);
}
