//! Feature worker: consumer-group reader computing windowed features.
//!
//! Each poll cycle blocking-reads a bounded batch from the operations
//! stream, feeds every message into all active windows, updates running
//! counters, and acknowledges only after those effects are in memory —
//! a crash before the ack redelivers the message (at-least-once;
//! counters are not deduplicated on redelivery). After the batch,
//! features are recomputed for every window whose slide condition fires.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pulse_store::{GroupStart, ReadFrom, StoreError, StreamBatch, StreamStore};

use crate::config::FeatureWorkerConfig;
use crate::error::EngineError;
use crate::event::{EventPayload, STREAM_OPERATIONS, StreamEvent};
use crate::window::{TimeWindow, WindowSet};
use crate::worker::{Worker, WorkerState, WorkerStatus};

/// Delay before retrying after a failed group read.
const READ_RETRY_DELAY: Duration = Duration::from_secs(1);
/// How long `stop` waits for the poll loop before aborting it.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// A computed feature value: a single scalar or a named breakdown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    Scalar(f64),
    Map(HashMap<String, f64>),
}

/// One computed feature point, keyed `"<feature>_<window_name>"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowedFeature {
    pub name: String,
    pub window: String,
    pub timestamp: DateTime<Utc>,
    pub value: FeatureValue,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// State owned exclusively by the worker task; the query API hands out
/// owned copies only.
struct Registry {
    windows: WindowSet,
    op_counts: HashMap<String, u64>,
    /// Rolling per-message processing times in milliseconds.
    proc_samples: VecDeque<f64>,
    features: HashMap<String, VecDeque<WindowedFeature>>,
}

fn operation_name(event: &StreamEvent) -> String {
    match &event.payload {
        EventPayload::Operation { name, .. } => name.clone(),
        other => other.event_type().to_string(),
    }
}

/// Mean/median/min/max/stddev over a sample set; `None` when empty.
fn numeric_summary(values: &[f64]) -> Option<HashMap<String, f64>> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let median = if sorted.len() % 2 == 0 {
        (sorted[sorted.len() / 2 - 1] + sorted[sorted.len() / 2]) / 2.0
    } else {
        sorted[sorted.len() / 2]
    };

    let mut stats = HashMap::new();
    stats.insert("mean".to_string(), mean);
    stats.insert("median".to_string(), median);
    stats.insert("min".to_string(), sorted[0]);
    stats.insert("max".to_string(), sorted[sorted.len() - 1]);
    stats.insert("stddev".to_string(), variance.sqrt());
    Some(stats)
}

/// Features derived from one window snapshot.
fn window_features(
    window: &TimeWindow,
    snapshot: &[(DateTime<Utc>, StreamEvent)],
    now: DateTime<Utc>,
) -> Vec<WindowedFeature> {
    let window_name = window.name().to_string();
    let size_secs = window.spec().size_secs;
    let metadata: HashMap<String, String> = [
        ("window_size_secs".to_string(), size_secs.to_string()),
        ("events".to_string(), snapshot.len().to_string()),
    ]
    .into();

    let feature = |feature: &str, value: FeatureValue| WindowedFeature {
        name: format!("{feature}_{window_name}"),
        window: window_name.clone(),
        timestamp: now,
        value,
        metadata: metadata.clone(),
    };

    let count = snapshot.len() as f64;
    let mut features = vec![
        feature(
            "operation_rate",
            FeatureValue::Scalar(count / size_secs as f64),
        ),
        feature("total_operations", FeatureValue::Scalar(count)),
    ];

    let mut distribution: HashMap<String, f64> = HashMap::new();
    let mut latencies = Vec::new();
    for (_, event) in snapshot {
        *distribution.entry(operation_name(event)).or_insert(0.0) += 1.0;
        if let EventPayload::Operation { duration_ms, .. } = &event.payload {
            latencies.push(*duration_ms);
        }
    }
    if !distribution.is_empty() {
        features.push(feature(
            "operation_distribution",
            FeatureValue::Map(distribution),
        ));
    }
    if let Some(stats) = numeric_summary(&latencies) {
        features.push(feature("latency_stats", FeatureValue::Map(stats)));
    }

    features
}

fn push_feature(
    histories: &mut HashMap<String, VecDeque<WindowedFeature>>,
    capacity: usize,
    feature: WindowedFeature,
) {
    let history = histories.entry(feature.name.clone()).or_default();
    history.push_back(feature);
    while history.len() > capacity {
        history.pop_front();
    }
}

struct FeatureInner {
    store: Arc<dyn StreamStore>,
    config: FeatureWorkerConfig,
    state: Mutex<WorkerState>,
    registry: Mutex<Registry>,
    processed: AtomicU64,
    parse_failures: AtomicU64,
    published: AtomicU64,
    runtime: tokio::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl FeatureInner {
    /// Apply one delivered batch: window inserts and counters first,
    /// then the ack. Unparseable messages are skipped but still acked
    /// so they cannot stall the group.
    async fn apply_batches(&self, batches: Vec<StreamBatch>) {
        for batch in batches {
            for (id, record) in batch.entries {
                let started = Instant::now();
                match StreamEvent::from_record(&record) {
                    Ok(event) => {
                        let now = Utc::now();
                        {
                            let mut registry = self.registry.lock();
                            registry.windows.add(&event, now);
                            *registry
                                .op_counts
                                .entry(operation_name(&event))
                                .or_insert(0) += 1;
                            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                            registry.proc_samples.push_back(elapsed_ms);
                            while registry.proc_samples.len() > self.config.samples_capacity {
                                registry.proc_samples.pop_front();
                            }
                        }
                        self.processed.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        warn!(%id, error = %e, "skipping unparseable message");
                        self.parse_failures.fetch_add(1, Ordering::Relaxed);
                    }
                }

                if let Err(e) = self.store.ack(&batch.stream, &self.config.group, id).await {
                    warn!(%id, error = %e, "ack failed; message will be redelivered");
                }
            }
        }
    }

    /// Recompute features for every window whose slide condition fires.
    fn compute_due(&self, now: DateTime<Utc>) {
        let mut registry = self.registry.lock();
        let Registry {
            windows, features, ..
        } = &mut *registry;

        let mut published = 0u64;
        for window in windows.iter_mut() {
            if !window.should_slide(now) {
                continue;
            }
            window.slide(now);
            let snapshot = window.snapshot(now);
            for feature in window_features(window, &snapshot, now) {
                push_feature(features, self.config.history_capacity, feature);
                published += 1;
            }
            debug!(window = window.name(), entries = snapshot.len(), "features recomputed");
        }
        if published > 0 {
            self.published.fetch_add(published, Ordering::Relaxed);
        }
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        info!(group = %self.config.group, consumer = %self.config.consumer, "feature worker started");
        let streams = vec![(STREAM_OPERATIONS.to_string(), ReadFrom::New)];

        loop {
            let read = tokio::select! {
                _ = token.cancelled() => break,
                read = self.store.read_group(
                    &self.config.group,
                    &self.config.consumer,
                    &streams,
                    self.config.batch_size,
                    self.config.block(),
                ) => read,
            };

            match read {
                Ok(batches) => self.apply_batches(batches).await,
                Err(e) => {
                    warn!(error = %e, "feature worker read failed");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(READ_RETRY_DELAY) => {}
                    }
                }
            }

            self.compute_due(Utc::now());
        }
        info!("feature worker stopped");
    }
}

/// Windowed feature computation worker. Cheap to clone; all clones share
/// the same registry and poll loop.
#[derive(Clone)]
pub struct FeatureWorker {
    inner: Arc<FeatureInner>,
}

impl FeatureWorker {
    pub fn new(store: Arc<dyn StreamStore>, config: FeatureWorkerConfig) -> Self {
        let now = Utc::now();
        let windows = WindowSet::new(&config.windows, now);
        Self {
            inner: Arc::new(FeatureInner {
                store,
                config,
                state: Mutex::new(WorkerState::Stopped),
                registry: Mutex::new(Registry {
                    windows,
                    op_counts: HashMap::new(),
                    proc_samples: VecDeque::new(),
                    features: HashMap::new(),
                }),
                processed: AtomicU64::new(0),
                parse_failures: AtomicU64::new(0),
                published: AtomicU64::new(0),
                runtime: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Full history per feature name, optionally filtered.
    pub fn get_features(&self, names: Option<&[&str]>) -> HashMap<String, Vec<WindowedFeature>> {
        let registry = self.inner.registry.lock();
        registry
            .features
            .iter()
            .filter(|(name, _)| names.is_none_or(|ns| ns.contains(&name.as_str())))
            .map(|(name, history)| (name.clone(), history.iter().cloned().collect()))
            .collect()
    }

    /// Most recent value per feature name.
    pub fn get_latest(&self) -> HashMap<String, WindowedFeature> {
        let registry = self.inner.registry.lock();
        registry
            .features
            .iter()
            .filter_map(|(name, history)| history.back().map(|f| (name.clone(), f.clone())))
            .collect()
    }

    /// Per-operation message tallies since start.
    pub fn operation_counts(&self) -> HashMap<String, u64> {
        self.inner.registry.lock().op_counts.clone()
    }

    /// Mean per-message processing time over the rolling sample set.
    pub fn mean_processing_ms(&self) -> Option<f64> {
        let registry = self.inner.registry.lock();
        if registry.proc_samples.is_empty() {
            return None;
        }
        Some(registry.proc_samples.iter().sum::<f64>() / registry.proc_samples.len() as f64)
    }

    pub fn messages_processed(&self) -> u64 {
        self.inner.processed.load(Ordering::Relaxed)
    }

    pub fn parse_failures(&self) -> u64 {
        self.inner.parse_failures.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Worker for FeatureWorker {
    fn name(&self) -> &'static str {
        "features"
    }

    async fn start(&self) -> Result<(), EngineError> {
        {
            let mut state = self.inner.state.lock();
            if *state != WorkerState::Stopped {
                return Ok(());
            }
            *state = WorkerState::Starting;
        }

        match self
            .inner
            .store
            .create_consumer_group(
                STREAM_OPERATIONS,
                &self.inner.config.group,
                GroupStart::Beginning,
                true,
            )
            .await
        {
            Ok(()) | Err(StoreError::GroupExists { .. }) => {}
            Err(e) => {
                *self.inner.state.lock() = WorkerState::Stopped;
                return Err(EngineError::WorkerStart {
                    worker: "features",
                    reason: e.to_string(),
                });
            }
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(self.inner.clone().run(token.clone()));
        *self.inner.runtime.lock().await = Some((token, handle));
        *self.inner.state.lock() = WorkerState::Running;
        Ok(())
    }

    async fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state != WorkerState::Running {
                return;
            }
            *state = WorkerState::Stopping;
        }

        if let Some((token, mut handle)) = self.inner.runtime.lock().await.take() {
            token.cancel();
            if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
                warn!("feature worker did not stop in time; aborting");
                handle.abort();
            }
        }
        *self.inner.state.lock() = WorkerState::Stopped;
    }

    fn status(&self) -> WorkerStatus {
        let state = *self.inner.state.lock();
        WorkerStatus {
            state,
            running: state == WorkerState::Running,
            items: self.inner.published.load(Ordering::Relaxed),
        }
    }
}
