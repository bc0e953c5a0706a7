//! Pattern worker: threshold rules applied across event streams.
//!
//! One consumer group fans in over the operation, interaction, and
//! metric streams; each message is dispatched by source stream to its
//! rule. Matches append to a bounded detection history (oldest evicted),
//! and a periodic compaction pass re-trims the history to capacity.
//! Acks follow evaluation, with the same redelivery caveat as the
//! feature worker.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use strum::{Display, EnumString};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pulse_store::{GroupStart, ReadFrom, StoreError, StreamBatch, StreamStore};

use crate::config::PatternWorkerConfig;
use crate::error::EngineError;
use crate::event::{
    EventPayload, STREAM_INTERACTIONS, STREAM_METRICS, STREAM_OPERATIONS, StreamEvent,
};
use crate::worker::{Worker, WorkerState, WorkerStatus};

const READ_RETRY_DELAY: Duration = Duration::from_secs(1);
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Kinds of detected patterns.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PatternType {
    SlowOperation,
    LongInteraction,
    ResourceSpike,
}

/// One rule match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternDetection {
    pub pattern_type: PatternType,
    /// Linear in the overage, capped at 1.0.
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    pub description: String,
    pub data: serde_json::Map<String, Value>,
}

fn data_map(pairs: Vec<(&str, Value)>) -> serde_json::Map<String, Value> {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

/// Confidence scales linearly with how far the value exceeds the
/// threshold, saturating at twice the threshold.
fn overage_confidence(value: f64, threshold: f64) -> f64 {
    (value / (2.0 * threshold)).min(1.0)
}

/// Apply the rule for the event's source stream. Returns `None` when the
/// event is within bounds or the stream has no rule.
fn evaluate(
    config: &PatternWorkerConfig,
    stream: &str,
    event: &StreamEvent,
    now: DateTime<Utc>,
) -> Option<PatternDetection> {
    match (stream, &event.payload) {
        (STREAM_OPERATIONS, EventPayload::Operation {
            name, duration_ms, ..
        }) if *duration_ms > config.latency_threshold_ms => Some(PatternDetection {
            pattern_type: PatternType::SlowOperation,
            confidence: overage_confidence(*duration_ms, config.latency_threshold_ms),
            timestamp: now,
            description: format!(
                "operation `{name}` took {duration_ms:.0}ms (threshold {:.0}ms)",
                config.latency_threshold_ms
            ),
            data: data_map(vec![
                ("operation", json!(name)),
                ("duration_ms", json!(duration_ms)),
                ("threshold_ms", json!(config.latency_threshold_ms)),
                ("source", json!(event.source)),
            ]),
        }),
        (STREAM_INTERACTIONS, EventPayload::Interaction {
            action,
            duration_ms,
        }) if *duration_ms > config.interaction_ceiling_ms => Some(PatternDetection {
            pattern_type: PatternType::LongInteraction,
            confidence: overage_confidence(*duration_ms, config.interaction_ceiling_ms),
            timestamp: now,
            description: format!(
                "interaction `{action}` ran {duration_ms:.0}ms (ceiling {:.0}ms)",
                config.interaction_ceiling_ms
            ),
            data: data_map(vec![
                ("action", json!(action)),
                ("duration_ms", json!(duration_ms)),
                ("ceiling_ms", json!(config.interaction_ceiling_ms)),
            ]),
        }),
        (STREAM_METRICS, EventPayload::Metric { name, value, unit })
            if unit == "percent" && *value > config.metric_threshold_pct =>
        {
            Some(PatternDetection {
                pattern_type: PatternType::ResourceSpike,
                confidence: overage_confidence(*value, config.metric_threshold_pct),
                timestamp: now,
                description: format!(
                    "metric `{name}` at {value:.1}% (threshold {:.1}%)",
                    config.metric_threshold_pct
                ),
                data: data_map(vec![
                    ("metric", json!(name)),
                    ("value", json!(value)),
                    ("threshold_pct", json!(config.metric_threshold_pct)),
                ]),
            })
        }
        _ => None,
    }
}

struct PatternInner {
    store: Arc<dyn StreamStore>,
    config: PatternWorkerConfig,
    state: Mutex<WorkerState>,
    history: Mutex<VecDeque<PatternDetection>>,
    processed: AtomicU64,
    parse_failures: AtomicU64,
    detected: AtomicU64,
    runtime: tokio::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl PatternInner {
    async fn apply_batches(&self, batches: Vec<StreamBatch>) {
        for batch in batches {
            for (id, record) in batch.entries {
                match StreamEvent::from_record(&record) {
                    Ok(event) => {
                        let now = Utc::now();
                        if let Some(detection) = evaluate(&self.config, &batch.stream, &event, now)
                        {
                            debug!(
                                pattern = %detection.pattern_type,
                                confidence = detection.confidence,
                                "pattern detected"
                            );
                            let mut history = self.history.lock();
                            history.push_back(detection);
                            while history.len() > self.config.history_capacity {
                                history.pop_front();
                            }
                            self.detected.fetch_add(1, Ordering::Relaxed);
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

    fn compact(&self) {
        let mut history = self.history.lock();
        let before = history.len();
        while history.len() > self.config.history_capacity {
            history.pop_front();
        }
        if before != history.len() {
            debug!(trimmed = before - history.len(), "pattern history compacted");
        }
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        info!(group = %self.config.group, consumer = %self.config.consumer, "pattern worker started");
        let streams: Vec<(String, ReadFrom)> = [STREAM_OPERATIONS, STREAM_INTERACTIONS, STREAM_METRICS]
            .iter()
            .map(|s| (s.to_string(), ReadFrom::New))
            .collect();
        let mut last_compact = Instant::now();

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
                    warn!(error = %e, "pattern worker read failed");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(READ_RETRY_DELAY) => {}
                    }
                }
            }

            if last_compact.elapsed() >= self.config.compact_interval() {
                self.compact();
                last_compact = Instant::now();
            }
        }
        info!("pattern worker stopped");
    }
}

/// Threshold-rule pattern detection worker. Cheap to clone; all clones
/// share the same history and poll loop.
#[derive(Clone)]
pub struct PatternWorker {
    inner: Arc<PatternInner>,
}

impl PatternWorker {
    pub fn new(store: Arc<dyn StreamStore>, config: PatternWorkerConfig) -> Self {
        Self {
            inner: Arc::new(PatternInner {
                store,
                config,
                state: Mutex::new(WorkerState::Stopped),
                history: Mutex::new(VecDeque::new()),
                processed: AtomicU64::new(0),
                parse_failures: AtomicU64::new(0),
                detected: AtomicU64::new(0),
                runtime: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Copy of the detection history, optionally filtered by type.
    pub fn get_patterns(&self, types: Option<&[PatternType]>) -> Vec<PatternDetection> {
        let history = self.inner.history.lock();
        history
            .iter()
            .filter(|d| types.is_none_or(|ts| ts.contains(&d.pattern_type)))
            .cloned()
            .collect()
    }

    /// Detections whose timestamp falls within the trailing `within`.
    pub fn recent_patterns(&self, within: Duration) -> Vec<PatternDetection> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(within).unwrap_or_else(|_| chrono::Duration::zero());
        let history = self.inner.history.lock();
        history
            .iter()
            .filter(|d| d.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    pub fn messages_processed(&self) -> u64 {
        self.inner.processed.load(Ordering::Relaxed)
    }

    pub fn parse_failures(&self) -> u64 {
        self.inner.parse_failures.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Worker for PatternWorker {
    fn name(&self) -> &'static str {
        "patterns"
    }

    async fn start(&self) -> Result<(), EngineError> {
        {
            let mut state = self.inner.state.lock();
            if *state != WorkerState::Stopped {
                return Ok(());
            }
            *state = WorkerState::Starting;
        }

        for stream in [STREAM_OPERATIONS, STREAM_INTERACTIONS, STREAM_METRICS] {
            match self
                .inner
                .store
                .create_consumer_group(stream, &self.inner.config.group, GroupStart::Beginning, true)
                .await
            {
                Ok(()) | Err(StoreError::GroupExists { .. }) => {}
                Err(e) => {
                    *self.inner.state.lock() = WorkerState::Stopped;
                    return Err(EngineError::WorkerStart {
                        worker: "patterns",
                        reason: e.to_string(),
                    });
                }
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
                warn!("pattern worker did not stop in time; aborting");
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
            items: self.inner.detected.load(Ordering::Relaxed),
        }
    }
}
