//! Buffered event producer.
//!
//! Events accumulate in an in-memory buffer owned exclusively by the
//! producer; a periodic task flushes them to the store, and reaching
//! buffer capacity forces an immediate synchronous flush before
//! `produce` returns (back-pressure, never drop). Flush failures are
//! retried indefinitely with exponential backoff and jitter; after
//! enough consecutive failures the producer degrades to an extended
//! cool-down cadence, but it never stops retrying.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use pulse_store::StreamStore;

use crate::config::ProducerConfig;
use crate::error::EngineError;
use crate::event::StreamEvent;

/// How long `stop` waits for the flush task before aborting it.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Point-in-time producer statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ProducerStats {
    /// Events successfully appended to the store.
    pub produced: u64,
    /// Flush attempts that failed.
    pub failed: u64,
    /// Capacity-triggered synchronous flushes.
    pub overflows: u64,
    /// Successful flush operations.
    pub flushes: u64,
    /// Consecutive failed flush attempts right now.
    pub consecutive_failures: u32,
    /// Events currently buffered.
    pub buffered: usize,
    pub last_flush: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Counters {
    produced: AtomicU64,
    failed: AtomicU64,
    overflows: AtomicU64,
    flushes: AtomicU64,
    last_flush_ms: AtomicI64,
}

struct ProducerInner {
    store: Arc<dyn StreamStore>,
    config: ProducerConfig,
    buffer: Mutex<VecDeque<StreamEvent>>,
    consecutive_failures: AtomicU32,
    counters: Counters,
    runtime: tokio::sync::Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ProducerInner {
    /// Snapshot-and-clear the buffer, group by event type, and append
    /// each record to its mapped stream. On failure the unsent tail is
    /// pushed back to the front of the buffer for the next cycle.
    async fn flush(&self) -> Result<usize, EngineError> {
        let batch: Vec<StreamEvent> = {
            let mut buffer = self.buffer.lock();
            buffer.drain(..).collect()
        };
        if batch.is_empty() {
            return Ok(0);
        }

        let total = batch.len();
        let mut appended = 0usize;

        for (idx, event) in batch.iter().enumerate() {
            let record = match event.to_record() {
                Ok(record) => record,
                Err(e) => {
                    // An unencodable event cannot ever succeed; drop it
                    // rather than wedging the buffer.
                    warn!(event_id = %event.event_id, error = %e, "dropping unencodable event");
                    continue;
                }
            };
            match self.store.append(event.event_type.stream(), record).await {
                Ok(_) => {
                    appended += 1;
                    self.counters.produced.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    let unsent = &batch[idx..];
                    {
                        let mut buffer = self.buffer.lock();
                        for event in unsent.iter().rev() {
                            buffer.push_front(event.clone());
                        }
                    }
                    self.counters.failed.fetch_add(1, Ordering::Relaxed);
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!(
                        error = %e,
                        appended,
                        requeued = unsent.len(),
                        consecutive_failures = failures,
                        "flush failed; batch requeued for next cycle"
                    );
                    return Err(EngineError::Store(e));
                }
            }
        }

        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        self.counters
            .last_flush_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
        debug!(appended, total, "flush complete");
        Ok(appended)
    }

    async fn run(self: Arc<Self>, token: CancellationToken) {
        info!(
            interval_ms = self.config.flush_interval_ms,
            capacity = self.config.buffer_capacity,
            "producer flush loop started"
        );
        loop {
            let failures = self.consecutive_failures.load(Ordering::SeqCst);
            let delay = if failures == 0 {
                self.config.flush_interval()
            } else {
                // Backoff replaces the regular cadence while the store
                // is failing; includes the post-threshold cool-down.
                self.config.backoff.delay_for_attempt(failures)
            };

            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {
                    let _ = self.flush().await;
                }
            }
        }
        info!("producer flush loop stopped");
    }
}

/// Buffered, batching event producer. Cheap to clone; all clones share
/// the same buffer and flush task.
#[derive(Clone)]
pub struct EventProducer {
    inner: Arc<ProducerInner>,
}

impl EventProducer {
    pub fn new(store: Arc<dyn StreamStore>, config: ProducerConfig) -> Self {
        Self {
            inner: Arc::new(ProducerInner {
                store,
                config,
                buffer: Mutex::new(VecDeque::new()),
                consecutive_failures: AtomicU32::new(0),
                counters: Counters::default(),
                runtime: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Buffer one event. Reaching buffer capacity triggers an immediate
    /// synchronous flush before returning; a failed flush keeps the
    /// events buffered for the periodic task to retry.
    pub async fn produce(&self, event: StreamEvent) {
        let at_capacity = {
            let mut buffer = self.inner.buffer.lock();
            buffer.push_back(event);
            buffer.len() >= self.inner.config.buffer_capacity
        };

        if at_capacity {
            self.inner.counters.overflows.fetch_add(1, Ordering::Relaxed);
            debug!("buffer at capacity; flushing synchronously");
            let _ = self.inner.flush().await;
        }
    }

    /// Flush the buffer now. Used by the periodic task, shutdown, and
    /// tests; returns how many events were appended.
    pub async fn flush(&self) -> Result<usize, EngineError> {
        self.inner.flush().await
    }

    /// Spawn the periodic flush task. Starting an already started
    /// producer is a no-op.
    pub async fn start(&self) {
        let mut runtime = self.inner.runtime.lock().await;
        if runtime.is_some() {
            return;
        }
        let token = CancellationToken::new();
        let handle = tokio::spawn(self.inner.clone().run(token.clone()));
        *runtime = Some((token, handle));
    }

    /// Cancel the flush task, await it under a bound, then perform one
    /// final flush so a clean shutdown loses no events.
    pub async fn stop(&self) {
        if let Some((token, mut handle)) = self.inner.runtime.lock().await.take() {
            token.cancel();
            if tokio::time::timeout(STOP_TIMEOUT, &mut handle).await.is_err() {
                warn!("producer flush task did not stop in time; aborting");
                handle.abort();
            }
        }
        if let Err(e) = self.inner.flush().await {
            warn!(error = %e, "final flush failed; events remain buffered");
        }
    }

    pub fn stats(&self) -> ProducerStats {
        let last_flush_ms = self.inner.counters.last_flush_ms.load(Ordering::Relaxed);
        ProducerStats {
            produced: self.inner.counters.produced.load(Ordering::Relaxed),
            failed: self.inner.counters.failed.load(Ordering::Relaxed),
            overflows: self.inner.counters.overflows.load(Ordering::Relaxed),
            flushes: self.inner.counters.flushes.load(Ordering::Relaxed),
            consecutive_failures: self.inner.consecutive_failures.load(Ordering::SeqCst),
            buffered: self.inner.buffer.lock().len(),
            last_flush: (last_flush_ms > 0)
                .then(|| Utc.timestamp_millis_opt(last_flush_ms).single())
                .flatten(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::STREAM_OPERATIONS;
    use async_trait::async_trait;
    use pulse_store::{
        EntryId, GroupStart, MemoryStore, ReadFrom, StoreError, StreamBatch, StreamRecord,
    };
    use std::sync::atomic::AtomicBool;

    fn small_config(capacity: usize) -> ProducerConfig {
        ProducerConfig {
            buffer_capacity: capacity,
            flush_interval_ms: 3_600_000, // keep the periodic task out of the way
            ..ProducerConfig::default()
        }
    }

    /// Store double whose appends fail while `failing` is set.
    struct FlakyStore {
        delegate: MemoryStore,
        failing: AtomicBool,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                delegate: MemoryStore::new(),
                failing: AtomicBool::new(false),
            }
        }

        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl StreamStore for FlakyStore {
        async fn append(
            &self,
            stream: &str,
            record: StreamRecord,
        ) -> Result<EntryId, StoreError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StoreError::unavailable("injected outage"));
            }
            self.delegate.append(stream, record).await
        }

        async fn create_consumer_group(
            &self,
            stream: &str,
            group: &str,
            start: GroupStart,
            create_stream_if_missing: bool,
        ) -> Result<(), StoreError> {
            self.delegate
                .create_consumer_group(stream, group, start, create_stream_if_missing)
                .await
        }

        async fn read_group(
            &self,
            group: &str,
            consumer: &str,
            streams: &[(String, ReadFrom)],
            count: usize,
            block: Duration,
        ) -> Result<Vec<StreamBatch>, StoreError> {
            self.delegate
                .read_group(group, consumer, streams, count, block)
                .await
        }

        async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<(), StoreError> {
            self.delegate.ack(stream, group, id).await
        }

        async fn length(&self, stream: &str) -> Result<u64, StoreError> {
            self.delegate.length(stream).await
        }
    }

    #[tokio::test]
    async fn capacity_overflow_flushes_synchronously() {
        // 150 events into a capacity-100 buffer: the capacity flush
        // moves the first 100, the explicit flush moves the last 50.
        let store = Arc::new(MemoryStore::new());
        let producer = EventProducer::new(store.clone(), small_config(100));

        for i in 0..150 {
            producer
                .produce(StreamEvent::operation("test", format!("op-{i}"), 1.0, true))
                .await;
        }

        assert_eq!(store.length(STREAM_OPERATIONS).await.unwrap(), 100);
        assert_eq!(producer.stats().overflows, 1);

        let sent = producer.flush().await.unwrap();
        assert_eq!(sent, 50);

        let stats = producer.stats();
        assert_eq!(store.length(STREAM_OPERATIONS).await.unwrap(), 150);
        assert_eq!(stats.flushes, 2);
        assert_eq!(stats.produced, 150);
        assert_eq!(stats.buffered, 0);
    }

    #[tokio::test]
    async fn flush_groups_events_by_type_into_their_streams() {
        let store = Arc::new(MemoryStore::new());
        let producer = EventProducer::new(store.clone(), small_config(100));

        producer
            .produce(StreamEvent::operation("svc", "recall", 3.0, true))
            .await;
        producer
            .produce(StreamEvent::interaction("ide", "hover", 12.0))
            .await;
        producer
            .produce(StreamEvent::metric("host", "cpu_percent", 55.0, "percent"))
            .await;
        producer.flush().await.unwrap();

        assert_eq!(store.length("pulse:events:operations").await.unwrap(), 1);
        assert_eq!(store.length("pulse:events:interactions").await.unwrap(), 1);
        assert_eq!(store.length("pulse:events:metrics").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_flush_requeues_and_later_retries_deliver_everything() {
        let store = Arc::new(FlakyStore::new());
        let producer = EventProducer::new(store.clone(), small_config(100));

        store.set_failing(true);
        for i in 0..5 {
            producer
                .produce(StreamEvent::operation("test", format!("op-{i}"), 1.0, true))
                .await;
        }
        assert!(producer.flush().await.is_err());

        let stats = producer.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.consecutive_failures, 1);
        assert_eq!(stats.buffered, 5);

        // Outage ends; the retry delivers the whole requeued batch.
        store.set_failing(false);
        assert_eq!(producer.flush().await.unwrap(), 5);
        assert_eq!(store.length(STREAM_OPERATIONS).await.unwrap(), 5);
        assert_eq!(producer.stats().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn no_silent_loss_under_sustained_outage() {
        let store = Arc::new(FlakyStore::new());
        let producer = EventProducer::new(store.clone(), small_config(100));

        store.set_failing(true);
        producer
            .produce(StreamEvent::operation("test", "recall", 1.0, true))
            .await;

        let before = producer.stats();
        assert!(producer.flush().await.is_err());
        assert!(producer.flush().await.is_err());
        let after = producer.stats();

        // The events are still buffered and the failure counters moved.
        assert_eq!(after.buffered, 1);
        assert!(after.failed > before.failed);
        assert!(after.consecutive_failures >= 2);
    }

    #[tokio::test]
    async fn stop_performs_a_final_flush() {
        let store = Arc::new(MemoryStore::new());
        let producer = EventProducer::new(store.clone(), small_config(100));

        producer.start().await;
        producer
            .produce(StreamEvent::operation("test", "recall", 1.0, true))
            .await;
        producer.stop().await;

        assert_eq!(store.length(STREAM_OPERATIONS).await.unwrap(), 1);
        assert_eq!(producer.stats().buffered, 0);
    }

    #[tokio::test]
    async fn periodic_task_flushes_on_its_interval() {
        let store = Arc::new(MemoryStore::new());
        let config = ProducerConfig {
            buffer_capacity: 100,
            flush_interval_ms: 50,
            ..ProducerConfig::default()
        };
        let producer = EventProducer::new(store.clone(), config);

        producer.start().await;
        producer
            .produce(StreamEvent::operation("test", "recall", 1.0, true))
            .await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(store.length(STREAM_OPERATIONS).await.unwrap(), 1);
        producer.stop().await;
    }
}
