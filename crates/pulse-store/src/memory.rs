use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

use crate::client::StreamStore;
use crate::error::StoreError;
use crate::types::{EntryId, GroupStart, ReadFrom, StreamBatch, StreamRecord};

/// How long a pending entry may sit unacknowledged with one consumer
/// before a group read on behalf of another consumer reclaims it.
const DEFAULT_RECLAIM_IDLE: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct PendingEntry {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Index into the entry log of the next entry never delivered to
    /// this group.
    next_index: usize,
    pending: BTreeMap<EntryId, PendingEntry>,
}

#[derive(Debug, Default)]
struct StreamState {
    entries: Vec<(EntryId, StreamRecord)>,
    groups: HashMap<String, GroupState>,
    last_id: EntryId,
}

impl StreamState {
    fn index_after(&self, id: EntryId) -> usize {
        self.entries.partition_point(|(eid, _)| *eid <= id)
    }
}

fn record_in(log: &[(EntryId, StreamRecord)], id: EntryId) -> Option<&StreamRecord> {
    log.binary_search_by_key(&id, |(eid, _)| *eid)
        .ok()
        .map(|idx| &log[idx].1)
}

#[derive(Debug, Default)]
struct Inner {
    streams: HashMap<String, StreamState>,
}

/// In-process [`StreamStore`] with full consumer-group semantics:
/// per-group delivery cursor, per-consumer pending (lease) tracking,
/// idle-based reclaim, and blocking group reads.
///
/// Backs the test suite and local development runs. Entries are never
/// trimmed; retention is the responsibility of a real backend.
pub struct MemoryStore {
    inner: Mutex<Inner>,
    appended: Notify,
    reclaim_idle: Duration,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_reclaim_idle(DEFAULT_RECLAIM_IDLE)
    }

    /// A store whose pending entries are reclaimable after `idle`.
    /// Tests use a zero idle to exercise redelivery deterministically.
    pub fn with_reclaim_idle(idle: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            appended: Notify::new(),
            reclaim_idle: idle,
        }
    }

    fn gather(
        &self,
        group: &str,
        consumer: &str,
        streams: &[(String, ReadFrom)],
        count: usize,
    ) -> Result<Vec<StreamBatch>, StoreError> {
        let mut inner = self.inner.lock();
        let mut batches = Vec::new();

        for (stream, from) in streams {
            let state =
                inner
                    .streams
                    .get_mut(stream.as_str())
                    .ok_or_else(|| StoreError::NoSuchStream {
                        stream: stream.clone(),
                    })?;
            let StreamState {
                entries: log,
                groups,
                ..
            } = state;
            let gs = groups
                .get_mut(group)
                .ok_or_else(|| StoreError::NoSuchGroup {
                    stream: stream.clone(),
                    group: group.to_string(),
                })?;

            let mut entries: Vec<(EntryId, StreamRecord)> = Vec::new();
            match from {
                ReadFrom::New => {
                    // Reclaim entries another consumer left pending past
                    // the idle bound, oldest first.
                    let reclaimable: Vec<EntryId> = gs
                        .pending
                        .iter()
                        .filter(|(_, p)| {
                            p.consumer != consumer && p.delivered_at.elapsed() >= self.reclaim_idle
                        })
                        .map(|(id, _)| *id)
                        .take(count)
                        .collect();
                    for id in reclaimable {
                        if entries.len() >= count {
                            break;
                        }
                        let Some(record) = record_in(log, id).cloned() else {
                            continue;
                        };
                        if let Some(p) = gs.pending.get_mut(&id) {
                            trace!(%id, from = %p.consumer, to = consumer, "reclaimed pending entry");
                            p.consumer = consumer.to_string();
                            p.delivered_at = Instant::now();
                            p.delivery_count += 1;
                        }
                        entries.push((id, record));
                    }

                    // Fresh entries never delivered to the group.
                    while entries.len() < count {
                        let Some((id, record)) = log.get(gs.next_index).cloned() else {
                            break;
                        };
                        gs.next_index += 1;
                        gs.pending.insert(
                            id,
                            PendingEntry {
                                consumer: consumer.to_string(),
                                delivered_at: Instant::now(),
                                delivery_count: 1,
                            },
                        );
                        entries.push((id, record));
                    }
                }
                ReadFrom::Pending(after) => {
                    let ids: Vec<EntryId> = gs
                        .pending
                        .range((std::ops::Bound::Excluded(*after), std::ops::Bound::Unbounded))
                        .filter(|(_, p)| p.consumer == consumer)
                        .map(|(id, _)| *id)
                        .take(count)
                        .collect();
                    for id in ids {
                        if let Some(record) = record_in(log, id).cloned() {
                            entries.push((id, record));
                        }
                    }
                }
            }

            if !entries.is_empty() {
                batches.push(StreamBatch {
                    stream: stream.clone(),
                    entries,
                });
            }
        }

        Ok(batches)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamStore for MemoryStore {
    async fn append(&self, stream: &str, record: StreamRecord) -> Result<EntryId, StoreError> {
        let id = {
            let mut inner = self.inner.lock();
            let state = inner.streams.entry(stream.to_string()).or_default();
            let now_ms = chrono::Utc::now().timestamp_millis();
            let id = if now_ms > state.last_id.ms {
                EntryId::new(now_ms, 0)
            } else {
                EntryId::new(state.last_id.ms, state.last_id.seq + 1)
            };
            state.last_id = id;
            state.entries.push((id, record));
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn create_consumer_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
        create_stream_if_missing: bool,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if !inner.streams.contains_key(stream) && !create_stream_if_missing {
            return Err(StoreError::NoSuchStream {
                stream: stream.to_string(),
            });
        }
        let state = inner.streams.entry(stream.to_string()).or_default();

        if state.groups.contains_key(group) {
            return Err(StoreError::GroupExists {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        }

        let next_index = match start {
            GroupStart::Beginning => 0,
            GroupStart::End => state.entries.len(),
            GroupStart::After(id) => state.index_after(id),
        };
        state.groups.insert(
            group.to_string(),
            GroupState {
                next_index,
                pending: BTreeMap::new(),
            },
        );
        Ok(())
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[(String, ReadFrom)],
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamBatch>, StoreError> {
        let deadline = Instant::now() + block;
        loop {
            // Register for wakeups before checking, so an append landing
            // between the check and the wait is not missed.
            let notified = self.appended.notified();

            let batches = self.gather(group, consumer, streams, count)?;
            if !batches.is_empty() {
                return Ok(batches);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.streams.get_mut(stream)
            && let Some(gs) = state.groups.get_mut(group)
        {
            gs.pending.remove(&id);
        }
        Ok(())
    }

    async fn length(&self, stream: &str) -> Result<u64, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .streams
            .get(stream)
            .map(|s| s.entries.len() as u64)
            .unwrap_or(0))
    }
}
