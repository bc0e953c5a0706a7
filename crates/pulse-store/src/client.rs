use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{EntryId, GroupStart, ReadFrom, StreamBatch, StreamRecord};

/// Client contract for the external append-log store.
///
/// Within one stream, append order is preserved and observed by group
/// readers; across streams no relative order is guaranteed. The store's
/// consumer-group registry is the sole source of truth for delivery and
/// lease state — callers perform no coordination of their own.
#[async_trait]
pub trait StreamStore: Send + Sync {
    /// Append a record to a stream, creating the stream if needed.
    /// Returns the id assigned to the new entry.
    async fn append(&self, stream: &str, record: StreamRecord) -> Result<EntryId, StoreError>;

    /// Create a consumer group on a stream.
    ///
    /// Returns [`StoreError::GroupExists`] if the group is already
    /// present; idempotent callers ignore that variant. With
    /// `create_stream_if_missing` the stream itself is created empty.
    async fn create_consumer_group(
        &self,
        stream: &str,
        group: &str,
        start: GroupStart,
        create_stream_if_missing: bool,
    ) -> Result<(), StoreError>;

    /// Read up to `count` entries across the given streams on behalf of
    /// `consumer` within `group`, blocking up to `block` when nothing is
    /// immediately available.
    ///
    /// Delivered entries become pending (leased to the consumer) until
    /// acknowledged. Streams with no entries are omitted from the result.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[(String, ReadFrom)],
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamBatch>, StoreError>;

    /// Acknowledge a delivered entry, removing it from the group's
    /// pending set. Acknowledging an unknown id is a no-op.
    async fn ack(&self, stream: &str, group: &str, id: EntryId) -> Result<(), StoreError>;

    /// Number of entries currently in the stream.
    async fn length(&self, stream: &str) -> Result<u64, StoreError>;
}
