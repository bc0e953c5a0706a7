use thiserror::Error;

/// Errors surfaced by stream store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store is unreachable or refused the operation. Transient:
    /// callers retry with backoff.
    #[error("store unavailable: {reason}")]
    Unavailable { reason: String },

    /// Consumer group already exists on the stream. Callers creating
    /// idempotently treat this as success.
    #[error("consumer group `{group}` already exists on stream `{stream}`")]
    GroupExists { stream: String, group: String },

    #[error("no such stream `{stream}`")]
    NoSuchStream { stream: String },

    #[error("no such consumer group `{group}` on stream `{stream}`")]
    NoSuchGroup { stream: String, group: String },

    #[error("malformed entry id `{input}`")]
    MalformedEntryId { input: String },
}

impl StoreError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }

    /// Whether the error is transient and the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}
