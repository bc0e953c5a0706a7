use pulse_store::StoreError;
use thiserror::Error;

/// Errors surfaced by the engine components.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A stream entry could not be decoded into an event. Per-message:
    /// the reader logs it, skips it, and still acknowledges it so a
    /// poison message cannot stall the group.
    #[error("malformed event record: {reason}")]
    Parse { reason: String },

    #[error("worker `{worker}` failed to start: {reason}")]
    WorkerStart {
        worker: &'static str,
        reason: String,
    },
}

impl EngineError {
    pub fn parse(reason: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
        }
    }
}
