//! Worker lifecycle interface and the supervisor composing both workers.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{error, info};

use crate::error::EngineError;

/// Lifecycle state of a consumer-group worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Point-in-time status snapshot of one worker.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub state: WorkerState,
    pub running: bool,
    /// Items the worker has produced: feature points for the feature
    /// worker, detections for the pattern worker.
    pub items: u64,
}

/// Uniform lifecycle interface implemented by both workers and consumed
/// by the [`WorkerManager`].
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &'static str;

    /// Transition `stopped -> starting -> running`. Starting an already
    /// running worker is a no-op. A non-recoverable failure (e.g.
    /// consumer-group creation) aborts only this worker's start.
    async fn start(&self) -> Result<(), EngineError>;

    /// Transition `running -> stopping -> stopped`. Cancels the poll
    /// loop between cycles and awaits its completion under a bound.
    async fn stop(&self);

    fn status(&self) -> WorkerStatus;
}

/// Combined status of all managed workers.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub running: bool,
    pub workers: BTreeMap<String, WorkerStatus>,
}

/// Lifecycle supervisor for the feature and pattern workers. Pure
/// composition: start in order, stop in reverse, no domain logic.
pub struct WorkerManager {
    workers: Vec<Arc<dyn Worker>>,
}

impl WorkerManager {
    pub fn new(feature: Arc<dyn Worker>, pattern: Arc<dyn Worker>) -> Self {
        Self {
            workers: vec![feature, pattern],
        }
    }

    /// Start all workers in registration order. If any start fails, the
    /// ones already running are stopped again and the error is returned.
    pub async fn start(&self) -> Result<(), EngineError> {
        for (idx, worker) in self.workers.iter().enumerate() {
            if let Err(e) = worker.start().await {
                error!(worker = worker.name(), error = %e, "worker failed to start");
                for started in self.workers[..idx].iter().rev() {
                    started.stop().await;
                }
                return Err(e);
            }
            info!(worker = worker.name(), "worker started");
        }
        Ok(())
    }

    /// Stop all workers in reverse registration order.
    pub async fn stop(&self) {
        for worker in self.workers.iter().rev() {
            worker.stop().await;
            info!(worker = worker.name(), "worker stopped");
        }
    }

    pub fn status(&self) -> ManagerStatus {
        let workers: BTreeMap<String, WorkerStatus> = self
            .workers
            .iter()
            .map(|w| (w.name().to_string(), w.status()))
            .collect();
        ManagerStatus {
            running: workers.values().all(|s| s.running),
            workers,
        }
    }
}
