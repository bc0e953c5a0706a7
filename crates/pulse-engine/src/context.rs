//! Application context: every component constructed once at startup and
//! passed explicitly — no ambient global state.

use std::sync::Arc;

use tracing::info;

use pulse_store::StreamStore;

use crate::config::PulseConfig;
use crate::error::EngineError;
use crate::features::FeatureWorker;
use crate::patterns::PatternWorker;
use crate::producer::EventProducer;
use crate::worker::WorkerManager;

/// Owns the producer and both analytics workers over one shared store
/// client. The gateway layer holds this context and queries it for
/// read-only snapshots; nothing in here is shared mutably.
pub struct PulseContext {
    store: Arc<dyn StreamStore>,
    producer: EventProducer,
    features: FeatureWorker,
    patterns: PatternWorker,
    manager: WorkerManager,
}

impl PulseContext {
    pub fn new(store: Arc<dyn StreamStore>, config: PulseConfig) -> Self {
        let producer = EventProducer::new(store.clone(), config.producer);
        let features = FeatureWorker::new(store.clone(), config.features);
        let patterns = PatternWorker::new(store.clone(), config.patterns);
        let manager = WorkerManager::new(
            Arc::new(features.clone()),
            Arc::new(patterns.clone()),
        );
        Self {
            store,
            producer,
            features,
            patterns,
            manager,
        }
    }

    /// Start the producer flush loop and both workers.
    pub async fn start_all(&self) -> Result<(), EngineError> {
        self.producer.start().await;
        self.manager.start().await?;
        info!("pulse context started");
        Ok(())
    }

    /// Stop workers first, then the producer, whose final flush drains
    /// the buffer so a clean shutdown loses no events.
    pub async fn stop_all(&self) {
        self.manager.stop().await;
        self.producer.stop().await;
        info!("pulse context stopped");
    }

    pub fn store(&self) -> &Arc<dyn StreamStore> {
        &self.store
    }

    pub fn producer(&self) -> &EventProducer {
        &self.producer
    }

    pub fn features(&self) -> &FeatureWorker {
        &self.features
    }

    pub fn patterns(&self) -> &PatternWorker {
        &self.patterns
    }

    pub fn manager(&self) -> &WorkerManager {
        &self.manager
    }
}
