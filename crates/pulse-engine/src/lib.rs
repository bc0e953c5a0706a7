//! # Pulse Engine
//!
//! The streaming analytics core: ingests operational events from a memory
//! service, streams them through an append-log store, and derives windowed
//! features and rule-based pattern detections in real time.
//!
//! Components, leaf to root:
//!
//! - [`event`] — typed event model and the flat wire codec used on the
//!   store.
//! - [`producer`] — buffered, batching event producer with failure
//!   backoff and capacity back-pressure.
//! - [`window`] — bounded sliding/tumbling time windows.
//! - [`features`] — consumer-group worker computing windowed features.
//! - [`patterns`] — consumer-group worker applying threshold rules across
//!   streams.
//! - [`worker`] — the worker lifecycle interface and the manager
//!   supervising both workers.
//! - [`context`] — the application context wiring it all together.
//!
//! Every component runs on its own task, guards its own state behind a
//! single lock, and publishes only owned snapshots to the outside.

pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod features;
pub mod logging;
pub mod patterns;
pub mod producer;
pub mod window;
pub mod worker;

pub use config::{
    FeatureWorkerConfig, FlushBackoff, PatternWorkerConfig, ProducerConfig, PulseConfig,
};
pub use context::PulseContext;
pub use error::EngineError;
pub use event::{EventPayload, EventType, StreamEvent};
pub use features::{FeatureValue, FeatureWorker, WindowedFeature};
pub use patterns::{PatternDetection, PatternType, PatternWorker};
pub use producer::{EventProducer, ProducerStats};
pub use window::{TimeWindow, WindowSet, WindowSpec};
pub use worker::{ManagerStatus, Worker, WorkerManager, WorkerState, WorkerStatus};
