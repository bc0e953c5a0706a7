//! # Pulse Store
//!
//! Contract for the external append-log store that backs the event
//! pipeline, plus an in-process implementation.
//!
//! The store keeps durable, ordered, per-stream record logs and supports
//! competing consumer groups with at-least-once delivery: every entry
//! handed to a group member stays pending until that member acknowledges
//! it, and idle pending entries are eventually redelivered to another
//! member of the same group.
//!
//! The pipeline only ever talks to the [`StreamStore`] trait. The bundled
//! [`MemoryStore`] implements the full contract in-process and is what the
//! test suite and local development runs use.

mod client;
mod error;
mod memory;
mod types;

pub use client::StreamStore;
pub use error::StoreError;
pub use memory::MemoryStore;
pub use types::{EntryId, GroupStart, ReadFrom, StreamBatch, StreamRecord};
