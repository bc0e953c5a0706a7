//! Bounded sliding/tumbling time windows.
//!
//! A window retains only entries with `timestamp >= now - size`; eviction
//! is lazy and runs on every insert and read. Tumbling windows have
//! `slide == size`; sliding windows overlap with `slide < size`.
//! Callers pass `now` explicitly, so window behavior is a pure function
//! of the clock they observe.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::event::StreamEvent;

/// Shape of one named window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSpec {
    pub name: String,
    pub size_secs: u64,
    pub slide_secs: u64,
}

impl WindowSpec {
    pub fn new(name: impl Into<String>, size_secs: u64, slide_secs: u64) -> Self {
        Self {
            name: name.into(),
            size_secs,
            slide_secs,
        }
    }

    /// The standard multi-granularity set evaluated in parallel over one
    /// event stream: an overlapping one-minute window for fast signal,
    /// tumbling windows for the coarser grains.
    pub fn standard_set() -> Vec<Self> {
        vec![
            Self::new("1m", 60, 30),
            Self::new("5m", 300, 300),
            Self::new("15m", 900, 900),
            Self::new("1h", 3600, 3600),
        ]
    }

    pub fn size(&self) -> Duration {
        Duration::seconds(self.size_secs as i64)
    }

    pub fn slide(&self) -> Duration {
        Duration::seconds(self.slide_secs as i64)
    }

    pub fn is_tumbling(&self) -> bool {
        self.slide_secs >= self.size_secs
    }
}

/// Bounded accumulator of timestamped events.
#[derive(Debug, Clone)]
pub struct TimeWindow {
    spec: WindowSpec,
    entries: VecDeque<(DateTime<Utc>, StreamEvent)>,
    last_slide: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(spec: WindowSpec, now: DateTime<Utc>) -> Self {
        Self {
            spec,
            entries: VecDeque::new(),
            last_slide: now,
        }
    }

    pub fn spec(&self) -> &WindowSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an event, then evict everything older than `now - size`.
    /// Amortized O(1): each entry is pushed and popped at most once.
    pub fn add(&mut self, event: StreamEvent, timestamp: DateTime<Utc>, now: DateTime<Utc>) {
        self.entries.push_back((timestamp, event));
        self.evict(now);
    }

    /// Evict, then return an owned copy of the current entries.
    pub fn snapshot(&mut self, now: DateTime<Utc>) -> Vec<(DateTime<Utc>, StreamEvent)> {
        self.evict(now);
        self.entries.iter().cloned().collect()
    }

    /// Whether the slide interval has elapsed since the last slide.
    pub fn should_slide(&self, now: DateTime<Utc>) -> bool {
        now - self.last_slide >= self.spec.slide()
    }

    /// Mark a slide at `now` and evict expired entries.
    pub fn slide(&mut self, now: DateTime<Utc>) {
        self.last_slide = now;
        self.evict(now);
    }

    fn evict(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.spec.size();
        while let Some((ts, _)) = self.entries.front() {
            if *ts >= cutoff {
                break;
            }
            self.entries.pop_front();
        }
    }
}

/// The named windows running in parallel over one event stream, each
/// evaluated independently.
#[derive(Debug, Clone)]
pub struct WindowSet {
    windows: Vec<TimeWindow>,
}

impl WindowSet {
    pub fn new(specs: &[WindowSpec], now: DateTime<Utc>) -> Self {
        Self {
            windows: specs
                .iter()
                .map(|spec| TimeWindow::new(spec.clone(), now))
                .collect(),
        }
    }

    /// Insert one event into every window.
    pub fn add(&mut self, event: &StreamEvent, now: DateTime<Utc>) {
        for window in &mut self.windows {
            window.add(event.clone(), event.timestamp, now);
        }
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TimeWindow> {
        self.windows.iter_mut()
    }

    pub fn total_entries(&self) -> usize {
        self.windows.iter().map(TimeWindow::len).sum()
    }
}
