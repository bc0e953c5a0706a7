//! Engine configuration types.
//!
//! Loading these from files or the environment is the embedding
//! application's concern; the defaults here are the production values.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::window::WindowSpec;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    pub producer: ProducerConfig,
    pub features: FeatureWorkerConfig,
    pub patterns: PatternWorkerConfig,
}

/// Event producer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Buffer capacity; reaching it triggers an immediate synchronous
    /// flush before `produce` returns.
    pub buffer_capacity: usize,
    /// Periodic flush interval in milliseconds.
    pub flush_interval_ms: u64,
    pub backoff: FlushBackoff,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 100,
            flush_interval_ms: 5000,
            backoff: FlushBackoff::default(),
        }
    }
}

impl ProducerConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Backoff policy for consecutive flush failures.
///
/// Delays grow exponentially with jitter up to `max_delay_ms`; once
/// `cooldown_after` consecutive failures accumulate the producer holds at
/// the extended `cooldown_ms` between attempts. There is no give-up
/// point: the store is retried indefinitely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushBackoff {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub use_jitter: bool,
    /// Consecutive failures after which the extended cool-down engages.
    pub cooldown_after: u32,
    pub cooldown_ms: u64,
}

impl Default for FlushBackoff {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            multiplier: 2.0,
            use_jitter: true,
            cooldown_after: 5,
            cooldown_ms: 60000,
        }
    }
}

impl FlushBackoff {
    /// Delay before the next flush attempt, given the number of
    /// consecutive failures so far. Zero failures means the regular
    /// periodic cadence applies and no backoff delay is added.
    pub fn delay_for_attempt(&self, consecutive_failures: u32) -> Duration {
        if consecutive_failures == 0 {
            return Duration::ZERO;
        }

        let base_ms = if consecutive_failures >= self.cooldown_after {
            self.cooldown_ms
        } else {
            let scaled = self.initial_delay_ms as f64
                * self
                    .multiplier
                    .powi(consecutive_failures.saturating_sub(1) as i32);
            scaled.min(self.max_delay_ms as f64) as u64
        };

        let delay_ms = if self.use_jitter {
            // Up to 25% jitter on top of the base delay.
            base_ms + (base_ms as f64 * 0.25 * rand::random::<f64>()) as u64
        } else {
            base_ms
        };

        Duration::from_millis(delay_ms)
    }
}

/// Feature worker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureWorkerConfig {
    pub group: String,
    pub consumer: String,
    /// Max entries taken per poll cycle.
    pub batch_size: usize,
    /// Blocking-read bound per poll cycle in milliseconds.
    pub block_ms: u64,
    pub windows: Vec<WindowSpec>,
    /// Max retained values per feature name.
    pub history_capacity: usize,
    /// Max retained rolling processing-time samples.
    pub samples_capacity: usize,
}

impl Default for FeatureWorkerConfig {
    fn default() -> Self {
        Self {
            group: "pulse:features".to_string(),
            consumer: "features-1".to_string(),
            batch_size: 64,
            block_ms: 1000,
            windows: WindowSpec::standard_set(),
            history_capacity: 100,
            samples_capacity: 1000,
        }
    }
}

impl FeatureWorkerConfig {
    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }
}

/// Pattern worker configuration: one consumer group fanning in across the
/// operation, interaction, and metric streams, plus the rule thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternWorkerConfig {
    pub group: String,
    pub consumer: String,
    pub batch_size: usize,
    pub block_ms: u64,
    /// Operations slower than this are flagged.
    pub latency_threshold_ms: f64,
    /// Interactions longer than this are flagged.
    pub interaction_ceiling_ms: f64,
    /// Percentage system metrics above this are flagged.
    pub metric_threshold_pct: f64,
    /// Max retained detections.
    pub history_capacity: usize,
    /// Compaction cadence in milliseconds.
    pub compact_interval_ms: u64,
}

impl Default for PatternWorkerConfig {
    fn default() -> Self {
        Self {
            group: "pulse:patterns".to_string(),
            consumer: "patterns-1".to_string(),
            batch_size: 64,
            block_ms: 1000,
            latency_threshold_ms: 1000.0,
            interaction_ceiling_ms: 30000.0,
            metric_threshold_pct: 90.0,
            history_capacity: 500,
            compact_interval_ms: 60000,
        }
    }
}

impl PatternWorkerConfig {
    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    pub fn compact_interval(&self) -> Duration {
        Duration::from_millis(self.compact_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_without_jitter() {
        let backoff = FlushBackoff {
            initial_delay_ms: 1000,
            max_delay_ms: 10000,
            multiplier: 2.0,
            use_jitter: false,
            cooldown_after: 10,
            cooldown_ms: 60000,
        };

        assert_eq!(backoff.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(backoff.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(backoff.delay_for_attempt(3), Duration::from_millis(4000));
        // Capped at the max delay.
        assert_eq!(backoff.delay_for_attempt(9), Duration::from_millis(10000));
    }

    #[test]
    fn backoff_strictly_increases_across_attempts_even_with_jitter() {
        // Jitter adds at most 25%, so the attempt-3 delay (4x base) is
        // strictly above the attempt-1 delay (1x base) in every draw.
        let backoff = FlushBackoff::default();
        let after_first = backoff.delay_for_attempt(1);
        let after_third = backoff.delay_for_attempt(3);
        assert!(after_third > after_first);
    }

    #[test]
    fn backoff_enters_extended_cooldown_after_threshold() {
        let backoff = FlushBackoff {
            use_jitter: false,
            ..FlushBackoff::default()
        };
        assert_eq!(
            backoff.delay_for_attempt(backoff.cooldown_after),
            Duration::from_millis(backoff.cooldown_ms)
        );
        // Never gives up: the cool-down delay holds, it does not grow to
        // infinity or stop retrying.
        assert_eq!(
            backoff.delay_for_attempt(backoff.cooldown_after + 10),
            Duration::from_millis(backoff.cooldown_ms)
        );
    }

    #[test]
    fn config_defaults_deserialize_from_empty_document() {
        let config: PulseConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.producer.buffer_capacity, 100);
        assert_eq!(config.features.windows.len(), 4);
        assert_eq!(config.patterns.latency_threshold_ms, 1000.0);
    }
}
