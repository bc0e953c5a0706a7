//! Tracing subscriber setup for embedding applications.

use tracing_subscriber::EnvFilter;

/// Default log filter directive.
pub const DEFAULT_LOG_FILTER: &str = "pulse_engine=info,pulse_store=info,pulse_gateway=info";

/// Install the global fmt subscriber. `RUST_LOG` wins over the passed
/// directive; a second call is a no-op so tests can init freely.
pub fn init(filter: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter.unwrap_or(DEFAULT_LOG_FILTER)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}
