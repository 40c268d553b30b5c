//! Logging initialization.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Default filter used when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "info,cadence=debug";

/// Initialize the global tracing subscriber.
///
/// Filtering comes from `RUST_LOG` when present, otherwise
/// [`DEFAULT_FILTER`]. Events carry their target and thread id, which makes
/// it possible to tell the render thread apart from the window thread.
///
/// Calling this more than once is harmless: later calls leave the first
/// subscriber in place.
///
/// # Example
/// ```
/// cadence_core::init_logging();
/// tracing::info!("Frame pipeline starting");
/// ```
pub fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .try_init();
}
