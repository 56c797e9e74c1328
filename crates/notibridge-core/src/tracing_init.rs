//! Shared tracing/logging initialization.
//!
//! Host processes embedding the session core call this once at startup to
//! install a `tracing_subscriber` with an env-filter and optional JSON output.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::LoggingConfig;

/// Install the global subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_filter` applies, for
/// example `"notibridge_session=debug"` to trace one device session's
/// state changes. Returns `false` when a subscriber was already installed,
/// leaving that one in place.
pub fn init_tracing(default_filter: &str, json: bool) -> bool {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(|| fmt::layer()))
        .try_init()
        .is_ok()
}

/// Install the subscriber from the `logging` section of the config, at
/// `logging.level` for both NotiBridge crates.
pub fn init_from_config(logging: &LoggingConfig) -> bool {
    let filter = format!(
        "notibridge_core={level},notibridge_session={level}",
        level = logging.level
    );
    init_tracing(&filter, logging.json)
}
