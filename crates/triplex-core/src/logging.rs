//! Tracing subscriber setup for binaries, benches and tests embedding the core

use crate::config::LogFormat;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "triplex_core=info";

/// Install a global subscriber filtered by `RUST_LOG`.
///
/// Returns `false` when a subscriber was already installed, which is expected when
/// several tests in one binary call this.
pub fn init_logging(format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => {
            registry.with(tracing_subscriber::fmt::layer().with_target(false)).try_init().is_ok()
        }
        LogFormat::Json => {
            registry.with(tracing_subscriber::fmt::layer().json()).try_init().is_ok()
        }
    }
}
