//! Logging setup.
//!
//! A single console layer, filtered either by `RUST_LOG` (falling back to
//! the level resolved from CLI flags) or, when logging was disabled with
//! `--quiet`, by a filter that admits nothing. No journald or rotating-file
//! layers: this service's CLI surface only exposes an on/off toggle, so
//! there is nothing further to configure.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global tracing subscriber.
///
/// `level` is `None` when `--quiet` was passed, in which case nothing is
/// logged regardless of `RUST_LOG`.
pub(crate) fn init(level: Option<LevelFilter>) {
    let filter = match level {
        None => EnvFilter::new("off"),
        Some(level) => EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env_lossy(),
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();
}
