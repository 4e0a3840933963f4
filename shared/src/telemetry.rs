//! Log output for shells that don't install their own subscriber.

use tracing_subscriber::{fmt, EnvFilter};

use crate::{AppError, AppResult, ErrorKind};

/// Installs a global fmt subscriber. `RUST_LOG` wins over `default_filter`.
///
/// Fails if a global subscriber is already set.
pub fn init_tracing(default_filter: &str) -> AppResult<()> {
    fmt()
        .with_env_filter(env_filter(default_filter))
        .with_target(true)
        .try_init()
        .map_err(|e| {
            AppError::new(ErrorKind::InvalidState, "Logging is already initialized")
                .with_internal(e.to_string())
        })
}

fn env_filter(default_filter: &str) -> EnvFilter {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    // Transport internals are noisy at debug.
    match "hyper=warn".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    }
}
