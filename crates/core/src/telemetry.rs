//! Tracing configuration.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{Error, Result};

/// Install the global subscriber. Logs go to stderr so program output on
/// stdout stays clean.
///
/// `RUST_LOG` wins when set; otherwise `debug` selects a verbose default
/// filter for the codebox crates.
pub fn configure_tracing(json: bool, debug: bool) -> Result<()> {
    let default_filter = if debug {
        "info,codebox=debug,codebox_sandbox=debug,codebox_core=debug"
    } else {
        "warn,codebox=info,codebox_sandbox=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    result.map_err(|e| Error::internal(format!("Failed to install tracing subscriber: {}", e)))
}
