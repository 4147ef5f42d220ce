use std::sync::Once;

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static LOG_INIT: Once = Once::new();

/// Default directive when neither `RUST_LOG` nor the caller provides one
const DEFAULT_DIRECTIVE: &str = "info";

/// Install the global tracing subscriber, once per process.
///
/// `RUST_LOG` wins over `default_value`; `default_value` wins over `info`.
/// Subsequent calls are no-ops, so every test can call this first.
pub fn log_init(default_value: Option<&str>) {
    LOG_INIT.call_once(|| {
        let directive = std::env::var("RUST_LOG")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default_value.unwrap_or(DEFAULT_DIRECTIVE).to_owned());
        tracing_setup(&directive);
    });
}

fn tracing_setup(directive: &str) {
    let format = tracing_subscriber::fmt::layer()
        .with_level(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(true)
        .compact();

    let filter =
        EnvFilter::try_new(directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    // another subscriber may already be installed by the host application
    if tracing_subscriber::registry()
        .with(filter)
        .with(format)
        .try_init()
        .is_err()
    {
        tracing::debug!("a global tracing subscriber is already installed");
    }
}
