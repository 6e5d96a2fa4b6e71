use tracing_subscriber::EnvFilter;

use crate::config::TelemetryConfig;

/// Resolve the log filter: `RUST_LOG` wins, then the configured directive,
/// then `info`.
pub fn env_filter(cfg: &TelemetryConfig) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cfg.log_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install the global fmt subscriber. Returns `false` if one was already set.
pub fn init_tracing(cfg: &TelemetryConfig) -> bool {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(cfg))
        .with_target(false);
    let installed = if cfg.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.is_ok()
}
