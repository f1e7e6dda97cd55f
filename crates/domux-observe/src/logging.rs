use tracing_subscriber::EnvFilter;

/// Environment variable consulted before `RUST_LOG`.
pub const LOG_ENV: &str = "DOMUX_LOG";

/// Directive used when neither `DOMUX_LOG` nor `RUST_LOG` parses.
pub const DEFAULT_DIRECTIVE: &str = "info";

/// Installs the global `fmt` subscriber. A second call leaves the first one in place.
///
/// Field conventions:
/// - `step` on anything tied to a training step.
/// - `domain` and `metric` on every reward-estimation event.
/// - Lifecycle events use target `domux_controller`, metric snapshots `domux_metrics`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter(DEFAULT_DIRECTIVE))
        .try_init();
}

pub fn env_filter(fallback: &str) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(fallback))
}
