//! Tracing initialisation for stowage front ends.
//!
//! The loader emits structured events (per-script failures, batch
//! summaries, cache repairs) through `tracing`; embedding programs call
//! [`init_tracing`] once at startup to see them. `RUST_LOG` overrides the
//! defaults when set.
//!
//! Safe to call more than once — subsequent calls are silently ignored
//! (the global subscriber can only be set once per process).

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Default verbosity when `RUST_LOG` is unset: loader progress at info,
/// plus per-script diagnostics when the loader's debug flag is on.
fn default_filter(debug: bool) -> &'static str {
    if debug {
        "stowage_core=debug"
    } else {
        "stowage_core=info"
    }
}

/// Initialise the global tracing subscriber.
///
/// * `debug` — pass the loader's debug flag; raises the default filter to
///   per-script diagnostics.
/// * `json` — when `true`, emit newline-delimited JSON log lines.
pub fn init_tracing(debug: bool, json: bool) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(debug)));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false).json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .try_init()
            .ok();
    }
}
