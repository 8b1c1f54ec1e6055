//! Telemetry initialization (tracing/tracing-subscriber).
//!
//! Behavior:
//! - LOG_LEVEL controls the filter (e.g. "debug" or detailed directives like
//!   "info,question=debug,lingo_backend=debug,tower_http=info,axum=info").
//! - LOG_FORMAT selects "pretty" (default) or "json" structured logs.
//!
//! Targets are always printed: `lingo_backend` covers the process, transport
//! and providers, `question` covers generation, buffering and verification.

use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_DIRECTIVES: &str = "info,question=debug,lingo_backend=debug,tower_http=info,axum=info";

fn filter_from_env() -> EnvFilter {
    EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

pub fn init_tracing() {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter_from_env())
        .with_target(true)
        .with_file(true)
        .with_line_number(true);

    let format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
    info!(target: "lingo_backend", format = if format == "json" { "json" } else { "pretty" }, "Tracing initialized");
}
