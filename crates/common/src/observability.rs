//! Logging setup shared by the fabric binaries.

use std::sync::Once;

use tracing::Span;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

/// Installs the global subscriber: an fmt layer filtered by `RUST_LOG`,
/// falling back to `default_filter`. Later calls are no-ops.
pub fn init_tracing(default_filter: &str) {
    INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(false))
            .init();
    });
}

/// Span wrapping the lifetime of one container.
#[must_use]
pub fn container_span(role: &str, container_id: &str) -> Span {
    tracing::info_span!("container", role = role, container_id = container_id)
}
