use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Installs the global subscriber.
///
/// An explicit `level` (from -v / -q) wins over `RUST_LOG`, which wins over `info`.
pub fn init_tracing(json: bool, level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let registry = tracing_subscriber::registry().with(filter);

    let result = if json {
        registry.with(fmt::layer().json().with_target(false)).try_init()
    } else {
        registry.with(fmt::layer().with_target(false).compact()).try_init()
    };

    // A subscriber installed earlier (tests, embedding) stays in place.
    if result.is_err() {
        tracing::debug!("Global tracing subscriber already set");
    }
}
