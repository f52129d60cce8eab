use tracing_subscriber::{fmt, EnvFilter};

/// Directives used when `RUST_LOG` is unset; keeps sqlx statement logs quiet.
pub const DEFAULT_DIRECTIVES: &str = "info,sqlx=warn";

/// Install the global subscriber. Call once from `main.rs`.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    // Later calls keep the first subscriber.
    let installed = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .try_init()
        .is_ok();

    if installed {
        tracing::info!(version = env!("CARGO_PKG_VERSION"), "Logging initialized");
    }
}
