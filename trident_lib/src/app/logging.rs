use tracing_subscriber::EnvFilter;

/// Installs the global fmt subscriber. `default_directive` is used when
/// `RUST_LOG` is not set. Safe to call more than once; later calls are no-ops.
pub fn setup_logging(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init();
}
