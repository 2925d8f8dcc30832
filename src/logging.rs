use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber for CLI and test binaries.
///
/// Honors `RUST_LOG`; defaults to `info`. Safe to call more than once —
/// later calls are no-ops.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}
