use tracing_subscriber::{EnvFilter, fmt};

/// Installs the process-wide `tracing` subscriber. Later calls are ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}
