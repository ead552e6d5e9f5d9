use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "PRUNEGUARD_LOG";

/// Installs the stderr subscriber. `PRUNEGUARD_LOG` takes an `EnvFilter`
/// directive and wins over `default_level`. Safe to call more than once.
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
