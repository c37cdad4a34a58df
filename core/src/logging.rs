// Tracing setup for embedders and tests

use tracing_subscriber::EnvFilter;

/// Install a formatting subscriber (idempotent)
///
/// `RUST_LOG` wins when set; otherwise `default_level` applies
/// (e.g. `"info"` or `"meshbearer_core=debug"`).
pub fn init(default_level: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .try_init();
}
