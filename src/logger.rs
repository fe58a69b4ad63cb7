//! Subscriber setup for the `hog_optimize` binary. The library only emits `tracing` events.

use tracing::Level;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::SystemTime;

/// Install a fmt subscriber filtered at `default_level` unless `RUST_LOG` says otherwise.
/// A second call keeps the first subscriber.
pub fn init_logger(default_level: Level) {
    let filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(SystemTime)
        .with_target(true)
        .try_init();
}
