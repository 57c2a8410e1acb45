use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Install the global `tracing` subscriber.
///
/// In debug builds, default to debug level for this crate and info for the
/// rest. `RUST_LOG` overrides either default. Calling this twice is harmless.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("eddie_sync_lib=debug,info")
        } else {
            EnvFilter::new("info")
        }
    });

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub fn fmt_ms(d: Duration) -> String {
    let ms = d.as_millis();
    if ms == 0 { "<1ms".into() } else { format!("{}ms", ms) }
}
