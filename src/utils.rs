use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::EnvFilter;

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Installs a `fmt` subscriber filtered by `RUST_LOG`, defaulting to `info`.
/// Task spans carry the branch path, and thread names (`t.<path>`) are
/// printed alongside every event.
///
/// Calling this more than once is a no-op.
pub fn init_logging() -> anyhow::Result<()> {
    if INSTALLED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .try_init()
        .map_err(anyhow::Error::msg)
}
