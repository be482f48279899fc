use std::sync::atomic::{AtomicBool, Ordering};

use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber, filtered by `RUST_LOG` when set.
/// Later calls are no-ops, so tests can call this freely.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Global flag to control high-frequency real-time diagnostics
pub static RT_DEBUG_ENABLED: AtomicBool = AtomicBool::new(false);

/// Set real-time debug logging on/off
pub fn set_rt_debug(enabled: bool) {
    RT_DEBUG_ENABLED.store(enabled, Ordering::Relaxed);
    tracing::info!(
        "🔧 Real-time debug logging {}",
        if enabled { "ENABLED" } else { "DISABLED" }
    );
}

/// Check if real-time debug logging is enabled
pub fn is_rt_debug_enabled() -> bool {
    RT_DEBUG_ENABLED.load(Ordering::Relaxed)
}

/// Real-time debug macro - only logs if real-time debug is enabled
#[macro_export]
macro_rules! rt_debug {
    ($($arg:tt)*) => {
        if $crate::log::RT_DEBUG_ENABLED.load(std::sync::atomic::Ordering::Relaxed) {
            tracing::debug!($($arg)*);
        }
    };
}
