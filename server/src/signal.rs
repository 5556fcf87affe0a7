//! Signal handling for graceful shutdown.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Install SIGINT/SIGTERM handlers.
///
/// The returned flag flips to `true` on the first signal; a second
/// signal force-exits the process.
pub fn install_signal_handler() -> Arc<AtomicBool> {
    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();

    ctrlc::set_handler(move || {
        if flag.swap(true, Ordering::SeqCst) {
            tracing::warn!("second shutdown signal, exiting immediately");
            std::process::exit(1);
        }
        tracing::info!("shutdown signal received, draining");
    })
    .expect("failed to install signal handler");

    shutdown
}
