//! Signal handling for watch mode: SIGTERM/SIGINT stop, SIGHUP reloads config.
//!
//! The watch loop polls these flags between passes and while sleeping.

#![allow(missing_docs)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use signal_hook::consts::{SIGINT, SIGTERM};

/// Signal flags shared between the OS handlers and the watch loop.
#[derive(Clone)]
pub struct SignalHandler {
    shutdown_flag: Arc<AtomicBool>,
    reload_flag: Arc<AtomicBool>,
}

impl SignalHandler {
    /// Create a handler and register OS hooks. Registration failures are logged, not fatal.
    pub fn new() -> Self {
        let handler = Self::detached();
        handler.register_signals();
        handler
    }

    /// Flags without OS registration, driven only by `request_*`.
    #[must_use]
    pub fn detached() -> Self {
        Self {
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            reload_flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn should_shutdown(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    /// Check and clear the reload request.
    pub fn should_reload(&self) -> bool {
        self.reload_flag.swap(false, Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
    }

    pub fn request_reload(&self) {
        self.reload_flag.store(true, Ordering::Relaxed);
    }

    /// Sleep up to `interval`, waking early on shutdown or reload.
    ///
    /// Returns `true` if the full interval elapsed.
    pub fn sleep(&self, interval: Duration) -> bool {
        let deadline = Instant::now() + interval;
        let tick = Duration::from_millis(200);
        loop {
            if self.should_shutdown() || self.reload_flag.load(Ordering::Relaxed) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(tick.min(deadline - now));
        }
    }

    fn register_signals(&self) {
        if let Err(e) = signal_hook::flag::register(SIGTERM, Arc::clone(&self.shutdown_flag)) {
            eprintln!("[DSN-SIGNAL] failed to register SIGTERM: {e}");
        }
        if let Err(e) = signal_hook::flag::register(SIGINT, Arc::clone(&self.shutdown_flag)) {
            eprintln!("[DSN-SIGNAL] failed to register SIGINT: {e}");
        }

        #[cfg(unix)]
        {
            use signal_hook::consts::SIGHUP;
            if let Err(e) = signal_hook::flag::register(SIGHUP, Arc::clone(&self.reload_flag)) {
                eprintln!("[DSN-SIGNAL] failed to register SIGHUP: {e}");
            }
        }
    }
}

impl Default for SignalHandler {
    fn default() -> Self {
        Self::new()
    }
}
