//! Orderly shutdown on INT/HUP/TERM
//!
//! One `Shutdown` object is constructed in `main` and registered with the
//! signal layer. The signal handler itself only trips a flag; the work of
//! shutting down (unmounting, terminating children) happens in registered
//! hooks that `run` executes exactly once, on whichever thread calls it
//! first. `run` is safe to call from multiple places; later calls are
//! no-ops.

use crate::error::Result;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

static SIGNAL_TRIPPED: AtomicBool = AtomicBool::new(false);

extern "C" fn trip(_signum: nix::libc::c_int) {
    SIGNAL_TRIPPED.store(true, Ordering::SeqCst);
}

/// Process-wide shutdown coordinator
pub struct Shutdown {
    hooks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    ran: AtomicBool,
}

impl Shutdown {
    /// A coordinator with no hooks registered yet
    pub fn new() -> Arc<Shutdown> {
        Arc::new(Shutdown {
            hooks: Mutex::new(Vec::new()),
            ran: AtomicBool::new(false),
        })
    }

    /// Route INT, HUP and TERM to the shutdown flag
    ///
    /// Signals whose handler is already set to ignore stay ignored, the
    /// same courtesy `nohup` relies on.
    pub fn register_signals(&self) -> Result<()> {
        let action = SigAction::new(
            SigHandler::Handler(trip),
            SaFlags::empty(),
            SigSet::empty(),
        );
        for sig in [Signal::SIGINT, Signal::SIGHUP, Signal::SIGTERM] {
            unsafe {
                let old = signal::sigaction(sig, &action)
                    .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                if let SigHandler::SigIgn = old.handler() {
                    signal::sigaction(sig, &old)
                        .map_err(|e| std::io::Error::from_raw_os_error(e as i32))?;
                }
            }
        }
        debug!("signal handlers registered");
        Ok(())
    }

    /// Register a cleanup hook; hooks run in registration order
    pub fn on_shutdown(&self, hook: impl FnOnce() + Send + 'static) {
        self.hooks.lock().push(Box::new(hook));
    }

    /// True once a shutdown signal arrived
    ///
    /// Long loops poll this at iteration boundaries; there is no
    /// finer-grained per-request cancellation.
    pub fn is_requested(&self) -> bool {
        SIGNAL_TRIPPED.load(Ordering::SeqCst)
    }

    /// Run every registered hook, exactly once across all callers
    pub fn run(&self) {
        if self.ran.swap(true, Ordering::SeqCst) {
            return;
        }
        let hooks = std::mem::take(&mut *self.hooks.lock());
        if !hooks.is_empty() {
            info!(hooks = hooks.len(), "running shutdown hooks");
        }
        for hook in hooks {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_hooks_run_once() {
        let shutdown = Shutdown::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let c = Arc::clone(&count);
            shutdown.on_shutdown(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        shutdown.run();
        shutdown.run();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_late_hooks_do_not_fire() {
        let shutdown = Shutdown::new();
        shutdown.run();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        shutdown.on_shutdown(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        shutdown.run();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
