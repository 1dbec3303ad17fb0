//! Store statistics and the periodic progress ticker
//!
//! Statistics are written only from the driving thread; the ticker thread
//! reads them under the display lock, which is the same lock the driver
//! takes when printing, so a callback always observes a consistent set.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Counters describing one store/push operation
#[derive(Debug, Clone, Default)]
pub struct StoreStatistics {
    /// Regular files discovered in the origin
    pub num_files: usize,
    /// Directories discovered in the origin
    pub num_dirs: usize,
    /// Hard links rewritten into in-archive references
    pub num_hard_links: usize,
    /// Total logical bytes of the discovered files
    pub size_files: u64,
    /// Files that need to be written to the storage
    pub num_files_to_store: usize,
    /// Bytes that need to be written to the storage
    pub size_files_to_store: u64,
    /// Files written so far
    pub num_files_stored: usize,
    /// Bytes written so far
    pub size_files_stored: u64,
}

impl StoreStatistics {
    /// Fraction of planned bytes already stored, in `0..=1`
    pub fn progress(&self) -> f64 {
        if self.size_files_to_store == 0 {
            1.0
        } else {
            (self.size_files_stored as f64 / self.size_files_to_store as f64).min(1.0)
        }
    }
}

struct TickerShared {
    lock: Mutex<bool>,
    wake: Condvar,
}

/// Once-per-second callback thread
///
/// The callback runs with the display lock held; use
/// [`ProgressTicker::while_blocked`] from the driving thread to update the
/// progress line without racing the ticker.
pub struct ProgressTicker {
    shared: Arc<TickerShared>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ProgressTicker {
    /// Spawn the ticker; `callback` fires about once per second until drop
    pub fn start(callback: impl FnMut() + Send + 'static) -> Self {
        let shared = Arc::new(TickerShared {
            lock: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let mut callback = callback;
        let handle = thread::spawn(move || loop {
            let mut stopped = thread_shared.lock.lock();
            if *stopped {
                return;
            }
            let timed_out = thread_shared
                .wake
                .wait_for(&mut stopped, Duration::from_secs(1))
                .timed_out();
            if *stopped {
                return;
            }
            if timed_out {
                // Still holding the display lock: the driver cannot write
                // the progress line mid-callback.
                callback();
            }
        });
        ProgressTicker {
            shared,
            handle: Some(handle),
        }
    }

    /// Run `f` while the ticker callback is blocked out
    pub fn while_blocked<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.shared.lock.lock();
        f()
    }
}

impl Drop for ProgressTicker {
    fn drop(&mut self) {
        {
            let mut stopped = self.shared.lock.lock();
            *stopped = true;
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_progress_fraction() {
        let mut s = StoreStatistics::default();
        assert_eq!(s.progress(), 1.0);
        s.size_files_to_store = 100;
        s.size_files_stored = 25;
        assert_eq!(s.progress(), 0.25);
    }

    #[test]
    fn test_ticker_fires_and_stops() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        {
            let ticker = ProgressTicker::start(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            });
            ticker.while_blocked(|| {});
            thread::sleep(Duration::from_millis(2200));
        }
        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 1, "ticker never fired");
        let after = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(1200));
        assert_eq!(count.load(Ordering::SeqCst), after, "ticker ran after drop");
    }
}
