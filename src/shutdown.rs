use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time;

// Set from the signal handler, which may only touch atomics
static SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn termination_handler(_sig: libc::c_int) {
    SIGNALLED.store(true, Ordering::Relaxed);
}

/// Routes SIGINT, SIGHUP and SIGTERM to the process-wide shutdown flag. Signals the process was
/// started with ignored stay ignored.
pub fn install_signal_handlers() {
    for sig in [libc::SIGINT, libc::SIGHUP, libc::SIGTERM] {
        unsafe {
            let handler = termination_handler as *const () as libc::sighandler_t;
            let previous = libc::signal(sig, handler);
            if previous == libc::SIG_IGN {
                libc::signal(sig, libc::SIG_IGN);
            }
        }
    }
}

pub fn signal_received() -> bool {
    SIGNALLED.load(Ordering::Relaxed)
}

struct Inner {
    triggered: AtomicBool,
    lock: Mutex<()>,
    cvar: Condvar,
}

/// Cancellation shared by the pacer's loops.
#[derive(Clone)]
pub struct Shutdown {
    inner: Arc<Inner>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                triggered: AtomicBool::new(false),
                lock: Mutex::new(()),
                cvar: Condvar::new(),
            }),
        }
    }

    pub fn trigger(&self) {
        self.inner.triggered.store(true, Ordering::Relaxed);

        let _guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.inner.cvar.notify_all();
    }

    /// True once triggered, or once a termination signal has arrived.
    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::Relaxed) || signal_received()
    }

    /// Sleeps for `timeout` unless triggered first. Returns true if triggered.
    pub fn wait_timeout(&self, timeout: time::Duration) -> bool {
        let deadline = time::Instant::now() + timeout;
        let mut guard = self.inner.lock.lock().unwrap_or_else(|e| e.into_inner());

        loop {
            if self.is_triggered() {
                return true;
            }

            let now = time::Instant::now();
            if now >= deadline {
                return false;
            }

            guard = match self.inner.cvar.wait_timeout(guard, deadline - now) {
                Ok((guard, _)) => guard,
                Err(e) => e.into_inner().0,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_times_out() {
        let shutdown = Shutdown::new();
        let start = time::Instant::now();

        assert!(!shutdown.wait_timeout(time::Duration::from_millis(20)));
        assert!(start.elapsed() >= time::Duration::from_millis(20));
    }

    #[test]
    fn trigger_wakes_waiter() {
        let shutdown = Shutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            thread::spawn(move || shutdown.wait_timeout(time::Duration::from_secs(30)))
        };

        thread::sleep(time::Duration::from_millis(10));
        shutdown.trigger();

        assert!(waiter.join().unwrap());
        assert!(shutdown.is_triggered());
    }
}
