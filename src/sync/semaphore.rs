use parking_lot::{Condvar, Mutex};
use std::time::Duration;

/// A counting semaphore used to wake DPC/worker threads from IRQ context.
///
/// `post_once` is the irq-safe entry point (source: `semaphore::post_once`,
/// called from `host::bus_changed_debounce_timeout`, the UDC isr, and
/// `tty_rx_putc`'s callers) — it only ever sets the count to at least one
/// and never blocks. `wait_interruptible` is the task-context counterpart
/// used by the worker thread's main loop.
pub struct Semaphore {
    count: Mutex<u64>,
    cvar: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            count: Mutex::new(0),
            cvar: Condvar::new(),
        }
    }

    /// Post exactly once: raises the count to at least 1 without
    /// accumulating further wakeups. Safe to call from an irq-context stub.
    pub fn post_once(&self) {
        let mut count = self.count.lock();
        if *count == 0 {
            *count = 1;
            self.cvar.notify_one();
        }
    }

    /// Post, incrementing the count (used by the USB/MMC completion paths
    /// that want every event observed exactly once).
    pub fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cvar.notify_one();
    }

    /// Block until posted, or return `false` if `stop` becomes true while waiting.
    pub fn wait_interruptible(&self, stop: &super::InterruptFlag) -> bool {
        let mut count = self.count.lock();
        while *count == 0 {
            if stop.is_raised() {
                return false;
            }
            self.cvar.wait_for(&mut count, Duration::from_millis(200));
            if stop.is_raised() {
                return false;
            }
        }
        *count -= 1;
        true
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::InterruptFlag;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn post_once_wakes_single_waiter() {
        let sem = Arc::new(Semaphore::new());
        let stop = Arc::new(InterruptFlag::new());
        let sem2 = sem.clone();
        let stop2 = stop.clone();
        let t = thread::spawn(move || sem2.wait_interruptible(&stop2));
        thread::sleep(Duration::from_millis(20));
        sem.post_once();
        assert!(t.join().unwrap());
    }

    #[test]
    fn stop_flag_unblocks_waiter() {
        let sem = Arc::new(Semaphore::new());
        let stop = Arc::new(InterruptFlag::new());
        let sem2 = sem.clone();
        let stop2 = stop.clone();
        let t = thread::spawn(move || sem2.wait_interruptible(&stop2));
        thread::sleep(Duration::from_millis(20));
        stop.raise();
        assert!(!t.join().unwrap());
    }

    #[test]
    fn post_once_does_not_accumulate() {
        let sem = Semaphore::new();
        sem.post_once();
        sem.post_once();
        let stop = InterruptFlag::new();
        assert!(sem.wait_interruptible(&stop));
        // second wait should time out against the stop flag quickly because
        // post_once collapsed both posts into a single wakeup.
        stop.raise();
        assert!(!sem.wait_interruptible(&stop));
    }
}
