//! Generic gadget transaction lifecycle (SPEC_FULL.md §3, §4.4).
//!
//! Grounded on `original_source/sys/dev/usb/gadget/transaction.h`. The
//! source resolves the controller-specific transaction type with a C++
//! `dynamic_cast` from a `gadget::transaction*` base pointer; SPEC_FULL.md
//! §9 asks for a typed allocator per controller instead. This crate only
//! implements one controller (`fsl_usb2`), so `Transaction` is used
//! directly with no base/derived split at all — the cast this subsystem
//! worked around simply has nothing to check here.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

type DoneCallback = Box<dyn FnMut(i32) + Send>;
type FinaliseCallback = Box<dyn FnMut() + Send>;

/// Lifecycle: constructed -> clear -> set_buf -> queue -> started (set by
/// the controller) -> retired (`retired(status)` runs `done` then
/// `finalise`, then clears `running`).
///
/// Shared via `Arc<Transaction>` between the task that built it and the
/// controller driver that queues/retires it, so every field lives behind
/// interior mutability rather than requiring exclusive access.
pub struct Transaction {
    running: AtomicBool,
    buf: Mutex<Vec<u8>>,
    zero_length_termination: AtomicBool,
    done: Mutex<Option<DoneCallback>>,
    finalise: Mutex<Option<FinaliseCallback>>,
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            buf: Mutex::new(Vec::new()),
            zero_length_termination: AtomicBool::new(false),
            done: Mutex::new(None),
            finalise: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn zero_length_termination(&self) -> bool {
        self.zero_length_termination.load(Ordering::Acquire)
    }

    /// Resets the transaction to its just-constructed state.
    pub fn clear(&self) {
        self.running.store(false, Ordering::Release);
        self.buf.lock().clear();
        self.zero_length_termination.store(false, Ordering::Release);
        *self.done.lock() = None;
        *self.finalise.lock() = None;
    }

    pub fn set_buf(&self, buf: Vec<u8>, zero_length_termination: bool) {
        *self.buf.lock() = buf;
        self.zero_length_termination.store(zero_length_termination, Ordering::Release);
    }

    pub fn buf_len(&self) -> usize {
        self.buf.lock().len()
    }

    pub fn with_buf<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.buf.lock())
    }

    pub fn set_done(&self, cb: impl FnMut(i32) + Send + 'static) {
        *self.done.lock() = Some(Box::new(cb));
    }
    pub fn set_finalise(&self, cb: impl FnMut() + Send + 'static) {
        *self.finalise.lock() = Some(Box::new(cb));
    }

    /// Called by the controller once the hardware has accepted the
    /// transaction's descriptor chain.
    pub fn queue(&self) {
        self.running.store(true, Ordering::Release);
    }

    /// Called by the controller when the hardware reports completion
    /// (`status` is `0` for success, a negative `KernelError`-style code on
    /// failure): runs `done`, then `finalise`, then clears `running`.
    pub fn retired(&self, status: i32) {
        if let Some(done) = self.done.lock().as_mut() {
            done(status);
        }
        if let Some(finalise) = self.finalise.lock().as_mut() {
            finalise();
        }
        self.running.store(false, Ordering::Release);
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}
