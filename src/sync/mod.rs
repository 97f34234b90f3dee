//! Concurrency primitives shared by the worker threads of the TTY, UDC and MMC
//! host subsystems.
//!
//! Modeled on the synchronous multi-threaded worker loop of the teacher's
//! `session_mt` module: a `parking_lot::Mutex` + `Condvar` pair guarding a
//! small counter, rather than an async runtime. `parking_lot` is used instead
//! of `std::sync` because the rest of the crate (vnode locks, fd-table
//! rwlock, TTY state lock) already depends on it for non-poisoning locks.

mod semaphore;

pub use semaphore::Semaphore;

use std::sync::atomic::{AtomicBool, Ordering};

/// Raised on a subsystem to unblock every interruptible waiter with
/// `KernelError::Interrupted`, mirroring a POSIX signal hitting a sleeping task.
#[derive(Debug, Default)]
pub struct InterruptFlag(AtomicBool);

impl InterruptFlag {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Debug-only lock-order checker for the vnode parent-before-child rule
/// (SPEC_FULL.md §8, "Lock ordering"): a thread may never lock a vnode while
/// already holding the lock of one of its descendants. Each thread keeps a
/// stack of `(id, ancestor_ids)` pairs for the vnode locks it currently
/// holds, `ancestor_ids` being that vnode's own parent chain up to the root
/// as it stood at lock time. Locking `id` is a violation iff `id` appears in
/// the ancestor chain recorded for something already on the stack — that
/// would mean the held vnode is a descendant of `id`, i.e. the parent is
/// about to be locked after its child.
#[cfg(any(test, feature = "lock-order-checker"))]
pub mod lock_order {
    use std::cell::RefCell;

    thread_local! {
        static HELD: RefCell<Vec<(u64, Vec<u64>)>> = const { RefCell::new(Vec::new()) };
    }

    /// Record that `id` was just locked, whose ancestor chain (parent,
    /// grandparent, ... root) is `ancestors`. Returns `false` if doing so
    /// would violate parent-before-child ordering.
    pub fn push_checked(id: u64, ancestors: Vec<u64>) -> bool {
        HELD.with(|h| {
            let held = h.borrow();
            for (_, held_ancestors) in held.iter() {
                if held_ancestors.contains(&id) {
                    return false;
                }
            }
            drop(held);
            h.borrow_mut().push((id, ancestors));
            true
        })
    }

    pub fn pop(id: u64) {
        HELD.with(|h| {
            let mut held = h.borrow_mut();
            if let Some(pos) = held.iter().rposition(|(x, _)| *x == id) {
                held.remove(pos);
            }
        });
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        // Each test gets its own thread so the thread-local HELD stack
        // starts empty regardless of test execution order.
        fn in_fresh_thread<F: FnOnce() + Send + 'static>(f: F) {
            std::thread::spawn(f).join().unwrap();
        }

        #[test]
        fn parent_then_child_is_fine() {
            in_fresh_thread(|| {
                assert!(push_checked(1, vec![]));
                assert!(push_checked(2, vec![1]));
                pop(2);
                pop(1);
            });
        }

        #[test]
        fn child_then_parent_is_rejected() {
            in_fresh_thread(|| {
                // Lock the child first; `ancestors` records its parent chain.
                assert!(push_checked(2, vec![1]));
                // Locking the parent (id 1) while the child is held is the
                // violation: 1 appears in the held child's ancestor chain.
                assert!(!push_checked(1, vec![]));
                pop(2);
            });
        }

        #[test]
        fn pop_allows_the_same_id_to_be_locked_again() {
            in_fresh_thread(|| {
                assert!(push_checked(5, vec![]));
                pop(5);
                assert!(push_checked(5, vec![]));
                pop(5);
            });
        }
    }
}
