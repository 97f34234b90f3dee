//! The per-task handle `Vfs` syscalls take in place of an implicit current
//! task pointer (SPEC_FULL.md §6, "Surface as Rust API, not syscalls").

use std::sync::atomic::{AtomicU32, Ordering};

use super::fd::FdTable;

static NEXT_TASK_ID: AtomicU32 = AtomicU32::new(1);

/// One simulated task: an fd table plus a process-group id used by TTY job
/// control (SPEC_FULL.md §4.2) and a signal-mask region for must-complete
/// paths like `close` racing `exit` (SPEC_FULL.md §5).
pub struct Task {
    pub id: u32,
    pub fds: FdTable,
    pub pgid: AtomicU32,
    signals_blocked: AtomicU32,
}

impl Task {
    pub fn new(max_fds: usize) -> Self {
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            id,
            fds: FdTable::new(max_fds),
            pgid: AtomicU32::new(id),
            signals_blocked: AtomicU32::new(0),
        }
    }

    /// The kernel task is special: it never inherits fds across fork
    /// (SPEC_FULL.md §4.3). Ordinary `fork` uses `FdTable::fork` instead.
    pub fn new_kernel_task(max_fds: usize) -> Self {
        Self::new(max_fds)
    }

    /// `fork`: child inherits cwd and umask; every file description's
    /// count is incremented by `FdTable::fork` (SPEC_FULL.md §4.3). The
    /// child keeps the parent's process group; the scheduler assigns a new
    /// one only if it becomes a session/group leader, which is outside this
    /// crate's scope (§1).
    pub fn fork(&self) -> Task {
        Task {
            id: NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed),
            fds: self.fds.fork(),
            pgid: AtomicU32::new(self.pgid.load(Ordering::Acquire)),
            signals_blocked: AtomicU32::new(0),
        }
    }

    pub fn block_signals(&self) -> SigBlockGuard<'_> {
        self.signals_blocked.fetch_add(1, Ordering::AcqRel);
        SigBlockGuard { task: self }
    }

    pub fn signals_blocked(&self) -> bool {
        self.signals_blocked.load(Ordering::Acquire) > 0
    }
}

/// RAII region around must-complete paths (`close` racing `exit`), mirroring
/// the source's `sig_block_all` (SPEC_FULL.md §5).
pub struct SigBlockGuard<'a> {
    task: &'a Task,
}

impl Drop for SigBlockGuard<'_> {
    fn drop(&mut self) {
        self.task.signals_blocked.fetch_sub(1, Ordering::AcqRel);
    }
}
