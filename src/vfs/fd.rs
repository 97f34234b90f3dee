//! File descriptions and the per-task file descriptor table.
//!
//! Grounded on `original_source/sys/fs/vfs.c`/`vfs.cpp` and
//! `usr/server/fs/vfs/vfs_task.c`'s fd array. The source packs a CLOEXEC bit
//! into the low bits of the stored
//! pointer and uses two sentinel values (empty / reserved-during-open); this
//! crate models the same three states as an explicit enum instead, since
//! Rust has no spare pointer bits to steal without `unsafe`.

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use super::vnode::Vnode;
use crate::error::{KErrorExt as _, KResult, KernelError};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: i32 {
        const RDONLY = libc::O_RDONLY;
        const WRONLY = libc::O_WRONLY;
        const RDWR = libc::O_RDWR;
        const CREAT = libc::O_CREAT;
        const EXCL = libc::O_EXCL;
        const TRUNC = libc::O_TRUNC;
        const APPEND = libc::O_APPEND;
        const NONBLOCK = libc::O_NONBLOCK;
        const CLOEXEC = libc::O_CLOEXEC;
        const NOFOLLOW = libc::O_NOFOLLOW;
        const DIRECTORY = libc::O_DIRECTORY;
    }
}

impl OpenFlags {
    pub fn writable(self) -> bool {
        (self.bits() & libc::O_ACCMODE) != libc::O_RDONLY
    }
    pub fn readable(self) -> bool {
        (self.bits() & libc::O_ACCMODE) != libc::O_WRONLY
    }
}

/// The shared, refcounted handle returned by `open` (SPEC_FULL.md §3). `dup`
/// and `fork` share one `FileDescription`; `close` decrements the count,
/// and reaching zero invokes the filesystem's close callback (modeled here
/// as `Filesystem::fsync` not being called — close has no dedicated vop in
/// this reduced model beyond flushing, matching the source's `vn_close`
/// which is mostly refcount bookkeeping plus `inactive`).
pub struct FileDescription {
    pub flags: OpenFlags,
    status_flags: parking_lot::Mutex<i32>,
    count: AtomicU32,
    pub offset: AtomicI64,
    pub vnode: Arc<Vnode>,
    /// Present when this file description is one end of a pipe
    /// (SPEC_FULL.md §4.3): `true` for the read end, `false` for write.
    pub pipe_read_end: Option<bool>,
}

impl FileDescription {
    pub fn new(flags: OpenFlags, vnode: Arc<Vnode>, pipe_read_end: Option<bool>) -> Arc<Self> {
        Arc::new(Self {
            flags,
            status_flags: parking_lot::Mutex::new(flags.bits() & !libc::O_ACCMODE),
            count: AtomicU32::new(1),
            offset: AtomicI64::new(0),
            vnode,
            pipe_read_end,
        })
    }

    pub fn reference(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reference; returns `true` if this was the last one (the
    /// caller should run the close side effects: pipe end teardown,
    /// filesystem-level close).
    #[must_use]
    pub fn unreference(&self) -> bool {
        self.count.fetch_sub(1, Ordering::AcqRel) == 1
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    pub fn status_flags(&self) -> i32 {
        *self.status_flags.lock()
    }
    pub fn set_status_flags(&self, f: i32) {
        *self.status_flags.lock() = f & !libc::O_ACCMODE;
    }

    /// `true` for character devices and FIFOs, which never advance
    /// `f_offset` (SPEC_FULL.md §4.3, "Offset vs positioned I/O").
    pub fn offset_tracking_disabled(&self) -> bool {
        matches!(
            self.vnode.file_type,
            super::vnode::FileType::CharDevice | super::vnode::FileType::Fifo
        )
    }
}

/// One fd table slot: empty, reserved (mid-`open`, per SPEC_FULL.md §4.3),
/// or installed with a CLOEXEC bit.
#[derive(Clone)]
enum Slot {
    Empty,
    Reserved,
    Installed { file: Arc<FileDescription>, cloexec: bool },
}

/// A task's fd table: array indexed by small non-negative integers, plus
/// cwd, umask, and a per-task rwlock (SPEC_FULL.md §3, §5).
pub struct FdTable {
    slots: RwLock<Vec<Slot>>,
    pub cwd: RwLock<Option<Arc<FileDescription>>>,
    umask: AtomicU32,
}

impl FdTable {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || Slot::Empty);
        Self {
            slots: RwLock::new(slots),
            cwd: RwLock::new(None),
            umask: AtomicU32::new(0o022),
        }
    }

    pub fn umask(&self) -> u32 {
        self.umask.load(Ordering::Acquire)
    }
    pub fn set_umask(&self, mask: u32) -> u32 {
        self.umask.swap(mask & 0o777, Ordering::AcqRel)
    }

    /// Finds the lowest free slot at or above `min_fd` and reserves it,
    /// returning its index. Mirrors `newfd`'s scan-from-minimum semantics,
    /// folded into the two-phase reserve/install `open` uses.
    pub fn reserve(&self, min_fd: i32) -> KResult<i32> {
        let mut slots = self.slots.write();
        let min = min_fd.max(0) as usize;
        if min >= slots.len() {
            slots.resize_with(min + 1, || Slot::Empty);
        }
        for (i, slot) in slots.iter_mut().enumerate().skip(min) {
            if matches!(slot, Slot::Empty) {
                *slot = Slot::Reserved;
                return Ok(i as i32);
            }
        }
        let i = slots.len();
        slots.push(Slot::Reserved);
        Ok(i as i32)
    }

    /// Installs `file` into a previously reserved slot, or clears the
    /// reservation on failure (`file = None`).
    pub fn install(&self, fd: i32, file: Option<Arc<FileDescription>>, cloexec: bool) {
        let mut slots = self.slots.write();
        if let Some(slot) = slots.get_mut(fd as usize) {
            *slot = match file {
                Some(file) => Slot::Installed { file, cloexec },
                None => Slot::Empty,
            };
        }
    }

    pub fn get(&self, fd: i32) -> KResult<Arc<FileDescription>> {
        if fd < 0 {
            return Err(KernelError::Invalid);
        }
        let slots = self.slots.read();
        match slots.get(fd as usize) {
            Some(Slot::Installed { file, .. }) => Ok(file.clone()),
            _ => Err(KernelError::NotFound.context("bad file descriptor")),
        }
    }

    /// Removes and returns the file at `fd`, if installed.
    pub fn take(&self, fd: i32) -> KResult<Arc<FileDescription>> {
        if fd < 0 {
            return Err(KernelError::Invalid);
        }
        let mut slots = self.slots.write();
        match slots.get_mut(fd as usize) {
            Some(slot @ Slot::Installed { .. }) => {
                let taken = std::mem::replace(slot, Slot::Empty);
                match taken {
                    Slot::Installed { file, .. } => Ok(file),
                    _ => unreachable!(),
                }
            }
            _ => Err(KernelError::NotFound),
        }
    }

    /// Duplicates `oldfd` into the lowest free slot at or above `min_fd`.
    pub fn dup_from(&self, oldfd: i32, min_fd: i32, cloexec: bool) -> KResult<i32> {
        let file = self.get(oldfd)?;
        file.reference();
        let fd = self.reserve(min_fd)?;
        self.install(fd, Some(file), cloexec);
        Ok(fd)
    }

    /// `dup2`/`dup3`: installs `oldfd`'s file at exactly `newfd`, closing
    /// whatever was there first.
    pub fn dup_onto(&self, oldfd: i32, newfd: i32, cloexec: bool) -> KResult<Vec<Arc<FileDescription>>> {
        if oldfd == newfd {
            self.get(oldfd)?;
            return Ok(Vec::new());
        }
        if newfd < 0 {
            return Err(KernelError::Invalid);
        }
        let file = self.get(oldfd)?;
        file.reference();
        let mut slots = self.slots.write();
        let idx = newfd as usize;
        if idx >= slots.len() {
            slots.resize_with(idx + 1, || Slot::Empty);
        }
        let previous = std::mem::replace(&mut slots[idx], Slot::Installed { file, cloexec });
        let closed = match previous {
            Slot::Installed { file, .. } => vec![file],
            _ => Vec::new(),
        };
        Ok(closed)
    }

    pub fn set_cloexec(&self, fd: i32, cloexec: bool) -> KResult<()> {
        let mut slots = self.slots.write();
        match slots.get_mut(fd as usize) {
            Some(Slot::Installed { cloexec: c, .. }) => {
                *c = cloexec;
                Ok(())
            }
            _ => Err(KernelError::NotFound),
        }
    }

    pub fn get_cloexec(&self, fd: i32) -> KResult<bool> {
        let slots = self.slots.read();
        match slots.get(fd as usize) {
            Some(Slot::Installed { cloexec, .. }) => Ok(*cloexec),
            _ => Err(KernelError::NotFound),
        }
    }

    /// Every installed `(fd, file, cloexec)` triple, for fork/exec/exit.
    fn installed(&self) -> Vec<(i32, Arc<FileDescription>, bool)> {
        self.slots
            .read()
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                Slot::Installed { file, cloexec } => Some((i as i32, file.clone(), *cloexec)),
                _ => None,
            })
            .collect()
    }

    /// `fork`: every file description's count is incremented; the new table
    /// is a structural copy (SPEC_FULL.md §4.3).
    pub fn fork(&self) -> FdTable {
        let slots = self.slots.read();
        let mut new_slots = Vec::with_capacity(slots.len());
        for s in slots.iter() {
            new_slots.push(match s {
                Slot::Empty => Slot::Empty,
                Slot::Reserved => Slot::Empty,
                Slot::Installed { file, cloexec } => {
                    file.reference();
                    Slot::Installed { file: file.clone(), cloexec: *cloexec }
                }
            });
        }
        let cwd = self.cwd.read().clone();
        if let Some(c) = &cwd {
            c.reference();
        }
        FdTable {
            slots: RwLock::new(new_slots),
            cwd: RwLock::new(cwd),
            umask: AtomicU32::new(self.umask()),
        }
    }

    /// `exec`: closes every directory-typed fd and every CLOEXEC fd,
    /// returning the files to finalise (decrement + run close side effects).
    pub fn exec_close(&self) -> Vec<Arc<FileDescription>> {
        let mut closed = Vec::new();
        let mut slots = self.slots.write();
        for s in slots.iter_mut() {
            if let Slot::Installed { file, cloexec } = s {
                if *cloexec || file.vnode.file_type.is_dir() {
                    closed.push(file.clone());
                    *s = Slot::Empty;
                }
            }
        }
        closed
    }

    /// `exit`: closes every fd and the cwd, returning everything to finalise.
    pub fn exit_close(&self) -> Vec<Arc<FileDescription>> {
        let mut closed: Vec<_> = self.installed().into_iter().map(|(_, f, _)| f).collect();
        let mut slots = self.slots.write();
        for s in slots.iter_mut() {
            *s = Slot::Empty;
        }
        drop(slots);
        if let Some(cwd) = self.cwd.write().take() {
            closed.push(cwd);
        }
        closed
    }
}
