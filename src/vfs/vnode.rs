//! In-core vnode: the object representing one named filesystem entity.
//!
//! Grounded on `original_source/sys/fs/vnode.cpp` and `sys/fs/vnode.h`:
//! refcounted, addressable in a global hash by `(parent, name)`, carrying a
//! recursive lock and a filesystem-private cookie. The cyclic parent/child
//! reference is broken per SPEC_FULL.md §9: a child holds a strong reference
//! to its parent, but the parent never links back to children directly —
//! anyone wanting a child goes through the hash.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::ReentrantMutex;

use super::mount::Mount;
use crate::error::{KErrorExt as _, KResult, KernelError};

bitflags::bitflags! {
    /// Short flag bitfield (SPEC_FULL.md §3, Vnode).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VnodeFlags: u32 {
        /// This vnode is the root vnode of a mount.
        const ROOT_OF_MOUNT = 1 << 0;
        /// Hidden because another filesystem is mounted over it.
        const MOUNTED_OVER = 1 << 1;
        const HIDDEN = 1 << 2;
    }
}

/// POSIX file type, stored alongside permission bits in `mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FileType {
    Regular = libc::S_IFREG,
    Directory = libc::S_IFDIR,
    CharDevice = libc::S_IFCHR,
    BlockDevice = libc::S_IFBLK,
    Fifo = libc::S_IFIFO,
    Symlink = libc::S_IFLNK,
    Socket = libc::S_IFSOCK,
}

impl FileType {
    pub fn is_dir(self) -> bool {
        matches!(self, FileType::Directory)
    }
    pub fn is_symlink(self) -> bool {
        matches!(self, FileType::Symlink)
    }
}

static NEXT_VNODE_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity used by the lock-order checker and the vnode hash key;
/// stands in for the source's bare pointer identity.
pub type VnodeId = u64;

/// Mutable, lock-protected vnode state (SPEC_FULL.md §3: mode, size, cached
/// block number, filesystem cookie, pipe cookie, file map).
#[derive(Debug, Default)]
pub struct VnodeState {
    pub mode: u32,
    pub size: u64,
    pub cached_block: Option<u64>,
    /// Filesystem-private cookie: opaque to the VFS core (out of scope per
    /// SPEC_FULL.md §1 — concrete filesystems are external collaborators).
    pub fs_cookie: usize,
    /// Set when this vnode backs a pipe (SPEC_FULL.md §4.3, Pipes).
    pub pipe: Option<Arc<super::pipe::Pipe>>,
}

/// An in-core vnode. Reachable either through the global hash (one logical
/// reference, released by `inactive`) or through live `Arc` clones held by
/// file descriptions / callers.
#[derive(Debug)]
pub struct Vnode {
    pub id: VnodeId,
    pub mount: Arc<Mount>,
    parent: Option<Arc<Vnode>>,
    pub name: String,
    refcount: AtomicUsize,
    pub flags: parking_lot::Mutex<VnodeFlags>,
    pub file_type: FileType,
    /// Recursive lock: the source takes it re-entrantly from within its own
    /// vop callbacks (e.g. `inactive` re-acquiring the lock dropped by the
    /// caller just before teardown).
    lock: ReentrantMutex<()>,
    pub state: parking_lot::Mutex<VnodeState>,
}

impl Vnode {
    pub fn new(mount: Arc<Mount>, parent: Option<Arc<Vnode>>, name: String, file_type: FileType) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_VNODE_ID.fetch_add(1, Ordering::Relaxed),
            mount,
            parent,
            name,
            refcount: AtomicUsize::new(1),
            flags: parking_lot::Mutex::new(VnodeFlags::empty()),
            file_type,
            lock: ReentrantMutex::new(()),
            state: parking_lot::Mutex::new(VnodeState::default()),
        })
    }

    pub fn parent(&self) -> Option<&Arc<Vnode>> {
        self.parent.as_ref()
    }

    pub fn is_ancestor_of(&self, other: &Vnode) -> bool {
        let mut cur = other.parent();
        while let Some(p) = cur {
            if p.id == self.id {
                return true;
            }
            cur = p.parent();
        }
        false
    }

    /// Acquire the vnode's recursive lock. Registers with the debug lock-order
    /// checker (SPEC_FULL.md §8, "Lock ordering"): a child lock may not be
    /// held while then acquiring its parent's lock.
    pub fn lock(self: &Arc<Self>) -> VnodeGuard<'_> {
        #[cfg(any(test, feature = "lock-order-checker"))]
        {
            let mut ancestors = Vec::new();
            let mut cur = self.parent();
            while let Some(p) = cur {
                ancestors.push(p.id);
                cur = p.parent();
            }
            let ok = crate::sync::lock_order::push_checked(self.id, ancestors);
            debug_assert!(ok, "vnode lock order violation: locked a parent while a child lock is held");
        }
        let guard = self.lock.lock();
        VnodeGuard { vnode: self, _guard: guard }
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// Increment the refcount (source: `vget`/`vn_reference`). Returns a new
    /// strong reference; callers typically clone the `Arc` they already have
    /// once this succeeds.
    pub fn reference(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    /// Drop one reference. Returns `true` if this was the last one, in which
    /// case the caller (the vnode cache) must remove it from the hash and run
    /// the filesystem's `inactive` callback before it is truly freed.
    #[must_use]
    pub fn unreference(&self) -> bool {
        self.refcount.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// `vput`: drops one reference; if it was the last one, removes this
    /// vnode from the hash (modeled implicitly, see the struct doc comment),
    /// runs the filesystem's `inactive` callback, then releases the
    /// parent's reference by recursing (SPEC_FULL.md §4.3). The single
    /// release point every long-term holder of a `Vnode` (a `FileDescription`,
    /// a task's cwd, a mount's `covered` vnode) must go through when it gives
    /// up its reference, mirroring `Vfs::vput` but usable from `mount.rs` too.
    ///
    /// The refcount-to-zero check and the `inactive` callback run with the
    /// parent locked first, then this vnode (SPEC_FULL.md §4.3, "Lock
    /// discipline": always acquire parent before child).
    pub fn release(self: &Arc<Self>) {
        let parent = self.parent().cloned();
        let was_last = match &parent {
            Some(p) => {
                let _parent_guard = p.lock();
                let _child_guard = self.lock();
                self.unreference()
            }
            None => {
                let _child_guard = self.lock();
                self.unreference()
            }
        };
        if was_last {
            self.mount.fs.inactive(self);
            if let Some(parent) = parent {
                parent.release();
            }
        }
    }
}

/// RAII guard for `Vnode::lock`; pops the lock-order-checker stack on drop.
pub struct VnodeGuard<'a> {
    vnode: &'a Vnode,
    _guard: parking_lot::ReentrantMutexGuard<'a, ()>,
}

impl Drop for VnodeGuard<'_> {
    fn drop(&mut self) {
        #[cfg(any(test, feature = "lock-order-checker"))]
        crate::sync::lock_order::pop(self.vnode.id);
    }
}

pub(super) fn check_file_type(v: &Vnode, want_dir: bool) -> KResult<()> {
    if want_dir && !v.file_type.is_dir() {
        return Err(KernelError::NotADirectory.context("expected a directory vnode"));
    }
    if !want_dir && v.file_type.is_dir() {
        return Err(KernelError::IsADirectory.context("unexpected directory vnode"));
    }
    Ok(())
}
