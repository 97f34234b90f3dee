//! Mount table: filesystem type operations vector, mount list, mount/umount.
//!
//! Grounded on `original_source/sys/fs/mount.c` and `sys/fs/mount.h`. The concrete
//! filesystem implementation (FAT, ramfs, devfs) is out of scope (SPEC_FULL.md
//! §1); what lives here is the `Filesystem` capability-set trait SPEC_FULL.md
//! §9 calls for in place of the source's macro-dispatch vop table, plus the
//! mount list itself.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::vnode::{FileType, Vnode};
use crate::error::{KErrorExt as _, KResult, KernelError};

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MountFlags: u32 {
        const RDONLY = 1 << 0;
        const NOEXEC = 1 << 1;
        const NOSUID = 1 << 2;
    }
}

/// Capability set a concrete filesystem implements. Replaces the source's
/// function-pointer vop table (SPEC_FULL.md §9): one method per vop, with
/// `vop_nullop`/`vop_einval` equivalents expressed as default trait methods.
pub trait Filesystem: Send + Sync {
    fn mount(&self, _root: &Arc<Vnode>, _device: Option<i32>) -> KResult<()> {
        Ok(())
    }
    fn unmount(&self) -> KResult<()> {
        Ok(())
    }
    fn lookup(&self, _dir: &Arc<Vnode>, _name: &str) -> KResult<Arc<Vnode>> {
        Err(KernelError::NotFound)
    }
    fn read(&self, _v: &Arc<Vnode>, _off: u64, _buf: &mut [u8]) -> KResult<usize> {
        Err(KernelError::NotSupported)
    }
    fn write(&self, _v: &Arc<Vnode>, _off: u64, _buf: &[u8]) -> KResult<usize> {
        Err(KernelError::NotSupported)
    }
    fn readdir(&self, _v: &Arc<Vnode>, _offset: u64) -> KResult<Vec<(String, u64, FileType)>> {
        Err(KernelError::NotSupported)
    }
    fn mknod(&self, _dir: &Arc<Vnode>, _name: &str, _ty: FileType, _mode: u32) -> KResult<Arc<Vnode>> {
        Err(KernelError::NotSupported)
    }
    fn unlink(&self, _dir: &Arc<Vnode>, _name: &str) -> KResult<()> {
        Err(KernelError::NotSupported)
    }
    fn rename(&self, _old_dir: &Arc<Vnode>, _old: &str, _new_dir: &Arc<Vnode>, _new: &str) -> KResult<()> {
        Err(KernelError::NotSupported)
    }
    fn getattr(&self, _v: &Arc<Vnode>) -> KResult<libc::stat> {
        Err(KernelError::NotSupported)
    }
    /// `chmod`/`chown` resolution: SPEC_FULL.md §4.3 promotes the source's
    /// TODO to a pinned no-op answering `NotSupported`. Concrete filesystems
    /// may override to honour it instead.
    fn setattr(&self, _v: &Arc<Vnode>, _mode: Option<u32>) -> KResult<()> {
        Err(KernelError::NotSupported)
    }
    fn truncate(&self, _v: &Arc<Vnode>, _len: u64) -> KResult<()> {
        Err(KernelError::NotSupported)
    }
    fn fsync(&self, _v: &Arc<Vnode>) -> KResult<()> {
        Ok(())
    }
    /// Filesystem teardown hook for a vnode whose refcount just hit zero.
    fn inactive(&self, _v: &Arc<Vnode>) {}
    fn statfs(&self) -> KResult<libc::statvfs> {
        Err(KernelError::NotSupported)
    }
}

/// `vop_nullop`: succeeds trivially, no side effect.
pub struct NullFs;
impl Filesystem for NullFs {}

static NEXT_MOUNT_ID: AtomicU32 = AtomicU32::new(1);

pub struct Mount {
    pub id: u32,
    pub fs: Arc<dyn Filesystem>,
    pub flags: MountFlags,
    refcount: AtomicU32,
    /// fd the device was mounted from, if any (block devices are external
    /// collaborators per SPEC_FULL.md §1; this crate only threads the fd).
    pub device_fd: Option<i32>,
    root: Mutex<Option<Arc<Vnode>>>,
    /// The vnode this mount is mounted over, on the parent filesystem. `None`
    /// for the root mount (SPEC_FULL.md §4.3).
    pub covered: Option<Arc<Vnode>>,
}

impl std::fmt::Debug for Mount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mount")
            .field("id", &self.id)
            .field("flags", &self.flags)
            .field("refcount", &self.refcount.load(Ordering::Relaxed))
            .finish()
    }
}

impl Mount {
    pub fn root(&self) -> Arc<Vnode> {
        self.root
            .lock()
            .clone()
            .expect("mount root set before any vnode can reference this mount")
    }

    pub fn reference(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }
    pub fn unreference(&self) -> bool {
        self.refcount.fetch_sub(1, Ordering::AcqRel) == 1
    }
    pub fn refcount(&self) -> u32 {
        self.refcount.load(Ordering::Acquire)
    }
}

/// Global mount list, protected by one process-wide mutex (SPEC_FULL.md §3, §5).
#[derive(Default)]
pub struct MountList {
    mounts: Mutex<Vec<Arc<Mount>>>,
}

impl MountList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mounts the root filesystem. Special-cased per SPEC_FULL.md §4.3: no
    /// covered vnode, no lookup needed.
    pub fn mount_root(&self, fs: Arc<dyn Filesystem>, flags: MountFlags) -> KResult<Arc<Mount>> {
        let mount = Arc::new(Mount {
            id: NEXT_MOUNT_ID.fetch_add(1, Ordering::Relaxed),
            fs: fs.clone(),
            flags,
            refcount: AtomicU32::new(1),
            device_fd: None,
            root: Mutex::new(None),
            covered: None,
        });
        let root = Vnode::new(mount.clone(), None, String::new(), FileType::Directory);
        *root.flags.lock() |= super::vnode::VnodeFlags::ROOT_OF_MOUNT;
        fs.mount(&root, None)?;
        *mount.root.lock() = Some(root);
        self.mounts.lock().push(mount.clone());
        Ok(mount)
    }

    /// Mounts `fs` over `covered`, per SPEC_FULL.md §4.3: allocate the
    /// mount's root vnode, run the filesystem mount call, hide `covered`.
    pub fn mount(
        &self,
        fs: Arc<dyn Filesystem>,
        flags: MountFlags,
        covered: Arc<Vnode>,
        device_fd: Option<i32>,
    ) -> KResult<Arc<Mount>> {
        if !covered.file_type.is_dir() {
            return Err(KernelError::NotADirectory.context("mount point must be a directory"));
        }
        // The mount's `covered` field is a long-lived holder of this vnode,
        // same as a `FileDescription`; released on `unmount`.
        covered.reference();
        let mount = Arc::new(Mount {
            id: NEXT_MOUNT_ID.fetch_add(1, Ordering::Relaxed),
            fs: fs.clone(),
            flags,
            refcount: AtomicU32::new(1),
            device_fd,
            root: Mutex::new(None),
            covered: Some(covered.clone()),
        });
        let root = Vnode::new(mount.clone(), None, String::new(), FileType::Directory);
        *root.flags.lock() |= super::vnode::VnodeFlags::ROOT_OF_MOUNT;
        fs.mount(&root, device_fd)?;
        *mount.root.lock() = Some(root);
        *covered.flags.lock() |= super::vnode::VnodeFlags::MOUNTED_OVER;
        self.mounts.lock().push(mount.clone());
        Ok(mount)
    }

    /// Unmounts `mount`, reversing `mount` in order: refuses if the root has
    /// more than one reference (SPEC_FULL.md §4.3).
    pub fn unmount(&self, mount: &Arc<Mount>) -> KResult<()> {
        let root = mount.root();
        if root.refcount() > 1 {
            return Err(KernelError::Busy.context("mount root still referenced"));
        }
        mount.fs.unmount()?;
        if let Some(covered) = &mount.covered {
            *covered.flags.lock() -= super::vnode::VnodeFlags::MOUNTED_OVER;
            covered.release();
        }
        self.mounts.lock().retain(|m| m.id != mount.id);
        Ok(())
    }

    pub fn is_mount_point(&self, v: &Vnode) -> bool {
        v.flags.lock().contains(super::vnode::VnodeFlags::MOUNTED_OVER)
    }

    /// Finds the mount whose `covered` vnode is `v`, used by lookup to cross
    /// into the mounted filesystem's root.
    pub fn mount_over(&self, v: &Vnode) -> Option<Arc<Mount>> {
        self.mounts
            .lock()
            .iter()
            .find(|m| m.covered.as_ref().is_some_and(|c| c.id == v.id))
            .cloned()
    }

    /// Finds the mount whose root vnode is `v`, used by `umount` once lookup
    /// has already crossed into the mounted filesystem.
    pub fn mount_with_root(&self, v: &Vnode) -> Option<Arc<Mount>> {
        self.mounts.lock().iter().find(|m| m.root().id == v.id).cloned()
    }

    pub fn len(&self) -> usize {
        self.mounts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
