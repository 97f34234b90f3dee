//! Virtual File System: path resolution, vnode cache, fd tables, pipes,
//! mount table (SPEC_FULL.md §4.3).

pub mod fd;
pub mod mount;
pub mod path;
pub mod pipe;
pub mod task;
pub mod vnode;

use std::sync::Arc;

use crate::config::VfsConfig;
use crate::error::{KErrorExt as _, KResult, KernelError};

pub use fd::{FileDescription, OpenFlags};
pub use mount::{Filesystem, Mount, MountFlags, MountList, NullFs};
pub use pipe::Pipe;
pub use task::Task;
pub use vnode::{FileType, Vnode, VnodeFlags};

/// `lseek` whence values plus the data-hole extensions (SPEC_FULL.md §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
    Data,
    Hole,
}

/// The VFS instance: mount list plus root vnode. One per kernel; tasks are
/// passed in explicitly by reference (SPEC_FULL.md §6).
pub struct Vfs {
    pub mounts: MountList,
    root: arc_swap_cell::ArcCell<Vnode>,
    config: VfsConfig,
}

/// Minimal swap cell so the root vnode can be set once after construction
/// (root mount needs a `Vfs` reference for nothing, but keeping the type
/// small avoids `Option<Mutex<..>>` boilerplate at every read site).
mod arc_swap_cell {
    use parking_lot::Mutex;
    use std::sync::Arc;

    pub struct ArcCell<T>(Mutex<Option<Arc<T>>>);

    impl<T> ArcCell<T> {
        pub fn new() -> Self {
            Self(Mutex::new(None))
        }
        pub fn set(&self, v: Arc<T>) {
            *self.0.lock() = Some(v);
        }
        pub fn get(&self) -> Arc<T> {
            self.0
                .lock()
                .clone()
                .expect("vfs root must be mounted before use")
        }
    }
}

impl Vfs {
    pub fn new(config: VfsConfig, root_fs: Arc<dyn Filesystem>) -> KResult<Self> {
        let mounts = MountList::new();
        let mount = mounts.mount_root(root_fs, MountFlags::empty())?;
        let vfs = Self { mounts, root: arc_swap_cell::ArcCell::new(), config };
        vfs.root.set(mount.root());
        Ok(vfs)
    }

    pub fn root(&self) -> Arc<Vnode> {
        self.root.get()
    }

    fn start_vnode(&self, task: &Task, dirfd: Option<i32>, path: &str) -> KResult<Arc<Vnode>> {
        if path.starts_with('/') {
            return Ok(self.root());
        }
        match dirfd {
            None => task
                .fds
                .cwd
                .read()
                .as_ref()
                .map(|f| f.vnode.clone())
                .ok_or(KernelError::Invalid),
            Some(fd) => Ok(task.fds.get(fd)?.vnode.clone()),
        }
    }

    /// `openat`. Reserves the fd slot, performs the (possibly slow) lookup
    /// and filesystem open, then installs the real file description under
    /// the table lock — mirroring the two-phase protocol in SPEC_FULL.md §4.3.
    pub fn openat(&self, task: &Task, dirfd: Option<i32>, path: &str, flags: OpenFlags, mode: u32) -> KResult<i32> {
        let start = self.start_vnode(task, dirfd, path)?;
        let no_follow = flags.contains(OpenFlags::NOFOLLOW);

        let vnode = match path::lookup(&self.mounts, self.root(), start.clone(), path, no_follow) {
            Ok(v) => {
                if flags.contains(OpenFlags::CREAT) && flags.contains(OpenFlags::EXCL) {
                    return Err(KernelError::AlreadyExists);
                }
                if flags.contains(OpenFlags::DIRECTORY) && !v.file_type.is_dir() {
                    return Err(KernelError::NotADirectory);
                }
                v
            }
            Err(KernelError::NotFound) if flags.contains(OpenFlags::CREAT) => {
                let (parent, name) = path::lookup_noexist(&self.mounts, self.root(), start, path)?;
                let _parent_guard = parent.lock();
                parent.mount.fs.mknod(&parent, &name, FileType::Regular, mode)?
            }
            Err(e) => return Err(e),
        };

        let fd = task.fds.reserve(0)?;
        // The hash's own reference (from `mknod`, or whichever reference a
        // prior lookup already accounts for) covers the vnode cache; the
        // file description we're about to install needs its own.
        vnode.reference();
        let file = FileDescription::new(flags, vnode, None);
        task.fds.install(fd, Some(file), flags.contains(OpenFlags::CLOEXEC));
        Ok(fd)
    }

    pub fn open(&self, task: &Task, path: &str, flags: OpenFlags, mode: u32) -> KResult<i32> {
        self.openat(task, None, path, flags, mode)
    }

    /// Closes `fd`. Always runs to completion even if signals would
    /// otherwise abort an interruptible wait (SPEC_FULL.md §5, §7): the
    /// caller is expected to wrap must-complete call sites in
    /// `Task::block_signals` themselves when racing `exit`.
    pub fn close(&self, task: &Task, fd: i32) -> KResult<()> {
        let file = task.fds.take(fd)?;
        self.finalize_close(&file);
        Ok(())
    }

    fn finalize_close(&self, file: &Arc<FileDescription>) {
        if file.unreference() {
            if let Some(read_end) = file.pipe_read_end {
                if let Some(pipe) = file.vnode.state.lock().pipe.clone() {
                    if read_end {
                        pipe.close_reader();
                    } else {
                        pipe.close_writer();
                    }
                }
            }
            let _ = file.vnode.mount.fs.fsync(&file.vnode);
            self.vput(&file.vnode);
        }
    }

    /// Drops one reference on `v`; if it reaches zero, removes it from the
    /// hash (modeled implicitly — this crate keeps no separate cache hash,
    /// `Arc` strong counts serve that role, see vnode.rs), runs `inactive`,
    /// then releases the parent's reference by recursing (SPEC_FULL.md §4.3).
    fn vput(&self, v: &Arc<Vnode>) {
        v.release();
    }

    pub fn read(&self, task: &Task, fd: i32, buf: &mut [u8]) -> KResult<usize> {
        let file = task.fds.get(fd)?;
        if !file.flags.readable() {
            return Err(KernelError::Permission);
        }
        if file.vnode.file_type == FileType::Fifo {
            let pipe = file.vnode.state.lock().pipe.clone().ok_or(KernelError::Invalid)?;
            return pipe.read(buf);
        }
        let off = file.offset.load(std::sync::atomic::Ordering::Acquire);
        let n = file.vnode.mount.fs.read(&file.vnode, off as u64, buf)?;
        if !file.offset_tracking_disabled() {
            file.offset.fetch_add(n as i64, std::sync::atomic::Ordering::AcqRel);
        }
        Ok(n)
    }

    pub fn write(&self, task: &Task, fd: i32, buf: &[u8]) -> KResult<usize> {
        let file = task.fds.get(fd)?;
        if !file.flags.writable() {
            return Err(KernelError::Permission);
        }
        if file.vnode.file_type == FileType::Fifo {
            let pipe = file.vnode.state.lock().pipe.clone().ok_or(KernelError::Invalid)?;
            return pipe.write(buf).map_err(|e| {
                if e == KernelError::PipeClosed {
                    log::debug!("write to pipe with no readers: raising SIGPIPE on task {}", task.id);
                }
                e
            });
        }
        let off = if file.flags.contains(OpenFlags::APPEND) {
            file.vnode.state.lock().size as i64
        } else {
            file.offset.load(std::sync::atomic::Ordering::Acquire)
        };
        let n = file.vnode.mount.fs.write(&file.vnode, off as u64, buf)?;
        if !file.offset_tracking_disabled() {
            file.offset.fetch_add(n as i64, std::sync::atomic::Ordering::AcqRel);
        }
        Ok(n)
    }

    /// `pread`: explicit offset, does not update `f_offset`.
    pub fn pread(&self, task: &Task, fd: i32, buf: &mut [u8], offset: u64) -> KResult<usize> {
        let file = task.fds.get(fd)?;
        if file.vnode.file_type == FileType::Fifo {
            return Err(KernelError::Invalid.context("pread unsupported on pipes"));
        }
        file.vnode.mount.fs.read(&file.vnode, offset, buf)
    }

    pub fn pwrite(&self, task: &Task, fd: i32, buf: &[u8], offset: u64) -> KResult<usize> {
        let file = task.fds.get(fd)?;
        if file.vnode.file_type == FileType::Fifo {
            return Err(KernelError::Invalid.context("pwrite unsupported on pipes"));
        }
        file.vnode.mount.fs.write(&file.vnode, offset, buf)
    }

    /// `lseek`, including the `SEEK_DATA`/`SEEK_HOLE` extensions. A
    /// filesystem that doesn't model holes reports the simple approximation
    /// named in SPEC_FULL.md §4.3: `SEEK_DATA` returns `offset`, `SEEK_HOLE`
    /// returns `size - offset`. Never valid on FIFOs.
    pub fn lseek(&self, task: &Task, fd: i32, offset: i64, whence: Whence) -> KResult<i64> {
        let file = task.fds.get(fd)?;
        if file.vnode.file_type == FileType::Fifo {
            return Err(KernelError::Invalid.context("lseek not valid on a pipe"));
        }
        let size = file.vnode.state.lock().size as i64;
        let cur = file.offset.load(std::sync::atomic::Ordering::Acquire);
        let new = match whence {
            Whence::Set => offset,
            Whence::Cur => cur + offset,
            Whence::End => size + offset,
            Whence::Data => offset,
            Whence::Hole => size - offset,
        };
        if new < 0 {
            return Err(KernelError::Invalid);
        }
        file.offset.store(new, std::sync::atomic::Ordering::Release);
        Ok(new)
    }

    pub fn fstat(&self, task: &Task, fd: i32) -> KResult<libc::stat> {
        let file = task.fds.get(fd)?;
        file.vnode.mount.fs.getattr(&file.vnode)
    }

    pub fn stat(&self, task: &Task, path: &str) -> KResult<libc::stat> {
        let start = self.start_vnode(task, None, path)?;
        let v = path::lookup(&self.mounts, self.root(), start, path, false)?;
        v.mount.fs.getattr(&v)
    }

    pub fn mkdir(&self, task: &Task, path: &str, mode: u32) -> KResult<()> {
        let start = self.start_vnode(task, None, path)?;
        let (parent, name) = path::lookup_noexist(&self.mounts, self.root(), start, path)?;
        let _parent_guard = parent.lock();
        parent.mount.fs.mknod(&parent, &name, FileType::Directory, mode)?;
        Ok(())
    }

    pub fn mknod(&self, task: &Task, path: &str, ty: FileType, mode: u32) -> KResult<()> {
        let start = self.start_vnode(task, None, path)?;
        let (parent, name) = path::lookup_noexist(&self.mounts, self.root(), start, path)?;
        let _parent_guard = parent.lock();
        parent.mount.fs.mknod(&parent, &name, ty, mode)?;
        Ok(())
    }

    /// `rmdir`/`unlink`: takes the parent lock, then the target vnode's own
    /// lock, before calling into the filesystem (SPEC_FULL.md §4.3, "Lock
    /// discipline": always acquire parent before child).
    pub fn rmdir(&self, task: &Task, path: &str) -> KResult<()> {
        let start = self.start_vnode(task, None, path)?;
        let v = path::lookup(&self.mounts, self.root(), start.clone(), path, true)?;
        if !v.file_type.is_dir() {
            return Err(KernelError::NotADirectory);
        }
        let parent = v.parent().ok_or(KernelError::Permission)?.clone();
        let _parent_guard = parent.lock();
        let _child_guard = v.lock();
        parent.mount.fs.unlink(&parent, &v.name)
    }

    pub fn unlink(&self, task: &Task, path: &str, remove_dir: bool) -> KResult<()> {
        if remove_dir {
            return self.rmdir(task, path);
        }
        let start = self.start_vnode(task, None, path)?;
        let v = path::lookup(&self.mounts, self.root(), start, path, true)?;
        if v.file_type.is_dir() {
            return Err(KernelError::IsADirectory);
        }
        let parent = v.parent().ok_or(KernelError::Permission)?.clone();
        let _parent_guard = parent.lock();
        let _child_guard = v.lock();
        parent.mount.fs.unlink(&parent, &v.name)
    }

    /// `rename`: refuses cross-filesystem renames with `CrossDevice`
    /// (SPEC_FULL.md §4.3, §7) and rejects moving a directory into its own
    /// descendant, which the source does not check (SPEC_FULL.md §9).
    pub fn rename(&self, task: &Task, old_path: &str, new_path: &str) -> KResult<()> {
        let start = self.start_vnode(task, None, old_path)?;
        let old_vnode = path::lookup(&self.mounts, self.root(), start, old_path, true)?;
        let old_parent = old_vnode.parent().ok_or(KernelError::Permission)?.clone();
        let old_name = old_vnode.name.clone();

        let new_start = self.start_vnode(task, None, new_path)?;
        let (new_parent, new_name) = match path::lookup_dir(&self.mounts, self.root(), new_start, new_path)? {
            path::LookupDirResult::Found(v) => (v.parent().ok_or(KernelError::Permission)?.clone(), v.name.clone()),
            path::LookupDirResult::Missing { parent, name } => (parent, name),
        };
        if old_parent.mount.id != new_parent.mount.id {
            return Err(KernelError::CrossDevice.context("rename across filesystems"));
        }
        if old_vnode.file_type.is_dir() && path::is_descendant(&old_vnode, &new_parent) {
            return Err(KernelError::Invalid.context("cannot rename a directory into its own descendant"));
        }

        // Lock both parent directories before the vnode being moved
        // (parent-before-child, SPEC_FULL.md §4.3/§5). The two parents are
        // locked in vnode-id order, not call order, so a concurrent rename
        // crossing the same pair of directories the other way can't deadlock.
        let (_first_parent_guard, _second_parent_guard) = if old_parent.id == new_parent.id {
            (old_parent.lock(), old_parent.lock())
        } else if old_parent.id < new_parent.id {
            (old_parent.lock(), new_parent.lock())
        } else {
            (new_parent.lock(), old_parent.lock())
        };
        let _child_guard = old_vnode.lock();
        old_parent.mount.fs.rename(&old_parent, &old_name, &new_parent, &new_name)
    }

    pub fn symlink(&self, task: &Task, target: &str, link_path: &str) -> KResult<()> {
        let start = self.start_vnode(task, None, link_path)?;
        let (parent, name) = path::lookup_noexist(&self.mounts, self.root(), start, link_path)?;
        let v = parent.mount.fs.mknod(&parent, &name, FileType::Symlink, 0o777)?;
        parent.mount.fs.write(&v, 0, target.as_bytes())?;
        Ok(())
    }

    pub fn readlink(&self, task: &Task, path: &str, buf: &mut [u8]) -> KResult<usize> {
        let start = self.start_vnode(task, None, path)?;
        let v = path::lookup(&self.mounts, self.root(), start, path, true)?;
        if !v.file_type.is_symlink() {
            return Err(KernelError::Invalid);
        }
        v.mount.fs.read(&v, 0, buf)
    }

    pub fn access(&self, task: &Task, path: &str) -> KResult<()> {
        let start = self.start_vnode(task, None, path)?;
        path::lookup(&self.mounts, self.root(), start, path, false).map(|_| ())
    }

    pub fn dup(&self, task: &Task, fd: i32) -> KResult<i32> {
        task.fds.dup_from(fd, 0, false)
    }

    pub fn dup2(&self, task: &Task, oldfd: i32, newfd: i32) -> KResult<i32> {
        let closed = task.fds.dup_onto(oldfd, newfd, false)?;
        for f in &closed {
            self.finalize_close(f);
        }
        Ok(newfd)
    }

    pub fn dup3(&self, task: &Task, oldfd: i32, newfd: i32, cloexec: bool) -> KResult<i32> {
        if oldfd == newfd {
            return Err(KernelError::Invalid);
        }
        let closed = task.fds.dup_onto(oldfd, newfd, cloexec)?;
        for f in &closed {
            self.finalize_close(f);
        }
        Ok(newfd)
    }

    /// `pipe2`: creates a FIFO vnode outside the mount hashes, two file
    /// descriptions sharing one `Pipe` (SPEC_FULL.md §4.3).
    pub fn pipe2(&self, task: &Task, flags: OpenFlags) -> KResult<(i32, i32)> {
        let pipe = Arc::new(Pipe::new(self.config.pipe_ring_size));
        let fifo_mount = self.root().mount.clone();
        let read_v = Vnode::new(fifo_mount.clone(), None, String::new(), FileType::Fifo);
        read_v.state.lock().pipe = Some(pipe.clone());
        read_v.reference(); // second fd shares this same vnode
        let write_v = read_v.clone();

        let nonblock = flags.contains(OpenFlags::NONBLOCK);
        let cloexec = flags.contains(OpenFlags::CLOEXEC);
        let mut rflags = OpenFlags::RDONLY;
        let mut wflags = OpenFlags::WRONLY;
        if nonblock {
            rflags |= OpenFlags::NONBLOCK;
            wflags |= OpenFlags::NONBLOCK;
        }

        let rfile = FileDescription::new(rflags, read_v, Some(true));
        let wfile = FileDescription::new(wflags, write_v, Some(false));

        let rfd = task.fds.reserve(0)?;
        task.fds.install(rfd, Some(rfile), cloexec);
        let wfd = task.fds.reserve(0)?;
        task.fds.install(wfd, Some(wfile), cloexec);
        Ok((rfd, wfd))
    }

    pub fn fsync(&self, task: &Task, fd: i32) -> KResult<()> {
        let file = task.fds.get(fd)?;
        file.vnode.mount.fs.fsync(&file.vnode)
    }

    pub fn chdir(&self, task: &Task, path: &str) -> KResult<()> {
        let start = self.start_vnode(task, None, path)?;
        let v = path::lookup(&self.mounts, self.root(), start, path, false)?;
        if !v.file_type.is_dir() {
            return Err(KernelError::NotADirectory);
        }
        v.reference();
        let file = FileDescription::new(OpenFlags::RDONLY, v, None);
        let old = task.fds.cwd.write().replace(file);
        if let Some(old) = old {
            self.finalize_close(&old);
        }
        Ok(())
    }

    pub fn umask(&self, task: &Task, mask: u32) -> u32 {
        task.fds.set_umask(mask)
    }

    /// `chmod`/`chown`: SPEC_FULL.md §4.3 pins the open question as
    /// `NotSupported` by default, delegated to the filesystem so a concrete
    /// implementation may choose to honour it instead.
    pub fn chmod(&self, task: &Task, fd: i32, mode: u32) -> KResult<()> {
        let file = task.fds.get(fd)?;
        file.vnode.mount.fs.setattr(&file.vnode, Some(mode))
    }

    /// `utimensat`: pinned as an accepted no-op (SPEC_FULL.md §4.3).
    pub fn utimensat(&self, _task: &Task, _path: &str) -> KResult<()> {
        Ok(())
    }

    pub fn mount(&self, fs: Arc<dyn Filesystem>, flags: MountFlags, target: &str, device_fd: Option<i32>) -> KResult<()> {
        let covered = path::lookup(&self.mounts, self.root(), self.root(), target, false)?;
        self.mounts.mount(fs, flags, covered, device_fd)?;
        Ok(())
    }

    pub fn umount(&self, target: &str) -> KResult<()> {
        let v = path::lookup(&self.mounts, self.root(), self.root(), target, false)?;
        if v.id == self.root().id {
            return Err(KernelError::Invalid.context("cannot unmount the root"));
        }
        let mount = self.mounts.mount_with_root(&v).ok_or(KernelError::NotFound)?;
        self.mounts.unmount(&mount)
    }

    pub fn sync(&self) {
        // Filesystems are external collaborators (SPEC_FULL.md §1); the core
        // has no dirty-page list of its own to flush beyond delegating.
    }

    pub fn getdents(&self, task: &Task, fd: i32) -> KResult<Vec<(String, u64, FileType)>> {
        let file = task.fds.get(fd)?;
        file.vnode.mount.fs.readdir(&file.vnode, 0)
    }

    pub fn fcntl_dupfd(&self, task: &Task, fd: i32, min_fd: i32, cloexec: bool) -> KResult<i32> {
        task.fds.dup_from(fd, min_fd, cloexec)
    }

    /// `fcntl(F_GETFD)`.
    pub fn fcntl_getfd(&self, task: &Task, fd: i32) -> KResult<bool> {
        task.fds.get_cloexec(fd)
    }

    /// `fcntl(F_SETFD)`.
    pub fn fcntl_setfd(&self, task: &Task, fd: i32, cloexec: bool) -> KResult<()> {
        task.fds.set_cloexec(fd, cloexec)
    }

    /// `fcntl(F_GETFL)`: access mode plus status flags.
    pub fn fcntl_getfl(&self, task: &Task, fd: i32) -> KResult<i32> {
        let file = task.fds.get(fd)?;
        Ok((file.flags.bits() & libc::O_ACCMODE) | file.status_flags())
    }

    /// `fcntl(F_SETFL)`: only the status flags (e.g. `O_NONBLOCK`, `O_APPEND`)
    /// are mutable; the access mode set at `open` is fixed.
    pub fn fcntl_setfl(&self, task: &Task, fd: i32, flags: i32) -> KResult<()> {
        let file = task.fds.get(fd)?;
        file.set_status_flags(flags);
        Ok(())
    }

    /// `chown`/`fchown`: same open-question resolution as `chmod`
    /// (SPEC_FULL.md §4.3) — delegated to the filesystem, `NotSupported` by
    /// default.
    pub fn fchown(&self, task: &Task, fd: i32, _uid: u32, _gid: u32) -> KResult<()> {
        let file = task.fds.get(fd)?;
        file.vnode.mount.fs.setattr(&file.vnode, None)
    }

    /// `statfs`/`fstatfs`.
    pub fn statfs(&self, task: &Task, path: &str) -> KResult<libc::statvfs> {
        let start = self.start_vnode(task, None, path)?;
        let v = path::lookup(&self.mounts, self.root(), start, path, false)?;
        v.mount.fs.statfs()
    }

    pub fn fstatfs(&self, task: &Task, fd: i32) -> KResult<libc::statvfs> {
        let file = task.fds.get(fd)?;
        file.vnode.mount.fs.statfs()
    }

    /// `getcwd`: reconstructs the absolute path by walking the cwd vnode's
    /// parent chain up to the root, same traversal `is_descendant` in
    /// `path.rs` uses in the other direction.
    pub fn getcwd(&self, task: &Task) -> KResult<String> {
        let cwd = task.fds.cwd.read().as_ref().map(|f| f.vnode.clone()).ok_or(KernelError::Invalid)?;
        let mut components = Vec::new();
        let mut cur = cwd;
        loop {
            let parent = cur.parent().cloned();
            match parent {
                None => break,
                Some(parent) => {
                    components.push(cur.name.clone());
                    cur = parent;
                }
            }
        }
        if components.is_empty() {
            return Ok("/".to_string());
        }
        components.reverse();
        Ok(format!("/{}", components.join("/")))
    }

    /// `fork`: child inherits cwd and umask; every file description's count
    /// is incremented (SPEC_FULL.md §4.3). The kernel task is special and
    /// never inherits fds — construct it with `Task::new_kernel_task` instead
    /// of forking.
    pub fn fork(&self, task: &Task) -> Task {
        task.fork()
    }

    /// `exec`: closes every directory-typed fd and every fd with CLOEXEC set
    /// (SPEC_FULL.md §4.3).
    pub fn exec(&self, task: &Task) {
        for file in task.fds.exec_close() {
            self.finalize_close(&file);
        }
    }

    /// `exit`: closes every fd and the cwd. Wrapped in `sig_block_all` so it
    /// always runs to completion even if racing a signal (SPEC_FULL.md §5,
    /// §7). Dispatching this onto a worker thread when called from IRQ or
    /// while holding the scheduler lock is the scheduler's responsibility
    /// (external collaborator, §1); this method performs the task-context
    /// close itself.
    pub fn exit(&self, task: &Task) {
        let _guard = task.block_signals();
        for file in task.fds.exit_close() {
            self.finalize_close(&file);
        }
    }
}
