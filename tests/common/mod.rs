//! Shared test fixture: a minimal in-memory filesystem implementing
//! `apexkern::vfs::Filesystem`, used to drive the VFS syscall scenarios in
//! SPEC_FULL.md §8 end to end through the public `Vfs` API rather than
//! through any single module in isolation.
//!
//! Grounded the way the teacher's own `tests/integration_tests.rs` drives a
//! minimal `Filesystem` impl (`NoSendFS`) through the real session/mount
//! path instead of unit-testing `fuser` internals directly.

use std::collections::HashMap;
use std::sync::Arc;

use apexkern::vfs::vnode::VnodeId;
use apexkern::vfs::{FileType, Filesystem, Vnode};
use apexkern::{KErrorExt as _, KResult, KernelError};

struct Inode {
    data: Vec<u8>,
    file_type: FileType,
}

/// A trivial ramfs: directory entries keyed by parent vnode id, file/symlink
/// bytes keyed by vnode id. No on-disk backing, no holes, no permission
/// checks beyond file type — just enough to drive path resolution, fd
/// lifecycle and pipe/readlink scenarios through the real `Vfs` façade.
#[derive(Default)]
pub struct MemFs {
    entries: std::sync::Mutex<HashMap<VnodeId, HashMap<String, Arc<Vnode>>>>,
    inodes: std::sync::Mutex<HashMap<VnodeId, Inode>>,
}

impl MemFs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl Filesystem for MemFs {
    fn mount(&self, root: &Arc<Vnode>, _device: Option<i32>) -> KResult<()> {
        self.entries.lock().unwrap().insert(root.id, HashMap::new());
        Ok(())
    }

    fn lookup(&self, dir: &Arc<Vnode>, name: &str) -> KResult<Arc<Vnode>> {
        self.entries
            .lock()
            .unwrap()
            .get(&dir.id)
            .and_then(|children| children.get(name).cloned())
            .ok_or(KernelError::NotFound)
    }

    fn mknod(&self, dir: &Arc<Vnode>, name: &str, ty: FileType, _mode: u32) -> KResult<Arc<Vnode>> {
        let mut entries = self.entries.lock().unwrap();
        let children = entries.entry(dir.id).or_default();
        if children.contains_key(name) {
            return Err(KernelError::AlreadyExists);
        }
        let child = Vnode::new(dir.mount.clone(), Some(dir.clone()), name.to_string(), ty);
        children.insert(name.to_string(), child.clone());
        if ty.is_dir() {
            self.entries_insert_empty(child.id);
        } else {
            self.inodes.lock().unwrap().insert(child.id, Inode { data: Vec::new(), file_type: ty });
        }
        Ok(child)
    }

    fn read(&self, v: &Arc<Vnode>, off: u64, buf: &mut [u8]) -> KResult<usize> {
        let inodes = self.inodes.lock().unwrap();
        let inode = inodes.get(&v.id).ok_or_else(|| KernelError::Invalid.context("read on a directory"))?;
        let off = off as usize;
        if off >= inode.data.len() {
            return Ok(0);
        }
        let n = (inode.data.len() - off).min(buf.len());
        buf[..n].copy_from_slice(&inode.data[off..off + n]);
        Ok(n)
    }

    fn write(&self, v: &Arc<Vnode>, off: u64, buf: &[u8]) -> KResult<usize> {
        let mut inodes = self.inodes.lock().unwrap();
        let inode = inodes.get_mut(&v.id).ok_or_else(|| KernelError::Invalid.context("write on a directory"))?;
        let off = off as usize;
        if inode.data.len() < off + buf.len() {
            inode.data.resize(off + buf.len(), 0);
        }
        inode.data[off..off + buf.len()].copy_from_slice(buf);
        v.state.lock().size = inode.data.len() as u64;
        Ok(buf.len())
    }

    fn readdir(&self, v: &Arc<Vnode>, _offset: u64) -> KResult<Vec<(String, u64, FileType)>> {
        Ok(self
            .entries
            .lock()
            .unwrap()
            .get(&v.id)
            .map(|children| children.values().map(|c| (c.name.clone(), c.id, c.file_type)).collect())
            .unwrap_or_default())
    }

    fn unlink(&self, dir: &Arc<Vnode>, name: &str) -> KResult<()> {
        let mut entries = self.entries.lock().unwrap();
        let removed = entries.get_mut(&dir.id).and_then(|children| children.remove(name)).ok_or(KernelError::NotFound)?;
        self.inodes.lock().unwrap().remove(&removed.id);
        entries.remove(&removed.id);
        Ok(())
    }

    fn rename(&self, old_dir: &Arc<Vnode>, old: &str, new_dir: &Arc<Vnode>, new: &str) -> KResult<()> {
        let mut entries = self.entries.lock().unwrap();
        let moved = entries.get_mut(&old_dir.id).and_then(|c| c.remove(old)).ok_or(KernelError::NotFound)?;
        entries.entry(new_dir.id).or_default().insert(new.to_string(), moved);
        Ok(())
    }

    fn getattr(&self, v: &Arc<Vnode>) -> KResult<libc::stat> {
        // SAFETY: `libc::stat` is a plain-old-data struct of integers; a
        // zeroed instance is valid, matching the teacher's own test
        // fixtures' use of a minimal stat() stand-in.
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        st.st_mode = v.file_type as u32 | 0o644;
        st.st_size = v.state.lock().size as i64;
        Ok(st)
    }

    fn inactive(&self, _v: &Arc<Vnode>) {}
}

impl MemFs {
    fn entries_insert_empty(&self, id: VnodeId) {
        self.entries.lock().unwrap().entry(id).or_default();
    }
}

pub fn new_vfs() -> apexkern::vfs::Vfs {
    apexkern::vfs::Vfs::new(apexkern::VfsConfig::default(), MemFs::new()).expect("mounting the root memfs")
}

pub fn new_task() -> apexkern::vfs::Task {
    apexkern::vfs::Task::new(apexkern::VfsConfig::default().max_fds)
}
