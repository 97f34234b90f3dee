//! Path resolution: `lookup`, `lookup_dir`, `lookup_noexist`.
//!
//! Grounded on `original_source/sys/fs/vfs.c` and `sys/fs/vfs.cpp`. Segments are
//! consumed one `/`-delimited token at a time; `.`/`..` are handled by the
//! resolver (`..` at root stays at root); symlinks are followed inline with
//! a depth cap, restarting resolution at the link's parent.

use std::sync::Arc;

use super::mount::MountList;
use super::vnode::Vnode;
use crate::error::{KErrorExt as _, KResult, KernelError};

pub const MAX_SYMLINK_DEPTH: u32 = 16;

/// Result of `lookup_dir`: either the vnode exists, or it doesn't and the
/// locked parent plus the missing component name are returned instead.
pub enum LookupDirResult {
    Found(Arc<Vnode>),
    Missing { parent: Arc<Vnode>, name: String },
}

fn split_first<'a>(path: &'a str) -> (&'a str, &'a str) {
    match path.find('/') {
        Some(i) => (&path[..i], path[i + 1..].trim_start_matches('/')),
        None => (path, ""),
    }
}

/// Crosses from a mount point's covered vnode to the mounted filesystem's
/// root, if one is mounted there (SPEC_FULL.md §4.3).
fn cross_mount(mounts: &MountList, v: Arc<Vnode>) -> Arc<Vnode> {
    if mounts.is_mount_point(&v) {
        if let Some(m) = mounts.mount_over(&v) {
            return m.root();
        }
    }
    v
}

/// Reads a symlink's target using the filesystem's `read` vop, mirroring the
/// source's reuse of a resolver-owned one-path-page scratch buffer.
fn read_link_target(v: &Arc<Vnode>) -> KResult<String> {
    let mut buf = vec![0u8; 4096];
    let n = v.mount.fs.read(v, 0, &mut buf)?;
    String::from_utf8(buf[..n].to_vec()).map_err(|_| KernelError::Invalid.context("symlink target not utf8"))
}

struct Resolver<'a> {
    mounts: &'a MountList,
    root: Arc<Vnode>,
    depth: u32,
}

impl<'a> Resolver<'a> {
    /// Resolves all but the last path component, returning the locked
    /// directory vnode the final component should be interpreted against,
    /// and the final component string.
    fn resolve_to_parent(&mut self, start: Arc<Vnode>, path: &str) -> KResult<(Arc<Vnode>, String)> {
        let mut dir = cross_mount(self.mounts, start);
        let mut rest = path.trim_start_matches('/');
        loop {
            let (comp, tail) = split_first(rest);
            if tail.is_empty() {
                return Ok((dir, comp.to_string()));
            }
            dir = self.step(dir, comp, false)?;
            rest = tail;
        }
    }

    /// Consumes one component, following symlinks (unless `no_follow`) and
    /// crossing mount points as it goes.
    fn step(&mut self, dir: Arc<Vnode>, comp: &str, no_follow: bool) -> KResult<Arc<Vnode>> {
        if comp.is_empty() || comp == "." {
            return Ok(dir);
        }
        if comp == ".." {
            return Ok(dir.parent().cloned().unwrap_or(dir));
        }
        let next = dir.mount.fs.lookup(&dir, comp)?;
        if next.file_type.is_symlink() && !no_follow {
            self.depth += 1;
            if self.depth > MAX_SYMLINK_DEPTH {
                return Err(KernelError::TooManyLinks.context("symlink recursion depth exceeded"));
            }
            let target = read_link_target(&next)?;
            let restart_from = next.parent().cloned().unwrap_or_else(|| self.root.clone());
            return self.resolve(restart_from, &target, false);
        }
        Ok(cross_mount(self.mounts, next))
    }

    /// Full resolution of `path`, starting from `start`.
    fn resolve(&mut self, start: Arc<Vnode>, path: &str, no_follow_last: bool) -> KResult<Arc<Vnode>> {
        if path.is_empty() {
            return Ok(start);
        }
        let mut dir = cross_mount(self.mounts, start);
        let mut rest = path.trim_start_matches('/');
        loop {
            let (comp, tail) = split_first(rest);
            if comp.is_empty() {
                return Ok(dir);
            }
            let is_last = tail.is_empty();
            dir = self.step(dir, comp, is_last && no_follow_last)?;
            if is_last {
                return Ok(dir);
            }
            rest = tail;
        }
    }
}

/// Looks up `path` starting at `start` (the dirfd's vnode, or the VFS root
/// for an absolute path). `no_follow` suppresses following a symlink at the
/// final component (`O_NOFOLLOW`).
pub fn lookup(mounts: &MountList, root: Arc<Vnode>, start: Arc<Vnode>, path: &str, no_follow: bool) -> KResult<Arc<Vnode>> {
    let base = if path.starts_with('/') { root.clone() } else { start };
    let mut r = Resolver { mounts, root, depth: 0 };
    r.resolve(base, path, no_follow)
}

/// `lookup_dir`: resolves all but the final component, then attempts the
/// final lookup, returning `Missing` instead of an error if it does not
/// exist (so callers like `openat(O_CREAT)` can create it).
pub fn lookup_dir(mounts: &MountList, root: Arc<Vnode>, start: Arc<Vnode>, path: &str) -> KResult<LookupDirResult> {
    let base = if path.starts_with('/') { root.clone() } else { start };
    let mut r = Resolver { mounts, root: root.clone(), depth: 0 };
    let (parent, name) = r.resolve_to_parent(base, path)?;
    if !parent.file_type.is_dir() {
        return Err(KernelError::NotADirectory);
    }
    match parent.mount.fs.lookup(&parent, &name) {
        Ok(v) => Ok(LookupDirResult::Found(cross_mount(mounts, v))),
        Err(KernelError::NotFound) => Ok(LookupDirResult::Missing { parent, name }),
        Err(e) => Err(e),
    }
}

/// `lookup_noexist`: like `lookup_dir` but requires the final component not
/// to already exist; returns the locked parent directory.
pub fn lookup_noexist(mounts: &MountList, root: Arc<Vnode>, start: Arc<Vnode>, path: &str) -> KResult<(Arc<Vnode>, String)> {
    match lookup_dir(mounts, root, start, path)? {
        LookupDirResult::Missing { parent, name } => Ok((parent, name)),
        LookupDirResult::Found(_) => Err(KernelError::AlreadyExists),
    }
}

pub fn is_descendant(ancestor: &Vnode, maybe_descendant: &Vnode) -> bool {
    ancestor.is_ancestor_of(maybe_descendant) || ancestor.id == maybe_descendant.id
}
