//! Property check of SPEC_FULL.md §8 "Vnode refcount": for any sequence of
//! syscalls that returns without panicking, once every fd (and the cwd) a
//! test has opened is closed, each vnode it touched is back down to the
//! reference held by whatever still names it (its directory entry, or — for
//! a mount root — the mount itself). Nothing an `openat`/`chdir`/`mount`
//! caller does should leak or double-release a reference.
//!
//! Grounded the same way `tests/dma_properties.rs` drives
//! `apexkern::dma`'s invariants: a `proptest!` generating random syscall
//! sequences against the real `Vfs`/`MemFs` fixture in `common`, rather than
//! a unit test pinned to one hand-picked trace.

mod common;

use std::sync::Arc;

use apexkern::vfs::{FileType, OpenFlags, Vnode};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum Op {
    Open,
    Close(usize),
    Chdir,
}

fn ops() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        prop_oneof![
            3 => Just(Op::Open),
            3 => (0usize..8).prop_map(Op::Close),
            1 => Just(Op::Chdir),
        ],
        1..40,
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn file_vnode_refcount_returns_to_baseline_once_all_fds_close(seq in ops()) {
        let vfs = common::new_vfs();
        let task = common::new_task();
        vfs.mknod(&task, "/f", FileType::Regular, 0o644).unwrap();

        // One open up front to get a live Arc<Vnode> to inspect; this is the
        // baseline every later close must return to once undone.
        let probe_fd = vfs.open(&task, "/f", OpenFlags::RDWR, 0o644).unwrap();
        let vnode: Arc<Vnode> = task.fds.get(probe_fd).unwrap().vnode.clone();
        let baseline = vnode.refcount();
        vfs.close(&task, probe_fd).unwrap();
        prop_assert_eq!(vnode.refcount(), baseline - 1);

        let mut open_fds = Vec::new();
        for op in seq {
            match op {
                Op::Open => {
                    if let Ok(fd) = vfs.open(&task, "/f", OpenFlags::RDWR, 0o644) {
                        open_fds.push(fd);
                    }
                }
                Op::Close(i) => {
                    if !open_fds.is_empty() {
                        let fd = open_fds.swap_remove(i % open_fds.len());
                        vfs.close(&task, fd).unwrap();
                    }
                }
                Op::Chdir => {
                    let _ = vfs.chdir(&task, "/");
                }
            }
        }

        for fd in open_fds {
            vfs.close(&task, fd).unwrap();
        }
        // Undo the trailing chdir(s), if any, so the cwd's reference on the
        // root vnode doesn't linger past the end of the test.
        vfs.chdir(&task, "/").unwrap();
        vfs.exit(&task);

        prop_assert_eq!(vnode.refcount(), baseline - 1);
    }
}
