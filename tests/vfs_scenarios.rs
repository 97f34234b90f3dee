//! Cross-module VFS scenarios from SPEC_FULL.md §8, driven through the
//! public `Vfs` syscall-style API against the in-memory `MemFs` fixture.

mod common;

use apexkern::vfs::{FileType, MountFlags, OpenFlags, Whence};
use apexkern::KernelError;

#[test]
fn pipe_cloexec_fds_are_closed_across_exec() {
    // Scenario 1: pipe2(fds, O_CLOEXEC); write(fds[1], "hi", 2); execve(...)
    // — after exec both fds are closed; a child process never sees the pipe.
    let vfs = common::new_vfs();
    let task = common::new_task();

    let (rfd, wfd) = vfs.pipe2(&task, OpenFlags::CLOEXEC).unwrap();
    assert_eq!(vfs.write(&task, wfd, b"hi").unwrap(), 2);

    vfs.exec(&task);

    assert!(matches!(vfs.read(&task, rfd, &mut [0u8; 2]), Err(KernelError::NotFound)));
    assert!(matches!(vfs.write(&task, wfd, b"x"), Err(KernelError::NotFound)));
}

#[test]
fn openat_creat_excl_missing_intermediate_dir_is_notfound() {
    // Scenario 2: openat(AT_FDCWD, "a/b/c", O_CREAT|O_EXCL, 0644) when a/
    // exists but a/b/ does not -> -NotFound.
    let vfs = common::new_vfs();
    let task = common::new_task();

    vfs.mkdir(&task, "/a", 0o755).unwrap();
    let result = vfs.openat(&task, None, "/a/b/c", OpenFlags::CREAT | OpenFlags::EXCL, 0o644);
    assert!(matches!(result, Err(KernelError::NotFound)), "got {result:?}");
}

#[test]
fn fork_then_child_dup2_exit_leaves_parent_fd_refcount_unchanged() {
    // Scenario 3: fork(); child: dup2(1, 99); exit(0); — parent's original
    // fd refcount is restored once the child's copies are all closed.
    let vfs = common::new_vfs();
    let parent = common::new_task();

    let fd = vfs.open(&parent, "/f", OpenFlags::CREAT | OpenFlags::RDWR, 0o644).unwrap();
    let file = parent.fds.get(fd).unwrap();
    assert_eq!(file.count(), 1);

    let child = vfs.fork(&parent);
    assert_eq!(file.count(), 2, "fork must bump the shared file description's refcount");

    vfs.dup2(&child, fd, 99).unwrap();
    assert_eq!(file.count(), 3, "dup2 in the child adds another reference to the same file");

    vfs.exit(&child);
    assert_eq!(file.count(), 1, "exiting the child must drop both of its references");
}

#[test]
fn readlink_returns_full_target_and_truncates_short_buffers() {
    // Scenario 4: readlink("/x/y") where /x/y is a symlink to a long target
    // -> full target when the buffer is big enough; truncated to
    // min(len, size) when it isn't.
    let vfs = common::new_vfs();
    let task = common::new_task();

    let target = "z".repeat(4095);
    vfs.symlink(&task, &target, "/link").unwrap();

    let mut full = vec![0u8; 8192];
    let n = vfs.readlink(&task, "/link", &mut full).unwrap();
    assert_eq!(n, target.len());
    assert_eq!(&full[..n], target.as_bytes());

    let mut short = vec![0u8; 10];
    let n = vfs.readlink(&task, "/link", &mut short).unwrap();
    assert_eq!(n, short.len().min(target.len()));
    assert_eq!(&short[..n], &target.as_bytes()[..n]);
}

#[test]
fn rename_across_mounts_is_rejected_cross_device() {
    let vfs = common::new_vfs();
    let task = common::new_task();

    vfs.mkdir(&task, "/mnt", 0o755).unwrap();
    vfs.mount(common::MemFs::new(), MountFlags::empty(), "/mnt", None).unwrap();

    vfs.open(&task, "/a", OpenFlags::CREAT | OpenFlags::RDWR, 0o644).unwrap();
    let result = vfs.rename(&task, "/a", "/mnt/a");
    assert!(matches!(result, Err(KernelError::CrossDevice)), "got {result:?}");
}

#[test]
fn rename_directory_into_its_own_descendant_is_rejected() {
    let vfs = common::new_vfs();
    let task = common::new_task();

    vfs.mkdir(&task, "/a", 0o755).unwrap();
    vfs.mkdir(&task, "/a/b", 0o755).unwrap();
    let result = vfs.rename(&task, "/a", "/a/b/c");
    assert!(matches!(result, Err(KernelError::Invalid)), "got {result:?}");
}

#[test]
fn rmdir_on_a_regular_file_is_not_a_directory() {
    let vfs = common::new_vfs();
    let task = common::new_task();

    vfs.open(&task, "/f", OpenFlags::CREAT | OpenFlags::RDWR, 0o644).unwrap();
    assert!(matches!(vfs.rmdir(&task, "/f"), Err(KernelError::NotADirectory)));
}

#[test]
fn unlink_on_a_directory_is_isadirectory() {
    let vfs = common::new_vfs();
    let task = common::new_task();

    vfs.mkdir(&task, "/d", 0o755).unwrap();
    assert!(matches!(vfs.unlink(&task, "/d", false), Err(KernelError::IsADirectory)));
}

#[test]
fn dotdot_at_root_stays_at_root() {
    let vfs = common::new_vfs();
    let task = common::new_task();

    let root_stat = vfs.stat(&task, "/..").unwrap();
    let root_stat2 = vfs.stat(&task, "/").unwrap();
    assert_eq!(root_stat.st_mode, root_stat2.st_mode);
}

#[test]
fn lseek_end_and_data_hole_extensions() {
    let vfs = common::new_vfs();
    let task = common::new_task();

    let fd = vfs.open(&task, "/f", OpenFlags::CREAT | OpenFlags::RDWR, 0o644).unwrap();
    vfs.write(&task, fd, b"0123456789").unwrap();

    assert_eq!(vfs.lseek(&task, fd, 0, Whence::End).unwrap(), 10);
    assert_eq!(vfs.lseek(&task, fd, 3, Whence::Data).unwrap(), 3);
    assert_eq!(vfs.lseek(&task, fd, 3, Whence::Hole).unwrap(), 7);
}

#[test]
fn pipe_write_with_no_readers_returns_pipeclosed() {
    let vfs = common::new_vfs();
    let task = common::new_task();

    let (rfd, wfd) = vfs.pipe2(&task, OpenFlags::empty()).unwrap();
    vfs.close(&task, rfd).unwrap();
    assert!(matches!(vfs.write(&task, wfd, b"x"), Err(KernelError::PipeClosed)));
}

#[test]
fn directory_fds_are_closed_on_exec_even_without_cloexec() {
    let vfs = common::new_vfs();
    let task = common::new_task();

    vfs.mkdir(&task, "/d", 0o755).unwrap();
    let fd = vfs.openat(&task, None, "/d", OpenFlags::RDONLY | OpenFlags::DIRECTORY, 0).unwrap();
    vfs.exec(&task);
    assert!(matches!(vfs.fstat(&task, fd), Err(KernelError::NotFound)));
}

#[test]
fn getcwd_reflects_chdir() {
    let vfs = common::new_vfs();
    let task = common::new_task();

    vfs.mkdir(&task, "/a", 0o755).unwrap();
    vfs.mkdir(&task, "/a/b", 0o755).unwrap();
    assert_eq!(vfs.getcwd(&task).unwrap(), "/");

    vfs.chdir(&task, "/a/b").unwrap();
    assert_eq!(vfs.getcwd(&task).unwrap(), "/a/b");
}

#[test]
fn fcntl_getfl_reports_access_mode_and_status_flags() {
    let vfs = common::new_vfs();
    let task = common::new_task();

    let fd = vfs.open(&task, "/f", OpenFlags::CREAT | OpenFlags::RDWR, 0o644).unwrap();
    let fl = vfs.fcntl_getfl(&task, fd).unwrap();
    assert_eq!(fl & libc::O_ACCMODE, libc::O_RDWR);

    vfs.fcntl_setfl(&task, fd, libc::O_RDWR | libc::O_NONBLOCK).unwrap();
    assert_ne!(vfs.fcntl_getfl(&task, fd).unwrap() & libc::O_NONBLOCK, 0);
}

#[test]
fn fcntl_setfd_toggles_cloexec_independently_of_open_flags() {
    let vfs = common::new_vfs();
    let task = common::new_task();

    let fd = vfs.open(&task, "/f", OpenFlags::CREAT | OpenFlags::RDWR, 0o644).unwrap();
    assert!(!vfs.fcntl_getfd(&task, fd).unwrap());
    vfs.fcntl_setfd(&task, fd, true).unwrap();
    assert!(vfs.fcntl_getfd(&task, fd).unwrap());

    vfs.exec(&task);
    assert!(matches!(vfs.fstat(&task, fd), Err(KernelError::NotFound)));
}

#[test]
fn mknod_then_getdents_lists_created_entries() {
    let vfs = common::new_vfs();
    let task = common::new_task();

    vfs.mknod(&task, "/a", FileType::Regular, 0o644).unwrap();
    vfs.mknod(&task, "/b", FileType::Regular, 0o644).unwrap();
    let fd = vfs.openat(&task, None, "/", OpenFlags::RDONLY | OpenFlags::DIRECTORY, 0).unwrap();
    let mut names: Vec<_> = vfs.getdents(&task, fd).unwrap().into_iter().map(|(n, _, _)| n).collect();
    names.sort();
    assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
}
