//! Anonymous pipes: a FIFO vnode carrying a power-of-two ring buffer.
//!
//! Grounded on `original_source/sys/fs/pipe.cpp`. A pipe vnode is created
//! outside the mount hashes (SPEC_FULL.md §4.3); two file descriptions share
//! one `Pipe`, one read-only and one write-only.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{KErrorExt as _, KResult, KernelError};

/// Fixed 4 KiB ring, per SPEC_FULL.md §3. Indexing uses `cursor & (size-1)`
/// since the size is always a power of two.
struct Ring {
    buf: Vec<u8>,
    read_cursor: AtomicU64,
    write_cursor: AtomicU64,
}

impl Ring {
    fn new(size: usize) -> Self {
        assert!(size.is_power_of_two());
        Self {
            buf: vec![0u8; size],
            read_cursor: AtomicU64::new(0),
            write_cursor: AtomicU64::new(0),
        }
    }

    fn mask(&self) -> u64 {
        (self.buf.len() - 1) as u64
    }

    fn queued(&self) -> u64 {
        self.write_cursor.load(Ordering::Acquire) - self.read_cursor.load(Ordering::Acquire)
    }

    fn free(&self) -> u64 {
        self.buf.len() as u64 - self.queued()
    }
}

/// A FIFO pipe. Readers block on `not_empty` while the ring is empty;
/// writers signal SIGPIPE-equivalent (`KernelError::PipeClosed`) when the
/// reader count is zero (SPEC_FULL.md §4.3).
pub struct Pipe {
    ring: Mutex<Ring>,
    not_empty: Condvar,
    not_full: Condvar,
    readers: AtomicU32,
    writers: AtomicU32,
}

impl Pipe {
    pub fn new(ring_size: usize) -> Self {
        Self {
            ring: Mutex::new(Ring::new(ring_size)),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            readers: AtomicU32::new(1),
            writers: AtomicU32::new(1),
        }
    }

    pub fn add_reader(&self) {
        self.readers.fetch_add(1, Ordering::AcqRel);
    }
    pub fn add_writer(&self) {
        self.writers.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops a reader end; wakes writers blocked on `not_full` so they can
    /// observe `readers() == 0` and fail with `EPIPE`.
    pub fn close_reader(&self) {
        if self.readers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.not_full.notify_all();
        }
    }

    /// Drops a writer end; wakes readers blocked on `not_empty` so they can
    /// observe EOF.
    pub fn close_writer(&self) {
        if self.writers.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.not_empty.notify_all();
        }
    }

    pub fn readers(&self) -> u32 {
        self.readers.load(Ordering::Acquire)
    }
    pub fn writers(&self) -> u32 {
        self.writers.load(Ordering::Acquire)
    }

    /// Blocking read: waits on the ring's condition variable while empty and
    /// the write end is still open. Returns `0` (EOF) once all writers close
    /// on an empty ring.
    pub fn read(&self, buf: &mut [u8]) -> KResult<usize> {
        let mut ring = self.ring.lock();
        while ring.queued() == 0 {
            if self.writers() == 0 {
                return Ok(0);
            }
            self.not_empty.wait(&mut ring);
        }
        let n = (ring.queued().min(buf.len() as u64)) as usize;
        let mask = ring.mask();
        let start = ring.read_cursor.load(Ordering::Acquire);
        for (i, slot) in buf.iter_mut().take(n).enumerate() {
            *slot = ring.buf[((start + i as u64) & mask) as usize];
        }
        ring.read_cursor.fetch_add(n as u64, Ordering::AcqRel);
        self.not_full.notify_all();
        Ok(n)
    }

    /// Blocking write. Returns `EPIPE` (with the caller responsible for
    /// raising `SIGPIPE` on the current task, per SPEC_FULL.md §4.3) once the
    /// reader count reaches zero.
    pub fn write(&self, buf: &[u8]) -> KResult<usize> {
        if self.readers() == 0 {
            return Err(KernelError::PipeClosed.context("no readers remain on pipe"));
        }
        let mut ring = self.ring.lock();
        let mut written = 0usize;
        while written < buf.len() {
            while ring.free() == 0 {
                if self.readers() == 0 {
                    return Err(KernelError::PipeClosed);
                }
                self.not_full.wait(&mut ring);
            }
            let n = (ring.free().min((buf.len() - written) as u64)) as usize;
            let mask = ring.mask();
            let start = ring.write_cursor.load(Ordering::Acquire);
            for (i, byte) in buf[written..written + n].iter().enumerate() {
                let idx = ((start + i as u64) & mask) as usize;
                ring.buf[idx] = *byte;
            }
            ring.write_cursor.fetch_add(n as u64, Ordering::AcqRel);
            written += n;
            self.not_empty.notify_all();
        }
        Ok(written)
    }

    pub fn queued_len(&self) -> u64 {
        self.ring.lock().queued()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn write_then_read_round_trips() {
        let p = Pipe::new(4096);
        p.write(b"hello").unwrap();
        let mut buf = [0u8; 16];
        let n = p.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[test]
    fn read_returns_eof_after_writer_closes_on_empty_ring() {
        let p = Pipe::new(4096);
        p.close_writer();
        let mut buf = [0u8; 16];
        assert_eq!(p.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn write_fails_when_no_readers() {
        let p = Pipe::new(4096);
        p.close_reader();
        assert!(matches!(p.write(b"x"), Err(KernelError::PipeClosed)));
    }

    #[test]
    fn concurrent_write_read_preserves_prefix_property() {
        let p = Arc::new(Pipe::new(4096));
        let p2 = p.clone();
        let writer = thread::spawn(move || {
            for chunk in [b"abc".as_slice(), b"def", b"ghi"] {
                p2.write(chunk).unwrap();
            }
            p2.close_writer();
        });
        let mut received = Vec::new();
        loop {
            let mut buf = [0u8; 3];
            let n = p.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        writer.join().unwrap();
        assert_eq!(received, b"abcdefghi");
    }
}
