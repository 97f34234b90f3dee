//! Terminal line discipline: canonical/raw cooking, echo, flow control, job
//! control signals, and the irq-safe driver-facing hooks (SPEC_FULL.md §4.2).
//!
//! Grounded on `original_source/sys/dev/tty/tty.cpp`. The spec's separate
//! `rxq_lock` (irq-safe spinlock around the raw tail) and `state_lock`
//! (recursive, held by the worker while walking the cursors) are collapsed
//! onto one `parking_lot::Mutex<BufferQueue>` here: Rust's borrow checker
//! can't let two independently-locked references alias the same struct's
//! fields the way the source's single C++ object does, and `parking_lot`'s
//! `Mutex` is cheap enough that a driver's irq-context `rx_putc` taking the
//! same lock the worker thread does costs nothing IRQs aren't already
//! paying by being modeled as ordinary function calls (SPEC_FULL.md §9,
//! "ISR -> task-context split").

pub mod buffer_queue;
pub mod termios;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::config::TtyConfig;
use crate::error::{KErrorExt as _, KResult, KernelError};
use crate::sync::{InterruptFlag, Semaphore};

use buffer_queue::BufferQueue;
use termios::{Cc, IFlags, LFlags, Termios};

/// Job-control / flow-control signal raised by the line discipline. The
/// scheduler that actually delivers it to a task is an external
/// collaborator (SPEC_FULL.md §1); this crate calls out through a
/// `SignalSink` instead of touching process state directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Int,
    Quit,
    Tstp,
}

pub trait SignalSink: Send + Sync {
    fn raise(&self, pgid: u32, sig: Signal);
}

/// A `SignalSink` that does nothing, for headless/test use.
#[derive(Debug, Default)]
pub struct NullSignalSink;
impl SignalSink for NullSignalSink {
    fn raise(&self, _pgid: u32, _sig: Signal) {}
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct TtyFlags: u32 {
        const COOK_INPUT          = 1 << 0;
        const RX_BLOCKED_ON_TX_FULL = 1 << 1;
        const TX_STOPPED          = 1 << 2;
        const RX_OVERFLOW         = 1 << 3;
    }
}

struct TxRing {
    buf: Vec<u8>,
    /// Driver dequeue cursor: bytes before this have been picked up by
    /// `tx_getc`/`tx_getbuf` but not necessarily acknowledged complete yet.
    pos: usize,
    /// Tail of newly-queued data.
    end: usize,
}

impl TxRing {
    fn new(size: usize) -> Self {
        Self { buf: vec![0u8; size], pos: 0, end: 0 }
    }
    fn free(&self) -> usize {
        self.buf.len() - (self.end - self.pos)
    }
    fn queued(&self) -> usize {
        self.end - self.pos
    }
    fn push(&mut self, byte: u8) -> bool {
        if self.free() == 0 {
            return false;
        }
        let idx = self.end % self.buf.len();
        self.buf[idx] = byte;
        self.end += 1;
        true
    }
    fn compact_if_idle(&mut self) {
        if self.pos == self.end {
            self.pos = 0;
            self.end = 0;
        }
    }
}

/// Window size (SPEC_FULL.md §3, TIOCGWINSZ/SWINSZ).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WinSize {
    pub rows: u16,
    pub cols: u16,
}

struct LineState {
    termios: Termios,
    pgid: u32,
    open_count: u32,
    winsize: WinSize,
    column: u32,
    canon_column: u32,
}

/// `TCFLSH`/`TCXONC` selectors (SPEC_FULL.md §4.2, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushQueue {
    Input,
    Output,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowAction {
    StartOutput,
    StopOutput,
    StartInput,
    StopInput,
}

pub struct Tty {
    name: String,
    rx: Mutex<BufferQueue>,
    tx: Mutex<TxRing>,
    line: Mutex<LineState>,
    flags: AtomicU32,
    worker_wake: Semaphore,
    stop: InterruptFlag,
    input_ready: Condvar,
    output_space: Condvar,
    tx_drained: Condvar,
    signals: Arc<dyn SignalSink>,
    destroyed: std::sync::atomic::AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Tty {
    pub fn new(name: impl Into<String>, config: TtyConfig, signals: Arc<dyn SignalSink>) -> Arc<Self> {
        let termios = Termios::default();
        let cook = termios.needs_cooking();
        let tty = Arc::new(Self {
            name: name.into(),
            rx: Mutex::new(BufferQueue::new(config.rx_buf_size * config.rx_buf_count)),
            tx: Mutex::new(TxRing::new(config.tx_ring_size)),
            line: Mutex::new(LineState { termios, pgid: 0, open_count: 0, winsize: WinSize::default(), column: 0, canon_column: 0 }),
            flags: AtomicU32::new(if cook { TtyFlags::COOK_INPUT.bits() } else { 0 }),
            worker_wake: Semaphore::new(),
            stop: InterruptFlag::new(),
            input_ready: Condvar::new(),
            output_space: Condvar::new(),
            tx_drained: Condvar::new(),
            signals,
            destroyed: std::sync::atomic::AtomicBool::new(false),
            worker: Mutex::new(None),
        });
        let worker_tty = tty.clone();
        let handle = std::thread::Builder::new()
            .name(format!("tty-{}", tty.name))
            .spawn(move || worker_tty.worker_loop())
            .expect("spawning the tty worker thread");
        *tty.worker.lock() = Some(handle);
        tty
    }

    fn flag(&self, f: TtyFlags) -> bool {
        TtyFlags::from_bits_truncate(self.flags.load(Ordering::Acquire)).contains(f)
    }
    fn set_flag(&self, f: TtyFlags, on: bool) {
        if on {
            self.flags.fetch_or(f.bits(), Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!f.bits(), Ordering::AcqRel);
        }
    }

    fn worker_loop(&self) {
        while self.worker_wake.wait_interruptible(&self.stop) {
            self.cook_pending_input();
        }
    }

    // ---- irq-safe driver-facing hooks (SPEC_FULL.md §4.2) ----

    /// Called by the hardware driver from interrupt context for each
    /// received byte.
    pub fn rx_putc(&self, byte: u8) {
        self.rx.lock().push(&[byte]);
        self.wake_input_producer();
    }

    pub fn rx_putbuf(&self, bytes: &[u8]) -> usize {
        let n = self.rx.lock().push(bytes);
        self.wake_input_producer();
        n
    }

    fn wake_input_producer(&self) {
        if self.flag(TtyFlags::COOK_INPUT) {
            self.worker_wake.post_once();
        } else {
            self.input_ready.notify_all();
        }
    }

    /// Hardware driver reports a receive overflow; bytes are dropped at
    /// step 4 of the cook pass until cleared.
    pub fn rx_overflow(&self) {
        self.set_flag(TtyFlags::RX_OVERFLOW, true);
    }

    pub fn clear_rx_overflow(&self) {
        self.set_flag(TtyFlags::RX_OVERFLOW, false);
    }

    /// Driver pulls one byte to transmit. Honors `tx_stopped` (IXON/XOFF).
    pub fn tx_getc(&self) -> Option<u8> {
        if self.flag(TtyFlags::TX_STOPPED) {
            return None;
        }
        let mut tx = self.tx.lock();
        if tx.queued() == 0 {
            return None;
        }
        let idx = tx.pos % tx.buf.len();
        let byte = tx.buf[idx];
        tx.pos += 1;
        tx.compact_if_idle();
        Some(byte)
    }

    /// Driver pulls up to `max` contiguous bytes without committing the
    /// dequeue; pair with `tx_advance`.
    pub fn tx_getbuf(&self, max: usize) -> Vec<u8> {
        if self.flag(TtyFlags::TX_STOPPED) {
            return Vec::new();
        }
        let tx = self.tx.lock();
        let n = tx.queued().min(max);
        (0..n).map(|i| tx.buf[(tx.pos + i) % tx.buf.len()]).collect()
    }

    pub fn tx_advance(&self, n: usize) {
        let mut tx = self.tx.lock();
        tx.pos += n;
        tx.compact_if_idle();
        drop(tx);
        self.output_space.notify_all();
        if self.flag(TtyFlags::RX_BLOCKED_ON_TX_FULL) {
            self.set_flag(TtyFlags::RX_BLOCKED_ON_TX_FULL, false);
            self.worker_wake.post_once();
        }
    }

    pub fn tx_complete(&self) {
        self.tx_drained.notify_all();
    }

    // ---- line discipline (task context, SPEC_FULL.md §4.2 steps 1-7) ----

    fn cook_pending_input(&self) {
        loop {
            let byte = match self.rx.lock().peek_unprocessed() {
                Some(b) => b,
                None => return,
            };
            if !self.cook_one_byte(byte) {
                // blocked on tx full (echo couldn't be written); resume
                // when tx_advance clears RX_BLOCKED_ON_TX_FULL.
                return;
            }
            self.rx.lock().advance_processed();
        }
    }

    /// Processes one raw byte through steps 1-7. Returns `false` if progress
    /// stalled because the output queue is full mid-echo (the byte is NOT
    /// marked processed in that case, per SPEC_FULL.md §4.2).
    fn cook_one_byte(&self, mut byte: u8) -> bool {
        let mut line = self.line.lock();
        let t = line.termios;

        // 1. CR/NL translation.
        if byte == b'\r' {
            if t.iflag.contains(IFlags::IGNCR) {
                return true;
            }
            if t.iflag.contains(IFlags::ICRNL) {
                byte = b'\n';
            }
        } else if byte == b'\n' && t.iflag.contains(IFlags::INLCR) {
            byte = b'\r';
        }

        // 2. Flow control.
        if t.iflag.contains(IFlags::IXON) {
            let start = t.cc(Cc::Start);
            let stop = t.cc(Cc::Stop);
            if byte == stop {
                if start == stop {
                    let now_stopped = !self.flag(TtyFlags::TX_STOPPED);
                    self.set_flag(TtyFlags::TX_STOPPED, now_stopped);
                } else {
                    self.set_flag(TtyFlags::TX_STOPPED, true);
                }
                return true;
            }
            if byte == start {
                self.set_flag(TtyFlags::TX_STOPPED, false);
                return true;
            }
        }

        // 3. Signal generation.
        if t.lflag.contains(LFlags::ISIG) {
            let sig = if byte == t.cc(Cc::Intr) {
                Some(Signal::Int)
            } else if byte == t.cc(Cc::Quit) {
                Some(Signal::Quit)
            } else if byte == t.cc(Cc::Susp) {
                Some(Signal::Tstp)
            } else {
                None
            };
            if let Some(sig) = sig {
                self.signals.raise(line.pgid, sig);
                if !t.lflag.contains(LFlags::NOFLSH) {
                    drop(line);
                    self.flush(FlushQueue::Both);
                }
                return true;
            }
        }

        // 4. Overflow gate.
        if self.flag(TtyFlags::RX_OVERFLOW) {
            return true;
        }

        let canon = t.lflag.contains(LFlags::ICANON);

        // 5. Canonical erase.
        if canon && byte == t.cc(Cc::Erase) {
            let erased = self.rx.lock().erase_one();
            if let Some(c) = erased {
                if t.lflag.contains(LFlags::ECHOE) {
                    if !self.echo_erase(&mut line, c) {
                        return false;
                    }
                }
            }
            return true;
        }
        if canon && byte == t.cc(Cc::Werase) {
            loop {
                let erased = self.rx.lock().erase_one();
                match erased {
                    Some(b' ') | None => break,
                    Some(c) => {
                        if t.lflag.contains(LFlags::ECHOE) && !self.echo_erase(&mut line, c) {
                            return false;
                        }
                    }
                }
            }
            return true;
        }
        if canon && byte == t.cc(Cc::Kill) {
            let erased = self.rx.lock().erase_line();
            if t.lflag.intersects(LFlags::ECHOK | LFlags::ECHOKE) {
                for &c in erased.iter().rev() {
                    if !self.echo_erase(&mut line, c) {
                        return false;
                    }
                }
            }
            return true;
        }

        // 6. Echo.
        let should_echo = t.lflag.contains(LFlags::ECHO)
            || (byte == b'\n' && t.lflag.contains(LFlags::ECHONL));
        if should_echo && !self.echo_byte(&mut line, byte) {
            return false;
        }

        // 7. Commit.
        let is_eof = canon && byte == t.cc(Cc::Eof);
        if is_eof {
            self.rx.lock().release_line();
            return true;
        }
        self.rx.lock().commit(byte);
        if canon && (byte == b'\n' || byte == t.cc(Cc::Eol) || byte == t.cc(Cc::Eol2)) {
            self.rx.lock().release_line();
        }
        if !canon {
            self.rx.lock().release_line();
        }
        self.input_ready.notify_all();
        true
    }

    /// Writes one echoed byte to the tx ring, tracking column for erase
    /// bookkeeping. Control chars (other than `\n`/`\t`) echo as `^X`.
    fn echo_byte(&self, line: &mut LineState, byte: u8) -> bool {
        if Termios::is_control(byte) && byte != b'\n' && byte != b'\t' {
            if !self.queue_tx(&[b'^', byte ^ 0x40]) {
                return false;
            }
            line.column += 2;
        } else {
            if !self.queue_tx(&[byte]) {
                return false;
            }
            if byte == b'\n' {
                line.column = 0;
            } else {
                line.column += 1;
            }
        }
        true
    }

    /// Rubout sequence for one erased character: three bytes for a normal
    /// char, six for a control char (SPEC_FULL.md §4.2, step 5).
    fn echo_erase(&self, line: &mut LineState, erased: u8) -> bool {
        let seq: &[u8] = if Termios::is_control(erased) && erased != b'\n' && erased != b'\t' {
            b"\x08\x08  \x08\x08"
        } else {
            b"\x08 \x08"
        };
        if !self.queue_tx(seq) {
            return false;
        }
        line.column = line.column.saturating_sub(1);
        true
    }

    fn queue_tx(&self, bytes: &[u8]) -> bool {
        let mut tx = self.tx.lock();
        if tx.free() < bytes.len() {
            drop(tx);
            self.set_flag(TtyFlags::RX_BLOCKED_ON_TX_FULL, true);
            return false;
        }
        for &b in bytes {
            tx.push(b);
        }
        drop(tx);
        self.output_space.notify_all();
        true
    }

    // ---- reader/writer facing API ----

    /// Blocking read, honoring ICANON line release. Returns the interrupted
    /// error if the stop flag is raised while waiting (teardown).
    pub fn read(&self, buf: &mut [u8]) -> KResult<usize> {
        let canon = self.line.lock().termios.lflag.contains(LFlags::ICANON);
        let mut rx = self.rx.lock();
        loop {
            let avail = if canon { rx.cooked } else { rx.pending };
            if avail > 0 {
                return Ok(rx.pop_front(buf, canon));
            }
            if self.destroyed.load(Ordering::Acquire) {
                return Err(KernelError::Cancelled);
            }
            self.input_ready.wait_for(&mut rx, Duration::from_millis(200));
            if self.destroyed.load(Ordering::Acquire) {
                return Err(KernelError::Cancelled);
            }
        }
    }

    /// `write`: formats into the tx ring under the line-state lock,
    /// expanding tabs (XTABS) and prefixing `\n` with `\r` (ONLCR). Atomic
    /// when single-char or the ring has room for the whole sequence
    /// (SPEC_FULL.md §4.2, "Output").
    pub fn write(&self, buf: &[u8]) -> KResult<usize> {
        use termios::OFlags;
        let mut line = self.line.lock();
        let t = line.termios;
        let mut formatted: Vec<u8> = Vec::with_capacity(buf.len());
        for &byte in buf {
            if byte == b'\t' {
                if t.oflag.contains(OFlags::XTABS) {
                    let spaces = 8 - (line.column % 8);
                    for _ in 0..spaces {
                        formatted.push(b' ');
                    }
                    line.column += spaces;
                } else {
                    formatted.push(b'\t');
                }
                continue;
            }
            if byte == b'\n' && t.oflag.contains(OFlags::ONLCR) {
                formatted.push(b'\r');
                formatted.push(b'\n');
                line.column = 0;
                continue;
            }
            formatted.push(byte);
            if byte == b'\n' {
                line.column = 0;
            } else {
                line.column += 1;
            }
        }
        drop(line);

        let mut written = 0usize;
        loop {
            let n = {
                let mut tx = self.tx.lock();
                let room = tx.free();
                let take = if buf.len() == 1 || room >= formatted.len() - written {
                    (formatted.len() - written).min(room)
                } else {
                    0
                };
                for &b in &formatted[written..written + take] {
                    tx.push(b);
                }
                take
            };
            if n == 0 && written < formatted.len() {
                if self.destroyed.load(Ordering::Acquire) {
                    return Err(KernelError::Cancelled);
                }
                let mut tx = self.tx.lock();
                self.output_space.wait_for(&mut tx, Duration::from_millis(200));
                continue;
            }
            written += n;
            self.output_space.notify_all();
            if written >= formatted.len() {
                return Ok(buf.len());
            }
        }
    }

    // ---- ioctl surface (SPEC_FULL.md §4.2, §6) ----

    pub fn get_termios(&self) -> Termios {
        self.line.lock().termios
    }

    /// TCSETS/TCSETSW/TCSETSF: `flush_input` corresponds to TCSETSF additionally
    /// flushing the receive queue.
    pub fn set_termios(&self, termios: Termios, flush_input: bool) {
        {
            let mut line = self.line.lock();
            line.termios = termios;
        }
        self.set_flag(TtyFlags::COOK_INPUT, termios.needs_cooking());
        if flush_input {
            self.flush(FlushQueue::Input);
        }
    }

    pub fn get_pgrp(&self) -> u32 {
        self.line.lock().pgid
    }
    pub fn set_pgrp(&self, pgid: u32) {
        self.line.lock().pgid = pgid;
    }

    pub fn flush(&self, which: FlushQueue) {
        if matches!(which, FlushQueue::Input | FlushQueue::Both) {
            self.rx.lock().clear();
        }
        if matches!(which, FlushQueue::Output | FlushQueue::Both) {
            let mut tx = self.tx.lock();
            tx.pos = 0;
            tx.end = 0;
            drop(tx);
            self.output_space.notify_all();
        }
    }

    /// TCSBRK: drain-only semantics; `duration` must be nonzero per
    /// SPEC_FULL.md §4.2.
    pub fn drain(&self, duration: u32) -> KResult<()> {
        if duration == 0 {
            return Err(KernelError::Invalid.context("TCSBRK duration must be nonzero"));
        }
        let mut tx = self.tx.lock();
        while tx.queued() > 0 {
            if self.destroyed.load(Ordering::Acquire) {
                return Err(KernelError::Cancelled);
            }
            self.tx_drained.wait_for(&mut tx, Duration::from_millis(200));
        }
        Ok(())
    }

    /// TCXONC: TCOON/TCOOFF and TCION/TCIOFF synthesise VSTART/VSTOP.
    pub fn flow(&self, action: FlowAction) {
        match action {
            FlowAction::StartOutput => self.set_flag(TtyFlags::TX_STOPPED, false),
            FlowAction::StopOutput => self.set_flag(TtyFlags::TX_STOPPED, true),
            FlowAction::StartInput => {
                let byte = self.line.lock().termios.cc(Cc::Start);
                self.cook_one_byte(byte);
            }
            FlowAction::StopInput => {
                let byte = self.line.lock().termios.cc(Cc::Stop);
                self.cook_one_byte(byte);
            }
        }
    }

    pub fn winsize(&self) -> WinSize {
        self.line.lock().winsize
    }
    pub fn set_winsize(&self, ws: WinSize) {
        self.line.lock().winsize = ws;
    }

    /// TIOCINQ: bytes readable without blocking.
    pub fn input_queue_len(&self) -> usize {
        let rx = self.rx.lock();
        let canon = self.line.lock().termios.lflag.contains(LFlags::ICANON);
        if canon { rx.cooked } else { rx.pending }
    }

    /// TIOCOUTQ: bytes still queued for transmission.
    pub fn output_queue_len(&self) -> usize {
        self.tx.lock().queued()
    }

    /// Hides the device, wakes every wait queue with an error, spins until
    /// no operation references it, then the worker thread exits
    /// (SPEC_FULL.md §4.2, "Teardown").
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.stop.raise();
        self.worker_wake.post_once();
        {
            let rx = self.rx.lock();
            self.input_ready.notify_all();
            drop(rx);
        }
        {
            let tx = self.tx.lock();
            self.output_space.notify_all();
            self.tx_drained.notify_all();
            drop(tx);
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Tty {
    fn drop(&mut self) {
        if !self.destroyed.load(Ordering::Acquire) {
            self.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn wait_until(mut pred: impl FnMut() -> bool, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if pred() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        pred()
    }

    fn feed(tty: &Arc<Tty>, bytes: &[u8]) {
        for &b in bytes {
            tty.rx_putc(b);
        }
    }

    #[test]
    fn canonical_line_with_erase_yields_exact_line() {
        let tty = Tty::new("tty0", TtyConfig::default(), Arc::new(NullSignalSink));
        feed(&tty, b"abc\x7f\x7f\x7fhello\n");
        assert!(wait_until(|| tty.input_queue_len() >= 6, Duration::from_secs(1)));
        let mut buf = [0u8; 256];
        let n = tty.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello\n");
        tty.destroy();
    }

    #[test]
    fn erase_echo_emits_rubout_sequence() {
        let tty = Tty::new("tty1", TtyConfig::default(), Arc::new(NullSignalSink));
        feed(&tty, b"a\x7f");
        assert!(wait_until(|| tty.output_queue_len() >= 4, Duration::from_secs(1)));
        let out = tty.tx_getbuf(16);
        assert_eq!(out, b"a\x08 \x08");
        tty.destroy();
    }

    #[test]
    fn veof_splits_input_into_two_lines() {
        let tty = Tty::new("tty2", TtyConfig::default(), Arc::new(NullSignalSink));
        feed(&tty, b"line1\n\x04line2\n");
        assert!(wait_until(|| tty.input_queue_len() >= 6, Duration::from_secs(1)));
        let mut buf = [0u8; 256];
        let n1 = tty.read(&mut buf).unwrap();
        assert_eq!(&buf[..n1], b"line1\n");
        assert!(wait_until(|| tty.input_queue_len() >= 6, Duration::from_secs(1)));
        let n2 = tty.read(&mut buf).unwrap();
        assert_eq!(&buf[..n2], b"line2\n");
        tty.destroy();
    }
}
