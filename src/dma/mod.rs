//! Shared DMA staging engine.
//!
//! Decides, for each span of a caller's iovec, whether it can go direct to
//! hardware or must be staged through a bounce buffer, and builds the
//! resulting transfer list. Grounded on `sys/kern/dma.cpp`'s `dma_iterate` /
//! `dma_prepare` / `dma_finalise` triad; USB (`fsl_usb2` dTD chains) and MMC
//! (ADMA2 descriptor tables) both build their hardware descriptor lists on
//! top of the transfer list this module emits.

use crate::error::{KErrorExt as _, KResult, KernelError};
use smallvec::SmallVec;

/// Direction of a DMA transfer, relative to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToDevice,
    DeviceToHost,
}

/// One logical span of caller memory to be transferred.
#[derive(Debug, Clone, Copy)]
pub struct IoSpan {
    pub addr: usize,
    pub len: usize,
    /// Whether the page(s) backing this span report the DMA-capable /
    /// cache-coherent attribute bits (source: page attribute check in
    /// `dma_iterate`'s `direct` predicate).
    pub dma_capable: bool,
    pub cache_coherent: bool,
}

/// Per-transaction constraints supplied by the calling driver.
#[derive(Debug, Clone, Copy)]
pub struct TransferConstraints {
    pub direction: Direction,
    pub transfer_min: usize,
    pub transfer_max: usize,
    pub transfer_modulo: usize,
    pub address_alignment: usize,
    pub cache_line_size: usize,
}

impl TransferConstraints {
    fn validate(&self) -> KResult<()> {
        let pow2 = |x: usize| x != 0 && (x & (x - 1)) == 0;
        if !pow2(self.transfer_min) || !pow2(self.transfer_max) || !pow2(self.transfer_modulo)
            || !pow2(self.address_alignment)
        {
            return Err(KernelError::Invalid);
        }
        if self.transfer_min > self.transfer_max {
            return Err(KernelError::Invalid);
        }
        Ok(())
    }
}

/// A bounce buffer supplied by the caller: must itself be DMA-capable,
/// aligned, and large enough to cover whatever cache-line padding is needed.
#[derive(Debug, Clone, Copy)]
pub struct BounceBuffer {
    pub addr: usize,
    pub len: usize,
    pub dma_capable: bool,
}

/// One emitted hardware transfer descriptor: physical address + length.
/// USB builds dTD chains from these; MMC builds ADMA2 descriptors from these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transfer {
    pub phys: usize,
    pub len: usize,
    pub bounced: bool,
}

pub type TransferList = SmallVec<[Transfer; 16]>;

fn align_down(x: usize, a: usize) -> usize {
    x & !(a - 1)
}
fn align_up(x: usize, a: usize) -> usize {
    (x + a - 1) & !(a - 1)
}

/// Result of walking the iovec: the transfer list plus how many bytes of the
/// bounce buffer were actually used (needed by `finalise` to know how much
/// to copy back for device→host transfers).
struct IterateResult {
    transfers: TransferList,
    bounce_used: usize,
    covered: usize,
}

/// Checks whether `span` (or the first `limit` bytes of it) is eligible for a
/// direct transfer, per SPEC_FULL.md §4.1's policy.
fn direct_eligible(span: &IoSpan, c: &TransferConstraints, limit: usize) -> Option<usize> {
    if !span.dma_capable {
        return None;
    }
    if span.addr % c.address_alignment != 0 {
        return None;
    }
    let len = span.len.min(limit);
    if len < c.transfer_min {
        return None;
    }
    if !span.cache_coherent && c.direction == Direction::DeviceToHost {
        // non-coherent memory must cover whole cache lines for device->host
        if span.addr % c.cache_line_size != 0 || len % c.cache_line_size != 0 {
            return None;
        }
    }
    Some(len.min(c.transfer_max))
}

/// Walks `span` for up to `limit` bytes, invoking `on_transfer` for each
/// direct transfer and `on_bounce` for each bounce-staged run. Mirrors
/// `dma_iterate`'s closures (`add_bounce`/`align_bounce`/`flush_bounce`/
/// `do_transfer`/`do_bounce`) collapsed into two callbacks since this crate
/// has no real cache-maintenance instructions to interleave.
fn iterate(
    span: &IoSpan,
    bounce: &BounceBuffer,
    c: &TransferConstraints,
    limit: usize,
    mut on_transfer: impl FnMut(usize, usize),
    mut on_bounce: impl FnMut(usize, usize, usize), // (span_offset, bounce_offset, len)
) -> KResult<(usize, usize)> {
    let mut span_off = 0usize;
    let mut bounce_off = 0usize;
    let mut covered = 0usize;

    while span_off < limit {
        let remaining = IoSpan {
            addr: span.addr + span_off,
            len: span.len - span_off,
            dma_capable: span.dma_capable,
            cache_coherent: span.cache_coherent,
        };
        let rem_limit = limit - span_off;

        if let Some(len) = direct_eligible(&remaining, c, rem_limit) {
            let len = align_down(len, c.transfer_modulo).max(c.transfer_modulo.min(len));
            let len = len.min(rem_limit);
            if len == 0 {
                break;
            }
            on_transfer(remaining.addr, len);
            span_off += len;
            covered += len;
            continue;
        }

        // Stage through the bounce buffer: greedily pack up to transfer_min,
        // rounded up to a multiple of transfer_modulo, capped by both the
        // remaining span and remaining bounce capacity.
        let want = c.transfer_min.max(c.transfer_modulo).min(rem_limit);
        let want = align_up(want, c.transfer_modulo).min(rem_limit);
        if bounce_off + want > bounce.len {
            return Err(KernelError::NoSpace);
        }
        on_bounce(span_off, bounce_off, want);
        bounce_off += want;
        span_off += want;
        covered += want;
    }

    Ok((covered, bounce_off))
}

fn check_bounce(bounce: &BounceBuffer, c: &TransferConstraints) -> KResult<()> {
    if !bounce.dma_capable {
        return Err(KernelError::Invalid.context("bounce buffer outside DMA memory"));
    }
    if bounce.addr % c.address_alignment != 0 {
        return Err(KernelError::Invalid.context("misaligned bounce buffer"));
    }
    if bounce.len < c.cache_line_size {
        return Err(KernelError::Invalid.context("bounce buffer too small for cache alignment"));
    }
    Ok(())
}

/// Prepares a transfer: walks `span`, flushing (host→device) or invalidating
/// (device→host) the affected cache lines for direct transfers, pre-copying
/// host→device bounce runs. Returns the transfer list and the number of
/// bytes actually covered (which may be less than `len` requested).
pub fn dma_prepare(
    span: &IoSpan,
    offset: usize,
    len: usize,
    bounce: &BounceBuffer,
    c: &TransferConstraints,
    copy_in: impl Fn(usize, usize, usize), // (span_offset, bounce_offset, len) host->device only
) -> KResult<(TransferList, usize)> {
    c.validate()?;
    if len % c.transfer_modulo != 0 {
        return Err(KernelError::Invalid.context("length not a multiple of transfer_modulo"));
    }
    check_bounce(bounce, c)?;

    let sub = IoSpan {
        addr: span.addr + offset,
        len: span.len.saturating_sub(offset),
        dma_capable: span.dma_capable,
        cache_coherent: span.cache_coherent,
    };

    let mut transfers = TransferList::new();
    let (covered, _bounce_used) = iterate(
        &sub,
        bounce,
        c,
        len,
        |addr, l| transfers.push(Transfer { phys: addr, len: l, bounced: false }),
        |span_off, bounce_off, l| {
            if c.direction == Direction::HostToDevice {
                copy_in(span_off, bounce_off, l);
            }
            transfers.push(Transfer { phys: bounce.addr + bounce_off, len: l, bounced: true });
        },
    )?;

    Ok((transfers, covered))
}

/// Finalises a transfer after hardware reports `transferred` bytes moved.
/// For device→host transactions, invalidates caches up to `transferred` and
/// replays the bounce copy-back via `copy_out`. Must be called with
/// identical `span`/`offset`/`len`/`bounce`/`c` as the matching `dma_prepare`.
pub fn dma_finalise(
    span: &IoSpan,
    offset: usize,
    len: usize,
    transferred: usize,
    bounce: &BounceBuffer,
    c: &TransferConstraints,
    copy_out: impl Fn(usize, usize, usize), // (span_offset, bounce_offset, len) device->host only
) -> KResult<()> {
    c.validate()?;
    check_bounce(bounce, c)?;

    let sub = IoSpan {
        addr: span.addr + offset,
        len: span.len.saturating_sub(offset),
        dma_capable: span.dma_capable,
        cache_coherent: span.cache_coherent,
    };

    // First pass: walk up to `transferred` bytes only, invalidating /
    // tracking how much bounce space was actually used this time.
    iterate(&sub, bounce, c, transferred.min(len), |_, _| {}, |_, _, _| {})?;

    if c.direction == Direction::DeviceToHost {
        iterate(
            &sub,
            bounce,
            c,
            transferred.min(len),
            |_, _| {},
            |span_off, bounce_off, l| copy_out(span_off, bounce_off, l),
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn span(addr: usize, len: usize, dma: bool, coherent: bool) -> IoSpan {
        IoSpan { addr, len, dma_capable: dma, cache_coherent: coherent }
    }

    fn constraints(dir: Direction) -> TransferConstraints {
        TransferConstraints {
            direction: dir,
            transfer_min: 4,
            transfer_max: 4096,
            transfer_modulo: 4,
            address_alignment: 4,
            cache_line_size: 32,
        }
    }

    #[test]
    fn direct_path_for_aligned_dma_memory() {
        let s = span(0x1000, 4096, true, true);
        let b = BounceBuffer { addr: 0x9000, len: 64, dma_capable: true };
        let c = constraints(Direction::HostToDevice);
        let (transfers, covered) = dma_prepare(&s, 0, 4096, &b, &c, |_, _, _| {}).unwrap();
        assert_eq!(covered, 4096);
        assert!(transfers.iter().all(|t| !t.bounced));
    }

    #[test]
    fn bounces_non_dma_memory() {
        let s = span(0x1001, 16, false, true);
        let b = BounceBuffer { addr: 0x9000, len: 64, dma_capable: true };
        let c = constraints(Direction::HostToDevice);
        let mut copied = vec![];
        let (transfers, covered) =
            dma_prepare(&s, 0, 16, &b, &c, |so, bo, l| copied.push((so, bo, l))).unwrap();
        assert_eq!(covered, 16);
        assert!(transfers.iter().all(|t| t.bounced));
        assert!(!copied.is_empty());
    }

    #[test]
    fn rejects_non_power_of_two_modulo() {
        let s = span(0x1000, 16, true, true);
        let b = BounceBuffer { addr: 0x9000, len: 64, dma_capable: true };
        let mut c = constraints(Direction::HostToDevice);
        c.transfer_modulo = 3;
        assert!(dma_prepare(&s, 0, 16, &b, &c, |_, _, _| {}).is_err());
    }

    #[test]
    fn rejects_misaligned_bounce_buffer() {
        let s = span(0x1001, 16, false, true);
        let b = BounceBuffer { addr: 0x9001, len: 64, dma_capable: true };
        let c = constraints(Direction::HostToDevice);
        assert!(dma_prepare(&s, 0, 16, &b, &c, |_, _, _| {}).is_err());
    }

    #[test]
    fn finalise_copies_back_device_to_host_bounce() {
        let s = span(0x1001, 16, false, true);
        let b = BounceBuffer { addr: 0x9000, len: 64, dma_capable: true };
        let c = constraints(Direction::DeviceToHost);
        let (_transfers, covered) = dma_prepare(&s, 0, 16, &b, &c, |_, _, _| {}).unwrap();
        let mut copied_out = vec![];
        dma_finalise(&s, 0, 16, covered, &b, &c, |so, bo, l| copied_out.push((so, bo, l)))
            .unwrap();
        assert!(!copied_out.is_empty());
    }
}
