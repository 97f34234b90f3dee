//! ADMA2 scatter/gather descriptor table.
//!
//! Grounded on SPEC_FULL.md §4.5, "ADMA2 DMA": builds a table of
//! `{phys, len, flags}` descriptors on top of the shared
//! [`crate::dma`] staging engine, with `transfer_max = 65535`,
//! `transfer_modulo = 4`, `address_align = 4`, and the host's per-command
//! `transfer_min = block_size`.

use crate::dma::{self, BounceBuffer, Direction, IoSpan, Transfer, TransferConstraints};
use crate::error::KResult;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescFlags: u8 {
        const VALID = 1 << 0;
        const END   = 1 << 1;
        const INT   = 1 << 2;
        /// Transfer descriptor (as opposed to a no-op/link descriptor).
        const TRAN  = 1 << 3;
    }
}

/// One ADMA2 descriptor table entry.
#[derive(Debug, Clone, Copy)]
pub struct Adma2Desc {
    pub phys: usize,
    pub len: u16,
    pub flags: DescFlags,
}

const MAX_SEGMENT: usize = 65535;

/// Builds the descriptor table for one command's data transfer, the last
/// descriptor's `END` bit set (SPEC_FULL.md §4.5).
pub fn build_table(
    span: &IoSpan,
    offset: usize,
    len: usize,
    block_size: usize,
    bounce: &BounceBuffer,
    direction: Direction,
    copy_in: impl Fn(usize, usize, usize),
) -> KResult<(Vec<Adma2Desc>, usize)> {
    let constraints = constraints_for(direction, block_size);
    let (transfers, covered) = dma::dma_prepare(span, offset, len, bounce, &constraints, copy_in)?;
    Ok((to_adma2_table(&transfers), covered))
}

/// The `TransferConstraints` a given command's block size implies, shared
/// between `build_table` and the matching `dma_finalise` call a block
/// device read/write issues once the command completes.
pub fn constraints_for(direction: Direction, block_size: usize) -> TransferConstraints {
    TransferConstraints {
        direction,
        transfer_min: block_size.next_power_of_two(),
        transfer_max: MAX_SEGMENT.next_power_of_two() / 2, // largest pow2 <= 65535 is 32768
        transfer_modulo: 4,
        address_alignment: 4,
        cache_line_size: 32,
    }
}

fn to_adma2_table(transfers: &[Transfer]) -> Vec<Adma2Desc> {
    let mut out = Vec::new();
    for t in transfers {
        // ADMA2 caps each single descriptor's length at 65535 bytes
        // (SPEC_FULL.md §4.5); split any wider transfer from the DMA
        // engine across multiple linked descriptors.
        let mut remaining = t.len;
        let mut phys = t.phys;
        while remaining > 0 {
            let chunk = remaining.min(MAX_SEGMENT);
            out.push(Adma2Desc {
                phys,
                len: chunk as u16,
                flags: DescFlags::VALID | DescFlags::TRAN,
            });
            phys += chunk;
            remaining -= chunk;
        }
    }
    if let Some(last) = out.last_mut() {
        last.flags |= DescFlags::END | DescFlags::INT;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_8kib_transfer_splits_into_segments_under_65536() {
        let span = IoSpan { addr: 0x1000, len: 8192, dma_capable: true, cache_coherent: true };
        let bounce = BounceBuffer { addr: 0x9000, len: 512, dma_capable: true };
        let (table, covered) = build_table(
            &span,
            0,
            8192,
            512,
            &bounce,
            Direction::DeviceToHost,
            |_, _, _| {},
        )
        .unwrap();
        assert_eq!(covered, 8192);
        assert!(table.iter().all(|d| d.len as usize <= 65535));
        assert!(table.last().unwrap().flags.contains(DescFlags::END));
    }

    #[test]
    fn descriptor_count_for_8192_bytes_is_bounded() {
        let span = IoSpan { addr: 0x2000, len: 8192, dma_capable: true, cache_coherent: true };
        let bounce = BounceBuffer { addr: 0xa000, len: 512, dma_capable: true };
        let (table, _) =
            build_table(&span, 0, 8192, 512, &bounce, Direction::HostToDevice, |_, _, _| {}).unwrap();
        // 8192 bytes / 16 sectors of 512b: one contiguous direct transfer,
        // so at most a handful of descriptors, never one per sector.
        assert!(table.len() <= 16);
    }
}
