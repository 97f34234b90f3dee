//! MMC partition enumeration and per-partition block/character device glue.
//!
//! Grounded on `sys/dev/mmc/mmc_device.cpp`'s `add_partitions`/
//! `switch_partition`/`for_each_eg`/`zeroout`/`discard` (SPEC_FULL.md §4.5,
//! "Partitioning" and "Discard/trim"). One block device is produced per
//! non-empty partition; RPMB is exposed separately since it is not
//! block-accessible.

use crate::error::{KErrorExt as _, KResult, KernelError};
use crate::mmc::desc::ExtCsd;
use crate::mmc::device::Partition;

/// Default erase-group size used when EXT_CSD doesn't report one
/// (SPEC_FULL.md §4.5, "Discard/trim").
const DEFAULT_ERASE_GROUP_BYTES: u64 = 4 * 1024 * 1024;

/// One block-addressable partition carved out of the EXT_CSD partition
/// table at enumeration time.
#[derive(Debug, Clone, Copy)]
pub struct PartitionInfo {
    pub partition: Partition,
    pub size_bytes: u64,
    pub enhanced: bool,
}

/// Enumerates the partitions EXT_CSD describes (SPEC_FULL.md §4.5,
/// "produces one block device per non-empty partition: user, boot1, boot2,
/// GP1..GP4, plus a character device for RPMB").
pub fn enumerate_partitions(ext_csd: &ExtCsd, sector_size: u64) -> Vec<PartitionInfo> {
    let mut out = Vec::new();

    let user_size = ext_csd.sec_count() * sector_size;
    out.push(PartitionInfo {
        partition: Partition::User,
        size_bytes: user_size,
        enhanced: ext_csd.partitions_attribute(0),
    });

    if ext_csd.boot_size_mult() != 0 {
        let sz = ext_csd.boot_size_mult() as u64 * 128 * 1024;
        out.push(PartitionInfo { partition: Partition::Boot1, size_bytes: sz, enhanced: false });
        out.push(PartitionInfo { partition: Partition::Boot2, size_bytes: sz, enhanced: false });
    }

    let gp_scale = ext_csd.hc_wp_grp_size() as u64 * ext_csd.hc_erase_grp_size() as u64 * 512 * 1024;
    for (idx, p) in [Partition::Gp1, Partition::Gp2, Partition::Gp3, Partition::Gp4]
        .into_iter()
        .enumerate()
    {
        let mult = ext_csd.gp_size_mult_gpp(idx + 1);
        if mult == 0 {
            continue;
        }
        out.push(PartitionInfo {
            partition: p,
            size_bytes: mult * gp_scale,
            enhanced: ext_csd.partitions_attribute(3 + idx),
        });
    }

    out
}

/// RPMB size in bytes, if the EXT_CSD reports a nonzero RPMB partition
/// (SPEC_FULL.md §4.5).
pub fn rpmb_size(ext_csd: &ExtCsd) -> Option<u64> {
    let mult = ext_csd.rpmb_size_mult();
    (mult != 0).then(|| mult as u64 * 128 * 1024)
}

/// Walks `[off, off+len)` one erase group at a time, calling `op` with each
/// group's `[start_lba, end_lba]` (inclusive) and releasing control between
/// groups so other I/O can interleave (SPEC_FULL.md §4.5, "Discard/trim":
/// "unlocking and relocking the host between groups").
pub fn for_each_erase_group(
    off: u64,
    len: u64,
    sector_size: u64,
    erase_group_bytes: u64,
    mut unlock_relock: impl FnMut(),
    mut op: impl FnMut(u64, u64) -> KResult<()>,
) -> KResult<()> {
    let eg = if erase_group_bytes == 0 { DEFAULT_ERASE_GROUP_BYTES } else { erase_group_bytes };
    let mut off = off;
    let mut len = len;

    let mut do_op = |off: u64, span: u64| -> KResult<()> {
        let start_lba = off / sector_size;
        let end_lba = (off + span) / sector_size - 1;
        op(start_lba, end_lba)
    };

    if off % eg != 0 {
        let first = eg - (off % eg);
        let first = first.min(len);
        unlock_relock();
        do_op(off, first)?;
        off += first;
        len -= first;
    }

    while len > 0 {
        let span = len.min(eg);
        unlock_relock();
        do_op(off, span)?;
        off += span;
        len -= span;
    }

    Ok(())
}

/// `zeroout` precondition (SPEC_FULL.md §4.5: "requires both
/// `erased_mem_cont == 0` and `SEC_GB_CL_EN` support").
pub fn zeroout_supported(ext_csd: &ExtCsd) -> bool {
    const SEC_GB_CL_EN: u32 = 1 << 4;
    ext_csd.erased_mem_cont() == 0 && ext_csd.sec_feature_support() & SEC_GB_CL_EN != 0
}

pub fn check_zeroout_supported(ext_csd: &ExtCsd) -> KResult<()> {
    if zeroout_supported(ext_csd) {
        Ok(())
    } else {
        Err(KernelError::NotSupported.context("zeroout requires erased_mem_cont=0 and SEC_GB_CL_EN"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext_csd_with_user(sec_count: u32) -> ExtCsd {
        let mut e = ExtCsd::default();
        e.0[212..216].copy_from_slice(&sec_count.to_le_bytes());
        e
    }

    #[test]
    fn user_partition_always_present() {
        let e = ext_csd_with_user(2_000_000);
        let parts = enumerate_partitions(&e, 512);
        assert_eq!(parts[0].partition, Partition::User);
        assert_eq!(parts[0].size_bytes, 2_000_000 * 512);
    }

    #[test]
    fn user_partition_size_scales_with_sector_size() {
        let e = ext_csd_with_user(2_000_000);
        let parts = enumerate_partitions(&e, 4096);
        assert_eq!(parts[0].size_bytes, 2_000_000 * 4096);
    }

    #[test]
    fn boot_partitions_absent_when_boot_size_mult_zero() {
        let e = ext_csd_with_user(1000);
        let parts = enumerate_partitions(&e, 512);
        assert!(!parts.iter().any(|p| p.partition == Partition::Boot1));
    }

    #[test]
    fn boot_partitions_present_when_boot_size_mult_set() {
        let mut e = ext_csd_with_user(1000);
        e.0[226] = 4; // 4 * 128KiB each
        let parts = enumerate_partitions(&e, 512);
        assert!(parts.iter().any(|p| p.partition == Partition::Boot1));
        assert!(parts.iter().any(|p| p.partition == Partition::Boot2));
    }

    #[test]
    fn for_each_erase_group_aligns_first_group() {
        let mut calls = vec![];
        for_each_erase_group(1500, 2500, 1, 1000, || {}, |s, e| {
            calls.push((s, e));
            Ok(())
        })
        .unwrap();
        // first call covers only the partial group up to the next 1000-byte
        // boundary: bytes [1500, 2000).
        assert_eq!(calls[0], (1500, 1999));
        assert_eq!(calls.last().copied().unwrap(), (3000, 3999));
    }

    #[test]
    fn zeroout_requires_erased_mem_cont_zero_and_sec_gb_cl_en() {
        let mut e = ExtCsd::default();
        assert!(!zeroout_supported(&e));
        e.0[231] = 1 << 4;
        assert!(zeroout_supported(&e));
        e.0[181] = 1; // erased_mem_cont != 0
        assert!(!zeroout_supported(&e));
    }
}
