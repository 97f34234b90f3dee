//! CID/CSD/OCR/EXT_CSD/SCR register accessors.
//!
//! Grounded on `sys/dev/mmc/mmc.h` and `sd.h`. SPEC_FULL.md §3 supplement
//! scopes this to "enough to drive the scan/partition logic... without
//! requiring a full register-field catalogue" (full register maps are out
//! of scope per §1), so only the fields `host`/`device` actually consult are
//! implemented; the rest of the catalogue is not reproduced.

use crate::mmc::bitfield::{bit_be, bits_be, bytes_le, Bitfield};

/// True if the device/card status word carried by an R1-family response
/// reports any of the standard error bits. Grounded on `mmc.cpp`'s
/// `device_status::any_error()`/`sd.cpp`'s `card_status::any_error()`,
/// collapsed to the bits the scan state machine actually checks for rather
/// than the full per-bit catalogue (SPEC_FULL.md §3 supplement).
pub fn response_any_error(response: &[u8; 16]) -> bool {
    const ERROR_BITS: &[usize] = &[19, 20, 21, 22, 23, 28, 29, 30, 31];
    let buf = &response[..4];
    ERROR_BITS.iter().any(|&b| bit_be(buf, b))
}

/// True if the status word's `CARD_IS_LOCKED`/`DEVICE_IS_LOCKED` bit is set
/// (bit 25), as checked by `select_deselect_card` before a card/device that
/// requires unlocking is rejected.
pub fn response_is_locked(response: &[u8; 16]) -> bool {
    bit_be(&response[..4], 25)
}

/// MMC/SD access mode as reported in the OCR (byte addressing vs. high
/// capacity sector addressing).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Byte,
    Sector,
}

/// Operating Conditions Register, shared shape for both MMC and SD (the bit
/// layout differs slightly but the fields this crate needs line up).
#[derive(Debug, Clone, Copy, Default)]
pub struct Ocr(pub u32);

impl Ocr {
    pub fn busy(&self) -> bool {
        !bit_be(&self.0.to_be_bytes(), 31)
    }
    pub fn v_170_195(&self) -> bool {
        bit_be(&self.0.to_be_bytes(), 7)
    }
    pub fn access_mode(&self) -> AccessMode {
        if bits_be(&self.0.to_be_bytes(), 29, 30) & 0b10 != 0 {
            AccessMode::Sector
        } else {
            AccessMode::Byte
        }
    }
    /// True if the OCR's voltage window includes `supply_v`
    /// (SPEC_FULL.md §4.5, "The returned OCR must show supply-compatibility").
    pub fn supply_compatible(&self, supply_v: f32) -> bool {
        if !(2.7..=3.6).contains(&supply_v) && !(1.65..=1.95).contains(&supply_v) {
            return false;
        }
        // bits 15..23 cover the 2.7-3.6V window in 100mV steps.
        if (2.7..=3.6).contains(&supply_v) {
            let bit = 15 + ((supply_v - 2.7) / 0.1) as usize;
            bit_be(&self.0.to_be_bytes(), bit.min(23))
        } else {
            self.v_170_195()
        }
    }
}

/// Card/Device Identification Register (16 bytes).
#[derive(Debug, Clone, Copy)]
pub struct Cid(pub [u8; 16]);

impl Default for Cid {
    fn default() -> Self {
        Self([0u8; 16])
    }
}

impl Cid {
    pub fn clear(&mut self) {
        self.0 = [0u8; 16];
    }
    pub fn mid(&self) -> u32 {
        bits_be(&self.0, 120, 127)
    }
    pub fn psn(&self) -> u32 {
        bits_be(&self.0, 16, 47)
    }
}

/// Card/Device Specific Data Register (16 bytes).
#[derive(Debug, Clone, Copy, Default)]
pub struct Csd(pub [u8; 16]);

impl Csd {
    pub fn csd_structure(&self) -> u32 {
        bits_be(&self.0, 126, 127)
    }
    pub fn spec_vers(&self) -> u32 {
        bits_be(&self.0, 122, 125)
    }
}

/// EXT_CSD register (eMMC only, 512 bytes, byte addressed little-endian).
#[derive(Clone)]
pub struct ExtCsd(pub Vec<u8>);

impl Default for ExtCsd {
    fn default() -> Self {
        Self(vec![0u8; 512])
    }
}

/// Writable byte offsets into EXT_CSD, used by `SWITCH` (CMD6) writes
/// (SPEC_FULL.md §4.5, scan state machine).
#[derive(Debug, Clone, Copy)]
#[repr(u32)]
pub enum Offset {
    HsTiming = 185,
    BusWidth = 183,
    PowerClass = 187,
    PartitionConfig = 179,
    EraseGroupDef = 175,
    CacheCtrl = 33,
}

impl ExtCsd {
    pub fn data(&self) -> &[u8] {
        &self.0
    }
    pub fn size(&self) -> usize {
        self.0.len()
    }

    pub fn csd_structure(&self) -> u32 {
        self.0[194] as u32
    }
    pub fn device_type(&self) -> Bitfield {
        Bitfield(self.0[196] as u32)
    }
    pub fn driver_strength(&self) -> Bitfield {
        Bitfield(self.0[197] as u32)
    }
    pub fn strobe_support(&self) -> u32 {
        self.0[184] as u32
    }
    pub fn partition_config(&self) -> u32 {
        self.0[179] as u32
    }
    pub fn erased_mem_cont(&self) -> u32 {
        self.0[181] as u32
    }
    pub fn sec_feature_support(&self) -> u32 {
        self.0[231] as u32
    }
    pub fn sec_count(&self) -> u64 {
        bytes_le(&self.0, 212, 215)
    }
    pub fn boot_size_mult(&self) -> u32 {
        self.0[226] as u32
    }
    pub fn rpmb_size_mult(&self) -> u32 {
        self.0[168] as u32
    }
    pub fn hc_wp_grp_size(&self) -> u32 {
        self.0[221] as u32
    }
    pub fn hc_erase_grp_size(&self) -> u32 {
        self.0[224] as u32
    }
    pub fn gp_size_mult_gpp(&self, index: usize) -> u64 {
        debug_assert!((1..=4).contains(&index));
        let base = 143 + (index - 1) * 3;
        bytes_le(&self.0, base, base + 2)
    }
    pub fn partitions_attribute(&self, bit: usize) -> bool {
        (self.0[156] as u32) & (1 << bit) != 0
    }
    pub fn enh_size_mult(&self) -> u64 {
        bytes_le(&self.0, 140, 142)
    }
    pub fn enh_start_addr(&self) -> u64 {
        bytes_le(&self.0, 136, 139)
    }
    pub fn cache_size(&self) -> u64 {
        bytes_le(&self.0, 249, 252)
    }
    pub fn data_sector_size(&self) -> u32 {
        self.0[61] as u32
    }
    pub fn bkops_support(&self) -> u32 {
        self.0[502] as u32
    }
    pub fn bkops_en(&self) -> u32 {
        self.0[163] as u32
    }
    pub fn rst_n_function(&self) -> u32 {
        (self.0[162] as u32) & 0b11
    }

    /// Stages a single-byte `SWITCH` write into the local copy; the actual
    /// CMD6 is issued by the host driver, which then re-reads EXT_CSD.
    pub fn stage_write(&mut self, offset: Offset, value: u8) {
        self.0[offset as usize] = value;
    }
}

/// SD Configuration Register (8 bytes).
#[derive(Debug, Clone, Copy, Default)]
pub struct Scr(pub [u8; 8]);

impl Scr {
    pub fn sd_spec(&self) -> u32 {
        bits_be(&self.0, 56, 59)
    }
    pub fn sd_bus_widths(&self) -> u32 {
        bits_be(&self.0, 48, 51)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ocr_busy_is_top_bit() {
        assert!(!Ocr(0x8000_0000).busy());
        assert!(Ocr(0x0000_0000).busy());
    }

    #[test]
    fn ext_csd_partition_config_roundtrips_through_stage_write() {
        let mut e = ExtCsd::default();
        e.stage_write(Offset::PartitionConfig, 0x03);
        assert_eq!(e.partition_config(), 0x03);
    }

    #[test]
    fn response_any_error_detects_out_of_range_bit() {
        let mut r = [0u8; 16];
        assert!(!response_any_error(&r));
        r[0] = 0x80; // bit 31 (OUT_OF_RANGE)
        assert!(response_any_error(&r));
    }

    #[test]
    fn response_is_locked_checks_bit_25() {
        let mut r = [0u8; 16];
        assert!(!response_is_locked(&r));
        r[0] = 0x02; // bit 25
        assert!(response_is_locked(&r));
    }

    #[test]
    fn ext_csd_gp_size_mult_reads_three_byte_fields() {
        let mut e = ExtCsd::default();
        e.0[143] = 0x01;
        e.0[144] = 0x00;
        e.0[145] = 0x00;
        assert_eq!(e.gp_size_mult_gpp(1), 1);
    }
}
