//! MMC/SD device and operating-mode negotiation.
//!
//! Grounded on `sys/dev/mmc/mmc_device.cpp`'s `device::init` (eMMC) and
//! `sys/dev/mmc/sd_card.cpp`'s `card::init` (SD), collapsed to the subset
//! SPEC_FULL.md §4.5 describes: address-state transitions, bus-width test,
//! operating-mode selection, drive-strength selection, clock switch.

use crate::error::{KErrorExt as _, KResult, KernelError};
use crate::mmc::desc::{AccessMode, Cid, Csd, ExtCsd, Offset, Ocr, Scr};

/// eMMC `DEVICE_TYPE` bus modes (SPEC_FULL.md §4.5, "Operating mode is
/// selected as the first supported of...").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmcDeviceType {
    Sdr26 = 0,
    Sdr52 = 1,
    Ddr52_1v8_3v3 = 2,
    Ddr52_1v2 = 3,
    Hs200_1v8 = 4,
    Hs200_1v2 = 5,
    Hs400_1v8 = 6,
    Hs400_1v2 = 7,
}

impl MmcDeviceType {
    pub fn ddr_mode(self) -> bool {
        !matches!(self, MmcDeviceType::Sdr26 | MmcDeviceType::Sdr52)
    }
    pub fn hs_mode(self) -> bool {
        !matches!(self, MmcDeviceType::Sdr26)
    }
    pub fn timing_interface(self) -> u8 {
        match self {
            MmcDeviceType::Sdr26 | MmcDeviceType::Ddr52_1v8_3v3 | MmcDeviceType::Ddr52_1v2 => 0,
            MmcDeviceType::Sdr52 => 1,
            MmcDeviceType::Hs200_1v8 | MmcDeviceType::Hs200_1v2 => 2,
            MmcDeviceType::Hs400_1v8 | MmcDeviceType::Hs400_1v2 => 3,
        }
    }
}

/// SD UHS-I `access_mode` bus modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdAccessMode {
    DefaultSdr12,
    HighSdr25,
    Sdr50,
    Sdr104,
    Ddr50,
}

/// Drive strength, shared shape between MMC and SD (the wire encodings
/// differ but the output-impedance mapping follows the same pattern).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStrength {
    Type0_50Ohm,
    Type1_33Ohm,
    Type2_66Ohm,
    Type3_100Ohm,
    Type4_40Ohm,
}

impl DriverStrength {
    pub fn output_impedance(self) -> u32 {
        match self {
            DriverStrength::Type0_50Ohm => 50,
            DriverStrength::Type1_33Ohm => 33,
            DriverStrength::Type2_66Ohm => 66,
            DriverStrength::Type3_100Ohm => 100,
            DriverStrength::Type4_40Ohm => 40,
        }
    }
}

/// Current operating mode of whatever is attached (SPEC_FULL.md §3, "a
/// currently-attached `device` ... polymorphic").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Sd(SdAccessMode),
    Mmc(MmcDeviceType),
}

/// MMC/SD partition selector (SPEC_FULL.md §4.5, "Partitioning").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    User = 0,
    Boot1 = 1,
    Boot2 = 2,
    Rpmb = 3,
    Gp1 = 4,
    Gp2 = 5,
    Gp3 = 6,
    Gp4 = 7,
}

/// One negotiated bus/drive-strength outcome, computed by `negotiate_mmc`
/// independent of any host so it is exercisable without real hardware.
pub struct Negotiated {
    pub mode: MmcDeviceType,
    pub mode_rate_hz: u64,
    pub drive: DriverStrength,
    pub hw_rate_hz: u64,
    pub clock_hz: u64,
}

/// Picks the best eMMC operating mode the host and the card's EXT_CSD both
/// support, then the drive strength giving the highest rate within that
/// mode, then the clock (SPEC_FULL.md §4.5). Mirrors `mmc_device.cpp`'s
/// `try_mode`/`try_drive` closures as pure functions over capability sets.
pub fn negotiate_mmc(
    ext_csd: &ExtCsd,
    host_supports: impl Fn(MmcDeviceType) -> bool,
    ddr_ok: bool,
    io_1v2: bool,
    io_1v8: bool,
    rate_limit: impl Fn(u32) -> u64,
) -> KResult<Negotiated> {
    let device_type = ext_csd.device_type();
    let driver_strength = ext_csd.driver_strength();

    let candidates: &[(MmcDeviceType, u64, bool)] = &[
        (MmcDeviceType::Hs400_1v2, 400_000_000, ddr_ok && io_1v2),
        (MmcDeviceType::Hs400_1v8, 400_000_000, ddr_ok && io_1v8),
        (MmcDeviceType::Hs200_1v2, 200_000_000, io_1v2),
        (MmcDeviceType::Hs200_1v8, 200_000_000, io_1v8),
        (MmcDeviceType::Ddr52_1v2, 104_000_000, ddr_ok && io_1v2),
        (MmcDeviceType::Ddr52_1v8_3v3, 104_000_000, ddr_ok),
        (MmcDeviceType::Sdr52, 52_000_000, true),
        (MmcDeviceType::Sdr26, 26_000_000, true),
    ];

    let (mode, mode_rate_hz) = candidates
        .iter()
        .find(|(m, _, gate)| *gate && host_supports(*m) && device_type.is_set(*m as u32))
        .map(|(m, r, _)| (*m, *r))
        .ok_or_else(|| KernelError::NotSupported.context("no compatible eMMC bus mode"))?;

    let drive_order: &[DriverStrength] = if mode.hs_mode() {
        &[
            DriverStrength::Type1_33Ohm,
            DriverStrength::Type4_40Ohm,
            DriverStrength::Type0_50Ohm,
            DriverStrength::Type2_66Ohm,
            DriverStrength::Type3_100Ohm,
        ]
    } else {
        &[DriverStrength::Type0_50Ohm]
    };

    let mut hw_rate_hz = 0u64;
    let mut drive = DriverStrength::Type0_50Ohm;
    for &d in drive_order {
        if !driver_strength.is_set(d as u32) {
            continue;
        }
        let max = rate_limit(d.output_impedance());
        if hw_rate_hz == 0 || max >= mode_rate_hz {
            hw_rate_hz = max;
            drive = d;
        }
    }
    if hw_rate_hz == 0 {
        return Err(KernelError::NotSupported.context("no compatible eMMC drive strength"));
    }

    let ddr = mode.ddr_mode();
    let clock_hz = hw_rate_hz.min(mode_rate_hz) / if ddr { 2 } else { 1 };

    Ok(Negotiated { mode, mode_rate_hz, drive, hw_rate_hz, clock_hz })
}

/// Snapshot of an attached eMMC device's negotiated state
/// (SPEC_FULL.md §3, §4.5).
#[derive(Default)]
pub struct MmcDevice {
    pub rca: u32,
    pub ocr: Ocr,
    pub cid: Cid,
    pub csd: Csd,
    pub ext_csd: ExtCsd,
    pub sector_size: usize,
    pub mode: Option<MmcDeviceType>,
}

impl MmcDevice {
    pub fn tuning_cmd_index(&self) -> u32 {
        21
    }

    /// SPEC_FULL.md §4.5, "Calculate sector size": byte addressing always
    /// has a 1-byte sector; sector addressing uses EXT_CSD's reported size.
    pub fn compute_sector_size(&mut self) -> KResult<()> {
        self.sector_size = match self.ocr.access_mode() {
            AccessMode::Byte => 1,
            AccessMode::Sector => match self.ext_csd.data_sector_size() {
                0 => 512,
                1 => 4096,
                _ => return Err(KernelError::NotSupported.context("unknown DATA_SECTOR_SIZE")),
            },
        };
        Ok(())
    }

    pub fn switch_partition_value(&self, p: Partition) -> u8 {
        let config = self.ext_csd.partition_config();
        ((config & !0x7) | p as u32) as u8
    }
}

/// Snapshot of an attached SD card's negotiated state.
#[derive(Default)]
pub struct SdCard {
    pub rca: u32,
    pub ocr: Ocr,
    pub cid: Cid,
    pub csd: Csd,
    pub scr: Scr,
    pub mode: Option<SdAccessMode>,
    pub sector_size: usize,
}

impl SdCard {
    pub fn tuning_cmd_index(&self) -> u32 {
        19
    }
}

/// Whichever of `MmcDevice`/`SdCard` the bus scan attached
/// (SPEC_FULL.md §3, "polymorphic").
pub enum AttachedDevice {
    Mmc(MmcDevice),
    Sd(SdCard),
}

impl AttachedDevice {
    pub fn tuning_cmd_index(&self) -> u32 {
        match self {
            AttachedDevice::Mmc(d) => d.tuning_cmd_index(),
            AttachedDevice::Sd(c) => c.tuning_cmd_index(),
        }
    }
    pub fn mode(&self) -> Option<Mode> {
        match self {
            AttachedDevice::Mmc(d) => d.mode.map(Mode::Mmc),
            AttachedDevice::Sd(c) => c.mode.map(Mode::Sd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ext_csd_supporting(types: &[MmcDeviceType], drives: &[DriverStrength]) -> ExtCsd {
        let mut e = ExtCsd::default();
        let mut type_bits = 0u8;
        for t in types {
            type_bits |= 1 << (*t as u32);
        }
        let mut drive_bits = 0u8;
        for d in drives {
            drive_bits |= 1 << (*d as u32);
        }
        e.stage_write(Offset::HsTiming, 0); // no-op write, exercises stage_write path
        e.0[196] = type_bits;
        e.0[197] = drive_bits;
        e
    }

    #[test]
    fn picks_highest_tier_mode_both_sides_support() {
        let ext_csd = ext_csd_supporting(
            &[MmcDeviceType::Sdr26, MmcDeviceType::Hs200_1v8],
            &[DriverStrength::Type0_50Ohm],
        );
        let negotiated = negotiate_mmc(
            &ext_csd,
            |m| matches!(m, MmcDeviceType::Sdr26 | MmcDeviceType::Hs200_1v8),
            false,
            false,
            true,
            |_| 200_000_000,
        )
        .unwrap();
        assert_eq!(negotiated.mode, MmcDeviceType::Hs200_1v8);
    }

    #[test]
    fn falls_back_to_sdr26_when_nothing_else_supported() {
        let ext_csd = ext_csd_supporting(&[MmcDeviceType::Sdr26], &[DriverStrength::Type0_50Ohm]);
        let negotiated =
            negotiate_mmc(&ext_csd, |_| true, true, true, true, |_| 26_000_000).unwrap();
        assert_eq!(negotiated.mode, MmcDeviceType::Sdr26);
        assert!(!negotiated.mode.ddr_mode());
    }

    #[test]
    fn errors_when_no_mode_is_mutually_supported() {
        let ext_csd = ext_csd_supporting(&[], &[]);
        let err = negotiate_mmc(&ext_csd, |_| false, true, true, true, |_| 0).unwrap_err();
        assert_eq!(err, KernelError::NotSupported);
    }

    #[test]
    fn switch_partition_value_preserves_upper_bits() {
        let mut d = MmcDevice::default();
        d.ext_csd.stage_write(Offset::PartitionConfig, 0x40);
        assert_eq!(d.switch_partition_value(Partition::Boot1), 0x41);
    }
}
