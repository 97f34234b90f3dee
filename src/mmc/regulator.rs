//! Voltage regulator seam.
//!
//! Out of scope per SPEC_FULL.md §1 (board files); modeled as a small trait
//! so `mmc::Host` can drive power sequencing (SPEC_FULL.md §4.5, "power
//! cycle") against a test double instead of a real PMIC driver. Regulators
//! are weakly referenced from the host (SPEC_FULL.md §3), matching
//! `regulator::voltage::bind` returning a borrowed pointer the host does not
//! own.

use std::sync::Weak;

/// A single voltage rail (VCC, VIO, or VCCQ).
pub trait Voltage: Send + Sync {
    /// Attempts to set the rail within `[min_v, max_v]`. `(0.0, 0.0)` powers
    /// the rail off. Returns the achieved voltage, or `None` if the range is
    /// unsupported.
    fn set(&self, min_v: f32, max_v: f32) -> Option<f32>;
    /// Currently configured voltage.
    fn get(&self) -> f32;
    /// True if the rail can be set within `[min_v, max_v]` without changing it.
    fn supports(&self, min_v: f32, max_v: f32) -> bool;
    /// True if `self` and `other` name the same physical rail (SPEC_FULL.md
    /// §3, "vccq_supply must be set equal to vcc or vio").
    fn is_same_rail(&self, other: &dyn Voltage) -> bool;
}

/// Handle to one of the host's three rails; `Weak` matches the source's
/// non-owning `regulator::voltage *`.
pub type VoltageHandle = Weak<dyn Voltage>;
