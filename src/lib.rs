//! Kernel services core for a small, POSIX-flavored embedded operating
//! system: the virtual file system, the TTY line discipline, the USB
//! device-controller (gadget) framework, the MMC/SD host framework, and the
//! DMA staging engine they both build on.
//!
//! This crate models the *core* subsystems only (SPEC_FULL.md §1). The
//! scheduler, page allocator, concrete filesystems, block-device backends,
//! board files and register maps are external collaborators, represented
//! here as small trait seams (`dma::IoSpan`'s page-attribute bits,
//! `vfs::Filesystem`, `mmc::HostHardware`, `usb::UdcHardware`,
//! `mmc::Voltage`) rather than reimplemented.

pub mod config;
pub mod dma;
pub mod error;
pub mod mmc;
pub mod sync;
pub mod tty;
pub mod usb;
pub mod vfs;

pub use config::{DmaConfig, HostConfig, KernelConfig, TtyConfig, UdcConfig, VfsConfig};
pub use error::{KErrorExt, KResult, KernelError};
