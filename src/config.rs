//! Per-subsystem tunables.
//!
//! The source fixes these as `#define`s or constructor arguments (ring
//! sizes, retry counts, bounce thresholds); SPEC_FULL.md §1 **[AMBIENT]**
//! asks for small `Default`-implementing config structs instead, mirroring
//! the teacher's `KernelConfig` aggregate in spirit (here split one struct
//! per subsystem since each is independently constructible in tests).

/// DMA staging engine tunables (SPEC_FULL.md §4.1).
#[derive(Debug, Clone, Copy)]
pub struct DmaConfig {
    pub cache_line_size: usize,
}

impl Default for DmaConfig {
    fn default() -> Self {
        Self { cache_line_size: 32 }
    }
}

/// TTY line discipline tunables (SPEC_FULL.md §4.2).
#[derive(Debug, Clone, Copy)]
pub struct TtyConfig {
    pub tx_ring_size: usize,
    pub rx_buf_size: usize,
    pub rx_buf_count: usize,
}

impl Default for TtyConfig {
    fn default() -> Self {
        Self {
            tx_ring_size: 4096,
            rx_buf_size: 256,
            rx_buf_count: 16,
        }
    }
}

/// USB gadget / UDC tunables (SPEC_FULL.md §4.4).
#[derive(Debug, Clone, Copy)]
pub struct UdcConfig {
    pub max_endpoints: usize,
    pub ep0_max_packet: usize,
    pub retries: u32,
}

impl Default for UdcConfig {
    fn default() -> Self {
        Self {
            max_endpoints: 16,
            ep0_max_packet: 64,
            retries: 1,
        }
    }
}

/// MMC/SD host tunables (SPEC_FULL.md §4.5).
#[derive(Debug, Clone, Copy)]
pub struct HostConfig {
    pub command_timeout_ms: u64,
    pub cdihb_timeout_ms: u64,
    pub command_retries: u32,
    pub init_probe_timeout_ms: u64,
    pub adma2_max_segment: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: 1000,
            cdihb_timeout_ms: 1000,
            command_retries: 3,
            init_probe_timeout_ms: 1000,
            adma2_max_segment: 65535,
        }
    }
}

/// VFS tunables: fd table size and path-resolution limits (SPEC_FULL.md §4.3).
#[derive(Debug, Clone, Copy)]
pub struct VfsConfig {
    pub max_fds: usize,
    pub max_symlink_depth: u32,
    pub pipe_ring_size: usize,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            max_fds: 256,
            max_symlink_depth: 16,
            pipe_ring_size: 4096,
        }
    }
}

/// Aggregate configuration for the whole crate, mirroring the teacher's
/// single `KernelConfig` knob bag threaded through `Session::new`.
#[derive(Debug, Clone, Copy, Default)]
pub struct KernelConfig {
    pub dma: DmaConfig,
    pub tty: TtyConfig,
    pub udc: UdcConfig,
    pub host: HostConfig,
    pub vfs: VfsConfig,
}
