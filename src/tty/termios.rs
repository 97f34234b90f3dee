//! POSIX termios: control characters and mode flags.
//!
//! Grounded on `original_source/sys/dev/tty/tty.cpp`'s use of `::termios`
//! from libc; this crate re-exposes the same flag bits via `bitflags!`
//! wrappers instead of raw `tcflag_t` so the line-discipline code below can
//! match on them without repeating `& FLAG != 0` everywhere.

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct IFlags: u32 {
        const IGNCR = libc::IGNCR;
        const ICRNL = libc::ICRNL;
        const INLCR = libc::INLCR;
        const IXON = libc::IXON;
        const IXOFF = libc::IXOFF;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OFlags: u32 {
        const ONLCR = libc::ONLCR;
        /// BSD's `OXTABS`/`XTABS` tab-expansion bit; not in libc's portable
        /// `tcflag_t` set on this target, so it is assigned a private bit
        /// position above the standard oflag range.
        const XTABS = 1 << 20;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LFlags: u32 {
        const ICANON = libc::ICANON;
        const ISIG = libc::ISIG;
        const ECHO = libc::ECHO;
        const ECHOE = libc::ECHOE;
        const ECHOK = libc::ECHOK;
        const ECHOKE = libc::ECHOKE;
        const ECHONL = libc::ECHONL;
        const NOFLSH = libc::NOFLSH;
    }
}

/// Indices into `Termios::cc`, matching `NCCS`-style POSIX control-char slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Cc {
    Intr = libc::VINTR,
    Quit = libc::VQUIT,
    Erase = libc::VERASE,
    Kill = libc::VKILL,
    Eof = libc::VEOF,
    Eol = libc::VEOL,
    Eol2 = libc::VEOL2,
    Start = libc::VSTART,
    Stop = libc::VSTOP,
    Susp = libc::VSUSP,
    Werase = libc::VWERASE,
}

pub const NCCS: usize = 32;

#[derive(Debug, Clone, Copy)]
pub struct Termios {
    pub iflag: IFlags,
    pub oflag: OFlags,
    pub lflag: LFlags,
    pub cc: [u8; NCCS],
}

impl Default for Termios {
    fn default() -> Self {
        let mut cc = [0u8; NCCS];
        cc[Cc::Intr as usize] = 0x03; // ^C
        cc[Cc::Quit as usize] = 0x1c; // ^\
        cc[Cc::Erase as usize] = 0x7f; // DEL
        cc[Cc::Kill as usize] = 0x15; // ^U
        cc[Cc::Eof as usize] = 0x04; // ^D
        cc[Cc::Start as usize] = 0x11; // ^Q
        cc[Cc::Stop as usize] = 0x13; // ^S
        cc[Cc::Susp as usize] = 0x1a; // ^Z
        cc[Cc::Werase as usize] = 0x17; // ^W
        Self {
            iflag: IFlags::ICRNL,
            oflag: OFlags::ONLCR,
            lflag: LFlags::ICANON | LFlags::ISIG | LFlags::ECHO | LFlags::ECHOE | LFlags::ECHOK,
            cc,
        }
    }
}

impl Termios {
    pub fn cc(&self, c: Cc) -> u8 {
        self.cc[c as usize]
    }

    /// `cook_input` is set whenever ICANON, ISIG, ECHO, or IXON are on
    /// (SPEC_FULL.md §4.2): any of these requires the worker thread's
    /// line-discipline pass instead of a direct pass-through.
    pub fn needs_cooking(&self) -> bool {
        self.lflag.intersects(LFlags::ICANON | LFlags::ISIG | LFlags::ECHO) || self.iflag.contains(IFlags::IXON)
    }

    pub fn is_control(byte: u8) -> bool {
        byte < 0x20 || byte == 0x7f
    }
}
