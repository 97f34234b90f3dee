//! MMC/SD command and response-type truth tables.
//!
//! Grounded on `sys/dev/mmc/command.{h,cpp}`: a command is constructed with
//! an index, argument and response type, optionally carries a data
//! transfer, and derives several booleans purely from the response type
//! (SPEC_FULL.md §4.5 supplement, "Command response derivation").

use crate::mmc::bitfield::bit_be;

pub const ACMD: u32 = 0x80;

/// Response-type tag (SPEC_FULL.md §3, MMC command). Comment columns from
/// the source: length, index, busy, crc.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    None,
    R1,
    R1b,
    R2,
    R3,
    R4,
    R5,
    R5b,
    R6,
    R7,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    None,
    HostToDevice,
    DeviceToHost,
}

/// One MMC/SD command in flight: index/argument/response type, optional
/// attached data transfer, and the 16-byte response buffer once issued.
#[derive(Debug, Clone)]
pub struct Command {
    index: u32,
    argument: u32,
    response_type: ResponseType,
    data_direction: DataDirection,
    iov_offset: usize,
    data_size: usize,
    transfer_block_size: usize,
    reliable_write: bool,
    response: [u8; 16],
    data: Vec<u8>,
}

impl Command {
    pub fn new(index: u32, argument: u32, response_type: ResponseType) -> Self {
        Self {
            index,
            argument,
            response_type,
            data_direction: DataDirection::None,
            iov_offset: 0,
            data_size: 0,
            transfer_block_size: 0,
            reliable_write: false,
            response: [0u8; 16],
            data: Vec::new(),
        }
    }

    pub fn setup_data_transfer(
        &mut self,
        direction: DataDirection,
        transfer_block_size: usize,
        iov_offset: usize,
        len: usize,
        reliable_write: bool,
    ) {
        self.data_direction = direction;
        self.transfer_block_size = transfer_block_size;
        self.iov_offset = iov_offset;
        self.data_size = len;
        self.reliable_write = reliable_write;
        self.data.resize(len, 0);
    }

    /// The in-band data payload for a command whose transfer has been set up
    /// with [`setup_data_transfer`](Self::setup_data_transfer): the card's
    /// response for `device_to_host` commands (e.g. EXT_CSD, SCR), or the
    /// bytes to write for `host_to_device` ones. `HostHardware::run_command`
    /// impls read/fill this in place of a separate iovec pointer.
    pub fn data_buf(&self) -> &[u8] {
        &self.data
    }
    pub fn data_buf_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn iov_offset(&self) -> usize {
        self.iov_offset
    }
    pub fn data_direction(&self) -> DataDirection {
        self.data_direction
    }
    pub fn data_size(&self) -> usize {
        self.data_size
    }
    pub fn transfer_block_size(&self) -> usize {
        self.transfer_block_size
    }
    pub fn reliable_write(&self) -> bool {
        self.reliable_write
    }

    /// True if the command index carries the `APP_CMD` (ACMD) prefix bit.
    pub fn acmd(&self) -> bool {
        self.index & ACMD != 0
    }
    /// The bare command index, with the ACMD prefix bit masked off.
    pub fn index(&self) -> u32 {
        self.index & !ACMD
    }
    pub fn argument(&self) -> u32 {
        self.argument
    }

    pub fn response(&self) -> &[u8; 16] {
        &self.response
    }
    pub fn response_mut(&mut self) -> &mut [u8; 16] {
        &mut self.response
    }

    pub fn response_length(&self) -> usize {
        match self.response_type {
            ResponseType::None => 0,
            ResponseType::R2 => 136,
            _ => 48,
        }
    }

    pub fn busy_signalling(&self) -> bool {
        matches!(self.response_type, ResponseType::R1b | ResponseType::R5b)
    }

    pub fn uses_data_lines(&self) -> bool {
        self.data_size() > 0 || self.busy_signalling()
    }

    pub fn response_contains_index(&self) -> bool {
        matches!(
            self.response_type,
            ResponseType::R1
                | ResponseType::R1b
                | ResponseType::R4
                | ResponseType::R5
                | ResponseType::R5b
                | ResponseType::R6
                | ResponseType::R7
        )
    }

    pub fn response_crc_valid(&self) -> bool {
        self.response_contains_index()
    }

    /// Bit 23 of an R1/R1b response signals a command CRC error on the
    /// wire; every other response type cannot carry it.
    pub fn com_crc_error(&self) -> bool {
        match self.response_type {
            ResponseType::R1 | ResponseType::R1b => bit_be(&self.response[..4], 23),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_response_length_from_type() {
        assert_eq!(Command::new(0, 0, ResponseType::None).response_length(), 0);
        assert_eq!(Command::new(1, 0, ResponseType::R1).response_length(), 48);
        assert_eq!(Command::new(2, 0, ResponseType::R2).response_length(), 136);
    }

    #[test]
    fn busy_signalling_only_r1b_r5b() {
        assert!(Command::new(12, 0, ResponseType::R1b).busy_signalling());
        assert!(!Command::new(12, 0, ResponseType::R1).busy_signalling());
    }

    #[test]
    fn acmd_prefix_strips_from_index() {
        let c = Command::new(ACMD | 41, 0, ResponseType::R3);
        assert!(c.acmd());
        assert_eq!(c.index(), 41);
    }

    #[test]
    fn uses_data_lines_true_for_data_or_busy() {
        let mut c = Command::new(18, 0, ResponseType::R1);
        assert!(!c.uses_data_lines());
        c.setup_data_transfer(DataDirection::DeviceToHost, 512, 0, 512, false);
        assert!(c.uses_data_lines());
    }
}
