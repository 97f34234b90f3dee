//! MMC/SD host framework: bus scan, command issue, ADMA2, partitioning
//! (SPEC_FULL.md §4.5).

pub mod adma2;
pub mod bitfield;
pub mod command;
pub mod desc;
pub mod device;
pub mod host;
pub mod partition;
pub mod regulator;

pub use command::{Command, DataDirection, ResponseType, ACMD};
pub use desc::{response_any_error, response_is_locked, AccessMode, Cid, Csd, ExtCsd, Ocr, Offset, Scr};
pub use device::{AttachedDevice, DriverStrength, MmcDevice, MmcDeviceType, Mode, Partition, SdAccessMode, SdCard};
pub use host::{Capabilities, ClockMode, Host, HostDescriptor, HostHardware};
pub use partition::PartitionInfo;
pub use regulator::{Voltage, VoltageHandle};
