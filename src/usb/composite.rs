//! Composite device model: device -> configurations -> functions.
//!
//! Grounded on `original_source/sys/dev/usb/gadget/composite.cpp`. A
//! function owns one or more interfaces and endpoints; endpoint numbers are
//! assigned densely starting at 1 across the whole device at init time
//! (SPEC_FULL.md §4.4).

use std::sync::Arc;

use crate::error::KResult;
use crate::usb::descriptor::{DeviceDescriptor, EndpointDescriptor, InterfaceDescriptor};
use crate::usb::SetupPacket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// A claimed endpoint slot, numbered densely from 1 across the device.
#[derive(Debug, Clone, Copy)]
pub struct EndpointAssignment {
    pub number: u8,
    pub direction: Direction,
    pub descriptor: EndpointDescriptor,
}

/// A USB function: one or more interfaces, and the endpoints they use.
/// Standard requests the device doesn't claim itself are tried against the
/// active configuration's functions in order (SPEC_FULL.md §4.4).
pub trait Function: Send + Sync {
    fn interfaces(&self) -> Vec<InterfaceDescriptor>;
    fn endpoint_descriptors(&self) -> Vec<EndpointDescriptor>;
    /// Starts the function once its configuration is selected; programs
    /// hardware endpoints via the UDC the caller supplies.
    fn start(&self) -> KResult<()> {
        Ok(())
    }
    fn process_setup(&self, _setup: &SetupPacket) -> Option<KResult<Vec<u8>>> {
        None
    }
}

pub struct Configuration {
    pub value: u8,
    pub configuration_str: u8,
    pub attributes: u8,
    pub max_power: u8,
    pub functions: Vec<Arc<dyn Function>>,
}

impl Configuration {
    pub fn num_interfaces(&self) -> u8 {
        self.functions.iter().map(|f| f.interfaces().len() as u8).sum()
    }
}

pub struct Device {
    pub descriptor: DeviceDescriptor,
    pub strings: Vec<String>,
    pub configurations: Vec<Configuration>,
}

impl Device {
    /// Assigns endpoint numbers densely starting at 1 across every
    /// configuration's functions, matching SPEC_FULL.md §4.4's
    /// initialisation rule. Returns `(config_index, function_index,
    /// endpoint_descriptor, assigned_number)` tuples.
    pub fn assign_endpoints(&self) -> Vec<(usize, usize, EndpointDescriptor, u8)> {
        let mut out = Vec::new();
        let mut next = 1u8;
        for (ci, config) in self.configurations.iter().enumerate() {
            for (fi, func) in config.functions.iter().enumerate() {
                for ep in func.endpoint_descriptors() {
                    out.push((ci, fi, ep, next));
                    next += 1;
                }
            }
        }
        out
    }

    /// Size of the largest configuration descriptor across all
    /// configurations/speeds (SPEC_FULL.md §9, "Dynamic descriptor size"):
    /// the buffer must be allocated once at init to the max seen, not sized
    /// per-request.
    pub fn max_configuration_descriptor_len(&self) -> usize {
        self.configurations
            .iter()
            .map(|c| {
                let mut len = crate::usb::descriptor::CONFIGURATION_DESC_LEN as usize;
                for f in &c.functions {
                    len += f.interfaces().len() * crate::usb::descriptor::INTERFACE_DESC_LEN as usize;
                    len += f.endpoint_descriptors().len() * crate::usb::descriptor::ENDPOINT_DESC_LEN as usize;
                }
                len
            })
            .max()
            .unwrap_or(crate::usb::descriptor::CONFIGURATION_DESC_LEN as usize)
    }

    pub fn encode_configuration(&self, index: usize, other_speed: bool) -> KResult<Vec<u8>> {
        use crate::error::KernelError;
        let config = self.configurations.get(index).ok_or(KernelError::NotFound)?;
        let mut out = Vec::new();
        let header = crate::usb::descriptor::ConfigurationHeader {
            total_length: 0, // patched below
            num_interfaces: config.num_interfaces(),
            configuration_value: config.value,
            configuration_str: config.configuration_str,
            attributes: config.attributes,
            max_power: config.max_power,
        };
        out.extend_from_slice(&header.encode(other_speed));
        for func in &config.functions {
            for iface in func.interfaces() {
                out.extend_from_slice(&iface.encode());
            }
            for ep in func.endpoint_descriptors() {
                out.extend_from_slice(&ep.encode());
            }
        }
        let total = out.len() as u16;
        out[2..4].copy_from_slice(&total.to_le_bytes());
        Ok(out)
    }
}
