//! Standard USB 2.0 descriptor byte layouts (SPEC_FULL.md §4.4, §6).
//!
//! Grounded on `original_source`'s composite/device/function descriptor
//! builders; little-endian, fixed-size structures serialized the way the
//! wire format requires, plus the teacher-style `Descriptor::encode_into`
//! convention of writing into a caller-owned byte slice.

pub const DEVICE_DESC_LEN: u8 = 18;
pub const DEVICE_QUALIFIER_DESC_LEN: u8 = 10;
pub const CONFIGURATION_DESC_LEN: u8 = 9;
pub const INTERFACE_DESC_LEN: u8 = 9;
pub const ENDPOINT_DESC_LEN: u8 = 7;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorType {
    Device = 0x01,
    Configuration = 0x02,
    String = 0x03,
    Interface = 0x04,
    Endpoint = 0x05,
    DeviceQualifier = 0x06,
    OtherSpeedConfiguration = 0x07,
}

#[derive(Debug, Clone, Copy)]
pub struct DeviceDescriptor {
    pub usb_bcd: u16,
    pub device_class: u8,
    pub device_subclass: u8,
    pub device_protocol: u8,
    pub max_packet_size0: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub device_bcd: u16,
    pub manufacturer_str: u8,
    pub product_str: u8,
    pub serial_str: u8,
    pub num_configurations: u8,
}

impl DeviceDescriptor {
    pub fn encode(&self) -> [u8; DEVICE_DESC_LEN as usize] {
        let mut b = [0u8; DEVICE_DESC_LEN as usize];
        b[0] = DEVICE_DESC_LEN;
        b[1] = DescriptorType::Device as u8;
        b[2..4].copy_from_slice(&self.usb_bcd.to_le_bytes());
        b[4] = self.device_class;
        b[5] = self.device_subclass;
        b[6] = self.device_protocol;
        b[7] = self.max_packet_size0;
        b[8..10].copy_from_slice(&self.vendor_id.to_le_bytes());
        b[10..12].copy_from_slice(&self.product_id.to_le_bytes());
        b[12..14].copy_from_slice(&self.device_bcd.to_le_bytes());
        b[14] = self.manufacturer_str;
        b[15] = self.product_str;
        b[16] = self.serial_str;
        b[17] = self.num_configurations;
        b
    }

    pub fn qualifier(&self) -> [u8; DEVICE_QUALIFIER_DESC_LEN as usize] {
        let mut b = [0u8; DEVICE_QUALIFIER_DESC_LEN as usize];
        b[0] = DEVICE_QUALIFIER_DESC_LEN;
        b[1] = DescriptorType::DeviceQualifier as u8;
        b[2..4].copy_from_slice(&self.usb_bcd.to_le_bytes());
        b[4] = self.device_class;
        b[5] = self.device_subclass;
        b[6] = self.device_protocol;
        b[7] = self.max_packet_size0;
        b[8] = self.num_configurations;
        b[9] = 0; // reserved
        b
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConfigurationHeader {
    pub total_length: u16,
    pub num_interfaces: u8,
    pub configuration_value: u8,
    pub configuration_str: u8,
    pub attributes: u8,
    pub max_power: u8,
}

impl ConfigurationHeader {
    pub fn encode(&self, other_speed: bool) -> [u8; CONFIGURATION_DESC_LEN as usize] {
        let mut b = [0u8; CONFIGURATION_DESC_LEN as usize];
        b[0] = CONFIGURATION_DESC_LEN;
        b[1] = if other_speed {
            DescriptorType::OtherSpeedConfiguration as u8
        } else {
            DescriptorType::Configuration as u8
        };
        b[2..4].copy_from_slice(&self.total_length.to_le_bytes());
        b[4] = self.num_interfaces;
        b[5] = self.configuration_value;
        b[6] = self.configuration_str;
        b[7] = self.attributes;
        b[8] = self.max_power;
        b
    }
}

#[derive(Debug, Clone, Copy)]
pub struct InterfaceDescriptor {
    pub interface_number: u8,
    pub alternate_setting: u8,
    pub num_endpoints: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub interface_str: u8,
}

impl InterfaceDescriptor {
    pub fn encode(&self) -> [u8; INTERFACE_DESC_LEN as usize] {
        [
            INTERFACE_DESC_LEN,
            DescriptorType::Interface as u8,
            self.interface_number,
            self.alternate_setting,
            self.num_endpoints,
            self.interface_class,
            self.interface_subclass,
            self.interface_protocol,
            self.interface_str,
        ]
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EndpointDescriptor {
    pub endpoint_address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

impl EndpointDescriptor {
    pub fn encode(&self) -> [u8; ENDPOINT_DESC_LEN as usize] {
        let mp = self.max_packet_size.to_le_bytes();
        [
            ENDPOINT_DESC_LEN,
            DescriptorType::Endpoint as u8,
            self.endpoint_address,
            self.attributes,
            mp[0],
            mp[1],
            self.interval,
        ]
    }
}

/// Encodes a string descriptor as little-endian UCS-2 (SPEC_FULL.md §6).
pub fn encode_string(s: &str) -> Vec<u8> {
    let utf16: Vec<u16> = s.encode_utf16().collect();
    let mut out = Vec::with_capacity(2 + utf16.len() * 2);
    out.push(0); // length, patched below
    out.push(DescriptorType::String as u8);
    for code in utf16 {
        out.extend_from_slice(&code.to_le_bytes());
    }
    out[0] = out.len() as u8;
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_descriptor_has_fixed_length_and_type() {
        let d = DeviceDescriptor {
            usb_bcd: 0x0200,
            device_class: 0,
            device_subclass: 0,
            device_protocol: 0,
            max_packet_size0: 64,
            vendor_id: 0x1234,
            product_id: 0x5678,
            device_bcd: 0x0100,
            manufacturer_str: 1,
            product_str: 2,
            serial_str: 0,
            num_configurations: 1,
        };
        let enc = d.encode();
        assert_eq!(enc[0], DEVICE_DESC_LEN);
        assert_eq!(enc[1], DescriptorType::Device as u8);
        assert_eq!(u16::from_le_bytes([enc[8], enc[9]]), 0x1234);
    }

    #[test]
    fn string_descriptor_length_prefix_matches_encoded_size() {
        let enc = encode_string("hi");
        assert_eq!(enc[0] as usize, enc.len());
        assert_eq!(enc[1], DescriptorType::String as u8);
    }
}
