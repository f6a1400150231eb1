//! Standard USB descriptors (USB 2.0 spec table 9-5 and friends) and a
//! bounded walker over a GET_DESCRIPTOR(Configuration) blob.
//!
//! Grounded on `crates/kernel/src/drivers/xhci/usb.rs`, which only carries
//! [`UsbDescriptorHeader`]/[`UsbDeviceDescriptor`]; the rest of the table
//! (Configuration/Interface/Endpoint/String/HID) is authored fresh from the
//! USB 2.0 specification, in the same `#[repr(C)]` plain-struct style.

use heapless::Vec as HVec;

pub const DESCRIPTOR_TYPE_DEVICE: u8 = 1;
pub const DESCRIPTOR_TYPE_CONFIGURATION: u8 = 2;
pub const DESCRIPTOR_TYPE_STRING: u8 = 3;
pub const DESCRIPTOR_TYPE_INTERFACE: u8 = 4;
pub const DESCRIPTOR_TYPE_ENDPOINT: u8 = 5;
pub const DESCRIPTOR_TYPE_HID: u8 = 0x21;
pub const DESCRIPTOR_TYPE_HID_REPORT: u8 = 0x22;

/// Maximum interfaces this crate will track per configuration. Bounds the
/// `heapless::Vec` in [`ConfigurationDescriptorSet`]; devices exceeding this
/// are rejected rather than silently truncated (see `ConfigurationTooLarge`
/// handling in `crate::device`).
pub const MAX_INTERFACES: usize = 8;
/// Maximum endpoints tracked per interface (excluding the default control
/// endpoint, which every device already has outside this table).
pub const MAX_ENDPOINTS_PER_INTERFACE: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct UsbDescriptorHeader {
    pub b_length: u8,
    pub b_descriptor_type: u8,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct UsbDeviceDescriptor {
    pub header: UsbDescriptorHeader,
    pub bcd_usb: u16,
    pub b_device_class: u8,
    pub b_device_subclass: u8,
    pub b_device_protocol: u8,
    pub b_max_packet_size_0: u8,
    pub id_vendor: u16,
    pub id_product: u16,
    pub bcd_device: u16,
    pub i_manufacturer: u8,
    pub i_product: u8,
    pub i_serial_number: u8,
    pub num_configurations: u8,
}

const _: () = assert!(size_of::<UsbDeviceDescriptor>() == 18);

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct UsbConfigurationDescriptor {
    pub header: UsbDescriptorHeader,
    pub w_total_length: u16,
    pub b_num_interfaces: u8,
    pub b_configuration_value: u8,
    pub i_configuration: u8,
    pub bm_attributes: u8,
    pub b_max_power: u8,
}

const _: () = assert!(size_of::<UsbConfigurationDescriptor>() == 9);

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct UsbInterfaceDescriptor {
    pub header: UsbDescriptorHeader,
    pub b_interface_number: u8,
    pub b_alternate_setting: u8,
    pub b_num_endpoints: u8,
    pub b_interface_class: u8,
    pub b_interface_sub_class: u8,
    pub b_interface_protocol: u8,
    pub i_interface: u8,
}

const _: () = assert!(size_of::<UsbInterfaceDescriptor>() == 9);

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct UsbEndpointDescriptor {
    pub header: UsbDescriptorHeader,
    pub b_endpoint_address: u8,
    pub bm_attributes: u8,
    pub w_max_packet_size: u16,
    pub b_interval: u8,
}

const _: () = assert!(size_of::<UsbEndpointDescriptor>() == 7);

impl UsbEndpointDescriptor {
    pub const fn endpoint_number(&self) -> u8 {
        self.b_endpoint_address & 0x0f
    }

    pub const fn is_in(&self) -> bool {
        self.b_endpoint_address & 0x80 != 0
    }

    pub const fn transfer_type(&self) -> EndpointTransferType {
        match self.bm_attributes & 0x03 {
            0 => EndpointTransferType::Control,
            1 => EndpointTransferType::Isochronous,
            2 => EndpointTransferType::Bulk,
            _ => EndpointTransferType::Interrupt,
        }
    }

    /// Device Context Index: xHCI spec section 4.5.1, `DCI = (endpoint
    /// number * 2) + direction`, with the control endpoint fixed at DCI 1.
    pub const fn dci(&self) -> u8 {
        self.endpoint_number() * 2 + if self.is_in() { 1 } else { 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointTransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct UsbHidDescriptor {
    pub header: UsbDescriptorHeader,
    pub bcd_hid: u16,
    pub b_country_code: u8,
    pub b_num_descriptors: u8,
    pub b_report_descriptor_type: u8,
    pub w_report_descriptor_length: u16,
}

const _: () = assert!(size_of::<UsbHidDescriptor>() == 9);

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct UsbStringDescriptorHeader {
    pub header: UsbDescriptorHeader,
}

/// One interface's descriptor plus its endpoints, as walked out of a
/// Configuration descriptor blob.
#[derive(Debug, Clone, Copy)]
pub struct InterfaceDescriptorSet {
    pub interface: UsbInterfaceDescriptor,
    pub hid: Option<UsbHidDescriptor>,
    pub endpoints: HVec<UsbEndpointDescriptor, MAX_ENDPOINTS_PER_INTERFACE>,
}

/// A fully-walked Configuration descriptor: the fixed header plus every
/// interface (and its endpoints) found inside `wTotalLength` bytes.
#[derive(Debug, Clone)]
pub struct ConfigurationDescriptorSet {
    pub configuration: UsbConfigurationDescriptor,
    pub interfaces: HVec<InterfaceDescriptorSet, MAX_INTERFACES>,
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("configuration descriptor carries more than {MAX_INTERFACES} interfaces")]
pub struct ConfigurationTooLarge;

/// Walks a raw GET_DESCRIPTOR(Configuration) blob (`bytes`, `wTotalLength`
/// bytes long) into a [`ConfigurationDescriptorSet`]. Unrecognized
/// descriptor types between recognized ones (vendor-specific, HID report
/// descriptors embedded out of place, etc.) are skipped by `bLength`.
pub fn parse_configuration(bytes: &[u8]) -> Result<ConfigurationDescriptorSet, ConfigurationTooLarge> {
    let mut cursor = 0usize;

    let configuration = read_struct::<UsbConfigurationDescriptor>(bytes, &mut cursor);
    let mut interfaces: HVec<InterfaceDescriptorSet, MAX_INTERFACES> = HVec::new();

    while cursor < bytes.len() {
        if bytes.len() - cursor < 2 {
            break;
        }
        let b_length = bytes[cursor] as usize;
        let b_descriptor_type = bytes[cursor + 1];

        if b_length == 0 {
            break;
        }

        match b_descriptor_type {
            DESCRIPTOR_TYPE_INTERFACE => {
                let interface = read_struct::<UsbInterfaceDescriptor>(bytes, &mut cursor);
                interfaces
                    .push(InterfaceDescriptorSet {
                        interface,
                        hid: None,
                        endpoints: HVec::new(),
                    })
                    .map_err(|_| ConfigurationTooLarge)?;
            }
            DESCRIPTOR_TYPE_HID => {
                let hid = read_struct::<UsbHidDescriptor>(bytes, &mut cursor);
                if let Some(last) = interfaces.last_mut() {
                    last.hid = Some(hid);
                } else {
                    cursor += 0;
                }
            }
            DESCRIPTOR_TYPE_ENDPOINT => {
                let endpoint = read_struct::<UsbEndpointDescriptor>(bytes, &mut cursor);
                if let Some(last) = interfaces.last_mut() {
                    let _ = last.endpoints.push(endpoint);
                }
            }
            _ => {
                cursor += b_length;
            }
        }
    }

    Ok(ConfigurationDescriptorSet {
        configuration,
        interfaces,
    })
}

fn read_struct<T: Copy>(bytes: &[u8], cursor: &mut usize) -> T {
    let size = size_of::<T>();
    debug_assert!(*cursor + size <= bytes.len());
    let value = unsafe { (bytes.as_ptr().add(*cursor) as *const T).read_unaligned() };
    *cursor += bytes[*cursor] as usize;
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_dci_matches_spec_formula() {
        let mut ep = UsbEndpointDescriptor {
            header: UsbDescriptorHeader {
                b_length: 7,
                b_descriptor_type: DESCRIPTOR_TYPE_ENDPOINT,
            },
            b_endpoint_address: 0x81,
            bm_attributes: 0x03,
            w_max_packet_size: 8,
            b_interval: 10,
        };
        assert_eq!(ep.dci(), 3);
        assert!(ep.is_in());
        ep.b_endpoint_address = 0x02;
        assert_eq!(ep.dci(), 4);
        assert!(!ep.is_in());
    }

    #[test]
    fn parses_single_interface_with_endpoint() {
        #[rustfmt::skip]
        let bytes: [u8; 9 + 9 + 7] = [
            9, DESCRIPTOR_TYPE_CONFIGURATION, 25, 0, 1, 1, 0, 0xa0, 50,
            9, DESCRIPTOR_TYPE_INTERFACE, 0, 0, 1, 3, 1, 1, 0,
            7, DESCRIPTOR_TYPE_ENDPOINT, 0x81, 0x03, 8, 0, 10,
        ];
        let set = parse_configuration(&bytes).unwrap();
        assert_eq!(set.interfaces.len(), 1);
        assert_eq!(set.interfaces[0].endpoints.len(), 1);
        assert_eq!(set.interfaces[0].interface.b_interface_class, 3);
    }

    #[test]
    fn rejects_too_many_interfaces() {
        let mut bytes: HVec<u8, 128> = HVec::new();
        let _ = bytes.extend_from_slice(&[9, DESCRIPTOR_TYPE_CONFIGURATION, 0, 0, 0, 1, 0, 0, 0]);
        for i in 0..(MAX_INTERFACES + 1) {
            let _ = bytes.extend_from_slice(&[9, DESCRIPTOR_TYPE_INTERFACE, i as u8, 0, 0, 0, 0, 0, 0]);
        }
        assert!(parse_configuration(&bytes).is_err());
    }
}
