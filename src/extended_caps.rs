//! xHCI Extended Capabilities (xHCI spec §7): a singly-linked list of
//! dword-aligned capability records hanging off `CapsReg::ext_caps_offset`.
//!
//! The `id`/`next` header and the Supported Protocol capability (id 2) are
//! grounded on `crates/kernel/src/drivers/xhci/extended_caps.rs`, reworked
//! to walk the list directly over raw MMIO (this crate has no PCI-level
//! `ExtendedCaptability` collaborator; that subsystem was dropped, see
//! `DESIGN.md`). USB Legacy Support (id 1) and the BIOS handoff protocol
//! are reconstructed from `kernel/src/drivers/usb/xhci.cpp`'s
//! `_request_bios_handoff` and the `XHCI_LEGACY_*` constants in
//! `kernel/src/drivers/usb/xhci.h`, since the teacher has no handoff logic
//! at all.

use bitfield_struct::bitfield;

use crate::addr::VirtAddr;
use crate::error::{Result, XhciError};
use crate::platform::Platform;
use crate::wait::poll_ms;
use crate::{read_ref, write_ref};

pub const CAP_ID_USB_LEGACY_SUPPORT: u8 = 1;
pub const CAP_ID_SUPPORTED_PROTOCOL: u8 = 2;

const LEGACY_BIOS_OWNED_SEMAPHORE: u32 = 1 << 16;
const LEGACY_OS_OWNED_SEMAPHORE: u32 = 1 << 24;
const LEGACY_SMI_ENABLE_BITS: u32 = (1 << 0) | (1 << 4) | (1 << 13) | (1 << 14) | (1 << 15);

/// xHci Spec Section 7.0 Table 7-1: generic extended-capability header.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct GenericCapability {
    pub id: u8,
    pub next: u8,
    pub cap_specific: u16,
}

/// Iterates the Extended Capabilities linked list starting at `first`
/// (the MMIO-space address `CapsReg::ext_caps_offset()` resolves to).
pub struct ExtendedCapsIter {
    current: Option<VirtAddr>,
}

impl ExtendedCapsIter {
    pub const fn new(first: VirtAddr) -> Self {
        Self {
            current: if first.is_null() { None } else { Some(first) },
        }
    }
}

impl Iterator for ExtendedCapsIter {
    type Item = (GenericCapability, VirtAddr);

    fn next(&mut self) -> Option<Self::Item> {
        let addr = self.current?;
        let header_ptr = addr.into_ptr::<GenericCapability>();
        let header = read_ref!(*header_ptr);

        self.current = if header.next == 0 {
            None
        } else {
            Some(addr + (header.next as usize) * 4)
        };

        Some((header, addr))
    }
}

#[bitfield(u32)]
struct SupportedProtocolDword3 {
    #[bits(4)]
    slot_type: u8,
    #[bits(28)]
    __: (),
}

/// xHci Spec Section 7.2: USB Supported Protocol Capability (id 2).
#[repr(C)]
pub struct SupportedProtocolCap {
    header: GenericCapability,
    name: u32,
    compatible_port_offset: u8,
    compatible_port_count: u8,
    protocol_defined: u16,
    dword3: SupportedProtocolDword3,
}

impl SupportedProtocolCap {
    /// Zero-based index of the first port compatible with this capability.
    pub const fn first_compatible_port(&self) -> u8 {
        self.compatible_port_offset - 1
    }

    /// Zero-based index of the last port compatible with this capability.
    pub const fn last_compatible_port(&self) -> u8 {
        self.first_compatible_port() + self.compatible_port_count - 1
    }

    /// Major revision version, e.g. 3 for USB3.
    pub const fn major_version(&self) -> u8 {
        (self.header.cap_specific >> 8) as u8
    }

    pub const fn is_usb3(&self) -> bool {
        self.major_version() == 3
    }
}

/// xHci Spec Section 7.1.1: USB Legacy Support Capability (id 1), holding
/// the USBLEGSUP/USBLEGCTLSTS pair used for the BIOS-to-OS handoff.
#[repr(C)]
pub struct UsbLegacySupportCap {
    usblegsup: u32,
    usblegctlsts: u32,
}

impl UsbLegacySupportCap {
    /// Requests OS ownership of the controller, per xHCI spec §4.22.1: mask
    /// off SMI generation, set the OS-owned semaphore, then poll for the
    /// BIOS to clear its own semaphore. Forcibly claims ownership if the
    /// BIOS does not respond within `timeout_ms`, matching
    /// `_request_bios_handoff`'s "Attempting forced controller takeover"
    /// fallback.
    pub fn request_bios_handoff<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        timeout_ms: u32,
    ) -> Result<()> {
        let ctlsts = read_ref!(self.usblegctlsts) & !LEGACY_SMI_ENABLE_BITS;
        write_ref!(self.usblegctlsts, ctlsts);
        platform.sleep_ms(10);

        let legsup = read_ref!(self.usblegsup) | LEGACY_OS_OWNED_SEMAPHORE;
        write_ref!(self.usblegsup, legsup);
        platform.sleep_ms(10);

        let handed_off = poll_ms(platform, timeout_ms, 1, || {
            read_ref!(self.usblegsup) & LEGACY_BIOS_OWNED_SEMAPHORE == 0
        });

        if !handed_off {
            let forced = read_ref!(self.usblegsup) & !LEGACY_BIOS_OWNED_SEMAPHORE;
            write_ref!(self.usblegsup, forced);
            platform.sleep_ms(10);
            if read_ref!(self.usblegsup) & LEGACY_BIOS_OWNED_SEMAPHORE != 0 {
                return Err(XhciError::BiosHandoffTimeout);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usb3_protocol_cap_reports_major_version() {
        let cap = SupportedProtocolCap {
            header: GenericCapability {
                id: CAP_ID_SUPPORTED_PROTOCOL,
                next: 0,
                cap_specific: 0x0300,
            },
            name: 0x20425355,
            compatible_port_offset: 5,
            compatible_port_count: 4,
            protocol_defined: 0,
            dword3: SupportedProtocolDword3::new(),
        };
        assert_eq!(cap.major_version(), 3);
        assert!(cap.is_usb3());
        assert_eq!(cap.first_compatible_port(), 4);
        assert_eq!(cap.last_compatible_port(), 7);
    }
}
