//! Class drivers: the plug-in point user code attaches to a configured
//! interface to interpret its interrupt-IN reports.
//!
//! Grounded on `crates/kernel/src/drivers/xhci/usb_hid.rs`'s
//! `USBHIDDriver`/`USBHIDDevice` (the interrupt-IN "request, wait for
//! event, re-arm" loop in `request_hid_report`) and
//! `usb_interface.rs`'s `USBInterfaceDriver`/`USBInterface` (the
//! per-interface endpoint table and `start`/`on_event` dispatch). The
//! teacher carries these as two separate, overlapping traits, one of which
//! (`USBHIDDriver`) is really just `USBInterfaceDriver` narrowed to a
//! single interrupt-IN endpoint; this crate merges them into one
//! [`ClassDriver`] trait, since every class driver this crate supports
//! (HID boot-protocol keyboards/mice, and anything else attached through
//! the same interrupt-IN re-arm loop) fits that one shape. Both teacher
//! traits used `Box<dyn ...>` ownership; this crate has no `alloc`, so
//! drivers are attached by `&'static mut dyn ClassDriver` reference
//! instead — the caller owns the driver's storage.

use crate::error::Result;
use crate::rings::transfer::XHCITransferRing;
use crate::trb::NormalTRB;
use crate::usb::UsbEndpointDescriptor;

/// HID boot-protocol subclass/protocol codes (USB HID spec §4.2/§4.3),
/// used to recognize boot keyboards/mice without parsing a report
/// descriptor.
pub const HID_CLASS: u8 = 0x03;
pub const HID_SUBCLASS_BOOT: u8 = 0x01;
pub const HID_PROTOCOL_KEYBOARD: u8 = 0x01;
pub const HID_PROTOCOL_MOUSE: u8 = 0x02;

pub const fn is_hid_boot_interface(
    interface_class: u8,
    interface_subclass: u8,
    interface_protocol: u8,
) -> bool {
    interface_class == HID_CLASS
        && interface_subclass == HID_SUBCLASS_BOOT
        && (interface_protocol == HID_PROTOCOL_KEYBOARD || interface_protocol == HID_PROTOCOL_MOUSE)
}

/// One endpoint owned by an attached interface: its descriptor, transfer
/// ring, and the DMA buffer reports land in.
pub struct ClassEndpoint<'a> {
    pub descriptor: UsbEndpointDescriptor,
    pub transfer_ring: &'a mut XHCITransferRing,
    pub data_buffer: &'a mut [u8],
    pub data_buffer_phys: crate::addr::PhysAddr,
}

impl<'a> ClassEndpoint<'a> {
    /// Enqueues a Normal TRB sized to the endpoint's max packet size and
    /// rings its doorbell, arming it to receive (or send) the next report.
    /// Grounded on `usb_hid.rs::request_hid_report`.
    pub fn arm<D: Fn(u8, u8)>(&mut self, ring_doorbell: D) -> Result<()> {
        let endpoint_num = self.descriptor.endpoint_number();
        let max_packet_size = self.descriptor.w_max_packet_size as u32;

        let normal_trb = NormalTRB::new(self.data_buffer_phys, max_packet_size, 0, true, 1);
        self.transfer_ring.enqueue(normal_trb.into_trb());
        ring_doorbell(self.transfer_ring.doorbell_id(), endpoint_num);
        Ok(())
    }
}

/// A class driver interprets the interrupt-IN reports arriving on the
/// endpoints of one attached interface, and is responsible for re-arming
/// them (via [`ClassEndpoint::arm`]) after consuming each report.
pub trait ClassDriver: Send {
    /// Called once, right after the interface's endpoints have been
    /// configured, to arm the endpoint(s) for their first report.
    fn on_startup(&mut self, endpoints: &mut [ClassEndpoint<'_>], ring_doorbell: &dyn Fn(u8, u8));

    /// Called once per drained Transfer Event on one of this interface's
    /// endpoints, with that endpoint's current report bytes.
    fn on_event(
        &mut self,
        endpoint_index: usize,
        report: &[u8],
        endpoints: &mut [ClassEndpoint<'_>],
        ring_doorbell: &dyn Fn(u8, u8),
    );
}
