//! Per-device state: its Slot/Endpoint contexts, control transfer ring, and
//! the interfaces/endpoints discovered out of its Configuration descriptor.
//!
//! Grounded on `crates/kernel/src/drivers/xhci/devices/device.rs`'s
//! `XHCIDevice` (`create`, `configure_ep_input_ctx`,
//! `configure_ctrl_ep_input_ctx`, `fill_usb_descriptor`,
//! `get_usb_configuration_descriptor`'s header-then-body two-step fetch,
//! `set_configuration`). The teacher's `InputCtxPtr` enum — a raw, unsafely
//! dereferenced `*mut u8` tagged by context size — is replaced here by
//! `crate::context::InputContext`/`OutputContext`, which carry the same
//! 32-/64-byte dispatch without the raw pointer. The teacher's
//! `configure_ep_input_ctx` has a `todo!()` for non-High/Super-speed
//! intervals; [`endpoint_interval`] fills that gap. UTF-16LE string
//! descriptor decoding has no teacher counterpart at all.

use heapless::Vec as HVec;

use crate::addr::PhysAddr;
use crate::command::{start_control_transfer, TransferCompletion};
use crate::context::{ContextSize, DeviceEndpointType, InputContext, OutputContext};
use crate::dma::{Dma, DmaConstraints};
use crate::error::{Result, XhciError};
use crate::locks::Mutex;
use crate::platform::Platform;
use crate::regs::{PortSpeed, XHCIDoorbellManager};
use crate::rings::transfer::XHCITransferRing;
use crate::trb::{PacketRecipient, PacketType, XHCIDeviceRequestPacket};
use crate::usb::{
    parse_configuration, ConfigurationDescriptorSet, EndpointTransferType, UsbDeviceDescriptor,
    UsbEndpointDescriptor, MAX_ENDPOINTS_PER_INTERFACE, MAX_INTERFACES,
};

pub const GET_DESCRIPTOR: u8 = 6;
pub const SET_CONFIGURATION: u8 = 9;
pub const CLEAR_FEATURE: u8 = 1;
pub const ENDPOINT_HALT_FEATURE: u16 = 0;
pub const HID_SET_PROTOCOL: u8 = 0x0B;
pub const HID_BOOT_PROTOCOL: u16 = 0;

/// Large enough for a device/configuration descriptor off any device this
/// core targets (HID boot-protocol keyboards/mice and similar simple
/// peripherals); a configuration exceeding this is rejected rather than
/// silently truncated.
const DESCRIPTOR_BUFFER_SIZE: usize = 256;

pub fn get_descriptor_packet(descriptor_type: u8, descriptor_index: u8, length: u16) -> XHCIDeviceRequestPacket {
    XHCIDeviceRequestPacket::new()
        .with_recipient(PacketRecipient::Device)
        .with_p_type(PacketType::Standard)
        .with_device_to_host(true)
        .with_b_request(GET_DESCRIPTOR)
        .with_w_value(((descriptor_type as u16) << 8) | descriptor_index as u16)
        .with_w_index(0)
        .with_w_length(length)
}

/// GET_DESCRIPTOR(STRING, index), with `lang_id` in `wIndex` as USB 2.0
/// §9.4.3 requires for every string request past the langid-list probe
/// (`index=0`, where `wIndex` is conventionally 0 too).
pub fn get_string_descriptor_packet(descriptor_index: u8, lang_id: u16, length: u16) -> XHCIDeviceRequestPacket {
    get_descriptor_packet(crate::usb::DESCRIPTOR_TYPE_STRING, descriptor_index, length).with_w_index(lang_id)
}

pub fn set_configuration_packet(config_value: u8) -> XHCIDeviceRequestPacket {
    XHCIDeviceRequestPacket::new()
        .with_recipient(PacketRecipient::Device)
        .with_p_type(PacketType::Standard)
        .with_device_to_host(false)
        .with_b_request(SET_CONFIGURATION)
        .with_w_value(config_value as u16)
}

pub fn set_boot_protocol_packet(interface_number: u8) -> XHCIDeviceRequestPacket {
    XHCIDeviceRequestPacket::new()
        .with_recipient(PacketRecipient::Interface)
        .with_p_type(PacketType::Class)
        .with_device_to_host(false)
        .with_b_request(HID_SET_PROTOCOL)
        .with_w_value(HID_BOOT_PROTOCOL)
        .with_w_index(interface_number as u16)
}

pub fn clear_endpoint_halt_packet(endpoint_address: u8) -> XHCIDeviceRequestPacket {
    XHCIDeviceRequestPacket::new()
        .with_recipient(PacketRecipient::Endpoint)
        .with_p_type(PacketType::Standard)
        .with_device_to_host(false)
        .with_b_request(CLEAR_FEATURE)
        .with_w_value(ENDPOINT_HALT_FEATURE)
        .with_w_index(endpoint_address as u16)
}

/// Endpoint Context `Interval` field, xHCI spec Table 6-9 / USB 2.0 §9.6.6.
/// High/Super-speed interrupt and isochronous endpoints encode interval as
/// `bInterval - 1` (a power-of-2-frame exponent); Full/Low-speed interrupt
/// endpoints use `bInterval` directly, in frames, clamped to the
/// xHCI-mandated `[3, 18]` range; control and bulk endpoints ignore
/// `bInterval` and always program 0.
pub fn endpoint_interval(speed: PortSpeed, transfer_type: EndpointTransferType, b_interval: u8) -> u8 {
    match transfer_type {
        EndpointTransferType::Control | EndpointTransferType::Bulk => 0,
        EndpointTransferType::Interrupt | EndpointTransferType::Isochronous => {
            if speed.is_usb3() || speed == PortSpeed::High {
                b_interval.saturating_sub(1)
            } else {
                b_interval.clamp(3, 18)
            }
        }
    }
}

fn device_endpoint_type(transfer_type: EndpointTransferType, is_in: bool) -> DeviceEndpointType {
    match (transfer_type, is_in) {
        (EndpointTransferType::Control, _) => DeviceEndpointType::ControlBI,
        (EndpointTransferType::Isochronous, false) => DeviceEndpointType::IsochOut,
        (EndpointTransferType::Isochronous, true) => DeviceEndpointType::IsochIn,
        (EndpointTransferType::Bulk, false) => DeviceEndpointType::BulkOut,
        (EndpointTransferType::Bulk, true) => DeviceEndpointType::BulkIn,
        (EndpointTransferType::Interrupt, false) => DeviceEndpointType::IntOut,
        (EndpointTransferType::Interrupt, true) => DeviceEndpointType::IntIn,
    }
}

pub const MAX_STRING_LEN: usize = 64;

/// Decodes a GET_DESCRIPTOR(String) body (header already stripped by the
/// caller is not required — `bytes` may include the 2-byte header, which is
/// skipped) from UTF-16LE into a bounded UTF-8 string. Unpaired surrogates
/// become the replacement character rather than aborting the decode.
pub fn decode_usb_string(bytes: &[u8]) -> heapless::String<MAX_STRING_LEN> {
    let mut out = heapless::String::new();
    let payload = &bytes[bytes.len().min(2)..];
    let units = payload
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]));
    for c in char::decode_utf16(units).map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER)) {
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

/// One endpoint belonging to an attached, configured interface.
pub struct Endpoint {
    pub descriptor: UsbEndpointDescriptor,
    pub dci: u8,
    pub transfer_ring: XHCITransferRing,
    pub report_buffer: Dma<u8>,
}

/// One interface out of the device's active configuration.
pub struct Interface {
    pub interface_number: u8,
    pub interface_class: u8,
    pub interface_subclass: u8,
    pub interface_protocol: u8,
    pub endpoints: HVec<Endpoint, MAX_ENDPOINTS_PER_INTERFACE>,
}

/// A device occupying one slot: its contexts, control transfer ring, and
/// (once configured) its interfaces and their endpoints.
pub struct Device {
    slot_id: u8,
    root_hub_port: u8,
    speed: PortSpeed,
    context_size: ContextSize,
    input_ctx: InputContext,
    output_ctx: OutputContext,
    control_ring: XHCITransferRing,
    descriptor_buffer: Dma<u8>,
    address: u8,
    pub interfaces: HVec<Interface, MAX_INTERFACES>,
}

impl Device {
    pub fn create<P: Platform + ?Sized>(
        platform: &P,
        slot_id: u8,
        root_hub_port: u8,
        speed: PortSpeed,
        context_size: ContextSize,
    ) -> Result<Self> {
        let input_ctx = InputContext::alloc(platform, context_size)?;
        let output_ctx = OutputContext::alloc(platform, context_size)?;
        let control_ring = XHCITransferRing::create(platform, 16, slot_id)?;
        let descriptor_buffer = Dma::<u8>::alloc_slice(platform, DESCRIPTOR_BUFFER_SIZE, DmaConstraints::PAGE)?;

        Ok(Self {
            slot_id,
            root_hub_port,
            speed,
            context_size,
            input_ctx,
            output_ctx,
            control_ring,
            descriptor_buffer,
            address: 0,
            interfaces: HVec::new(),
        })
    }

    pub const fn slot_id(&self) -> u8 {
        self.slot_id
    }
    pub const fn speed(&self) -> PortSpeed {
        self.speed
    }
    pub const fn address(&self) -> u8 {
        self.address
    }
    pub const fn context_size(&self) -> ContextSize {
        self.context_size
    }
    pub fn output_ctx_phys(&self) -> PhysAddr {
        self.output_ctx.phys_addr()
    }
    pub fn input_ctx_phys(&self) -> PhysAddr {
        self.input_ctx.phys_addr()
    }

    /// Fills the Input Context for the first (`BSR=1`) phase of
    /// `ADDRESS_DEVICE`: Slot Context plus a control Endpoint Context whose
    /// max packet size is only a speed-based guess (the device hasn't
    /// reported its real `bMaxPacketSize0` yet).
    pub fn prepare_address_device_input(&mut self) {
        let (dequeue, dcs) = self.control_ring.dequeue_ptr_and_dcs();
        self.input_ctx.clear_control_flags();
        self.input_ctx.set_add_flag(0);
        self.input_ctx.set_add_flag(1);
        self.input_ctx.configure_slot(self.speed, self.root_hub_port);
        self.input_ctx
            .configure_control_endpoint(self.speed.max_control_transfer_initial_packet_size(), dequeue, dcs);
    }

    /// Re-synchronizes the Input Context's control Endpoint Context with
    /// the real `bMaxPacketSize0` from the device descriptor, ahead of the
    /// second (`BSR=0`) `ADDRESS_DEVICE` phase.
    pub fn refine_control_endpoint_mps(&mut self, max_packet_size: u16) {
        let (dequeue, dcs) = self.control_ring.dequeue_ptr_and_dcs();
        self.input_ctx.configure_control_endpoint(max_packet_size, dequeue, dcs);
    }

    /// Reads back the USB device address the controller assigned, after a
    /// successful `ADDRESS_DEVICE(BSR=0)`.
    pub fn note_assigned_address(&mut self) {
        self.address = match &self.output_ctx {
            OutputContext::Ctx32(dma) => unsafe {
                dma.as_slice()[0].slot_context.dword3.usb_device_address()
            },
            OutputContext::Ctx64(dma) => unsafe {
                dma.as_slice()[0].slot_context.dword3.usb_device_address()
            },
        };
    }

    pub fn sync_input_from_output(&mut self) {
        self.input_ctx.sync_from_output(&self.output_ctx);
    }

    /// Issues a control IN transfer (Setup + Data[IN] + Status) through
    /// this device's control ring and blocks for its completion, returning
    /// the number of bytes actually received into the front of the
    /// descriptor buffer (the controller reports residual untransferred
    /// length on short packets).
    pub fn control_transfer_in<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        doorbells: &Mutex<XHCIDoorbellManager<'_>>,
        completion: &TransferCompletion,
        packet: XHCIDeviceRequestPacket,
        length: u16,
        timeout_ms: u32,
    ) -> Result<usize> {
        if length as usize > self.descriptor_buffer.len() {
            return Err(XhciError::DescriptorTooLarge);
        }
        let data_phys = self.descriptor_buffer.phys_addr();
        start_control_transfer(
            platform,
            &mut self.control_ring,
            self.slot_id,
            doorbells,
            packet,
            Some((data_phys, length as u32, true)),
        );
        let response = completion.wait(platform, timeout_ms)?;
        let residual = response.status.trb_transfer_length() as usize;
        Ok((length as usize).saturating_sub(residual))
    }

    /// Issues a control OUT transfer with no Data stage (`SET_CONFIGURATION`,
    /// `SET_PROTOCOL`, `CLEAR_FEATURE`, ...).
    pub fn control_transfer_no_data<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        doorbells: &Mutex<XHCIDoorbellManager<'_>>,
        completion: &TransferCompletion,
        packet: XHCIDeviceRequestPacket,
        timeout_ms: u32,
    ) -> Result<()> {
        start_control_transfer(platform, &mut self.control_ring, self.slot_id, doorbells, packet, None);
        completion.wait(platform, timeout_ms)?;
        Ok(())
    }

    fn descriptor_bytes(&self, len: usize) -> &[u8] {
        let slice = unsafe { self.descriptor_buffer.as_slice() };
        &slice[..len.min(slice.len())]
    }

    /// Step 4 of the device setup flow: reads just the first 8 bytes of the
    /// Device descriptor (`bMaxPacketSize0` is the 8th byte) at the
    /// speed-guessed MPS, per SPEC_FULL §4.6 step 4. The full descriptor is
    /// fetched separately, once the control endpoint's MPS is confirmed
    /// correct (see [`Self::fetch_device_descriptor`]): on a Full/Low-speed
    /// device whose real MPS is below the guess, an 18-byte IN transfer at
    /// the wrong MPS terminates on the first short packet and leaves bytes
    /// 8-17 (`iManufacturer`/`iProduct`/`iSerialNumber`/
    /// `bNumConfigurations`) as stale zeroes.
    pub fn fetch_device_descriptor_prefix<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        doorbells: &Mutex<XHCIDoorbellManager<'_>>,
        completion: &TransferCompletion,
        timeout_ms: u32,
    ) -> Result<u8> {
        const DEVICE_DESCRIPTOR_PREFIX_LEN: u16 = 8;
        self.control_transfer_in(
            platform,
            doorbells,
            completion,
            get_descriptor_packet(crate::usb::DESCRIPTOR_TYPE_DEVICE, 0, DEVICE_DESCRIPTOR_PREFIX_LEN),
            DEVICE_DESCRIPTOR_PREFIX_LEN,
            timeout_ms,
        )?;
        let bytes = self.descriptor_bytes(DEVICE_DESCRIPTOR_PREFIX_LEN as usize);
        Ok(bytes[7])
    }

    /// Fetches the full 18-byte Device descriptor. Called once the control
    /// endpoint's MPS is known to be correct (after BSR=0), so the whole
    /// descriptor — not just the `bMaxPacketSize0` prefix — comes back
    /// intact.
    pub fn fetch_device_descriptor<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        doorbells: &Mutex<XHCIDoorbellManager<'_>>,
        completion: &TransferCompletion,
        timeout_ms: u32,
    ) -> Result<UsbDeviceDescriptor> {
        let length = core::mem::size_of::<UsbDeviceDescriptor>() as u16;
        self.control_transfer_in(
            platform,
            doorbells,
            completion,
            get_descriptor_packet(crate::usb::DESCRIPTOR_TYPE_DEVICE, 0, length),
            length,
            timeout_ms,
        )?;
        let bytes = self.descriptor_bytes(length as usize);
        Ok(unsafe { (bytes.as_ptr() as *const UsbDeviceDescriptor).read_unaligned() })
    }

    /// Fetches and parses the device's active Configuration descriptor, per
    /// the teacher's header-then-body two-step: a short GET_DESCRIPTOR to
    /// learn `wTotalLength`, then a second one sized to the whole blob.
    pub fn fetch_configuration_descriptor<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        doorbells: &Mutex<XHCIDoorbellManager<'_>>,
        completion: &TransferCompletion,
        timeout_ms: u32,
    ) -> Result<ConfigurationDescriptorSet> {
        const CONFIG_HEADER_LEN: u16 = 9;
        self.control_transfer_in(
            platform,
            doorbells,
            completion,
            get_descriptor_packet(crate::usb::DESCRIPTOR_TYPE_CONFIGURATION, 0, CONFIG_HEADER_LEN),
            CONFIG_HEADER_LEN,
            timeout_ms,
        )?;
        let header = self.descriptor_bytes(CONFIG_HEADER_LEN as usize);
        let total_length = u16::from_le_bytes([header[2], header[3]]);
        if total_length as usize > self.descriptor_buffer.len() {
            return Err(XhciError::DescriptorTooLarge);
        }

        self.control_transfer_in(
            platform,
            doorbells,
            completion,
            get_descriptor_packet(crate::usb::DESCRIPTOR_TYPE_CONFIGURATION, 0, total_length),
            total_length,
            timeout_ms,
        )?;
        let bytes = self.descriptor_bytes(total_length as usize);
        parse_configuration(bytes).map_err(|_| XhciError::DescriptorTooLarge)
    }

    /// Fetches a String descriptor with the same header-then-body two-step
    /// as [`Self::fetch_configuration_descriptor`]: a 2-byte probe to learn
    /// `bLength`, then a second request sized to the whole descriptor.
    /// `index=0, lang_id=0` reads the langid list (its first `u16` is the
    /// primary langid every later string request should pass back in).
    pub fn fetch_string_descriptor<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        doorbells: &Mutex<XHCIDoorbellManager<'_>>,
        completion: &TransferCompletion,
        index: u8,
        lang_id: u16,
        timeout_ms: u32,
    ) -> Result<heapless::String<MAX_STRING_LEN>> {
        const STRING_HEADER_LEN: u16 = 2;
        self.control_transfer_in(
            platform,
            doorbells,
            completion,
            get_string_descriptor_packet(index, lang_id, STRING_HEADER_LEN),
            STRING_HEADER_LEN,
            timeout_ms,
        )?;
        let header = self.descriptor_bytes(STRING_HEADER_LEN as usize);
        let total_length = header[0] as u16;
        if total_length < STRING_HEADER_LEN || total_length as usize > self.descriptor_buffer.len() {
            return Err(XhciError::DescriptorTooLarge);
        }

        self.control_transfer_in(
            platform,
            doorbells,
            completion,
            get_string_descriptor_packet(index, lang_id, total_length),
            total_length,
            timeout_ms,
        )?;
        Ok(decode_usb_string(self.descriptor_bytes(total_length as usize)))
    }

    /// Reads the device's primary langid out of String descriptor 0 (the
    /// langid list), falling back to `0x0409` (US English) if the device's
    /// list is empty or the read fails — several simple HID peripherals
    /// answer every other string index but stall on index 0.
    pub fn fetch_primary_lang_id<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        doorbells: &Mutex<XHCIDoorbellManager<'_>>,
        completion: &TransferCompletion,
        timeout_ms: u32,
    ) -> u16 {
        const DEFAULT_US_ENGLISH: u16 = 0x0409;
        const LANGID_LIST_HEADER_LEN: u16 = 4;
        if self
            .control_transfer_in(
                platform,
                doorbells,
                completion,
                get_string_descriptor_packet(0, 0, LANGID_LIST_HEADER_LEN),
                LANGID_LIST_HEADER_LEN,
                timeout_ms,
            )
            .is_err()
        {
            return DEFAULT_US_ENGLISH;
        }
        let bytes = self.descriptor_bytes(LANGID_LIST_HEADER_LEN as usize);
        if bytes.len() < 4 {
            return DEFAULT_US_ENGLISH;
        }
        u16::from_le_bytes([bytes[2], bytes[3]])
    }

    pub fn apply_configuration<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        doorbells: &Mutex<XHCIDoorbellManager<'_>>,
        completion: &TransferCompletion,
        config_value: u8,
        timeout_ms: u32,
    ) -> Result<()> {
        self.control_transfer_no_data(
            platform,
            doorbells,
            completion,
            set_configuration_packet(config_value),
            timeout_ms,
        )
    }

    pub fn apply_boot_protocol<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        doorbells: &Mutex<XHCIDoorbellManager<'_>>,
        completion: &TransferCompletion,
        interface_number: u8,
        timeout_ms: u32,
    ) -> Result<()> {
        self.control_transfer_no_data(
            platform,
            doorbells,
            completion,
            set_boot_protocol_packet(interface_number),
            timeout_ms,
        )
    }

    /// `CLEAR_FEATURE(ENDPOINT_HALT)` on `endpoint_address`, the second half
    /// of the STALL recovery sequence named in SPEC_FULL §7
    /// (`RESET_ENDPOINT` is a Command Ring operation the caller issues
    /// separately, since it has no per-device state to thread through).
    pub fn clear_endpoint_halt<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        doorbells: &Mutex<XHCIDoorbellManager<'_>>,
        completion: &TransferCompletion,
        endpoint_address: u8,
        timeout_ms: u32,
    ) -> Result<()> {
        self.control_transfer_no_data(
            platform,
            doorbells,
            completion,
            clear_endpoint_halt_packet(endpoint_address),
            timeout_ms,
        )
    }

    /// Builds this device's interface/endpoint records out of a parsed
    /// Configuration descriptor, allocating a transfer ring and report
    /// buffer per endpoint and marking each endpoint's Add Context flag and
    /// Endpoint Context in the Input Context — ready for `CONFIGURE_ENDPOINT`.
    pub fn configure_interfaces<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        config: &ConfigurationDescriptorSet,
    ) -> Result<()> {
        let mut interfaces: HVec<Interface, MAX_INTERFACES> = HVec::new();

        for iface in &config.interfaces {
            let mut endpoints: HVec<Endpoint, MAX_ENDPOINTS_PER_INTERFACE> = HVec::new();

            for ep_desc in &iface.endpoints {
                let dci = ep_desc.dci();
                let transfer_ring = XHCITransferRing::create(platform, 16, self.slot_id)?;
                let (dequeue, dcs) = transfer_ring.dequeue_ptr_and_dcs();
                let interval = endpoint_interval(self.speed, ep_desc.transfer_type(), ep_desc.b_interval);
                let ep_type = device_endpoint_type(ep_desc.transfer_type(), ep_desc.is_in());

                self.input_ctx.set_add_flag(dci);
                self.input_ctx
                    .configure_endpoint(dci, ep_type, ep_desc.w_max_packet_size, interval, dequeue, dcs);

                let report_buffer =
                    Dma::<u8>::alloc_slice(platform, ep_desc.w_max_packet_size as usize, DmaConstraints::PAGE)?;

                endpoints
                    .push(Endpoint {
                        descriptor: *ep_desc,
                        dci,
                        transfer_ring,
                        report_buffer,
                    })
                    .map_err(|_| XhciError::DescriptorTooLarge)?;
            }

            interfaces
                .push(Interface {
                    interface_number: iface.interface.b_interface_number,
                    interface_class: iface.interface.b_interface_class,
                    interface_subclass: iface.interface.b_interface_sub_class,
                    interface_protocol: iface.interface.b_interface_protocol,
                    endpoints,
                })
                .map_err(|_| XhciError::DescriptorTooLarge)?;
        }

        self.interfaces = interfaces;
        Ok(())
    }

    /// Releases every DMA allocation owned by this device: its contexts,
    /// control ring, descriptor buffer, and every configured endpoint's
    /// transfer ring and report buffer.
    pub fn release<P: Platform + ?Sized>(self, platform: &P) {
        self.input_ctx.release(platform);
        self.output_ctx.release(platform);
        self.control_ring.release(platform);
        self.descriptor_buffer.release(platform);
        for interface in self.interfaces {
            for endpoint in interface.endpoints {
                endpoint.transfer_ring.release(platform);
                endpoint.report_buffer.release(platform);
            }
        }
    }
}
