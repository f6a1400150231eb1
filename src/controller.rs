//! Controller lifecycle: capability discovery, BIOS-to-OS handoff, host
//! controller reset, ring/queue construction, and the IRQ-driven event
//! dispatch that ties the Command/Transfer engines and attached class
//! drivers together into one runnable `Controller`.
//!
//! Grounded on `crates/kernel/src/drivers/xhci/mod.rs`'s `PCIDevice::create`/
//! `start` (capability mapping, ring/queue construction, `regs.start()`,
//! `prob()`), `InterruptReceiver::handle_interrupt` (drain-and-dispatch by
//! event kind) and `PolledDriver::poll` (pop a queued port connection,
//! reset it, hand off to `setup_device`). The teacher's own `setup_device`
//! is a two-line stub that only enables a slot and logs; the full
//! ADDRESS_DEVICE(BSR=1) -> GET_DESCRIPTOR -> conditional EVALUATE_CONTEXT
//! -> ADDRESS_DEVICE(BSR=0) -> SET_CONFIGURATION -> CONFIGURE_ENDPOINT
//! sequence built here has no single teacher analog; it is assembled out of
//! the per-step primitives `crate::device::Device` already exposes (each
//! grounded individually in `DESIGN.md`). Host-controller reset/start and
//! operational-register programming are reconstructed directly from the
//! `OperationalRegs`/`CapsReg` layouts in `crate::regs`, whose module doc
//! comment names this file as where that sequence now lives — the
//! teacher's `XHCIRegisters` wrapper that used to own it has no counterpart
//! here. BIOS handoff and USB3 Supported Protocol port discovery are
//! grounded on `kernel/src/drivers/usb/xhci.cpp`'s `_request_bios_handoff`
//! (see `crate::extended_caps`, which implements the mechanics this file
//! only calls). The teacher hard-codes a PCI `probe`/`start` pair and a
//! fixed MSI-X vector; this crate has no PCI layer of its own (dropped, see
//! `DESIGN.md`), so a `Platform`-mapped MMIO base plus one registered IRQ
//! vector stand in for it.

use heapless::Vec as HVec;

use crate::addr::{PhysAddr, VirtAddr};
use crate::class::{is_hid_boot_interface, ClassDriver, ClassEndpoint};
use crate::command::CommandEngine;
use crate::command::TransferCompletion;
use crate::config::XhciConfig;
use crate::context::ContextSize;
use crate::device::Device;
use crate::error::{Result, XhciError};
use crate::extended_caps::{
    ExtendedCapsIter, SupportedProtocolCap, UsbLegacySupportCap, CAP_ID_SUPPORTED_PROTOCOL,
    CAP_ID_USB_LEGACY_SUPPORT,
};
use crate::locks::Mutex;
use crate::platform::Platform;
use crate::regs::{CapsReg, InterrupterRegs, OperationalRegs, RuntimeRegs, USBCmd, USBSts, XHCIDoorbellManager, XHCIIman};
use crate::rings::command::XHCICommandRing;
use crate::rings::event::XHCIEventRing;
use crate::rings::RING_TRB_COUNT;
use crate::slots::{Dcbaa, ScratchpadBuffers, SlotTable};
use crate::trb::{
    AddressDeviceCommandTRB, CompletionStatusCode, ConfigureEndpointCommandTRB, EnableSlotCommandTRB,
    EvaluateContextCMDTRB, EventResponseTRB, ResetEndpointCommandTRB, TransferResponseTRB,
};
use crate::usb::MAX_ENDPOINTS_PER_INTERFACE;
use crate::wait::poll_ms;
use crate::{read_ref, write_ref};

/// Practical bound on root hub ports a single controller instance tracks
/// USB3 membership / pending connection events for. HCSPARAMS1's Max Ports
/// field is 8 bits wide (up to 255); no embedded system wires up anywhere
/// near that many.
const MAX_TRACKED_PORTS: usize = 64;

/// HID boot-protocol reports are capped by the HID spec (8 bytes for
/// keyboards, 3-4 for mice); 64 bytes leaves headroom without risking an
/// unbounded copy out of a misbehaving device's report buffer.
const MAX_REPORT_LEN: usize = 64;

/// Bound on STALL recoveries queued between `poll()` calls; a misbehaving
/// device stalling faster than the worker drains this queue just has its
/// later stalls recovered on the next `poll()` pass instead of queueing
/// unboundedly.
const MAX_TRACKED_STALLS: usize = 16;

/// Recognizes a just-configured interface and hands back the class driver
/// that should own it, or `None` to leave the interface unattached.
/// Embedder-supplied since this crate has no driver registry of its own
/// (no `alloc`, and only one class of driver storage — `&'static mut`) and
/// the teacher has nothing resembling a registry either: `usb_hid.rs`
/// hard-codes its single HID driver inline.
pub type DriverProbeFn = fn(class: u8, subclass: u8, protocol: u8) -> Option<&'static mut dyn ClassDriver>;

struct PortConnectionEvent {
    port_index: u8,
    disconnected: bool,
}

/// A `STALL_ERROR` transfer event on some endpoint other than the default
/// control endpoint, queued for `poll()` to recover from (SPEC_FULL §7:
/// `STALL_ERROR` -> `RESET_ENDPOINT` + `CLEAR_FEATURE(ENDPOINT_HALT)`).
/// Recovery needs two round trips through the Command Ring / control
/// endpoint that each block on a completion condition, so it cannot run
/// from inside `handle_interrupt` itself.
struct StallRecovery {
    slot_id: u8,
    dci: u8,
}

/// Reconstructs a `bEndpointAddress`-shaped byte (endpoint number in bits
/// 0-3, direction in bit 7) from a Device Context Index, per the DCI
/// formula in SPEC_FULL §3 (`DCI = 2*endpoint_num + direction_in`).
const fn endpoint_address_from_dci(dci: u8) -> u8 {
    let endpoint_num = dci / 2;
    let is_in = dci % 2 == 1;
    endpoint_num | if is_in { 0x80 } else { 0 }
}

struct AttachedDriver {
    interface_index: usize,
    driver: &'static mut dyn ClassDriver,
}

/// One xHCI host controller instance: owns every MMIO/DMA resource it needs
/// and drives its lifecycle end to end, from capability discovery through
/// per-device enumeration and steady-state interrupt dispatch.
pub struct Controller<P: Platform> {
    platform: P,
    config: XhciConfig,
    op_regs: *mut OperationalRegs,
    runtime_regs: *mut RuntimeRegs,
    max_ports: u8,
    max_device_slots: usize,
    context_size: ContextSize,
    doorbells: Mutex<XHCIDoorbellManager<'static>>,
    event_ring: Mutex<XHCIEventRing>,
    command_engine: CommandEngine,
    transfer_completion: TransferCompletion,
    dcbaa: Mutex<Dcbaa>,
    // Never read again once installed at DCBAA[0]; kept alive so its `Dma`
    // pages are never freed out from under the controller.
    _scratchpad: Option<ScratchpadBuffers>,
    devices: Mutex<SlotTable<Device>>,
    drivers: Mutex<SlotTable<AttachedDriver>>,
    driver_probe: Option<DriverProbeFn>,
    usb3_ports: Mutex<HVec<u8, MAX_TRACKED_PORTS>>,
    port_queue: Mutex<HVec<PortConnectionEvent, MAX_TRACKED_PORTS>>,
    stall_queue: Mutex<HVec<StallRecovery, MAX_TRACKED_STALLS>>,
}

// Every mutable access to the raw `op_regs`/`runtime_regs` pointers goes
// through a volatile read/write of a hardware register, the same
// aliasing model `crate::regs` already relies on for `&'static mut`
// views handed out from `&self`-taking accessors.
unsafe impl<P: Platform> Send for Controller<P> {}
unsafe impl<P: Platform> Sync for Controller<P> {}

impl<P: Platform> Controller<P> {
    /// Maps the controller's MMIO region, walks its extended capabilities
    /// (BIOS handoff, USB3 port discovery), resets it, and allocates every
    /// controller-lifetime structure (DCBAA, scratchpad buffers, Command
    /// Ring, Event Ring). Does not start the schedule — call [`Self::start`]
    /// once the returned controller has a stable address (it registers an
    /// interrupt handler carrying `&Self` as context).
    pub fn new(platform: P, mmio_phys: PhysAddr, mmio_size: usize, config: XhciConfig) -> Result<Self> {
        Self::new_with_driver_probe(platform, mmio_phys, mmio_size, config, None)
    }

    /// As [`Self::new`], but attaches `driver_probe` so newly configured HID
    /// boot-protocol interfaces can be handed off to an embedder-supplied
    /// [`ClassDriver`].
    pub fn new_with_driver_probe(
        platform: P,
        mmio_phys: PhysAddr,
        mmio_size: usize,
        config: XhciConfig,
        driver_probe: Option<DriverProbeFn>,
    ) -> Result<Self> {
        let base_virt = platform.map_mmio(mmio_phys, mmio_size);
        platform.mark_uncacheable(base_virt, mmio_size);

        let caps = unsafe { &*base_virt.into_ptr::<CapsReg>() };

        let mut usb3_ports: HVec<u8, MAX_TRACKED_PORTS> = HVec::new();
        Self::walk_extended_caps(&platform, base_virt, caps, config.bios_handoff_timeout_ms, &mut usb3_ports)?;

        let op_regs_ptr = caps.operational_regs_ptr();
        unsafe { Self::reset_host_controller(&platform, op_regs_ptr)? };

        let max_device_slots = caps.max_device_slots();
        let context_size = ContextSize::from_csz_bit(caps.context_sz_64bytes());

        let mut dcbaa = Dcbaa::alloc(&platform, max_device_slots)?;
        let scratchpad = if config.use_scratchpad_buffers && caps.max_scratchpad_buffers() > 0 {
            let buffers = ScratchpadBuffers::alloc(&platform, caps.max_scratchpad_buffers())?;
            dcbaa.set_scratchpad_array(buffers.phys_addr());
            Some(buffers)
        } else {
            None
        };

        let command_ring = XHCICommandRing::create(&platform, RING_TRB_COUNT)?;
        let command_engine = CommandEngine::new(command_ring);

        let runtime_regs_ptr = caps.runtime_regs_ptr();
        let interrupter0_ptr = unsafe { (&mut *runtime_regs_ptr).interrupter_ptr(0) };
        let event_ring = XHCIEventRing::create(&platform, interrupter0_ptr, RING_TRB_COUNT)?;

        unsafe {
            Self::program_operational_regs(op_regs_ptr, &dcbaa, &command_engine, max_device_slots);
            Self::enable_interrupter(interrupter0_ptr);
        }

        let doorbells: XHCIDoorbellManager<'static> =
            unsafe { XHCIDoorbellManager::new(caps.doorbells_base(), max_device_slots) };

        Ok(Self {
            max_ports: caps.max_ports(),
            max_device_slots,
            context_size,
            platform,
            config,
            op_regs: op_regs_ptr,
            runtime_regs: runtime_regs_ptr,
            doorbells: Mutex::new(doorbells),
            event_ring: Mutex::new(event_ring),
            command_engine,
            transfer_completion: TransferCompletion::new(),
            dcbaa: Mutex::new(dcbaa),
            _scratchpad: scratchpad,
            devices: Mutex::new(SlotTable::new()),
            drivers: Mutex::new(SlotTable::new()),
            driver_probe,
            usb3_ports: Mutex::new(usb3_ports),
            port_queue: Mutex::new(HVec::new()),
            stall_queue: Mutex::new(HVec::new()),
        })
    }

    fn walk_extended_caps(
        platform: &P,
        base_virt: VirtAddr,
        caps: &CapsReg,
        bios_handoff_timeout_ms: u32,
        usb3_ports: &mut HVec<u8, MAX_TRACKED_PORTS>,
    ) -> Result<()> {
        let Some(dword_offset) = caps.ext_caps_offset() else {
            return Ok(());
        };
        let first = base_virt + (dword_offset as usize) * 4;

        for (header, addr) in ExtendedCapsIter::new(first) {
            match header.id {
                CAP_ID_USB_LEGACY_SUPPORT => {
                    let legacy = unsafe { &mut *addr.into_ptr::<UsbLegacySupportCap>() };
                    legacy.request_bios_handoff(platform, bios_handoff_timeout_ms)?;
                }
                CAP_ID_SUPPORTED_PROTOCOL => {
                    let protocol = unsafe { &*addr.into_ptr::<SupportedProtocolCap>() };
                    if protocol.is_usb3() {
                        for port in protocol.first_compatible_port()..=protocol.last_compatible_port() {
                            let _ = usb3_ports.push(port);
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(())
    }

    /// Halts the controller if it's running, then drives HCRESET and waits
    /// for both it and Controller Not Ready to clear. Grounded on the
    /// teacher's `reset_zero`, reworked to return a typed error on timeout
    /// instead of panicking via `sleep_until!`.
    unsafe fn reset_host_controller(platform: &P, op_regs_ptr: *mut OperationalRegs) -> Result<()> {
        let op_regs = unsafe { &mut *op_regs_ptr };

        if read_ref!(op_regs.usbcmd).contains(USBCmd::RUN) {
            let cmd = read_ref!(op_regs.usbcmd).difference(USBCmd::RUN);
            write_ref!(op_regs.usbcmd, cmd);

            let halted = poll_ms(platform, 200, 1, || read_ref!(op_regs.usbstatus).contains(USBSts::HCHALTED));
            if !halted {
                return Err(XhciError::ControllerReset { phase: "halt" });
            }
        }

        write_ref!(op_regs.usbcmd, USBCmd::HCRESET);
        let reset_done = poll_ms(platform, 1000, 1, || {
            !read_ref!(op_regs.usbcmd).contains(USBCmd::HCRESET) && !read_ref!(op_regs.usbstatus).contains(USBSts::NOT_READY)
        });
        if !reset_done {
            return Err(XhciError::ControllerReset { phase: "reset" });
        }

        Ok(())
    }

    /// Programs DCBAAP/CRCR/CONFIG ahead of `Controller::start` setting
    /// Run/Stop. Device Notifications are left disabled (DNCTRL=0); no
    /// device class this core targets needs one.
    unsafe fn program_operational_regs(
        op_regs_ptr: *mut OperationalRegs,
        dcbaa: &Dcbaa,
        command_engine: &CommandEngine,
        max_device_slots: usize,
    ) {
        let op_regs = unsafe { &mut *op_regs_ptr };
        write_ref!(op_regs.dnctrl, 0);
        write_ref!(op_regs.dcbaap, dcbaa.phys_addr());
        let crcr = command_engine.ring_base_phys_addr().into_raw() | command_engine.ring_current_cycle() as usize;
        write_ref!(op_regs.crcr, crcr);
        write_ref!(op_regs.config, max_device_slots as u32);
    }

    unsafe fn enable_interrupter(interrupter_ptr: *mut InterrupterRegs) {
        let interrupter = unsafe { &mut *interrupter_ptr };
        let iman = read_ref!(interrupter.iman).union(XHCIIman::INTERRUPT_ENABLE);
        write_ref!(interrupter.iman, iman);
    }

    /// Registers the controller's interrupt handler, sets Run/Stop, and
    /// flushes any ports that were already connected before this driver
    /// attached (the teacher's `prob()`: a cold boot has no port status
    /// change events queued for devices connected by firmware).
    ///
    /// `self` must already be at its final, stable address — the
    /// registered handler carries a raw pointer to it.
    pub fn start(&'static self, irq_vector: u32) -> Result<()> {
        self.platform
            .register_irq(irq_vector, Self::irq_trampoline, self as *const Self as *mut ());

        let op_regs = unsafe { &mut *self.op_regs };
        let cmd = read_ref!(op_regs.usbcmd).union(USBCmd::RUN).union(USBCmd::INTERRUPT_ENABLE);
        write_ref!(op_regs.usbcmd, cmd);

        let running = poll_ms(&self.platform, 1000, 1, || !read_ref!(op_regs.usbstatus).contains(USBSts::HCHALTED));
        if !running {
            return Err(XhciError::ControllerReset { phase: "start" });
        }

        self.probe_ports();
        Ok(())
    }

    fn probe_ports(&self) {
        let op_regs = unsafe { &mut *self.op_regs };
        let mut queue = self.port_queue.lock();
        for port_index in 0..self.max_ports {
            let port_regs = unsafe { op_regs.port_registers(port_index) };
            let port_sc = read_ref!(port_regs.port_sc);
            if port_sc.ccs() && port_sc.csc() {
                let _ = queue.push(PortConnectionEvent {
                    port_index,
                    disconnected: !port_sc.ccs(),
                });
            }
        }
    }

    extern "C" fn irq_trampoline(ctx: *mut ()) {
        let this = unsafe { &*(ctx as *const Self) };
        this.handle_interrupt();
    }

    /// Drains the Event Ring and routes every event to the engine or class
    /// driver that owns it, then acknowledges the interrupt. Grounded on
    /// `InterruptReceiver::handle_interrupt`: EINT is cleared before IP,
    /// per `USBSts::EINT`'s own doc comment, to avoid racing a fresh
    /// Interrupt Pending transition.
    pub fn handle_interrupt(&self) {
        let events = self.event_ring.lock().dequeue_events();

        for event in events {
            match event {
                EventResponseTRB::CommandCompletion(resp) => {
                    crate::trace_trb!("command completion: slot {} code {:?}", resp.slot_id(), resp.completion_code());
                    self.command_engine.on_command_completion(resp);
                }
                EventResponseTRB::TransferResponse(resp) => {
                    self.dispatch_transfer_event(resp);
                }
                EventResponseTRB::PortStatusChange(event) => {
                    let port_index = event.parameter.port_index();
                    let op_regs = unsafe { &mut *self.op_regs };
                    let port_regs = unsafe { op_regs.port_registers(port_index) };
                    let port_sc = read_ref!(port_regs.port_sc);
                    if port_sc.csc() {
                        let _ = self.port_queue.lock().push(PortConnectionEvent {
                            port_index,
                            disconnected: !port_sc.ccs(),
                        });
                        write_ref!(port_regs.port_sc, port_sc.ack_connect_status_change());
                    }
                }
            }
        }

        let op_regs = unsafe { &mut *self.op_regs };
        write_ref!(op_regs.usbstatus, USBSts::EINT);

        let interrupter = unsafe { &mut *(&mut *self.runtime_regs).interrupter_ptr(0) };
        let iman = read_ref!(interrupter.iman).union(XHCIIman::INTERRUPT_PENDING);
        write_ref!(interrupter.iman, iman);
    }

    /// Routes one drained Transfer Event: control-endpoint (DCI 1) events
    /// complete the single shared [`TransferCompletion`] slot device setup
    /// waits on; every other endpoint's event is handed to the interface's
    /// attached class driver, if one is attached.
    fn dispatch_transfer_event(&self, resp: TransferResponseTRB) {
        if resp.dci() == 1 {
            self.transfer_completion.on_transfer_event(resp);
            return;
        }

        let slot_id = resp.slot_id();
        if resp.completion_code() == CompletionStatusCode::StallError {
            let _ = self.stall_queue.lock().push(StallRecovery { slot_id, dci: resp.dci() });
        }

        let mut drivers = self.drivers.lock();
        let Some(attached) = drivers.get_mut(slot_id) else {
            return;
        };

        let mut devices = self.devices.lock();
        let Some(device) = devices.get_mut(slot_id) else {
            return;
        };
        let Some(interface) = device.interfaces.get_mut(attached.interface_index) else {
            return;
        };
        let Some(endpoint_index) = interface.endpoints.iter().position(|ep| ep.dci == resp.dci()) else {
            return;
        };

        let mut report: HVec<u8, MAX_REPORT_LEN> = HVec::new();
        {
            let bytes = unsafe { interface.endpoints[endpoint_index].report_buffer.as_slice() };
            let _ = report.extend_from_slice(&bytes[..bytes.len().min(MAX_REPORT_LEN)]);
        }

        let doorbells = &self.doorbells;
        let ring_doorbell = |doorbell_id: u8, target: u8| {
            doorbells.lock().ring_doorbell(doorbell_id, target);
        };

        let mut endpoints: HVec<ClassEndpoint<'_>, MAX_ENDPOINTS_PER_INTERFACE> = HVec::new();
        for ep in interface.endpoints.iter_mut() {
            let data_buffer_phys = ep.report_buffer.phys_addr();
            let _ = endpoints.push(ClassEndpoint {
                descriptor: ep.descriptor,
                transfer_ring: &mut ep.transfer_ring,
                data_buffer: unsafe { ep.report_buffer.as_mut_slice() },
                data_buffer_phys,
            });
        }

        attached.driver.on_event(endpoint_index, &report, &mut endpoints, &ring_doorbell);
    }

    /// Pops one queued port connection event (if any), resets that port,
    /// and — if the reset succeeded and the event wasn't a disconnection —
    /// runs full device enumeration on it. Meant to be called from a
    /// non-interrupt worker context after `handle_interrupt` or `start`'s
    /// initial flush has queued something; grounded on `PolledDriver::poll`.
    pub fn poll(&self) {
        self.recover_stalls();

        let event = {
            let mut queue = self.port_queue.lock();
            if queue.is_empty() {
                return;
            }
            queue.remove(0)
        };

        let is_usb3 = self.usb3_ports.lock().contains(&event.port_index);
        let op_regs = unsafe { &mut *self.op_regs };
        let reset_ok = unsafe { op_regs.reset_port(&self.platform, is_usb3, event.port_index) };

        if reset_ok && !event.disconnected {
            if let Err(err) = self.setup_device(event.port_index) {
                log::warn!("xHCI device setup on port {port} failed: {err}", port = event.port_index);
            }
        }
    }

    /// Drains every queued [`StallRecovery`] and, per SPEC_FULL §7, issues
    /// `RESET_ENDPOINT` followed by a `CLEAR_FEATURE(ENDPOINT_HALT)` control
    /// transfer on each stalled endpoint so it is usable again. Best-effort:
    /// a device that has since disconnected, or a recovery command that
    /// itself times out, is logged and skipped rather than propagated,
    /// since no caller is waiting on this queue synchronously.
    fn recover_stalls(&self) {
        loop {
            let Some(stall) = self.stall_queue.lock().pop() else {
                break;
            };

            if let Err(err) = self.command_engine.send_command(
                &self.platform,
                &self.doorbells,
                ResetEndpointCommandTRB::new(stall.slot_id, stall.dci, false, 0).into_trb(),
                self.config.command_timeout_ms,
            ) {
                log::warn!(
                    "xHCI RESET_ENDPOINT failed for slot {slot} dci {dci}: {err}",
                    slot = stall.slot_id,
                    dci = stall.dci
                );
                continue;
            }

            let mut devices = self.devices.lock();
            let Some(device) = devices.get_mut(stall.slot_id) else {
                continue;
            };
            let endpoint_address = endpoint_address_from_dci(stall.dci);
            if let Err(err) = device.clear_endpoint_halt(
                &self.platform,
                &self.doorbells,
                &self.transfer_completion,
                endpoint_address,
                self.config.transfer_timeout_ms,
            ) {
                log::warn!(
                    "xHCI CLEAR_FEATURE(ENDPOINT_HALT) failed for slot {slot} endpoint {ep:#x}: {err}",
                    slot = stall.slot_id,
                    ep = endpoint_address
                );
            }
        }
    }

    /// Runs the full 11-step device setup sequence for a device that just
    /// reset successfully on `port_index`: enable a slot, address it twice
    /// (probing the real control endpoint MPS in between), fetch and apply
    /// its configuration, commit its endpoints, and attach a class driver
    /// to any recognized HID boot interface.
    fn setup_device(&self, port_index: u8) -> Result<()> {
        let op_regs = unsafe { &mut *self.op_regs };
        let port_regs = unsafe { op_regs.port_registers(port_index) };
        let speed = read_ref!(port_regs.port_sc).port_speed();
        let root_hub_port = port_index + 1;

        // Step 1: carve out a device slot.
        let enable_resp = self.command_engine.send_command(
            &self.platform,
            &self.doorbells,
            EnableSlotCommandTRB::new(0, 0).into_trb(),
            self.config.command_timeout_ms,
        )?;
        let slot_id = enable_resp.slot_id();

        // Step 2: allocate host-side state for the slot and point its DCBAA
        // entry at the Output Context the controller will write into.
        let mut device = Device::create(&self.platform, slot_id, root_hub_port, speed, self.context_size)?;
        self.dcbaa.lock().set_slot(slot_id, device.output_ctx_phys());

        // Step 3: ADDRESS_DEVICE(BSR=1) — claim the bus slot without issuing
        // SET_ADDRESS yet, so the default-address control endpoint can be
        // exercised first.
        device.prepare_address_device_input();
        self.command_engine.send_command(
            &self.platform,
            &self.doorbells,
            AddressDeviceCommandTRB::new(device.input_ctx_phys(), slot_id, true, 0).into_trb(),
            self.config.command_timeout_ms,
        )?;

        // Step 4: read just the 8-byte device descriptor prefix at the
        // guessed MPS to learn the real `bMaxPacketSize0`; re-evaluate the
        // control endpoint if the guess was wrong. A full 18-byte read here
        // would short-packet on a Full/Low-speed device whose real MPS is
        // below the guess, leaving the string-descriptor indices unread.
        let guessed_mps = speed.max_control_transfer_initial_packet_size();
        let real_mps = device.fetch_device_descriptor_prefix(
            &self.platform,
            &self.doorbells,
            &self.transfer_completion,
            self.config.transfer_timeout_ms,
        )?;
        if real_mps as u16 != guessed_mps {
            device.refine_control_endpoint_mps(real_mps as u16);
            self.command_engine.send_command(
                &self.platform,
                &self.doorbells,
                EvaluateContextCMDTRB::new(device.input_ctx_phys(), slot_id, 0).into_trb(),
                self.config.command_timeout_ms,
            )?;
        }

        // Step 5: ADDRESS_DEVICE(BSR=0) — the real SET_ADDRESS.
        self.command_engine.send_command(
            &self.platform,
            &self.doorbells,
            AddressDeviceCommandTRB::new(device.input_ctx_phys(), slot_id, false, 0).into_trb(),
            self.config.command_timeout_ms,
        )?;
        device.note_assigned_address();
        device.sync_input_from_output();

        // Step 6: now that the control endpoint's MPS is confirmed correct,
        // fetch the full device descriptor, then learn the device's strings
        // (langid, then product/manufacturer/serial number). Strings are
        // informational only — nothing in the device record depends on
        // them — so a failed or empty string read is logged and otherwise
        // ignored rather than aborting setup.
        let descriptor = device.fetch_device_descriptor(
            &self.platform,
            &self.doorbells,
            &self.transfer_completion,
            self.config.transfer_timeout_ms,
        )?;
        let lang_id = device.fetch_primary_lang_id(&self.platform, &self.doorbells, &self.transfer_completion, self.config.transfer_timeout_ms);
        for (label, index) in [
            ("manufacturer", descriptor.i_manufacturer),
            ("product", descriptor.i_product),
            ("serial number", descriptor.i_serial_number),
        ] {
            if index == 0 {
                continue;
            }
            match device.fetch_string_descriptor(&self.platform, &self.doorbells, &self.transfer_completion, index, lang_id, self.config.transfer_timeout_ms) {
                Ok(value) => log::debug!("slot {slot_id}: {label} = {value}"),
                Err(err) => log::warn!("slot {slot_id}: failed to read {label} string descriptor: {err:?}"),
            }
        }

        // Step 7: fetch and parse the active Configuration descriptor.
        let config_set = device.fetch_configuration_descriptor(
            &self.platform,
            &self.doorbells,
            &self.transfer_completion,
            self.config.transfer_timeout_ms,
        )?;

        // Step 8: SET_CONFIGURATION.
        device.apply_configuration(
            &self.platform,
            &self.doorbells,
            &self.transfer_completion,
            config_set.configuration.b_configuration_value,
            self.config.transfer_timeout_ms,
        )?;

        // Step 9: build interface/endpoint records, marking each endpoint's
        // Add Context flag and Endpoint Context in the Input Context.
        device.configure_interfaces(&self.platform, &config_set)?;

        // Step 10: CONFIGURE_ENDPOINT commits every endpoint added in step 9.
        self.command_engine.send_command(
            &self.platform,
            &self.doorbells,
            ConfigureEndpointCommandTRB::new(device.input_ctx_phys(), slot_id, false, 0).into_trb(),
            self.config.command_timeout_ms,
        )?;

        // Step 11: switch any recognized HID boot interface to boot
        // protocol and ask the embedder whether it wants to attach a
        // driver to it. Only the first such interface is attached — this
        // core targets simple boot keyboards/mice, not composite devices
        // with several HID interfaces needing independent drivers.
        let mut attached: Option<AttachedDriver> = None;
        for (interface_index, interface) in device.interfaces.iter().enumerate() {
            if !is_hid_boot_interface(interface.interface_class, interface.interface_subclass, interface.interface_protocol) {
                continue;
            }

            device.apply_boot_protocol(
                &self.platform,
                &self.doorbells,
                &self.transfer_completion,
                interface.interface_number,
                self.config.transfer_timeout_ms,
            )?;

            if let Some(probe) = self.driver_probe {
                if let Some(driver) = probe(interface.interface_class, interface.interface_subclass, interface.interface_protocol) {
                    attached = Some(AttachedDriver { interface_index, driver });
                }
            }
            break;
        }

        // Step 12: install the device record, then arm the attached
        // driver's endpoints (if any) for their first report.
        self.devices.lock().insert(slot_id, device).map_err(|_| XhciError::OutOfResources)?;

        if let Some(attached) = attached {
            {
                let mut devices = self.devices.lock();
                if let Some(device) = devices.get_mut(slot_id) {
                    if let Some(interface) = device.interfaces.get_mut(attached.interface_index) {
                        self.arm_driver_startup(interface, attached.driver);
                    }
                }
            }
            let _ = self.drivers.lock().insert(slot_id, attached);
        }

        Ok(())
    }

    fn arm_driver_startup(&self, interface: &mut crate::device::Interface, driver: &mut dyn ClassDriver) {
        let doorbells = &self.doorbells;
        let ring_doorbell = |doorbell_id: u8, target: u8| {
            doorbells.lock().ring_doorbell(doorbell_id, target);
        };

        let mut endpoints: HVec<ClassEndpoint<'_>, MAX_ENDPOINTS_PER_INTERFACE> = HVec::new();
        for ep in interface.endpoints.iter_mut() {
            let data_buffer_phys = ep.report_buffer.phys_addr();
            let _ = endpoints.push(ClassEndpoint {
                descriptor: ep.descriptor,
                transfer_ring: &mut ep.transfer_ring,
                data_buffer: unsafe { ep.report_buffer.as_mut_slice() },
                data_buffer_phys,
            });
        }

        driver.on_startup(&mut endpoints, &ring_doorbell);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::IrqHandler;
    use crate::regs::PortSpeed;
    use crate::trb::{
        CmdComplInfo, CmdCompletionStatus, PortStatusChangeInfo, TransferResponseInfo, TransferResponseStatus,
        TRBCommand, TRB, TRB_TYPE_CMD_COMPLETION, TRB_TYPE_PORT_STATUS_CHANGE_EVENT, TRB_TYPE_TRANSFER_EVENT,
    };
    use core::cell::UnsafeCell;
    use core::sync::atomic::{AtomicUsize, Ordering};
    extern crate std;
    use std::boxed::Box;
    use std::thread;
    use std::time::Duration;

    // Byte layout of the synthetic MMIO region below, all relative to the
    // mapped base: CapsReg (reg_length=0x20) puts OperationalRegs at 0x20;
    // runtime/doorbell offsets are chosen clear of the port register window
    // OperationalRegs::port_registers opens at base+0x400 (max_ports == 1,
    // so only one 0x10-byte PortRegisters is ever touched).
    const OP_REGS_OFF: usize = 0x20;
    const RUNTIME_OFF: usize = 0x2000;
    const DOORBELL_OFF: usize = 0x3000;
    const MMIO_SIZE: usize = 0x4000;
    const DMA_SIZE: usize = 64 * 1024;

    const USBCMD_OFF: usize = OP_REGS_OFF;
    const USBSTS_OFF: usize = OP_REGS_OFF + 4;

    fn write_u32(buf: *mut u8, offset: usize, value: u32) {
        unsafe { (buf.add(offset) as *mut u32).write_volatile(value) };
    }

    fn read_u32(buf: *mut u8, offset: usize) -> u32 {
        unsafe { (buf.add(offset) as *const u32).read_volatile() }
    }

    /// A `Platform` backing a hand-laid-out xHC: one buffer stands in for
    /// mapped MMIO, a second (bump-allocated, like `rings::event`'s test
    /// platform) stands in for DMA-capable memory. `sleep_ms` plays the
    /// hardware's part during `reset_host_controller`'s bounded wait,
    /// clearing HCRESET/NOT_READY the way real silicon would between polls.
    struct TestPlatform {
        mmio: UnsafeCell<Box<[u8; MMIO_SIZE]>>,
        dma: UnsafeCell<Box<[u8; DMA_SIZE]>>,
        dma_offset: AtomicUsize,
        qemu: bool,
    }
    unsafe impl Sync for TestPlatform {}

    impl TestPlatform {
        fn new() -> Self {
            let mut mmio = Box::new([0u8; MMIO_SIZE]);
            let base = mmio.as_mut_ptr();

            // CapsReg: reg_length=0x20, version=0, hcsparams_1 (1 slot, 1
            // interrupter, 1 port), hcsparams_2=0 (no scratchpad buffers),
            // hccparams_1=0 (32-byte contexts, no extended capabilities).
            unsafe { *base.add(0) = 0x20 };
            write_u32(base, 4, 0x0100_0101);
            write_u32(base, 8, 0);
            write_u32(base, 12, 0);
            write_u32(base, 16, 0);
            write_u32(base, 20, DOORBELL_OFF as u32);
            write_u32(base, 24, RUNTIME_OFF as u32);
            write_u32(base, 28, 0);

            Self {
                mmio: UnsafeCell::new(mmio),
                dma: UnsafeCell::new(Box::new([0u8; DMA_SIZE])),
                dma_offset: AtomicUsize::new(0),
                qemu: false,
            }
        }

        fn mmio_base(&self) -> *mut u8 {
            unsafe { (*self.mmio.get()).as_mut_ptr() }
        }

        fn port_sc_offset(port_index: u8) -> usize {
            OP_REGS_OFF + 0x400 + 0x10 * port_index as usize
        }

        fn set_port_connected(&self, port_index: u8) {
            // CCS (bit 0) | CSC (bit 17) | PP (bit 9), Port Speed = High in
            // bits 10..13.
            let value = (1 << 0) | (1 << 9) | ((PortSpeed::High.into_bits() as u32) << 10) | (1 << 17);
            write_u32(self.mmio_base(), Self::port_sc_offset(port_index), value);
        }

        /// Like `set_port_connected`, but with CCS left at '0': the PORTSC a
        /// disconnect event's handler would read.
        fn set_port_disconnect_change(&self, port_index: u8) {
            let value = (1 << 9) | ((PortSpeed::High.into_bits() as u32) << 10) | (1 << 17);
            write_u32(self.mmio_base(), Self::port_sc_offset(port_index), value);
        }
    }

    impl Platform for TestPlatform {
        fn map_mmio(&self, _bar_pa: PhysAddr, size: usize) -> VirtAddr {
            assert!(size <= MMIO_SIZE);
            VirtAddr::from_ptr(self.mmio_base())
        }
        fn alloc_dma(&self, size: usize, align: usize, _boundary: usize) -> Option<VirtAddr> {
            let base = unsafe { (*self.dma.get()).as_mut_ptr() } as usize;
            let offset = self.dma_offset.load(Ordering::SeqCst);
            let aligned = offset.next_multiple_of(align.max(1));
            assert!(aligned + size <= DMA_SIZE, "synthetic DMA arena exhausted");
            self.dma_offset.store(aligned + size, Ordering::SeqCst);
            Some(VirtAddr::from_ptr((base + aligned) as *mut u8))
        }
        fn free_dma(&self, _vaddr: VirtAddr, _size: usize) {}
        fn virt_to_phys(&self, vaddr: VirtAddr) -> PhysAddr {
            PhysAddr::from(vaddr.into_raw())
        }
        fn mark_uncacheable(&self, _vaddr: VirtAddr, _size: usize) {}
        fn register_irq(&self, _vector: u32, _handler: IrqHandler, _ctx: *mut ()) {}
        fn sleep_ms(&self, ms: u32) {
            let base = self.mmio_base();
            let usbcmd = read_u32(base, USBCMD_OFF);
            if usbcmd & USBCmd::HCRESET.bits() != 0 {
                write_u32(base, USBCMD_OFF, usbcmd & !USBCmd::HCRESET.bits());
                let usbsts = read_u32(base, USBSTS_OFF);
                write_u32(base, USBSTS_OFF, usbsts & !USBSts::NOT_READY.bits());
            }
            thread::sleep(Duration::from_micros(ms as u64 * 50));
        }
        fn sleep_us(&self, _us: u32) {}
        fn is_qemu(&self) -> bool {
            self.qemu
        }
    }

    fn new_controller() -> Controller<TestPlatform> {
        Controller::new(TestPlatform::new(), PhysAddr::from(0usize), MMIO_SIZE, XhciConfig::default())
            .expect("synthetic controller bring-up")
    }

    #[test]
    fn new_resets_and_programs_operational_registers() {
        let controller = new_controller();

        let op_regs = unsafe { &*controller.op_regs };
        let usbcmd = read_ref!(op_regs.usbcmd);
        assert!(!usbcmd.contains(USBCmd::HCRESET));

        assert_eq!(read_ref!(op_regs.dcbaap), controller.dcbaa.lock().phys_addr());
        assert_eq!(read_ref!(op_regs.config), controller.max_device_slots as u32);

        let crcr = read_ref!(op_regs.crcr);
        assert_eq!(crcr & 0x1, controller.command_engine.ring_current_cycle() as usize);
        assert_eq!(crcr & !0xF, controller.command_engine.ring_base_phys_addr().into_raw());
    }

    #[test]
    fn new_enables_the_interrupter() {
        let controller = new_controller();
        let interrupter = unsafe { &*(&mut *controller.runtime_regs).interrupter_ptr(0) };
        assert!(read_ref!(interrupter.iman).contains(XHCIIman::INTERRUPT_ENABLE));
    }

    #[test]
    fn start_sets_run_and_flushes_already_connected_ports() {
        let platform = TestPlatform::new();
        platform.set_port_connected(0);
        let controller = Controller::new(platform, PhysAddr::from(0usize), MMIO_SIZE, XhciConfig::default()).unwrap();
        let controller: &'static Controller<TestPlatform> = Box::leak(Box::new(controller));

        controller.start(32).unwrap();

        let op_regs = unsafe { &*controller.op_regs };
        let usbcmd = read_ref!(op_regs.usbcmd);
        assert!(usbcmd.contains(USBCmd::RUN));
        assert!(usbcmd.contains(USBCmd::INTERRUPT_ENABLE));

        // `start`'s initial flush queues the port that was already connected
        // before this driver attached, mirroring a cold-boot firmware handoff.
        assert_eq!(controller.port_queue.lock().len(), 1);
        assert_eq!(controller.port_queue.lock()[0].port_index, 0);
    }

    fn fake_cmd_completion(cycle: u8, slot_id: u8) -> TRB {
        let status = CmdCompletionStatus::new().with_completion_code(CompletionStatusCode::Success.into_bits());
        let cmd = CmdComplInfo::new()
            .with_cycle_bit(cycle)
            .with_trb_type(TRB_TYPE_CMD_COMPLETION)
            .with_slot_id(slot_id)
            .into_bits();
        TRB {
            parameter: 0,
            status: status.into_bits(),
            cmd: TRBCommand::from_bits(cmd),
        }
    }

    fn fake_transfer_event(cycle: u8, slot_id: u8, dci: u8) -> TRB {
        let status = TransferResponseInfo::new().with_completion_code(CompletionStatusCode::Success.into_bits());
        let cmd = TransferResponseStatus::new()
            .with_cycle_bit(cycle)
            .with_trb_type(TRB_TYPE_TRANSFER_EVENT)
            .with_endpoint_id(dci)
            .with_slot_id(slot_id)
            .into_bits();
        TRB {
            parameter: 0,
            status: status.into_bits(),
            cmd: TRBCommand::from_bits(cmd),
        }
    }

    fn fake_stall_transfer_event(cycle: u8, slot_id: u8, dci: u8) -> TRB {
        let status = TransferResponseInfo::new().with_completion_code(CompletionStatusCode::StallError.into_bits());
        let cmd = TransferResponseStatus::new()
            .with_cycle_bit(cycle)
            .with_trb_type(TRB_TYPE_TRANSFER_EVENT)
            .with_endpoint_id(dci)
            .with_slot_id(slot_id)
            .into_bits();
        TRB {
            parameter: 0,
            status: status.into_bits(),
            cmd: TRBCommand::from_bits(cmd),
        }
    }

    fn fake_port_status_change_event(cycle: u8, port_index: u8) -> TRB {
        let cmd = PortStatusChangeInfo::new()
            .with_cycle_bit(cycle)
            .with_trb_type(TRB_TYPE_PORT_STATUS_CHANGE_EVENT)
            .into_bits();
        TRB {
            parameter: (port_index as u64 + 1) << 24,
            status: 0,
            cmd: TRBCommand::from_bits(cmd),
        }
    }

    #[test]
    fn endpoint_address_from_dci_round_trips_number_and_direction() {
        assert_eq!(endpoint_address_from_dci(2), 0x01); // EP1 OUT
        assert_eq!(endpoint_address_from_dci(3), 0x81); // EP1 IN
        assert_eq!(endpoint_address_from_dci(4), 0x02); // EP2 OUT
        assert_eq!(endpoint_address_from_dci(7), 0x83); // EP3 IN
    }

    #[test]
    fn handle_interrupt_queues_stall_recovery_for_non_control_endpoint() {
        let controller: &'static Controller<TestPlatform> = Box::leak(Box::new(new_controller()));

        {
            let mut event_ring = controller.event_ring.lock();
            event_ring.write_trb_for_test(0, fake_stall_transfer_event(1, 2, 3));
        }
        controller.handle_interrupt();

        let queued = controller.stall_queue.lock();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].slot_id, 2);
        assert_eq!(queued[0].dci, 3);
    }

    #[test]
    fn handle_interrupt_does_not_queue_stall_recovery_for_control_endpoint() {
        let controller: &'static Controller<TestPlatform> = Box::leak(Box::new(new_controller()));

        {
            let mut event_ring = controller.event_ring.lock();
            event_ring.write_trb_for_test(0, fake_stall_transfer_event(1, 2, 1));
        }
        controller.handle_interrupt();

        assert!(controller.stall_queue.lock().is_empty());
    }

    #[test]
    fn handle_interrupt_routes_command_completion_to_command_engine() {
        let controller: &'static Controller<TestPlatform> = Box::leak(Box::new(new_controller()));

        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(5));
            {
                let mut event_ring = controller.event_ring.lock();
                event_ring.write_trb_for_test(0, fake_cmd_completion(1, 7));
            }
            controller.handle_interrupt();
        });

        let result = controller.command_engine.send_command(
            &controller.platform,
            &controller.doorbells,
            EnableSlotCommandTRB::new(0, 0).into_trb(),
            500,
        );
        sender.join().unwrap();
        assert_eq!(result.unwrap().slot_id(), 7);
    }

    #[test]
    fn handle_interrupt_routes_transfer_event_to_transfer_completion() {
        let controller: &'static Controller<TestPlatform> = Box::leak(Box::new(new_controller()));

        let waiter = thread::spawn(move || controller.transfer_completion.wait(&controller.platform, 500));

        thread::sleep(Duration::from_millis(5));
        {
            let mut event_ring = controller.event_ring.lock();
            event_ring.write_trb_for_test(0, fake_transfer_event(1, 3, 1));
        }
        controller.handle_interrupt();

        let result = waiter.join().unwrap();
        assert_eq!(result.unwrap().slot_id(), 3);
    }

    #[test]
    fn handle_interrupt_acknowledges_both_eint_and_iman_interrupt_pending() {
        let controller: &'static Controller<TestPlatform> = Box::leak(Box::new(new_controller()));

        {
            let mut event_ring = controller.event_ring.lock();
            event_ring.write_trb_for_test(0, fake_cmd_completion(1, 1));
        }
        controller.handle_interrupt();

        // The synthetic register backing here is a plain memory cell, not
        // real RW1C hardware, so this can only confirm both acknowledgement
        // writes land, not their relative order — `handle_interrupt`'s own
        // doc comment records why EINT is written first.
        let op_regs = unsafe { &*controller.op_regs };
        assert!(read_ref!(op_regs.usbstatus).contains(USBSts::EINT));

        let interrupter = unsafe { &*(&mut *controller.runtime_regs).interrupter_ptr(0) };
        assert!(read_ref!(interrupter.iman).contains(XHCIIman::INTERRUPT_PENDING));
    }

    #[test]
    fn handle_interrupt_queues_connect_and_clears_connect_status_change() {
        let controller: &'static Controller<TestPlatform> = Box::leak(Box::new(new_controller()));
        controller.platform.set_port_connected(0);
        {
            let mut event_ring = controller.event_ring.lock();
            event_ring.write_trb_for_test(0, fake_port_status_change_event(1, 0));
        }

        controller.handle_interrupt();

        let queue = controller.port_queue.lock();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].port_index, 0);
        assert!(!queue[0].disconnected);
        drop(queue);

        let op_regs = unsafe { &mut *controller.op_regs };
        let port_regs = unsafe { op_regs.port_registers(0) };
        assert!(!read_ref!(port_regs.port_sc).csc());
    }

    #[test]
    fn handle_interrupt_queues_disconnect_when_ccs_clear() {
        let controller: &'static Controller<TestPlatform> = Box::leak(Box::new(new_controller()));
        controller.platform.set_port_disconnect_change(0);
        {
            let mut event_ring = controller.event_ring.lock();
            event_ring.write_trb_for_test(0, fake_port_status_change_event(1, 0));
        }

        controller.handle_interrupt();

        let queue = controller.port_queue.lock();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].port_index, 0);
        assert!(queue[0].disconnected);
    }

    #[test]
    fn handle_interrupt_ignores_port_event_without_connect_status_change() {
        let controller: &'static Controller<TestPlatform> = Box::leak(Box::new(new_controller()));
        {
            let mut event_ring = controller.event_ring.lock();
            event_ring.write_trb_for_test(0, fake_port_status_change_event(1, 0));
        }

        controller.handle_interrupt();

        assert!(controller.port_queue.lock().is_empty());
    }
}
