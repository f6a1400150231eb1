//! Typed, volatile views over Capability/Operational/Runtime/Doorbell/Port
//! registers.
//!
//! Grounded on `crates/kernel/src/drivers/xhci/regs.rs` (the richest single
//! file in the teacher for this layer) — kept its `bitflags!`/
//! `#[bitfield(u32)]` style, its `reset_port` bounded-wait sequence, and its
//! `XHCIDoorbellManager` shape almost verbatim, generalized to take a
//! [`Platform`]-supplied base pointer instead of a PCI-BAR-derived one.
//! Ownership of DCBAA/scratchpad DMA allocations and the controller-level
//! reset/start/reconfigure sequence moved to [`crate::controller`] — this
//! module stays pure typed register views.

use bitfield_struct::bitfield;
use bitflags::bitflags;
use core::fmt::Display;

use crate::addr::{PhysAddr, VirtAddr};
use crate::platform::Platform;
use crate::{read_ref, wait::poll_ms, write_ref};

#[repr(C)]
pub struct CapsReg {
    reg_length: u8,
    _reserved0: u8,
    version_number: u8,
    hcsparams_1: u32,
    hcsparams_2: u32,
    hcsparams_3: u32,
    hccparams_1: u32,
    doorbell_off: u32,
    runtime_off: u32,
    hccparams_2: u32,
}

impl CapsReg {
    pub fn operational_regs_ptr(&self) -> *mut OperationalRegs {
        let caps_ptr = self as *const _ as *const u8;
        unsafe { caps_ptr.add(self.reg_length as usize) as *mut OperationalRegs }
    }

    pub fn runtime_regs_ptr(&self) -> *mut RuntimeRegs {
        let caps_ptr = self as *const _ as *const u8;
        unsafe { caps_ptr.add(self.runtime_off as usize) as *mut RuntimeRegs }
    }

    pub fn doorbells_base(&self) -> VirtAddr {
        let caps_ptr = self as *const _ as *const u8;
        let ptr = unsafe { caps_ptr.add(self.doorbell_off as usize) };
        VirtAddr::from_ptr(ptr)
    }

    pub const fn max_device_slots(&self) -> usize {
        (self.hcsparams_1 & 0xFF) as usize
    }
    pub const fn max_interrupts(&self) -> u8 {
        (self.hcsparams_1 >> 8) as u8
    }
    pub const fn max_ports(&self) -> u8 {
        (self.hcsparams_1 >> 24) as u8
    }
    pub const fn interrupt_schd_t(&self) -> u8 {
        (self.hcsparams_2 as u8) & 0xF
    }
    pub const fn erst_max(&self) -> u8 {
        ((self.hcsparams_2 >> 4) as u8) & 0xF
    }
    pub const fn max_scratchpad_buffers(&self) -> usize {
        (((self.hcsparams_2 >> 21) as u8) & 0x1F) as usize
    }
    pub const fn addressing_64bits(&self) -> bool {
        (self.hccparams_1 & 0x1) != 0
    }
    pub const fn bandwidth_negotiation(&self) -> bool {
        ((self.hccparams_1 >> 1) & 0x1) != 0
    }
    pub const fn context_sz_64bytes(&self) -> bool {
        ((self.hccparams_1 >> 2) & 0x1) != 0
    }
    pub const fn port_power_ctrl(&self) -> bool {
        ((self.hccparams_1 >> 3) & 0x1) != 0
    }
    pub const fn port_indicator_ctrl(&self) -> bool {
        ((self.hccparams_1 >> 4) & 0x1) != 0
    }
    pub const fn light_reset_support(&self) -> bool {
        ((self.hccparams_1 >> 5) & 0x1) != 0
    }

    /// Dword offset (from the capability register base) of the first
    /// extended capability entry, or `None` if there isn't one.
    pub const fn ext_caps_offset(&self) -> Option<u32> {
        let off = self.hccparams_1 >> 16;
        if off == 0 { None } else { Some(off) }
    }
}

impl Display for CapsReg {
    #[rustfmt::skip]
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "XHCI Capability Registers @{:?}:", VirtAddr::from_ptr(self as *const _))?;
        writeln!(f, "\tLength                            : {:#x}", self.reg_length)?;
        writeln!(f, "\tMax Device Slots                  : {}", self.max_device_slots())?;
        writeln!(f, "\tMax Interrupts                    : {}", self.max_interrupts())?;
        writeln!(f, "\tMax Ports                         : {}", self.max_ports())?;
        writeln!(f, "\tIST                               : {}", self.interrupt_schd_t())?;
        writeln!(f, "\tERST Max Size                     : {}", self.erst_max())?;
        writeln!(f, "\tScratchpad Buffers                : {}", self.max_scratchpad_buffers())?;
        writeln!(f, "\t64-bit Addressing                 : {}", self.addressing_64bits())?;
        writeln!(f, "\tBandwidth Negotiation Implemented : {}", self.bandwidth_negotiation())?;
        writeln!(f, "\t64-byte Context Size              : {}", self.context_sz_64bytes())?;
        writeln!(f, "\tPort Power Control                : {}", self.port_power_ctrl())?;
        writeln!(f, "\tPort Indicators Control           : {}", self.port_indicator_ctrl())?;
        write!(f,   "\tLight Reset Available             : {}", self.light_reset_support())
    }
}

bitflags! {
    #[repr(C)]
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct USBCmd: u32 {
        /// Run/Stop (R/S) — RW. xHci Spec §5.4.1 (USBCMD). Default '0'.
        /// While set the xHC executes its schedule; clearing it halts the
        /// controller once pending transactions complete. Software shall not
        /// set this unless HCHalted is '1', and shall not clear Run/Stop on a
        /// running controller with a full Event Ring (may drop events).
        const RUN = 1 << 0;
        /// Host Controller Reset (HCRST) — RW. xHci Spec §5.4.1. Writing '1'
        /// resets internal pipelines/timers/state machines to their initial
        /// values; cleared by hardware when the reset completes. Software
        /// shall not write this while the controller is running (HCH='0').
        const HCRESET = 1 << 1;
        /// Interrupter Enable (INTE) — RW. xHci Spec §5.4.1. Gates whether
        /// Interrupters may raise host system interrupts at all.
        const INTERRUPT_ENABLE = 1 << 2;
        /// Host System Error Enable (HSEE) — RW. xHci Spec §5.4.1. Gates
        /// whether a Host System Error asserts SERR# (or platform
        /// equivalent); harmless to leave set even when the platform has no
        /// such signal wired up.
        const HSEE = 1 << 3;
    }

    #[repr(C)]
    #[derive(Debug, Clone, Copy, Eq, PartialEq)]
    pub struct USBSts: u32 {
        /// HCHalted (HCH) — RO. xHci Spec §5.4.2. '1' once the xHC has
        /// finished stopping after RUN was cleared (by software or by an
        /// internal error).
        const HCHALTED = 1 << 0;
        /// Event Interrupt (EINT) — RW1C. xHci Spec §5.4.2. Set whenever any
        /// Interrupter's IP bit transitions 0->1. Clear EINT before clearing
        /// IP to avoid racing a fresh IP transition.
        const EINT = 1 << 3;
        /// Controller Not Ready (CNR) — RO. xHci Spec §5.4.2. Software shall
        /// not write any Doorbell or Operational register (other than
        /// USBSTS) while this is set.
        const NOT_READY = 1 << 11;
        /// Host Controller Error (HCE) — RO. xHci Spec §5.4.2. Set on an
        /// internal error condition requiring a full reset/reinit.
        const HCERROR = 1 << 12;
    }
}

#[repr(C)]
pub struct OperationalRegs {
    pub usbcmd: USBCmd,
    pub usbstatus: USBSts,
    page_size: u32,
    _reserved0: [u32; 2],
    pub dnctrl: u32,
    pub crcr: usize,
    _reserved1: [u32; 4],
    pub dcbaap: PhysAddr,
    pub config: u32,
    _reserved2: [u32; 49],
}

impl Display for OperationalRegs {
    #[rustfmt::skip]
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(f, "XHCI Operational Registers @{:?}:", VirtAddr::from_ptr(self as *const _))?;
        writeln!(f, "\tusbcmd    : {:?}", self.usbcmd)?;
        writeln!(f, "\tusbstatus : {:?}", self.usbstatus)?;
        writeln!(f, "\tPage Size : {:#x}", self.page_size)?;
        writeln!(f, "\tdnctrl    : {:#x}", self.dnctrl)?;
        writeln!(f, "\tcrcr      : {:#x}", self.crcr)?;
        writeln!(f, "\tdcbaap    : {:?}", self.dcbaap)?;
        write!(f,   "\tconfig    : {:#x}", self.config)
    }
}

impl OperationalRegs {
    pub unsafe fn port_registers(&mut self, port_index: u8) -> &'static mut PortRegisters {
        let ptr = self as *mut Self;
        unsafe {
            let port_reg_ptr =
                ptr.byte_add(0x400usize + (size_of::<PortRegisters>() * port_index as usize))
                    as *mut PortRegisters;
            &mut *port_reg_ptr
        }
    }

    /// Resets a port at `port_index`, driving a warm reset for USB3 ports
    /// and a standard reset for USB2 ports. Returns whether the port ended
    /// up enabled (PED=1); a `false` return is not necessarily fatal — it
    /// can happen after a disconnect with nothing currently attached.
    pub unsafe fn reset_port<P: Platform + ?Sized>(
        &mut self,
        platform: &P,
        is_usb3: bool,
        port_index: u8,
    ) -> bool {
        let port_regs = unsafe { self.port_registers(port_index) };
        let mut port_sc = read_ref!(port_regs.port_sc);

        if !port_sc.pp() {
            write_ref!(port_regs.port_sc, port_sc.with_pp(true));
            platform.sleep_ms(20);

            port_sc = read_ref!(port_regs.port_sc);
            if !port_sc.pp() {
                log::warn!("xHCI port {port_index} didn't power up, stopping reset");
                return false;
            }
        }

        // Clear any lingering status change bits before initiating the reset.
        port_sc = read_ref!(port_regs.port_sc)
            .with_csc(true)
            .with_pec(true)
            .with_prc(true);
        write_ref!(port_regs.port_sc, port_sc);
        port_sc = read_ref!(port_regs.port_sc);

        if is_usb3 {
            port_sc.set_wpr(true);
        } else {
            port_sc.set_pr(true);
        }
        write_ref!(port_regs.port_sc, port_sc);

        let reset_done = poll_ms(platform, 100, 1, || {
            let sc = read_ref!(port_regs.port_sc);
            (!is_usb3 && sc.prc()) || (is_usb3 && sc.wrc())
        });
        if !reset_done {
            log::warn!("xHCI port {port_index}: reset timeout after 100ms");
            return false;
        }

        platform.sleep_ms(5);

        port_sc = read_ref!(port_regs.port_sc)
            .with_prc(true)
            .with_wrc(true)
            .with_csc(true)
            .with_pec(true)
            .with_ped(false);
        write_ref!(port_regs.port_sc, port_sc);

        platform.sleep_ms(5);

        port_sc = read_ref!(port_regs.port_sc);
        if !port_sc.ped() {
            log::warn!(
                "xHCI attempted port {port_index} reset, port didn't enable, is_usb3={is_usb3}"
            );
            false
        } else {
            true
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PortSpeed {
    Undefined = 0,
    /// 12 MB/s USB 2.0
    Full = 1,
    /// 1.5 Mb/s USB 2.0
    Low = 2,
    /// 480 Mb/s USB 2.0
    High = 3,
    /// 5 Gb/s (Gen1 x1) USB 3.0
    Super = 4,
    /// 10 Gb/s (Gen2 x1) USB 3.1
    SuperPlus = 5,
}

impl PortSpeed {
    pub const fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Self::Full,
            2 => Self::Low,
            3 => Self::High,
            4 => Self::Super,
            5 => Self::SuperPlus,
            _ => Self::Undefined,
        }
    }

    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    pub const fn is_usb3(self) -> bool {
        matches!(self, Self::Super | Self::SuperPlus)
    }

    /// Max initial packet size (MPS) to guess for the control endpoint's
    /// first ADDRESS_DEVICE(BSR=1) before the device's own descriptor is read.
    pub const fn max_control_transfer_initial_packet_size(&self) -> u16 {
        match self {
            Self::Low => 8,
            Self::Full | Self::High => 64,
            Self::Super | Self::SuperPlus => 512,
            Self::Undefined => 0,
        }
    }
}

/// Port Status & Control register.
#[bitfield(u32)]
pub struct PortSCReg {
    /// Current Connect Status (CCS) – ROS. '1' = a device is connected.
    /// Reflects current state, not necessarily the event that set CSC.
    pub ccs: bool,
    /// Port Enabled/Disabled (PED) – RW1CS. Only the xHC can set this to
    /// '1'; software may clear it to '0'. '0' whenever PP is '0'.
    ped: bool,
    #[bits(2)]
    __: (),
    /// Port Reset (PR) – RW1S. A 0->1 transition starts the bus reset
    /// (USB2) or Hot Reset (USB3) sequence; remains set until complete.
    pr: bool,
    #[bits(4)]
    __: (),
    /// Port Power (PP) – RWS. Default '1'. '0' = port powered off and
    /// non-functional (no attach/detach/PLS reporting, still reports
    /// over-current if PPC='0').
    pp: bool,
    #[bits(4)]
    /// Speed (Port Speed) – ROS. Only meaningful when CCS='1'.
    pub port_speed: PortSpeed,
    #[bits(3)]
    __: (),
    /// Connect Status Change (CSC) – RW1CS. Set on any CCS/CAS transition
    /// not caused by software clearing PP or setting WPR. Write 1 to clear.
    pub csc: bool,
    /// Port Enabled/Disabled Change (PEC) – RW1CS. USB3 ports never set
    /// this. Write 1 to clear.
    pec: bool,
    /// Warm Port Reset Change (WRC) – RW1CS/RsvdZ. USB3-only; set when Warm
    /// Reset processing completes. Write 1 to clear.
    wrc: bool,
    #[bits(1)]
    __: (),
    /// Port Reset Change (PRC) – RW1CS. Set on a PR 1->0 transition (reset
    /// complete). Write 1 to clear.
    prc: bool,
    #[bits(9)]
    __: (),
    /// Warm Port Reset (WPR) – RW1S/RsvdZ. USB3-only. Writing 1 starts a
    /// Warm Reset and sets PR; always reads back 0.
    wpr: bool,
}

impl PortSCReg {
    /// Write-1-to-clear value for the Connect/Enable/Reset status-change
    /// bits (CSC/PEC/PRC), to be written back after observing a
    /// `PORT_STATUS_CHANGE_EVENT`. Explicitly forces PED to '0' rather than
    /// carrying through whatever `self` read as: PED is itself RW1CS, so
    /// writing back a `1` read off an enabled port would disable it, while
    /// writing `0` is a no-op for that field.
    pub const fn ack_connect_status_change(self) -> Self {
        self.with_csc(true).with_pec(true).with_prc(true).with_ped(false)
    }
}

#[derive(Debug)]
#[repr(C)]
pub struct PortRegisters {
    pub port_sc: PortSCReg,
    port_pmsc: u32,
    port_li: u32,
    __: u32,
}

const _: () = assert!(size_of::<PortRegisters>() == 0x10);

bitflags! {
    #[derive(Debug, Clone, Copy)]
    pub struct XHCIIman: u32 {
        /// Interrupt Pending (IP) – RW1C. '1' = interrupt pending for this
        /// Interrupter. xHci Spec §5.5.2.1.
        const INTERRUPT_PENDING = 1 << 0;
        const INTERRUPT_ENABLE = 1 << 1;
    }
}

#[bitfield(u64)]
pub struct EventRingDequePtr {
    #[bits(3)]
    pub erst_segment_index: usize,
    #[bits(1)]
    pub handler_busy: bool,
    #[bits(60)]
    pub ptr: u64,
}

impl EventRingDequePtr {
    pub const fn from_addr(addr: PhysAddr) -> Self {
        Self::from_bits(addr.into_raw() as u64)
    }

    pub const fn with_addr(self, addr: PhysAddr) -> Self {
        let bits = self.into_bits();
        Self::from_bits(bits | addr.into_raw() as u64)
    }
}

#[derive(Debug)]
#[repr(C)]
pub struct InterrupterRegs {
    pub iman: XHCIIman,
    imod: u32,
    pub erst_sz: u32,
    __: u32,
    pub erst_base: PhysAddr,
    pub event_ring_deque: EventRingDequePtr,
}

#[repr(C)]
pub struct RuntimeRegs {
    mf_index: u32,
    __: [u32; 7],
    interrupter_registers: [InterrupterRegs; 1024],
}

impl RuntimeRegs {
    pub fn interrupter_ptr(&mut self, index: usize) -> *mut InterrupterRegs {
        &raw mut self.interrupter_registers[index]
    }
}

#[bitfield(u32)]
pub struct DoorbellReg {
    db_target: u8,
    __: u8,
    db_stream_id: u16,
}

#[derive(Debug)]
pub struct XHCIDoorbellManager<'a> {
    doorbells: &'a mut [DoorbellReg],
}

impl<'a> XHCIDoorbellManager<'a> {
    /// # Safety
    /// `base` must be a valid, mapped pointer to at least `max_device_slots`
    /// doorbell registers for the lifetime of the returned manager.
    pub unsafe fn new(base: VirtAddr, max_device_slots: usize) -> Self {
        let doorbells_ptr = base.into_ptr::<DoorbellReg>();
        let doorbells = unsafe { core::slice::from_raw_parts_mut(doorbells_ptr, max_device_slots) };
        Self { doorbells }
    }

    pub fn ring_doorbell(&mut self, doorbell: u8, target: u8) {
        let doorbell_reg = &mut self.doorbells[doorbell as usize];
        unsafe {
            (doorbell_reg as *mut DoorbellReg).write_volatile(doorbell_reg.with_db_target(target));
        }
    }

    pub fn ring_command_doorbell(&mut self) {
        self.ring_doorbell(0, 0);
    }

    pub fn ring_control_endpoint_doorbell(&mut self, slot_id: u8) {
        self.ring_doorbell(slot_id, 1);
    }

    pub fn ring_endpoint_doorbell(&mut self, slot_id: u8, dci: u8) {
        self.ring_doorbell(slot_id, dci);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn portsc_change_bits_roundtrip() {
        let sc = PortSCReg::new().with_csc(true).with_pec(false);
        assert!(sc.csc());
        assert!(!sc.pec());
    }

    #[test]
    fn port_speed_bits_roundtrip() {
        for raw in 0..=5u8 {
            let speed = PortSpeed::from_bits(raw);
            assert_eq!(speed.into_bits(), raw);
        }
        assert_eq!(PortSpeed::from_bits(7), PortSpeed::Undefined);
    }

    #[test]
    fn event_ring_deque_ptr_masks_reserved_bits() {
        let addr = PhysAddr::from(0xDEAD_BEE0);
        let ptr = EventRingDequePtr::new().with_addr(addr).with_handler_busy(true);
        assert!(ptr.handler_busy());
    }
}
