//! Command Ring submission and single-slot completion waiting, plus the
//! analogous machinery for control-endpoint transfers.
//!
//! Grounded on `crates/kernel/src/drivers/xhci/mod.rs`'s `XHCIResponseQueue`
//! (`send_command`/`wait_for_command_response`): a requester-side mutex
//! serializing one submit-and-wait at a time, paired with a single
//! completion slot the event-dispatch path writes into. The teacher panics
//! (`"XHCI: timed out waiting for command response"`) after a fixed 200ms
//! poll; this crate has no panic-on-timeout luxury, so both engines here
//! return `XhciError::CommandTimeout`/`TransferTimeout` instead of a panic.

use crate::addr::PhysAddr;
use crate::error::{Result, XhciError};
use crate::locks::Mutex;
use crate::platform::Platform;
use crate::regs::XHCIDoorbellManager;
use crate::rings::command::XHCICommandRing;
use crate::rings::transfer::XHCITransferRing;
use crate::trb::{
    CmdResponseTRB, CompletionStatusCode, DataStageTRB, SetupStageTRB, StatusStageTRB,
    TransferResponseTRB, XHCIDeviceRequestPacket, TRB,
};
use crate::wait::poll_ms;

/// Serializes Command Ring submission and owns the single in-flight
/// completion slot — the "command mutex" naming the whole controller's
/// single Command Ring: at most one command can be outstanding at a time,
/// so one completion slot suffices.
pub struct CommandEngine {
    requester: Mutex<()>,
    ring: Mutex<XHCICommandRing>,
    completion: Mutex<Option<CmdResponseTRB>>,
}

impl CommandEngine {
    pub const fn new(ring: XHCICommandRing) -> Self {
        Self {
            requester: Mutex::new(()),
            ring: Mutex::new(ring),
            completion: Mutex::new(None),
        }
    }

    pub fn ring_base_phys_addr(&self) -> PhysAddr {
        self.ring.lock().base_phys_addr()
    }

    pub fn ring_current_cycle(&self) -> u8 {
        self.ring.lock().current_ring_cycle()
    }

    /// Called from the event-dispatch path with every Command Completion
    /// Event drained off the Event Ring. Harmless if nothing is currently
    /// waiting — a stray completion (e.g. for an aborted command) is simply
    /// overwritten by the next one.
    pub fn on_command_completion(&self, response: CmdResponseTRB) {
        *self.completion.lock() = Some(response);
    }

    /// Enqueues `trb`, rings the command doorbell, and polls until either a
    /// completion event arrives or `timeout_ms` elapses. Holds the
    /// requester lock for the whole call, so a second caller blocks here
    /// rather than racing this one's completion slot — the command mutex
    /// covers submission and the wait together, not just the enqueue.
    pub fn send_command<P: Platform + ?Sized>(
        &self,
        platform: &P,
        doorbells: &Mutex<XHCIDoorbellManager<'_>>,
        trb: TRB,
        timeout_ms: u32,
    ) -> Result<CmdResponseTRB> {
        let _requester = self.requester.lock();
        let trb_type = trb.cmd.trb_type();
        *self.completion.lock() = None;

        self.ring.lock().enqueue(trb);
        doorbells.lock().ring_command_doorbell();

        let arrived = poll_ms(platform, timeout_ms, 1, || self.completion.lock().is_some());
        let response = self.completion.lock().take();

        match (arrived, response) {
            (true, Some(resp)) if resp.completion_code().is_success() => Ok(resp),
            (true, Some(resp)) => Err(XhciError::CommandFailed {
                completion_code: resp.completion_code(),
            }),
            _ => Err(XhciError::CommandTimeout { trb_type }),
        }
    }
}

/// Single-slot completion tracker for control-endpoint transfers. Bulk and
/// interrupt endpoints hand their Transfer Events straight to the owning
/// class driver's `on_event` instead (`crate::class`); this tracker exists
/// only for the synchronous control transfers device setup drives directly
/// (GET_DESCRIPTOR, SET_CONFIGURATION, SET_PROTOCOL, ...).
pub struct TransferCompletion {
    completion: Mutex<Option<TransferResponseTRB>>,
}

impl TransferCompletion {
    pub const fn new() -> Self {
        Self {
            completion: Mutex::new(None),
        }
    }

    pub fn on_transfer_event(&self, response: TransferResponseTRB) {
        *self.completion.lock() = Some(response);
    }

    /// Polls until the next Transfer Event arrives or `timeout_ms` elapses.
    /// A short packet is a successful completion here — control transfers
    /// routinely request more bytes than a descriptor actually carries.
    pub fn wait<P: Platform + ?Sized>(
        &self,
        platform: &P,
        timeout_ms: u32,
    ) -> Result<TransferResponseTRB> {
        *self.completion.lock() = None;
        let arrived = poll_ms(platform, timeout_ms, 1, || self.completion.lock().is_some());
        let response = self.completion.lock().take();

        match (arrived, response) {
            (true, Some(resp))
                if resp.completion_code().is_success()
                    || resp.completion_code() == CompletionStatusCode::ShortPacket =>
            {
                Ok(resp)
            }
            (true, Some(resp)) => Err(XhciError::TransferFailed {
                completion_code: resp.completion_code(),
            }),
            _ => Err(XhciError::TransferTimeout),
        }
    }
}

impl Default for TransferCompletion {
    fn default() -> Self {
        Self::new()
    }
}

/// Optional Data Stage for [`start_control_transfer`]: physical address,
/// transfer length, and direction (`true` = device-to-host / IN).
pub type ControlTransferData = Option<(PhysAddr, u32, bool)>;

/// Enqueues a full control transfer (Setup [+ Data] + Status) onto
/// `transfer_ring` and rings the control endpoint's doorbell, batched per
/// the platform's emulation behavior: real hardware is rung once per stage
/// so it can start moving Data before Status is even queued, but QEMU's
/// xHCI emulation only reliably services the whole chain when the doorbell
/// is rung exactly once, after Status.
pub fn start_control_transfer<P: Platform + ?Sized>(
    platform: &P,
    transfer_ring: &mut XHCITransferRing,
    slot_id: u8,
    doorbells: &Mutex<XHCIDoorbellManager<'_>>,
    packet: XHCIDeviceRequestPacket,
    data: ControlTransferData,
) {
    transfer_ring.enqueue(SetupStageTRB::new(packet, 0, 0).into_trb());

    if let Some((data_phys, length, dir_in)) = data {
        transfer_ring.enqueue(DataStageTRB::new(data_phys, length, dir_in, 0, 0).into_trb());
        if !platform.is_qemu() {
            doorbells.lock().ring_control_endpoint_doorbell(slot_id);
        }
    }

    // No Data stage means Status is always device-to-host (USB 2.0 Spec §9.4.5).
    let status_dir_in = data.map(|(_, _, dir_in)| !dir_in).unwrap_or(true);
    transfer_ring.enqueue(StatusStageTRB::new(status_dir_in, 0, 0).into_trb());
    doorbells.lock().ring_control_endpoint_doorbell(slot_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::VirtAddr;
    use crate::platform::IrqHandler;
    use crate::trb::{
        CmdCompletionStatus, CmdComplInfo, EnableSlotCommandTRB, PacketRecipient, PacketType,
        TRB_TYPE_CMD_COMPLETION, TRB_TYPE_DATA_STAGE, TRB_TYPE_SETUP_STAGE, TRB_TYPE_STATUS_STAGE,
    };
    use core::cell::UnsafeCell;
    use core::sync::atomic::{AtomicBool, Ordering};
    extern crate std;
    use std::boxed::Box;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    const BACKING_SIZE: usize = 64 * 1024;

    struct TestPlatform {
        backing: UnsafeCell<Box<[u8; BACKING_SIZE]>>,
        qemu: bool,
    }
    unsafe impl Sync for TestPlatform {}

    impl Platform for TestPlatform {
        fn map_mmio(&self, _bar_pa: PhysAddr, _size: usize) -> VirtAddr {
            unimplemented!()
        }
        fn alloc_dma(&self, size: usize, _align: usize, _boundary: usize) -> Option<VirtAddr> {
            assert!(size <= BACKING_SIZE);
            Some(VirtAddr::from_ptr(unsafe { (*self.backing.get()).as_mut_ptr() }))
        }
        fn free_dma(&self, _vaddr: VirtAddr, _size: usize) {}
        fn virt_to_phys(&self, vaddr: VirtAddr) -> PhysAddr {
            PhysAddr::from(vaddr.into_raw())
        }
        fn mark_uncacheable(&self, _vaddr: VirtAddr, _size: usize) {}
        fn register_irq(&self, _vector: u32, _handler: IrqHandler, _ctx: *mut ()) {}
        fn sleep_ms(&self, ms: u32) {
            thread::sleep(Duration::from_micros(ms as u64 * 50));
        }
        fn sleep_us(&self, _us: u32) {}
        fn is_qemu(&self) -> bool {
            self.qemu
        }
    }

    fn fake_doorbell_manager(platform: &TestPlatform) -> XHCIDoorbellManager<'_> {
        let base = VirtAddr::from_ptr(unsafe { (*platform.backing.get()).as_mut_ptr() });
        unsafe { XHCIDoorbellManager::new(base, 8) }
    }

    fn fake_response(slot_id: u8, code: CompletionStatusCode) -> CmdResponseTRB {
        CmdResponseTRB {
            trb_pointer: PhysAddr::from(0usize),
            status: CmdCompletionStatus::new().with_completion_code(code.into_bits()),
            cmd: CmdComplInfo::new()
                .with_trb_type(TRB_TYPE_CMD_COMPLETION)
                .with_slot_id(slot_id),
        }
    }

    #[test]
    fn send_command_times_out_with_no_completion() {
        let platform = TestPlatform {
            backing: UnsafeCell::new(Box::new([0u8; BACKING_SIZE])),
            qemu: false,
        };
        let ring = XHCICommandRing::create(&platform, 8).unwrap();
        let engine = CommandEngine::new(ring);
        let doorbells = Mutex::new(fake_doorbell_manager(&platform));

        let trb = EnableSlotCommandTRB::new(0, 0).into_trb();
        let result = engine.send_command(&platform, &doorbells, trb, 2);
        assert!(matches!(result, Err(XhciError::CommandTimeout { .. })));
    }

    #[test]
    fn send_command_succeeds_once_completion_posted() {
        let platform = Arc::new(TestPlatform {
            backing: UnsafeCell::new(Box::new([0u8; BACKING_SIZE])),
            qemu: false,
        });
        let ring = XHCICommandRing::create(&*platform, 8).unwrap();
        let engine = Arc::new(CommandEngine::new(ring));
        let doorbells = Mutex::new(fake_doorbell_manager(&platform));

        let posted = Arc::new(AtomicBool::new(false));
        {
            let engine = Arc::clone(&engine);
            let posted = Arc::clone(&posted);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(5));
                engine.on_command_completion(fake_response(3, CompletionStatusCode::Success));
                posted.store(true, Ordering::SeqCst);
            });
        }

        let trb = EnableSlotCommandTRB::new(0, 0).into_trb();
        let result = engine.send_command(&*platform, &doorbells, trb, 500);
        assert!(posted.load(Ordering::SeqCst));
        assert_eq!(result.unwrap().slot_id(), 3);
    }

    #[test]
    fn send_command_surfaces_non_success_completion_code() {
        let platform = TestPlatform {
            backing: UnsafeCell::new(Box::new([0u8; BACKING_SIZE])),
            qemu: false,
        };
        let ring = XHCICommandRing::create(&platform, 8).unwrap();
        let engine = CommandEngine::new(ring);
        let doorbells = Mutex::new(fake_doorbell_manager(&platform));

        engine.on_command_completion(fake_response(1, CompletionStatusCode::NoSlotsAvailableError));
        let trb = EnableSlotCommandTRB::new(0, 0).into_trb();
        let result = engine.send_command(&platform, &doorbells, trb, 50);
        assert!(matches!(
            result,
            Err(XhciError::CommandFailed {
                completion_code: CompletionStatusCode::NoSlotsAvailableError
            })
        ));
    }

    #[test]
    fn transfer_completion_times_out_with_nothing_posted() {
        let platform = TestPlatform {
            backing: UnsafeCell::new(Box::new([0u8; BACKING_SIZE])),
            qemu: false,
        };
        let completion = TransferCompletion::new();
        let result = completion.wait(&platform, 2);
        assert!(matches!(result, Err(XhciError::TransferTimeout)));
    }

    #[test]
    fn start_control_transfer_with_data_rings_twice_off_qemu() {
        let platform = TestPlatform {
            backing: UnsafeCell::new(Box::new([0u8; BACKING_SIZE])),
            qemu: false,
        };
        let mut ring = XHCITransferRing::create(&platform, 8, 1).unwrap();
        let doorbells = Mutex::new(fake_doorbell_manager(&platform));
        let packet = XHCIDeviceRequestPacket::new()
            .with_recipient(PacketRecipient::Device)
            .with_p_type(PacketType::Standard)
            .with_device_to_host(true);

        start_control_transfer(
            &platform,
            &mut ring,
            2,
            &doorbells,
            packet,
            Some((PhysAddr::from(0x3000usize), 18, true)),
        );

        let trbs = unsafe { ring.trbs_for_test() };
        assert_eq!(trbs[0].cmd.trb_type(), TRB_TYPE_SETUP_STAGE);
        assert_eq!(trbs[1].cmd.trb_type(), TRB_TYPE_DATA_STAGE);
        assert_eq!(trbs[2].cmd.trb_type(), TRB_TYPE_STATUS_STAGE);
    }

    #[test]
    fn start_control_transfer_without_data_issues_in_status() {
        let platform = TestPlatform {
            backing: UnsafeCell::new(Box::new([0u8; BACKING_SIZE])),
            qemu: true,
        };
        let mut ring = XHCITransferRing::create(&platform, 8, 1).unwrap();
        let doorbells = Mutex::new(fake_doorbell_manager(&platform));
        let packet = XHCIDeviceRequestPacket::new()
            .with_recipient(PacketRecipient::Device)
            .with_p_type(PacketType::Standard)
            .with_device_to_host(false);

        start_control_transfer(&platform, &mut ring, 2, &doorbells, packet, None);

        let trbs = unsafe { ring.trbs_for_test() };
        assert_eq!(trbs[0].cmd.trb_type(), TRB_TYPE_SETUP_STAGE);
        assert_eq!(trbs[1].cmd.trb_type(), TRB_TYPE_STATUS_STAGE);
    }
}
