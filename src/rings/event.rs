//! The (single-segment) Event Ring: the xHC is the producer, the core is
//! the consumer.
//!
//! Grounded on `crates/kernel/src/drivers/xhci/rings/event.rs`. Mandatory
//! programming order per SPEC_FULL §5/§4.3: ERSTSZ, then ERDP, then
//! ERSTBA — writing ERSTBA is what arms the ring, so it must land last.

use heapless::Vec as HVec;

use crate::addr::PhysAddr;
use crate::dma::{Dma, DmaConstraints};
use crate::error::Result;
use crate::platform::Platform;
use crate::regs::InterrupterRegs;
use crate::trb::{EventResponseTRB, TRB};
use crate::{read_ref, write_ref};

/// Event Ring Segment Table entry (xHci Spec Table 6-40).
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct XHCIEventRingEntry {
    pub ring_segment_base: PhysAddr,
    pub ring_segment_size: u32,
    __: u32,
}

/// Maximum events drained from the ring in one `dequeue_events` call.
/// Bounds the batch so a pathological event storm can't grow this
/// allocation unboundedly; a full ring would mean the consumer has fallen
/// dangerously far behind anyway.
pub const MAX_EVENTS_PER_DRAIN: usize = 64;

pub struct XHCIEventRing {
    interrupter_regs: *mut InterrupterRegs,
    trbs: Dma<TRB>,
    ring_segment_table: Dma<XHCIEventRingEntry>,
    dequeue_ptr: usize,
    curr_ring_cycle_bit: u8,
}

unsafe impl Send for XHCIEventRing {}

impl XHCIEventRing {
    pub fn create<P: Platform + ?Sized>(
        platform: &P,
        interrupter_regs: *mut InterrupterRegs,
        trb_count: usize,
    ) -> Result<Self> {
        let trbs = Dma::<TRB>::alloc_slice(platform, trb_count, DmaConstraints::RING)?;
        let mut ring_segment_table = Dma::<XHCIEventRingEntry>::alloc_one(platform, DmaConstraints::DCBAA)?;

        let entry = unsafe { &mut ring_segment_table.as_mut_slice()[0] };
        entry.ring_segment_base = trbs.phys_addr();
        entry.ring_segment_size = trb_count as u32;

        let mut this = Self {
            interrupter_regs,
            trbs,
            ring_segment_table,
            dequeue_ptr: 0,
            curr_ring_cycle_bit: 1,
        };
        this.reset();
        Ok(this)
    }

    fn interrupter(&mut self) -> &mut InterrupterRegs {
        unsafe { &mut *self.interrupter_regs }
    }

    /// Reprograms the interrupter's ERST registers. Must only be called
    /// while the owning interrupter is otherwise quiescent (controller
    /// lifecycle setup) — the write order here is load-bearing.
    pub fn reset(&mut self) {
        let base_phys = self.ring_segment_table.phys_addr();
        let interrupter = self.interrupter();

        write_ref!(interrupter.erst_sz, 1);
        self.update_edrp();
        write_ref!(interrupter.erst_base, base_phys);
    }

    fn update_edrp(&mut self) {
        let deque_phys = self.trbs.phys_addr() + self.dequeue_ptr * size_of::<TRB>();
        let interrupter = self.interrupter();
        let edrp = read_ref!(interrupter.event_ring_deque).with_addr(deque_phys);
        write_ref!(interrupter.event_ring_deque, edrp);
    }

    fn dequeue_trb(&mut self) -> Option<TRB> {
        let len = self.trbs.len();
        let slice = unsafe { self.trbs.as_slice() };
        let trb = slice[self.dequeue_ptr];

        if trb.cmd.cycle_bit() != self.curr_ring_cycle_bit {
            return None;
        }

        self.dequeue_ptr += 1;
        if self.dequeue_ptr == len {
            self.dequeue_ptr = 0;
            self.curr_ring_cycle_bit ^= 1;
        }

        Some(trb)
    }

    /// Drains every currently-available event off the ring (up to
    /// [`MAX_EVENTS_PER_DRAIN`]), updating ERDP with the Event Handler Busy
    /// bit set while draining, matching the teacher's `dequeue_events`.
    pub fn dequeue_events(&mut self) -> HVec<EventResponseTRB, MAX_EVENTS_PER_DRAIN> {
        let mut events = HVec::new();
        while events.len() < MAX_EVENTS_PER_DRAIN {
            match self.dequeue_trb() {
                Some(trb) => {
                    if let Some(event) = trb.into_event_trb() {
                        let _ = events.push(event);
                    }
                }
                None => break,
            }
        }

        if !events.is_empty() {
            let interrupter = self.interrupter();
            let busy = read_ref!(interrupter.event_ring_deque).with_handler_busy(true);
            write_ref!(interrupter.event_ring_deque, busy);
            self.update_edrp();
        }

        events
    }

    /// Pokes a single slot's raw contents directly, bypassing the dequeue
    /// cursor entirely. Lets a caller outside this module simulate the xHC
    /// posting an event without reaching into the `Dma<TRB>` it owns.
    #[cfg(test)]
    pub(crate) fn write_trb_for_test(&mut self, index: usize, trb: TRB) {
        unsafe { self.trbs.as_mut_slice()[index] = trb };
    }
}
