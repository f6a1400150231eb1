//! The Command Ring: a single producer (the driving worker context, under
//! the command mutex) and a single consumer (the xHC).
//!
//! Grounded on `crates/kernel/src/drivers/xhci/rings/command.rs`.

use crate::addr::PhysAddr;
use crate::dma::{Dma, DmaConstraints};
use crate::error::Result;
use crate::platform::Platform;
use crate::trb::{TRB, TRB_TYPE_LINK};

pub struct XHCICommandRing {
    trbs: Dma<TRB>,
    enqueue_ptr: usize,
    curr_ring_cycle_bit: u8,
}

impl XHCICommandRing {
    pub fn create<P: Platform + ?Sized>(platform: &P, trb_count: usize) -> Result<Self> {
        let mut trbs = Dma::<TRB>::alloc_slice(platform, trb_count, DmaConstraints::RING)?;

        let base_phys = trbs.phys_addr();
        let slice = unsafe { trbs.as_mut_slice() };
        slice[trb_count - 1] = TRB::new_link(base_phys, true, 1);

        Ok(Self {
            trbs,
            enqueue_ptr: 0,
            curr_ring_cycle_bit: 1,
        })
    }

    /// Enqueues `trb` at the current producer slot, setting its cycle bit,
    /// and returns the physical address of the slot it was written to.
    /// Wraps and flips PCS (refreshing the Link TRB's cycle bit) when the
    /// producer reaches the last slot.
    pub fn enqueue(&mut self, mut trb: TRB) -> PhysAddr {
        trb.cmd = trb.cmd.with_cycle_bit(self.curr_ring_cycle_bit);

        let len = self.trbs.len();
        let slot = self.enqueue_ptr;
        let slot_phys = self.trbs.phys_addr() + slot * size_of::<TRB>();

        let slice = unsafe { self.trbs.as_mut_slice() };
        slice[slot] = trb;

        self.enqueue_ptr += 1;
        if self.enqueue_ptr == len - 1 {
            let base_phys = self.trbs.phys_addr();
            slice[len - 1] = TRB::new_link(base_phys, true, self.curr_ring_cycle_bit);
            self.enqueue_ptr = 0;
            self.curr_ring_cycle_bit ^= 1;
        }

        slot_phys
    }

    pub fn base_phys_addr(&self) -> PhysAddr {
        self.trbs.phys_addr()
    }

    pub const fn current_ring_cycle(&self) -> u8 {
        self.curr_ring_cycle_bit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::IrqHandler;
    use crate::addr::VirtAddr;
    use core::cell::UnsafeCell;
    extern crate std;
    use std::boxed::Box;

    struct TestPlatform(UnsafeCell<Box<[u8; 4096]>>);
    unsafe impl Sync for TestPlatform {}

    impl Platform for TestPlatform {
        fn map_mmio(&self, _bar_pa: PhysAddr, _size: usize) -> VirtAddr {
            unimplemented!()
        }
        fn alloc_dma(&self, size: usize, _align: usize, _boundary: usize) -> Option<VirtAddr> {
            assert!(size <= 4096);
            Some(VirtAddr::from_ptr(unsafe { (*self.0.get()).as_mut_ptr() }))
        }
        fn free_dma(&self, _vaddr: VirtAddr, _size: usize) {}
        fn virt_to_phys(&self, vaddr: VirtAddr) -> PhysAddr {
            PhysAddr::from(vaddr.into_raw())
        }
        fn mark_uncacheable(&self, _vaddr: VirtAddr, _size: usize) {}
        fn register_irq(&self, _vector: u32, _handler: IrqHandler, _ctx: *mut ()) {}
        fn sleep_ms(&self, _ms: u32) {}
        fn sleep_us(&self, _us: u32) {}
        fn is_qemu(&self) -> bool {
            false
        }
    }

    #[test]
    fn last_slot_is_link_trb() {
        let platform = TestPlatform(UnsafeCell::new(Box::new([0u8; 4096])));
        let ring = XHCICommandRing::create(&platform, 8).unwrap();
        let slice = unsafe { ring.trbs.as_slice() };
        assert_eq!(slice[7].cmd.trb_type(), TRB_TYPE_LINK);
    }

    #[test]
    fn wrap_flips_cycle_bit() {
        let platform = TestPlatform(UnsafeCell::new(Box::new([0u8; 4096])));
        let mut ring = XHCICommandRing::create(&platform, 4).unwrap();
        assert_eq!(ring.current_ring_cycle(), 1);
        for _ in 0..3 {
            ring.enqueue(TRB::zeroed());
        }
        assert_eq!(ring.current_ring_cycle(), 0);
        assert_eq!(ring.enqueue_ptr, 0);
    }

    /// The Link-TRB written on wrap must carry the cycle bit the consumer
    /// still expects (the PCS the just-enqueued data TRBs used), not the
    /// flipped one — otherwise the consumer sees a not-yet-valid TRB and
    /// stops following the ring right at the wrap.
    #[test]
    fn link_trb_cycle_bit_matches_pre_wrap_pcs_not_post_flip() {
        let platform = TestPlatform(UnsafeCell::new(Box::new([0u8; 4096])));
        let mut ring = XHCICommandRing::create(&platform, 4).unwrap();
        for _ in 0..3 {
            ring.enqueue(TRB::zeroed());
        }
        let slice = unsafe { ring.trbs.as_slice() };
        assert_eq!(slice[3].cmd.cycle_bit(), 1);
        assert_eq!(ring.current_ring_cycle(), 0);
    }
}
