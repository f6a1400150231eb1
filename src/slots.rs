//! DCBAA (Device Context Base Address Array), the scratchpad buffer array,
//! and the host-side slot-ID-indexed device table: the controller's
//! root-level, slot-keyed bookkeeping.
//!
//! Grounded on `crates/kernel/src/drivers/xhci/regs.rs`'s
//! `XHCIRegisters::configure_dcbaa`, the only place the teacher builds a
//! DCBAA and scratchpad array — by hand-packing both into one shared frame.
//! This crate gives the DCBAA and the scratchpad array their own `Dma`
//! allocations instead, since each already satisfies its own
//! alignment/boundary constraint independently and there is no frame
//! allocator here to economize against. The slot-keyed device table itself
//! has no teacher counterpart (`prob()` in `xhci/mod.rs` only ever tracks
//! one device at a time); it is authored fresh per SPEC_FULL's `§9`
//! re-architecture note: a fixed-capacity array indexed by slot ID, since
//! slot IDs are assigned contiguously from 1.

use heapless::Vec as HVec;

use crate::addr::PhysAddr;
use crate::dma::{Dma, DmaConstraints};
use crate::error::Result;
use crate::platform::Platform;

/// Hard upper bound on scratchpad buffers: HCSPARAMS2's Max Scratchpad
/// Buffers field is 5 bits wide, so no controller can ever report more.
pub const MAX_SCRATCHPAD_BUFFERS: usize = 31;

/// Practical bound on concurrently tracked device slots. The protocol
/// allows up to 255 (HCSPARAMS1's Max Slots field is 8 bits), but no
/// embedding system attaches anywhere near that many devices at once;
/// fixing a smaller host-side bound avoids reserving hundreds of device
/// records that will never be used.
pub const MAX_TRACKED_SLOTS: usize = 32;

const PAGE_SIZE: usize = 4096;

/// The Device Context Base Address Array: entry 0 is the Scratchpad Buffer
/// Array's physical address (if scratchpad buffers are in use), entries
/// `1..=max_device_slots` are per-slot Output Device Context pointers.
pub struct Dcbaa {
    entries: Dma<PhysAddr>,
}

impl Dcbaa {
    /// Allocates a zeroed DCBAA sized for `max_device_slots` device slots
    /// plus the reserved entry 0.
    pub fn alloc<P: Platform + ?Sized>(platform: &P, max_device_slots: usize) -> Result<Self> {
        let entries =
            Dma::<PhysAddr>::alloc_slice(platform, max_device_slots + 1, DmaConstraints::DCBAA)?;
        Ok(Self { entries })
    }

    /// Physical base address to program into `DCBAAP`.
    pub fn phys_addr(&self) -> PhysAddr {
        self.entries.phys_addr()
    }

    /// Installs the Scratchpad Buffer Array's physical address at DCBAA[0].
    /// Must happen before the controller is started (xHCI spec §6.1).
    pub fn set_scratchpad_array(&mut self, scratchpad_array_phys: PhysAddr) {
        let slice = unsafe { self.entries.as_mut_slice() };
        slice[0] = scratchpad_array_phys;
    }

    /// Installs `slot_id`'s Output Device Context physical base. `slot_id`
    /// is never 0 — that entry is reserved for the scratchpad array.
    pub fn set_slot(&mut self, slot_id: u8, output_ctx_phys: PhysAddr) {
        let slot_id = slot_id as usize;
        debug_assert!(slot_id != 0 && slot_id < self.entries.len());
        let slice = unsafe { self.entries.as_mut_slice() };
        slice[slot_id] = output_ctx_phys;
    }

    pub fn slot(&self, slot_id: u8) -> PhysAddr {
        let slot_id = slot_id as usize;
        debug_assert!(slot_id != 0 && slot_id < self.entries.len());
        unsafe { self.entries.as_slice()[slot_id] }
    }
}

/// The Scratchpad Buffer Array plus the backing pages it points to,
/// allocated once when `MaxScratchpadBuffers > 0` and installed at
/// `DCBAA[0]` via [`Dcbaa::set_scratchpad_array`].
pub struct ScratchpadBuffers {
    array: Dma<PhysAddr>,
    pages: HVec<Dma<[u8; PAGE_SIZE]>, MAX_SCRATCHPAD_BUFFERS>,
}

impl ScratchpadBuffers {
    /// Allocates `count` scratchpad pages and the array of their physical
    /// addresses. `count` comes from `CapsReg::max_scratchpad_buffers()`, a
    /// 5-bit hardware field, so it never exceeds [`MAX_SCRATCHPAD_BUFFERS`].
    pub fn alloc<P: Platform + ?Sized>(platform: &P, count: usize) -> Result<Self> {
        debug_assert!(count <= MAX_SCRATCHPAD_BUFFERS);
        let mut array = Dma::<PhysAddr>::alloc_slice(platform, count, DmaConstraints::DCBAA)?;
        let mut pages: HVec<Dma<[u8; PAGE_SIZE]>, MAX_SCRATCHPAD_BUFFERS> = HVec::new();

        let array_slice = unsafe { array.as_mut_slice() };
        for slot in array_slice.iter_mut() {
            let page = Dma::<[u8; PAGE_SIZE]>::alloc_one(platform, DmaConstraints::PAGE)?;
            *slot = page.phys_addr();
            pages
                .push(page)
                .map_err(|_| ())
                .expect("count bounded by MAX_SCRATCHPAD_BUFFERS");
        }

        Ok(Self { array, pages })
    }

    /// Physical address to install at `DCBAA[0]`.
    pub fn phys_addr(&self) -> PhysAddr {
        self.array.phys_addr()
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }
}

/// A fixed-capacity table keyed by slot ID (1-based, assigned contiguously
/// by the controller). Holds per-slot host-side state — device records in
/// `crate::device` — but stays generic here since the table shape is
/// independent of what it stores.
pub struct SlotTable<T> {
    slots: HVec<Option<T>, MAX_TRACKED_SLOTS>,
}

impl<T> SlotTable<T> {
    pub fn new() -> Self {
        let mut slots = HVec::new();
        for _ in 0..MAX_TRACKED_SLOTS {
            let _ = slots.push(None);
        }
        Self { slots }
    }

    fn index(slot_id: u8) -> Option<usize> {
        let idx = (slot_id as usize).checked_sub(1)?;
        (idx < MAX_TRACKED_SLOTS).then_some(idx)
    }

    /// Installs `value` at `slot_id`, overwriting any previous occupant.
    /// Fails (returning `value` back) only if `slot_id` is outside the
    /// tracked range, i.e. the controller reported more slots than
    /// [`MAX_TRACKED_SLOTS`] provisions for.
    pub fn insert(&mut self, slot_id: u8, value: T) -> core::result::Result<(), T> {
        match Self::index(slot_id) {
            Some(idx) => {
                self.slots[idx] = Some(value);
                Ok(())
            }
            None => Err(value),
        }
    }

    pub fn get(&self, slot_id: u8) -> Option<&T> {
        let idx = Self::index(slot_id)?;
        self.slots[idx].as_ref()
    }

    pub fn get_mut(&mut self, slot_id: u8) -> Option<&mut T> {
        let idx = Self::index(slot_id)?;
        self.slots[idx].as_mut()
    }

    pub fn remove(&mut self, slot_id: u8) -> Option<T> {
        let idx = Self::index(slot_id)?;
        self.slots[idx].take()
    }
}

impl<T> Default for SlotTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::VirtAddr;
    use crate::platform::IrqHandler;
    use core::cell::UnsafeCell;
    extern crate std;
    use std::boxed::Box;

    const BACKING_SIZE: usize = 64 * 1024;

    struct TestPlatform(UnsafeCell<Box<[u8; BACKING_SIZE]>>);
    unsafe impl Sync for TestPlatform {}

    impl Platform for TestPlatform {
        fn map_mmio(&self, _bar_pa: PhysAddr, _size: usize) -> VirtAddr {
            unimplemented!()
        }
        fn alloc_dma(&self, size: usize, _align: usize, _boundary: usize) -> Option<VirtAddr> {
            assert!(size <= BACKING_SIZE);
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
    fn dcbaa_entry_zero_reserved_for_scratchpad() {
        let platform = TestPlatform(UnsafeCell::new(Box::new([0u8; BACKING_SIZE])));
        let mut dcbaa = Dcbaa::alloc(&platform, 8).unwrap();
        let scratchpad_phys = PhysAddr::from(0x1000usize);
        dcbaa.set_scratchpad_array(scratchpad_phys);
        dcbaa.set_slot(1, PhysAddr::from(0x2000usize));
        assert_eq!(dcbaa.slot(1), PhysAddr::from(0x2000usize));
    }

    #[test]
    fn slot_table_insert_get_remove_round_trips() {
        let mut table: SlotTable<u32> = SlotTable::new();
        assert!(table.get(1).is_none());
        table.insert(1, 42).unwrap();
        assert_eq!(table.get(1).copied(), Some(42));
        assert_eq!(table.remove(1), Some(42));
        assert!(table.get(1).is_none());
    }

    #[test]
    fn slot_table_rejects_out_of_range_slot() {
        let mut table: SlotTable<u32> = SlotTable::new();
        let result = table.insert((MAX_TRACKED_SLOTS + 1) as u8, 7);
        assert_eq!(result, Err(7));
    }
}
