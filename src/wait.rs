//! Bounded-wait polling helper.
//!
//! The teacher's `sleep_until!`/`sleep!` macros (used throughout
//! `xhci/regs.rs`'s `reset_port`/`reset_zero`/`start`) sleep in a fixed
//! step and re-check a condition until either the condition holds or a
//! bound is exceeded, panicking on expiry. This crate has no panic-on-expiry
//! luxury — every bounded wait here returns a typed [`crate::error::XhciError`]
//! instead, so this helper returns `bool` and lets the caller decide.

use crate::platform::Platform;

/// Polls `condition` once per `step_ms` milliseconds (sleeping via
/// `platform.sleep_ms`) until it returns `true` or `bound_ms` total time has
/// elapsed. Always checks the condition at least once before sleeping.
/// Returns whether the condition was observed true.
pub fn poll_ms<P: Platform + ?Sized>(
    platform: &P,
    bound_ms: u32,
    step_ms: u32,
    mut condition: impl FnMut() -> bool,
) -> bool {
    let step_ms = step_ms.max(1);
    let mut waited = 0u32;
    loop {
        if condition() {
            return true;
        }
        if waited >= bound_ms {
            return false;
        }
        platform.sleep_ms(step_ms);
        waited += step_ms;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::{PhysAddr, VirtAddr};
    use core::cell::Cell;
    extern crate std;

    struct CountingPlatform {
        sleeps: Cell<u32>,
    }

    impl Platform for CountingPlatform {
        fn map_mmio(&self, _bar_pa: PhysAddr, _size: usize) -> VirtAddr {
            unimplemented!()
        }
        fn alloc_dma(&self, _size: usize, _align: usize, _boundary: usize) -> Option<VirtAddr> {
            unimplemented!()
        }
        fn free_dma(&self, _vaddr: VirtAddr, _size: usize) {}
        fn virt_to_phys(&self, vaddr: VirtAddr) -> PhysAddr {
            PhysAddr::from(vaddr.into_raw())
        }
        fn mark_uncacheable(&self, _vaddr: VirtAddr, _size: usize) {}
        fn register_irq(&self, _vector: u32, _handler: crate::platform::IrqHandler, _ctx: *mut ()) {}
        fn sleep_ms(&self, _ms: u32) {
            self.sleeps.set(self.sleeps.get() + 1);
        }
        fn sleep_us(&self, _us: u32) {}
        fn is_qemu(&self) -> bool {
            false
        }
    }

    #[test]
    fn returns_true_without_sleeping_when_already_satisfied() {
        let platform = CountingPlatform { sleeps: Cell::new(0) };
        assert!(poll_ms(&platform, 100, 1, || true));
        assert_eq!(platform.sleeps.get(), 0);
    }

    #[test]
    fn gives_up_once_bound_is_reached() {
        let platform = CountingPlatform { sleeps: Cell::new(0) };
        assert!(!poll_ms(&platform, 5, 1, || false));
        // Checked once per step until `waited >= bound_ms`, i.e. 5 sleeps
        // for a 5ms bound at a 1ms step.
        assert_eq!(platform.sleeps.get(), 5);
    }

    #[test]
    fn observes_condition_becoming_true_mid_poll() {
        let platform = CountingPlatform { sleeps: Cell::new(0) };
        let mut remaining = 3;
        let satisfied = poll_ms(&platform, 100, 1, || {
            if remaining == 0 {
                true
            } else {
                remaining -= 1;
                false
            }
        });
        assert!(satisfied);
        assert_eq!(platform.sleeps.get(), 3);
    }
}
