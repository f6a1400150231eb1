//! DMA allocator facade: a thin typed wrapper over [`Platform::alloc_dma`]
//! that turns a raw owning pointer into an ownership-bearing handle.
//!
//! Grounded on `crates/kernel/src/drivers/xhci/utils.rs`'s
//! `allocate_buffers_frame`/`allocate_buffers` (the teacher's ad hoc
//! frame-based allocation), generalized behind [`Platform`] since the
//! teacher's `Frame`/`frame_allocator` types are kernel-internal.

use core::marker::PhantomData;
use core::ptr::NonNull;

use crate::addr::{PhysAddr, VirtAddr};
use crate::error::{Result, XhciError};
use crate::platform::Platform;

/// Alignment/boundary constraints for a DMA allocation, named per the
/// structure being allocated (rings, DCBAA, scratchpad pages, contexts all
/// have different constraints dictated by the xHCI specification).
#[derive(Debug, Clone, Copy)]
pub struct DmaConstraints {
    pub align: usize,
    pub boundary: usize,
}

impl DmaConstraints {
    /// 64-byte aligned, must not cross a 64 KiB boundary — Command/Event/
    /// Transfer ring segments.
    pub const RING: Self = Self {
        align: 64,
        boundary: 64 * 1024,
    };
    /// 64-byte aligned, must not cross a 4 KiB boundary — the DCBAA.
    pub const DCBAA: Self = Self {
        align: 64,
        boundary: 4096,
    };
    /// 4 KiB aligned and bounded — scratchpad pages and Input/Output
    /// Device Contexts.
    pub const PAGE: Self = Self {
        align: 4096,
        boundary: 4096,
    };
}

/// An ownership-bearing handle to a zero-initialized, DMA-capable
/// allocation of `T`, caching the physical address queried once at
/// allocation time.
///
/// `Drop` is a documented no-op: the controller's permanent structures
/// (DCBAA, Command Ring, Event Ring, ERST, scratchpad array) are allocated
/// once for the controller's lifetime and never released. Per-device
/// structures that *should* be released call [`Dma::release`] explicitly
/// when a device record is torn down, matching the teacher's per-endpoint
/// `Drop` impl in `xhci/rings/transfer.rs` and `xhci/usb_endpoint.rs`.
pub struct Dma<T> {
    ptr: NonNull<T>,
    phys: PhysAddr,
    len: usize,
    _marker: PhantomData<T>,
}

unsafe impl<T: Send> Send for Dma<T> {}
unsafe impl<T: Sync> Sync for Dma<T> {}

impl<T> Dma<T> {
    /// Allocates a zero-initialized, DMA-capable buffer of `len` elements
    /// of `T`, satisfying `constraints`.
    pub fn alloc_slice<P: Platform + ?Sized>(
        platform: &P,
        len: usize,
        constraints: DmaConstraints,
    ) -> Result<Dma<T>> {
        let size = len * size_of::<T>();
        let vaddr = platform
            .alloc_dma(size, constraints.align, constraints.boundary)
            .ok_or(XhciError::OutOfResources)?;
        let phys = platform.virt_to_phys(vaddr);
        let ptr = NonNull::new(vaddr.into_ptr::<T>()).ok_or(XhciError::OutOfResources)?;
        Ok(Dma {
            ptr,
            phys,
            len,
            _marker: PhantomData,
        })
    }

    /// Allocates a single zero-initialized `T`.
    pub fn alloc_one<P: Platform + ?Sized>(
        platform: &P,
        constraints: DmaConstraints,
    ) -> Result<Dma<T>> {
        Self::alloc_slice(platform, 1, constraints)
    }

    pub const fn phys_addr(&self) -> PhysAddr {
        self.phys
    }

    pub fn virt_addr(&self) -> VirtAddr {
        VirtAddr::from_ptr(self.ptr.as_ptr())
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn as_ptr(&self) -> *const T {
        self.ptr.as_ptr()
    }

    pub const fn as_mut_ptr(&mut self) -> *mut T {
        self.ptr.as_ptr()
    }

    /// # Safety
    /// The caller must ensure no concurrent access from the controller
    /// (e.g. the hardware is not currently reading/writing this buffer)
    /// while the returned slice is live.
    pub unsafe fn as_slice(&self) -> &[T] {
        unsafe { core::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// # Safety
    /// Same caveat as [`Self::as_slice`].
    pub unsafe fn as_mut_slice(&mut self) -> &mut [T] {
        unsafe { core::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Explicitly releases this allocation back to the platform collaborator.
    /// Use for per-device structures (Input/Output contexts, per-endpoint
    /// transfer rings and data buffers) torn down when a device disconnects;
    /// controller-lifetime structures are never released.
    pub fn release<P: Platform + ?Sized>(self, platform: &P) {
        let vaddr = self.virt_addr();
        let size = self.len * size_of::<T>();
        core::mem::forget(self);
        platform.free_dma(vaddr, size);
    }
}

impl<T> Drop for Dma<T> {
    fn drop(&mut self) {
        // No-op: see the type's doc comment. Release via `Dma::release`.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::UnsafeCell;
    use core::sync::atomic::{AtomicUsize, Ordering};
    extern crate std;
    use std::boxed::Box;

    struct TestPlatform {
        backing: UnsafeCell<Box<[u8; 4096]>>,
        freed: AtomicUsize,
    }
    unsafe impl Sync for TestPlatform {}

    impl Platform for TestPlatform {
        fn map_mmio(&self, _bar_pa: PhysAddr, _size: usize) -> VirtAddr {
            unimplemented!()
        }
        fn alloc_dma(&self, size: usize, _align: usize, _boundary: usize) -> Option<VirtAddr> {
            assert!(size <= 4096);
            let ptr = unsafe { (*self.backing.get()).as_mut_ptr() };
            Some(VirtAddr::from_ptr(ptr))
        }
        fn free_dma(&self, _vaddr: VirtAddr, _size: usize) {
            self.freed.fetch_add(1, Ordering::SeqCst);
        }
        fn virt_to_phys(&self, vaddr: VirtAddr) -> PhysAddr {
            PhysAddr::from(vaddr.into_raw())
        }
        fn mark_uncacheable(&self, _vaddr: VirtAddr, _size: usize) {}
        fn register_irq(
            &self,
            _vector: u32,
            _handler: crate::platform::IrqHandler,
            _ctx: *mut (),
        ) {
        }
        fn sleep_ms(&self, _ms: u32) {}
        fn sleep_us(&self, _us: u32) {}
        fn is_qemu(&self) -> bool {
            false
        }
    }

    #[test]
    fn alloc_caches_phys_addr() {
        let platform = TestPlatform {
            backing: UnsafeCell::new(Box::new([0u8; 4096])),
            freed: AtomicUsize::new(0),
        };
        let dma = Dma::<u32>::alloc_slice(&platform, 16, DmaConstraints::PAGE).unwrap();
        assert_eq!(dma.len(), 16);
        assert_eq!(dma.phys_addr(), platform.virt_to_phys(dma.virt_addr()));
    }

    #[test]
    fn release_calls_free_dma_once() {
        let platform = TestPlatform {
            backing: UnsafeCell::new(Box::new([0u8; 4096])),
            freed: AtomicUsize::new(0),
        };
        let dma = Dma::<u32>::alloc_one(&platform, DmaConstraints::PAGE).unwrap();
        dma.release(&platform);
        assert_eq!(platform.freed.load(Ordering::SeqCst), 1);
    }
}
