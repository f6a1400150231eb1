//! The `Platform` collaborator trait — the Downward interface through which
//! this crate reaches PCI/MMIO mapping, DMA allocation, interrupt
//! registration, and sleeping without depending on any particular kernel.
//!
//! Grounded on the shape of `crates/kernel/src/drivers/pci/mod.rs`'s
//! `PCIDevice` trait and `crates/kernel/src/drivers/interrupts.rs`'s
//! `InterruptReceiver`/`register_irq` pair — both examples of the teacher
//! drawing a trait-object seam around a collaborator it also owns
//! elsewhere. Here the collaborator is *not* owned elsewhere: an embedding
//! kernel implements this trait once and the crate never assumes anything
//! about `arch`/`memory`/`drivers::pci` beyond what's named below.

use crate::addr::{PhysAddr, VirtAddr};

/// A function pointer invoked on interrupt delivery, paired with an
/// opaque context pointer the embedder supplied at registration time.
///
/// Kept as a raw fn-pointer + context pair (rather than a boxed closure or
/// trait object) so `Platform` itself stays object-safe.
pub type IrqHandler = extern "C" fn(ctx: *mut ());

/// The Downward collaborator interface: PCI/memory/interrupt/timing
/// services this crate needs but does not implement itself.
///
/// Object-safe by construction so an embedder can hand the core a
/// `&dyn Platform` as well as use it generically (`Controller<P: Platform>`).
pub trait Platform: Send + Sync {
    /// Maps `size` bytes of a PCI BAR (or other physical MMIO region)
    /// starting at `bar_pa` into the address space, uncached, and returns
    /// the virtual address the core should read/write through.
    fn map_mmio(&self, bar_pa: PhysAddr, size: usize) -> VirtAddr;

    /// Allocates `size` bytes of DMA-capable memory aligned to `align` and
    /// not crossing a `boundary`-byte boundary (0 = no boundary
    /// constraint), returning the virtual address of the new allocation.
    /// Returns `None` on allocation failure; the caller maps this into
    /// [`crate::error::XhciError::OutOfResources`].
    fn alloc_dma(&self, size: usize, align: usize, boundary: usize) -> Option<VirtAddr>;

    /// Releases a DMA allocation previously returned by [`Self::alloc_dma`].
    fn free_dma(&self, vaddr: VirtAddr, size: usize);

    /// Resolves the physical address backing a virtual address returned by
    /// [`Self::alloc_dma`] or [`Self::map_mmio`]. One-directional by design
    /// — see [`crate::dma::Dma`] for why callers cache this rather than
    /// re-deriving it.
    fn virt_to_phys(&self, vaddr: VirtAddr) -> PhysAddr;

    /// Marks `size` bytes starting at `vaddr` as uncacheable, where the
    /// platform's default mapping would otherwise cache it.
    fn mark_uncacheable(&self, vaddr: VirtAddr, size: usize);

    /// Registers `handler` to run (with `ctx`) when `vector` fires.
    fn register_irq(&self, vector: u32, handler: IrqHandler, ctx: *mut ());

    /// Blocks the calling context for at least `ms` milliseconds.
    fn sleep_ms(&self, ms: u32);

    /// Blocks the calling context for at least `us` microseconds.
    fn sleep_us(&self, us: u32);

    /// True when running under QEMU's xHCI emulation, which coalesces the
    /// SETUP/DATA/STATUS doorbell rings of a control transfer into a single
    /// ring after the Status Stage rather than expecting one per stage.
    fn is_qemu(&self) -> bool;
}
