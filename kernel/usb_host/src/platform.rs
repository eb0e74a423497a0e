//! Services the embedding system provides to host-controller drivers.
//!
//! The system registers one implementation at boot with [`init`]; drivers
//! obtain it through [`get`]. Registration follows the usual one-shot
//! pattern for process-wide driver services.

use core::alloc::Layout;
use core::ptr::NonNull;

use alloc::sync::Arc;
use spin::Once;

use crate::hcd::Hcd;
use crate::UsbError;

/// A wait/signal pair in the manner of a condition variable.
///
/// `signal` must be callable from interrupt context; `wait` blocks the
/// calling task until the next signal.
pub trait IrqEvent: Send + Sync {
    fn wait(&self);
    fn signal(&self);
}

/// Interrupt top-half entry point of a host-controller driver.
///
/// Returns whether the controller had an interrupt pending.
pub type IrqHandler = fn(&'static Hcd) -> bool;

pub trait HcdPlatform: Send + Sync {
    /// Allocate zeroed DMA-coherent memory for descriptor blocks.
    ///
    /// Returns the driver-visible pointer and the 32-bit bus address the
    /// controller uses for the same memory. On platforms with non-coherent
    /// DMA this must come from an uncached or write-through region.
    fn dma_alloc(&self, layout: Layout) -> Option<(NonNull<u8>, u32)>;

    /// Release memory obtained from [`HcdPlatform::dma_alloc`].
    ///
    /// # Safety
    /// The block must no longer be reachable by the controller.
    unsafe fn dma_free(&self, vaddr: NonNull<u8>, paddr: u32, layout: Layout);

    /// Bus address of arbitrary driver-visible memory (transfer buffers,
    /// setup packets). The region need not come from `dma_alloc`.
    fn virt_to_phys(&self, vaddr: *const u8) -> u32;

    /// Create the event a driver's ISR signals and its worker waits on.
    fn create_event(&self) -> Arc<dyn IrqEvent>;

    /// Route `irq` to `handler(hcd)`.
    fn attach_irq(
        &self,
        irq: u32,
        handler: IrqHandler,
        hcd: &'static Hcd,
    ) -> Result<(), UsbError>;

    /// Spawn a driver worker task at the given priority.
    fn spawn(
        &self,
        name: &'static str,
        priority: u8,
        entry: fn(&'static Hcd) -> !,
        hcd: &'static Hcd,
    ) -> Result<(), UsbError>;

    fn sleep_ms(&self, ms: u64);

    /// Board-specific PHY bring-up for the given controller.
    fn phy_init(&self, hcd: &Hcd) -> Result<(), UsbError> {
        let _ = hcd;
        Ok(())
    }
}

static PLATFORM: Once<&'static dyn HcdPlatform> = Once::new();

/// Register the platform services. Later calls are ignored.
pub fn init(platform: &'static dyn HcdPlatform) {
    PLATFORM.call_once(|| platform);
}

pub fn get() -> Result<&'static dyn HcdPlatform, UsbError> {
    PLATFORM.get().copied().ok_or(UsbError::InvalidConfiguration)
}
