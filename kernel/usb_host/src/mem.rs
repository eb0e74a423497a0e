//! Typed DMA-coherent hardware blocks.
//!
//! Every descriptor the controller reads lives in a [`DmaBlock`]: the
//! driver addresses it through the virtual pointer, the hardware through
//! the cached bus address. Blocks are zeroed on allocation and returned
//! to the platform on drop.

use core::alloc::Layout;
use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;

use crate::platform;
use crate::UsbError;

pub struct DmaBlock<T> {
    ptr: NonNull<T>,
    paddr: u32,
    layout: Layout,
}

unsafe impl<T: Send> Send for DmaBlock<T> {}
unsafe impl<T: Sync> Sync for DmaBlock<T> {}

impl<T> DmaBlock<T> {
    /// Allocate a zeroed block sized and aligned for `T`.
    pub fn new() -> Result<Self, UsbError> {
        Self::with_layout(Layout::new::<T>())
    }

    /// Allocate with an explicit layout, for blocks whose hardware
    /// alignment exceeds that of `T` (the periodic frame list is aligned
    /// to its own byte size).
    pub fn with_layout(layout: Layout) -> Result<Self, UsbError> {
        let (ptr, paddr) = platform::get()?
            .dma_alloc(layout)
            .ok_or(UsbError::OutOfMemory)?;
        Ok(Self {
            ptr: ptr.cast(),
            paddr,
            layout,
        })
    }

    /// Bus address the controller uses for this block.
    pub fn paddr(&self) -> u32 {
        self.paddr
    }
}

impl<T> Deref for DmaBlock<T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { self.ptr.as_ref() }
    }
}

impl<T> DerefMut for DmaBlock<T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { self.ptr.as_mut() }
    }
}

impl<T> Drop for DmaBlock<T> {
    fn drop(&mut self) {
        if let Ok(platform) = platform::get() {
            unsafe { platform.dma_free(self.ptr.cast(), self.paddr, self.layout) };
        }
    }
}
