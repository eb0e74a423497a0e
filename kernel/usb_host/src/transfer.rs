//! USB transfer descriptions handed down by the generic stack.

use core::sync::atomic::AtomicUsize;

use alloc::boxed::Box;
use spin::Mutex;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::UsbError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Control,
    Bulk,
    Interrupt,
    Isochronous,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to device.
    Out,
    /// Device to host.
    In,
}

/// The 8-byte SETUP stage payload, wire layout.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromZeroes, FromBytes, AsBytes)]
pub struct SetupPacket {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

/// Bytes transferred, or the fault that terminated the transfer.
pub type TransferStatus = Result<usize, UsbError>;

pub type TransferCallback = Box<dyn Fn(&UsbTransfer, TransferStatus) + Send + Sync>;

/// One submitted USB transfer.
///
/// The buffer is raw client memory the controller DMAs to or from; it must
/// stay valid and DMA-visible until the transfer completes.
pub struct UsbTransfer {
    pub kind: TransferType,
    pub direction: Direction,
    /// SETUP payload for control transfers; must have a stable address for
    /// the lifetime of the transfer (the hardware reads it in place).
    pub setup: Option<SetupPacket>,
    buffer: *mut u8,
    pub size: usize,
    /// Driver-private slot: an arena-handle token owned by the
    /// host-controller driver (0 while unsubmitted).
    pub hcdpriv: AtomicUsize,
    state: Mutex<Option<TransferStatus>>,
    callback: Option<TransferCallback>,
}

unsafe impl Send for UsbTransfer {}
unsafe impl Sync for UsbTransfer {}

impl UsbTransfer {
    pub fn new(
        kind: TransferType,
        direction: Direction,
        setup: Option<SetupPacket>,
        buffer: *mut u8,
        size: usize,
    ) -> Self {
        Self {
            kind,
            direction,
            setup,
            buffer,
            size,
            hcdpriv: AtomicUsize::new(0),
            state: Mutex::new(None),
            callback: None,
        }
    }

    pub fn with_callback(
        kind: TransferType,
        direction: Direction,
        setup: Option<SetupPacket>,
        buffer: *mut u8,
        size: usize,
        callback: TransferCallback,
    ) -> Self {
        let mut transfer = Self::new(kind, direction, setup, buffer, size);
        transfer.callback = Some(callback);
        transfer
    }

    pub fn buffer(&self) -> *mut u8 {
        self.buffer
    }

    /// Record the terminal status and notify the submitter.
    ///
    /// This is the completion entry point drivers invoke from the reaper;
    /// it must be called at most once per submission.
    pub fn finish(&self, status: TransferStatus) {
        *self.state.lock() = Some(status);
        if let Some(callback) = &self.callback {
            callback(self, status);
        }
    }

    /// Whether the transfer has completed since it was last submitted.
    pub fn is_complete(&self) -> bool {
        self.state.lock().is_some()
    }

    pub fn status(&self) -> Option<TransferStatus> {
        *self.state.lock()
    }

    /// Re-arm a completed transfer for resubmission.
    pub fn reset(&self) {
        *self.state.lock() = None;
    }
}
