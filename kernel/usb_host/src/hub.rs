//! Roothub surface consumed by host-controller drivers.
//!
//! The hub emulation layer above the drivers registers a control-request
//! dispatcher here; drivers divert roothub-targeted submissions to it and
//! report port changes through [`port_status_changed`].

use alloc::sync::Arc;
use spin::Once;

use crate::hcd::Hcd;
use crate::pipe::UsbDevice;
use crate::transfer::UsbTransfer;
use crate::UsbError;

/// Handles a control request addressed to the emulated roothub.
pub type RoothubHandler = fn(&Hcd, &Arc<UsbTransfer>) -> Result<(), UsbError>;

static ROOTHUB_HANDLER: Once<RoothubHandler> = Once::new();

/// Register the roothub request dispatcher; later calls are ignored.
pub fn set_roothub_handler(handler: RoothubHandler) {
    ROOTHUB_HANDLER.call_once(|| handler);
}

pub fn is_roothub(dev: &UsbDevice) -> bool {
    dev.roothub
}

/// Divert a submission targeting the roothub to the registered dispatcher.
pub fn roothub_request(hcd: &Hcd, transfer: &Arc<UsbTransfer>) -> Result<(), UsbError> {
    match ROOTHUB_HANDLER.get() {
        Some(handler) => handler(hcd, transfer),
        None => Err(UsbError::Unsupported),
    }
}

/// Port-change notification from a driver's worker.
///
/// Reads the driver's port-change bitmap and, if it is nonzero and the hub
/// has a pending status transfer, copies the bitmap into its buffer and
/// completes it.
pub fn port_status_changed(hcd: &Hcd) {
    let status = (hcd.ops.roothub_status)(hcd);
    log::trace!("roothub port status {:#x}", status);
    if status == 0 {
        return;
    }

    let pending = hcd.roothub_status_transfer.lock();
    if let Some(transfer) = pending.as_ref() {
        if !transfer.is_complete() && !transfer.buffer().is_null() {
            let bytes = status.to_le_bytes();
            let len = transfer.size.min(bytes.len());
            unsafe {
                core::ptr::copy_nonoverlapping(bytes.as_ptr(), transfer.buffer(), len);
            }
            transfer.finish(Ok(transfer.size));
        }
    }
}
