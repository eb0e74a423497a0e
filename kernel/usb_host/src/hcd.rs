//! Host-controller driver registry and per-controller state.
//!
//! Each driver exposes one [`HcdOps`] capability record and registers it
//! once at module load through [`hcd_register`]. The stack creates one
//! [`Hcd`] per discovered controller and drives it through the record.

use core::any::Any;

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::{Mutex, Once};

use crate::pipe::UsbPipe;
use crate::transfer::UsbTransfer;
use crate::UsbError;

/// Controller placement as discovered by the bus or board code.
pub struct HcdInfo {
    /// Physical base of the memory-mapped register file.
    pub base: usize,
    pub irq: u32,
}

/// The driver's operation table: a capability record of function values.
pub struct HcdOps {
    pub kind: &'static str,
    /// Bring the controller up.
    pub init: fn(&'static Hcd) -> Result<(), UsbError>,
    /// Submit a transfer on a pipe.
    pub transfer_enqueue: fn(&Hcd, &Arc<UsbTransfer>, &Arc<UsbPipe>) -> Result<(), UsbError>,
    /// Cancel a transfer in place.
    pub transfer_dequeue: fn(&Hcd, &UsbTransfer),
    /// Tear down a pipe's schedule state.
    pub pipe_destroy: fn(&Hcd, &UsbPipe),
    /// Current roothub port-change bitmap.
    pub roothub_status: fn(&Hcd) -> u32,
}

/// One host controller instance.
pub struct Hcd {
    pub info: HcdInfo,
    pub ops: &'static HcdOps,
    /// In-flight transfers. This mutex is the transfer lock; it is taken
    /// before any driver-internal lock when both are needed.
    pub transfers: Mutex<Vec<Arc<UsbTransfer>>>,
    /// Pending roothub interrupt (status) transfer, completed on port
    /// change notifications.
    pub roothub_status_transfer: Mutex<Option<Arc<UsbTransfer>>>,
    drvdata: Once<Box<dyn Any + Send + Sync>>,
}

impl Hcd {
    pub fn new(info: HcdInfo, ops: &'static HcdOps) -> Self {
        Self {
            info,
            ops,
            transfers: Mutex::new(Vec::new()),
            roothub_status_transfer: Mutex::new(None),
            drvdata: Once::new(),
        }
    }

    /// Install the driver's private state; later calls are ignored.
    pub fn set_drvdata(&self, data: Box<dyn Any + Send + Sync>) {
        self.drvdata.call_once(|| data);
    }

    pub fn drvdata<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.drvdata.get().and_then(|data| data.downcast_ref::<T>())
    }
}

static HCD_OPS: Mutex<Vec<&'static HcdOps>> = Mutex::new(Vec::new());

/// Driver registration entry point, invoked once per driver at module load.
pub fn hcd_register(ops: &'static HcdOps) {
    HCD_OPS.lock().push(ops);
}

/// Look up a registered driver by kind (e.g. `"ehci"`).
pub fn hcd_ops(kind: &str) -> Option<&'static HcdOps> {
    HCD_OPS.lock().iter().copied().find(|ops| ops.kind == kind)
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    fn nop_init(_: &'static Hcd) -> Result<(), UsbError> {
        Ok(())
    }
    fn nop_enqueue(_: &Hcd, _: &Arc<UsbTransfer>, _: &Arc<UsbPipe>) -> Result<(), UsbError> {
        Err(UsbError::Unsupported)
    }
    fn nop_dequeue(_: &Hcd, _: &UsbTransfer) {}
    fn nop_pipe_destroy(_: &Hcd, _: &UsbPipe) {}
    fn nop_roothub_status(_: &Hcd) -> u32 {
        0
    }

    static NOP_OPS: HcdOps = HcdOps {
        kind: "nop",
        init: nop_init,
        transfer_enqueue: nop_enqueue,
        transfer_dequeue: nop_dequeue,
        pipe_destroy: nop_pipe_destroy,
        roothub_status: nop_roothub_status,
    };

    #[test]
    fn registry_lookup_by_kind() {
        hcd_register(&NOP_OPS);
        assert!(hcd_ops("nop").is_some());
        assert!(hcd_ops("xhci").is_none());
    }

    #[test]
    fn drvdata_downcast() {
        let hcd = Hcd::new(HcdInfo { base: 0, irq: 0 }, &NOP_OPS);
        assert!(hcd.drvdata::<u32>().is_none());
        hcd.set_drvdata(Box::new(7u32));
        assert_eq!(hcd.drvdata::<u32>(), Some(&7));
        assert!(hcd.drvdata::<u64>().is_none());
    }
}
