//! Memory-mapped EHCI capability and operational registers.

use core::ptr::NonNull;

use bilge::prelude::*;
use volatile::{ReadOnly, Volatile};

// USBSTS bits as raw masks, for the interrupt-status accumulator.
pub(crate) const USBSTS_UI: u32 = 1 << 0;
pub(crate) const USBSTS_UEI: u32 = 1 << 1;
pub(crate) const USBSTS_PCI: u32 = 1 << 2;
pub(crate) const USBSTS_FRI: u32 = 1 << 3;
pub(crate) const USBSTS_SEI: u32 = 1 << 4;
pub(crate) const USBSTS_IAA: u32 = 1 << 5;

/// Interrupt sources the driver consumes.
pub(crate) const EHCI_INTRMASK: u32 =
    USBSTS_UI | USBSTS_UEI | USBSTS_PCI | USBSTS_SEI | USBSTS_IAA;

#[cfg(feature = "imx")]
const IMX_CAP_OFFSET: usize = 0x100;
#[cfg(feature = "imx")]
const IMX_OP_OFFSET: usize = 0x140;

#[bitsize(32)]
#[derive(DebugBits, Copy, Clone, FromBits)]
pub(crate) struct UsbCmd {
    pub run_stop: bool,
    pub reset: bool,
    pub frame_list_size: u2,
    pub periodic_enable: bool,
    pub async_enable: bool,
    pub iaa_doorbell: bool,
    pub light_reset: bool,
    pub park_count: u2,
    reserved: u1,
    pub park_enable: bool,
    reserved: u4,
    pub int_threshold: u8,
    reserved: u8,
}

#[bitsize(32)]
#[derive(DebugBits, Copy, Clone, FromBits)]
pub(crate) struct UsbSts {
    pub usb_int: bool,
    pub usb_error_int: bool,
    pub port_change: bool,
    pub frame_rollover: bool,
    pub system_error: bool,
    pub async_advance: bool,
    reserved: u6,
    pub halted: bool,
    pub reclamation: bool,
    pub periodic_running: bool,
    pub async_running: bool,
    reserved: u16,
}

#[bitsize(32)]
#[derive(DebugBits, Copy, Clone, FromBits)]
pub(crate) struct UsbIntr {
    pub usb_int: bool,
    pub usb_error_int: bool,
    pub port_change: bool,
    pub frame_rollover: bool,
    pub system_error: bool,
    pub async_advance: bool,
    reserved: u26,
}

#[bitsize(32)]
#[derive(DebugBits, Copy, Clone, FromBits)]
pub(crate) struct HcsParams {
    pub n_ports: u4,
    pub port_power_control: bool,
    reserved: u2,
    pub port_routing_rules: bool,
    pub ports_per_companion: u4,
    pub n_companions: u4,
    pub port_indicators: bool,
    reserved: u3,
    pub debug_port: u4,
    reserved: u8,
}

#[bitsize(32)]
#[derive(DebugBits, Copy, Clone, FromBits)]
pub(crate) struct HccParams {
    pub addr64: bool,
    pub programmable_frame_list: bool,
    pub async_park: bool,
    reserved: bool,
    pub iso_threshold: u4,
    pub ext_caps_ptr: u8,
    reserved: u16,
}

#[bitsize(32)]
#[derive(DebugBits, Copy, Clone, FromBits)]
pub(crate) struct PortSc {
    pub connected: bool,
    pub connect_change: bool,
    pub enabled: bool,
    pub enable_change: bool,
    pub overcurrent: bool,
    pub overcurrent_change: bool,
    pub force_resume: bool,
    pub suspend: bool,
    pub reset: bool,
    reserved: u1,
    pub line_status: u2,
    pub powered: bool,
    pub owner: bool,
    pub indicator: u2,
    pub test: u4,
    pub wake_connect: bool,
    pub wake_disconnect: bool,
    pub wake_overcurrent: bool,
    reserved: u9,
}

#[repr(C)]
pub(crate) struct CapabilityRegisters {
    pub cap_length: ReadOnly<u8>,
    _reserved: u8,
    pub hci_version: ReadOnly<u16>,
    pub hcs_params: ReadOnly<HcsParams>,
    pub hcc_params: ReadOnly<HccParams>,
    // kept as two words so the field stays at its 0x0C offset
    pub hcsp_portroute: ReadOnly<[u32; 2]>,
}

#[repr(C)]
pub(crate) struct OperationRegisters {
    pub command: Volatile<UsbCmd>,
    pub status: Volatile<UsbSts>,
    pub intr: Volatile<UsbIntr>,
    pub frame_index: Volatile<u32>,
    pub ctrl_ds_segment: Volatile<u32>,
    pub periodic_list_base: Volatile<u32>,
    pub async_list_addr: Volatile<u32>,
    _reserved: [u32; 9],
    pub config_flag: Volatile<u32>,
    #[cfg(not(feature = "imx"))]
    pub ports: [Volatile<PortSc>; 16],
    #[cfg(feature = "imx")]
    pub ports: [Volatile<PortSc>; 8],
    #[cfg(feature = "imx")]
    pub otgsc: Volatile<u32>,
    #[cfg(feature = "imx")]
    pub usbmode: Volatile<u32>,
}

/// Data-memory barrier: orders descriptor and register writes against the
/// controller's next observation of them.
#[inline]
pub(crate) fn mem_dmb() {
    #[cfg(all(feature = "imx", any(target_arch = "arm", target_arch = "aarch64")))]
    unsafe {
        core::arch::asm!("dmb sy", options(nostack, preserves_flags));
    }
    #[cfg(not(all(feature = "imx", any(target_arch = "arm", target_arch = "aarch64"))))]
    core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
}

/// Handle over one controller's register file.
///
/// Register words are 32-bit and accessed volatilely; the ISR touches only
/// USBSTS while every other register is written under a driver lock.
pub(crate) struct EhciRegs {
    caps: NonNull<CapabilityRegisters>,
    op: NonNull<OperationRegisters>,
}

unsafe impl Send for EhciRegs {}
unsafe impl Sync for EhciRegs {}

impl EhciRegs {
    /// # Safety
    /// `base` must be the virtual address of an EHCI register file mapped
    /// uncached, valid for the controller's lifetime.
    #[cfg(not(feature = "imx"))]
    pub(crate) unsafe fn new(base: usize) -> Self {
        let caps = NonNull::new_unchecked(base as *mut CapabilityRegisters);
        // The operational registers follow the capability block.
        let op_offset = caps.as_ref().cap_length.read() as usize;
        Self {
            caps,
            op: NonNull::new_unchecked((base + op_offset) as *mut OperationRegisters),
        }
    }

    /// # Safety
    /// `base` must be the virtual address of the i.MX USB controller,
    /// mapped uncached, valid for the controller's lifetime. The distance
    /// to the register blocks is a known constant on this platform.
    #[cfg(feature = "imx")]
    pub(crate) unsafe fn new(base: usize) -> Self {
        Self {
            caps: NonNull::new_unchecked((base + IMX_CAP_OFFSET) as *mut CapabilityRegisters),
            op: NonNull::new_unchecked((base + IMX_OP_OFFSET) as *mut OperationRegisters),
        }
    }

    fn caps(&self) -> &CapabilityRegisters {
        unsafe { self.caps.as_ref() }
    }

    fn op(&self) -> &OperationRegisters {
        unsafe { self.op.as_ref() }
    }

    pub(crate) fn command(&self) -> UsbCmd {
        self.op().command.read()
    }

    pub(crate) fn update_command(&self, f: impl FnOnce(&mut UsbCmd)) {
        unsafe { (*self.op.as_ptr()).command.update(f) }
    }

    pub(crate) fn status(&self) -> UsbSts {
        self.op().status.read()
    }

    pub(crate) fn status_raw(&self) -> u32 {
        u32::from(self.status())
    }

    /// Write-one-to-clear acknowledge of USBSTS interrupt bits.
    pub(crate) fn write_status_raw(&self, value: u32) {
        unsafe { (*self.op.as_ptr()).status.write(UsbSts::from(value)) }
    }

    pub(crate) fn write_intr(&self, mask: u32) {
        unsafe { (*self.op.as_ptr()).intr.write(UsbIntr::from(mask)) }
    }

    #[cfg(not(feature = "imx"))]
    pub(crate) fn hcc_params(&self) -> HccParams {
        self.caps().hcc_params.read()
    }

    #[cfg(not(feature = "imx"))]
    pub(crate) fn write_ctrl_ds_segment(&self, value: u32) {
        unsafe { (*self.op.as_ptr()).ctrl_ds_segment.write(value) }
    }

    pub(crate) fn write_periodic_list_base(&self, paddr: u32) {
        unsafe { (*self.op.as_ptr()).periodic_list_base.write(paddr) }
    }

    pub(crate) fn async_list_addr(&self) -> u32 {
        self.op().async_list_addr.read()
    }

    pub(crate) fn write_async_list_addr(&self, paddr: u32) {
        unsafe { (*self.op.as_ptr()).async_list_addr.write(paddr) }
    }

    pub(crate) fn write_config_flag(&self, value: u32) {
        unsafe { (*self.op.as_ptr()).config_flag.write(value) }
    }

    /// i.MX deviation: register-level host/device mode select.
    #[cfg(feature = "imx")]
    pub(crate) fn set_host_mode(&self) {
        unsafe { (*self.op.as_ptr()).usbmode.update(|mode| *mode |= 3) }
    }

    pub(crate) fn n_ports(&self) -> usize {
        self.caps().hcs_params.read().n_ports().value() as usize
    }

    pub(crate) fn port(&self, index: usize) -> PortSc {
        self.op().ports[index].read()
    }

    pub(crate) fn port_count(&self) -> usize {
        self.n_ports().min(self.op().ports.len())
    }
}
