//! Generic USB host stack surface
//!
//! This crate carries the interfaces shared between the generic USB stack
//! and host-controller drivers:
//! - transfer and pipe descriptions handed down by the stack,
//! - the `hcd` driver registry and the `HcdOps` capability record,
//! - platform services (DMA, IRQ, worker tasks) the embedding system
//!   provides to drivers,
//! - the roothub surface drivers consume.
//!
//! Host-controller drivers (e.g. `usb_ehci`) register an `HcdOps` record
//! once at module load and are driven through it afterwards.

#![no_std]

extern crate alloc;

pub mod hcd;
pub mod hub;
pub mod mem;
pub mod pipe;
pub mod platform;
pub mod transfer;

/// USB device address as assigned during enumeration (0..=127).
pub type DeviceAddress = u8;

/// Endpoint maximum packet size in bytes.
pub type MaxPacketSize = u16;

/// Fault taxonomy shared by submission paths and transfer completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    /// Allocation of a descriptor or control block failed.
    OutOfMemory,
    /// Misconfigured hardware or request (unaligned register base,
    /// stage-less submission, stale descriptor handle).
    InvalidConfiguration,
    /// The operation is not implemented by this driver.
    Unsupported,
    /// A bounded wait on controller state expired.
    Timeout,
    /// Transaction-level faults (XACT, babble, buffer error, halt) were
    /// observed on a transfer's qTD ring; carries the fault count.
    Transaction(u8),
    /// USBSTS reported a host system error; the controller is halted.
    SystemError,
}
