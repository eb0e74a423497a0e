//! Devices and endpoint pipes as the generic stack describes them.

use core::sync::atomic::{AtomicU16, AtomicU8, AtomicUsize, Ordering};

use alloc::sync::Arc;

use crate::transfer::{Direction, TransferType};
use crate::{DeviceAddress, MaxPacketSize};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UsbSpeed {
    /// 12 Mbps
    Full = 0,
    /// 1.5 Mbps
    Low = 1,
    /// 480 Mbps
    High = 2,
}

pub struct UsbDevice {
    /// Assigned during enumeration; address 0 until SET_ADDRESS completes.
    address: AtomicU8,
    pub speed: UsbSpeed,
    pub roothub: bool,
}

impl UsbDevice {
    pub fn new(address: DeviceAddress, speed: UsbSpeed) -> Self {
        Self {
            address: AtomicU8::new(address),
            speed,
            roothub: false,
        }
    }

    pub fn roothub(speed: UsbSpeed) -> Self {
        Self {
            address: AtomicU8::new(0),
            speed,
            roothub: true,
        }
    }

    pub fn address(&self) -> DeviceAddress {
        self.address.load(Ordering::Acquire)
    }

    pub fn set_address(&self, address: DeviceAddress) {
        self.address.store(address, Ordering::Release);
    }
}

/// One endpoint of one device, as targeted by submissions.
pub struct UsbPipe {
    pub dev: Arc<UsbDevice>,
    /// Endpoint number (0..=15).
    pub num: u8,
    pub kind: TransferType,
    pub direction: Direction,
    /// wMaxPacketSize; may be corrected after the device descriptor is read.
    max_packet_len: AtomicU16,
    /// bInterval from the endpoint descriptor (interrupt pipes).
    pub interval: u8,
    /// Driver-private slot: an arena-handle token owned by the
    /// host-controller driver (0 while the pipe has no queue head).
    pub hcdpriv: AtomicUsize,
}

impl UsbPipe {
    pub fn new(
        dev: Arc<UsbDevice>,
        num: u8,
        kind: TransferType,
        direction: Direction,
        max_packet_len: MaxPacketSize,
        interval: u8,
    ) -> Self {
        Self {
            dev,
            num,
            kind,
            direction,
            max_packet_len: AtomicU16::new(max_packet_len),
            interval,
            hcdpriv: AtomicUsize::new(0),
        }
    }

    pub fn max_packet_len(&self) -> MaxPacketSize {
        self.max_packet_len.load(Ordering::Acquire)
    }

    pub fn set_max_packet_len(&self, len: MaxPacketSize) {
        self.max_packet_len.store(len, Ordering::Release);
    }
}
