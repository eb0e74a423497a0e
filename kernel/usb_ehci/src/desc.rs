//! Hardware descriptors (qTD, QH), their pools, and the qTD builder.
//!
//! Driver records live in slab arenas addressed by copyable ids; the
//! hardware blocks they own live in DMA-coherent memory. All rings are
//! id-linked so the cyclic structure never owns itself through pointers:
//! a transfer's qTDs form a circular doubly-linked ring, async-list QHs a
//! circular ring through the dummy head, periodic chains a singly-linked
//! list per frame slot.
//!
//! [`DescArena`] (both slabs, both free pools, the async head) is the
//! state the async lock protects; every method here expects to be called
//! with that lock held.

use alloc::collections::VecDeque;
use alloc::vec::Vec;
use bilge::prelude::*;
use volatile::Volatile;

use usb_host::mem::DmaBlock;
use usb_host::pipe::{UsbPipe, UsbSpeed};
use usb_host::platform;
use usb_host::transfer::TransferType;
use usb_host::UsbError;

use crate::{
    EHCI_MAX_QH_POOL, EHCI_MAX_QTD_POOL, EHCI_PAGE_SIZE, EHCI_QH_NBUFS, EHCI_TRANS_ERRORS,
};

/// T-bit sentinel: no next descriptor.
pub(crate) const QTD_PTR_INVALID: u32 = 1;
pub(crate) const QH_PTR_INVALID: u32 = 1;

/// Horizontal link to a queue head (type field = 01).
pub(crate) fn qh_link(paddr: u32) -> u32 {
    (paddr & !0x1f) | (1 << 1)
}

/// S-mask selecting every microframe.
pub(crate) const SMASK_ALL: u8 = 0xff;
/// Standard completion-split pattern (microframes 2..=4).
pub(crate) const CMASK_DEFAULT: u8 = 0x1c;

#[bitsize(2)]
#[derive(Debug, Copy, Clone, FromBits, PartialEq, Eq)]
pub(crate) enum Pid {
    Out = 0,
    In = 1,
    Setup = 2,
    Reserved = 3,
}

#[bitsize(32)]
#[derive(DebugBits, Copy, Clone, FromBits, PartialEq)]
pub(crate) struct QtdToken {
    pub ping: bool,
    pub split_state: bool,
    pub missed_uframe: bool,
    pub xact_err: bool,
    pub babble: bool,
    pub buffer_err: bool,
    pub halted: bool,
    pub active: bool,
    pub pid: Pid,
    pub cerr: u2,
    pub c_page: u3,
    pub ioc: bool,
    pub total_bytes: u15,
    pub data_toggle: bool,
}

impl QtdToken {
    /// Transaction-level fault, as counted by the reaper.
    pub(crate) fn has_error(&self) -> bool {
        self.xact_err() || self.babble() || self.buffer_err() || self.halted()
    }

    /// Clear the low status bits so a halted endpoint queue can resume.
    pub(crate) fn clear_status(&mut self) {
        self.set_split_state(false);
        self.set_missed_uframe(false);
        self.set_xact_err(false);
        self.set_babble(false);
        self.set_buffer_err(false);
        self.set_halted(false);
    }
}

/// QH endpoint characteristics (info word 0).
#[bitsize(32)]
#[derive(DebugBits, Copy, Clone, FromBits)]
pub(crate) struct QhInfo0 {
    pub device_address: u7,
    pub inactivate: bool,
    pub endpoint: u4,
    pub speed: u2,
    /// Data toggle taken from qTD tokens rather than the overlay.
    pub dtc: bool,
    /// Head of the reclamation list; set on the dummy head only.
    pub head: bool,
    pub max_packet_len: u11,
    /// Control endpoint below high speed.
    pub control_endpoint: bool,
    pub nak_reload: u4,
}

/// QH microframe schedule control (info word 1).
#[bitsize(32)]
#[derive(DebugBits, Copy, Clone, FromBits)]
pub(crate) struct QhInfo1 {
    pub smask: u8,
    pub cmask: u8,
    pub hub_addr: u7,
    pub port: u7,
    pub mult: u2,
}

/// Queue element transfer descriptor, hardware layout.
#[repr(C, align(32))]
pub(crate) struct QtdHw {
    pub next: Volatile<u32>,
    pub alt_next: Volatile<u32>,
    pub token: Volatile<QtdToken>,
    pub buf: [Volatile<u32>; EHCI_QH_NBUFS],
    pub buf_hi: [Volatile<u32>; EHCI_QH_NBUFS],
}

/// Queue head, hardware layout: static words plus the transfer overlay
/// the controller maintains while executing.
#[repr(C, align(32))]
pub(crate) struct QhHw {
    pub horizontal: Volatile<u32>,
    pub info0: Volatile<QhInfo0>,
    pub info1: Volatile<QhInfo1>,
    pub current: Volatile<u32>,
    // overlay
    pub next_qtd: Volatile<u32>,
    pub alt_next_qtd: Volatile<u32>,
    pub token: Volatile<QtdToken>,
    pub buf: [Volatile<u32>; EHCI_QH_NBUFS],
    pub buf_hi: [Volatile<u32>; EHCI_QH_NBUFS],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QtdId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QhId(pub(crate) usize);

/// Driver record for one qTD.
pub(crate) struct Qtd {
    pub hw: DmaBlock<QtdHw>,
    /// Cached bus address of `hw`.
    pub paddr: u32,
    /// Circular transfer-ring siblings.
    pub next: QtdId,
    pub prev: QtdId,
    /// Queue head this qTD is pending on, while in flight.
    pub qh: Option<QhId>,
}

/// Driver record for one QH.
pub(crate) struct Qh {
    pub hw: DmaBlock<QhHw>,
    pub paddr: u32,
    /// Schedule siblings: circular on the async ring, chain on a periodic
    /// slot.
    pub next: Option<QhId>,
    pub prev: Option<QhId>,
    /// Last qTD queued on this endpoint; the driver-side tail cursor, kept
    /// apart from the hardware-owned overlay.
    pub last_qtd: Option<QtdId>,
    /// Polling period in frames (interrupt pipes).
    pub period: u32,
    /// Raw high-speed period in microframes (2^(bInterval-1)); sub-frame
    /// values select the every-microframe S-mask.
    pub uframes: u32,
    /// Elected frame-list phase.
    pub phase: usize,
    /// Elected microframe, when a single one is used.
    pub uframe: Option<u8>,
}

pub(crate) struct Slab<T> {
    slots: Vec<Option<T>>,
    free: Vec<usize>,
}

impl<T> Slab<T> {
    pub(crate) const fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }

    fn insert(&mut self, value: T) -> usize {
        match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(value);
                index
            }
            None => {
                self.slots.push(Some(value));
                self.slots.len() - 1
            }
        }
    }

    fn remove(&mut self, index: usize) -> Option<T> {
        let value = self.slots.get_mut(index)?.take();
        if value.is_some() {
            self.free.push(index);
        }
        value
    }

    fn get(&self, index: usize) -> Option<&T> {
        self.slots.get(index)?.as_ref()
    }

    fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.slots.get_mut(index)?.as_mut()
    }

    pub(crate) fn occupied(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (usize, &T)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|value| (index, value)))
    }
}

/// Descriptor arena: live records, capped free pools, and the async head.
/// Protected by the async lock as a whole.
pub(crate) struct DescArena {
    pub(crate) qtds: Slab<Qtd>,
    pub(crate) qhs: Slab<Qh>,
    qtd_pool: VecDeque<QtdId>,
    qh_pool: VecDeque<QhId>,
    pub(crate) async_head: Option<QhId>,
}

impl DescArena {
    pub(crate) const fn new() -> Self {
        Self {
            qtds: Slab::new(),
            qhs: Slab::new(),
            qtd_pool: VecDeque::new(),
            qh_pool: VecDeque::new(),
            async_head: None,
        }
    }

    pub(crate) fn qtd(&self, id: QtdId) -> Result<&Qtd, UsbError> {
        self.qtds.get(id.0).ok_or(UsbError::InvalidConfiguration)
    }

    pub(crate) fn qtd_mut(&mut self, id: QtdId) -> Result<&mut Qtd, UsbError> {
        self.qtds.get_mut(id.0).ok_or(UsbError::InvalidConfiguration)
    }

    pub(crate) fn qh(&self, id: QhId) -> Result<&Qh, UsbError> {
        self.qhs.get(id.0).ok_or(UsbError::InvalidConfiguration)
    }

    pub(crate) fn qh_mut(&mut self, id: QhId) -> Result<&mut Qh, UsbError> {
        self.qhs.get_mut(id.0).ok_or(UsbError::InvalidConfiguration)
    }

    /// Number of pooled (idle) qTDs.
    pub(crate) fn nqtds(&self) -> usize {
        self.qtd_pool.len()
    }

    /// Number of pooled (idle) QHs.
    pub(crate) fn nqhs(&self) -> usize {
        self.qh_pool.len()
    }

    /// Build one qTD covering up to five buffer pages, per EHCI 4.10.6.
    ///
    /// Consumes from `size`: the tail of the first page, then whole pages.
    /// If the fifth buffer still would not exhaust `size`, the byte count
    /// is truncated down to a whole multiple of `max_packet`, so a
    /// ring-internal qTD can never present a short packet to the device.
    pub(crate) fn qtd_alloc(
        &mut self,
        pid: Pid,
        max_packet: usize,
        data: Option<*mut u8>,
        size: &mut usize,
        data_toggle: bool,
    ) -> Result<QtdId, UsbError> {
        let id = match self.qtd_pool.pop_front() {
            Some(id) => id,
            None => {
                let hw: DmaBlock<QtdHw> = DmaBlock::new()?;
                let paddr = hw.paddr();
                let index = self.qtds.insert(Qtd {
                    hw,
                    paddr,
                    next: QtdId(0),
                    prev: QtdId(0),
                    qh: None,
                });
                let id = QtdId(index);
                let qtd = self.qtd_mut(id)?;
                qtd.next = id;
                qtd.prev = id;
                id
            }
        };

        let plat = platform::get()?;
        let qtd = self.qtd_mut(id)?;

        let mut token = QtdToken::from(0);
        token.set_data_toggle(data_toggle);
        token.set_pid(pid);
        token.set_cerr(u2::new(EHCI_TRANS_ERRORS));
        token.set_active(true);
        qtd.hw.token.write(token);
        qtd.hw.next.write(QTD_PTR_INVALID);
        qtd.hw.alt_next.write(QTD_PTR_INVALID);

        match data {
            Some(mut buf) => {
                let paddr0 = plat.virt_to_phys(buf as *const u8);
                qtd.hw.buf[0].write(paddr0);
                qtd.hw.buf_hi[0].write(0);

                let mut bytes = 0;
                let mut offs = (EHCI_PAGE_SIZE - (paddr0 as usize & (EHCI_PAGE_SIZE - 1)))
                    .min(*size);
                bytes += offs;
                buf = buf.wrapping_add(offs);

                let mut i = 1;
                while i < EHCI_QH_NBUFS && bytes != *size {
                    qtd.hw.buf[i].write(plat.virt_to_phys(buf as *const u8) & !0xfff);
                    qtd.hw.buf_hi[i].write(0);

                    offs = (*size - bytes).min(EHCI_PAGE_SIZE);
                    if i == EHCI_QH_NBUFS - 1 && bytes + offs < *size {
                        offs = (((bytes + offs) / max_packet) * max_packet) - bytes;
                    }
                    bytes += offs;
                    buf = buf.wrapping_add(offs);
                    i += 1;
                }
                while i < EHCI_QH_NBUFS {
                    qtd.hw.buf[i].write(0);
                    qtd.hw.buf_hi[i].write(0);
                    i += 1;
                }

                let mut token = qtd.hw.token.read();
                token.set_total_bytes(u15::new(bytes as u16));
                qtd.hw.token.write(token);
                *size -= bytes;
            }
            None => {
                for i in 0..EHCI_QH_NBUFS {
                    qtd.hw.buf[i].write(0);
                    qtd.hw.buf_hi[i].write(0);
                }
            }
        }

        Ok(id)
    }

    /// Append qTDs to `ring` until `size` bytes are covered, flipping the
    /// data toggle after each. Runs at least once, so zero-length stages
    /// still produce their qTD.
    pub(crate) fn qtd_add(
        &mut self,
        ring: &mut Option<QtdId>,
        pid: Pid,
        max_packet: usize,
        buf: Option<*mut u8>,
        size: usize,
        mut data_toggle: bool,
    ) -> Result<(), UsbError> {
        let mut remaining = size;
        loop {
            let data = buf.map(|b| b.wrapping_add(size - remaining));
            let id = self.qtd_alloc(pid, max_packet, data, &mut remaining, data_toggle)?;
            self.ring_add(ring, id)?;
            data_toggle = !data_toggle;
            if remaining == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Splice `id` in front of `ring`'s head (circular doubly-linked).
    fn ring_add(&mut self, ring: &mut Option<QtdId>, id: QtdId) -> Result<(), UsbError> {
        match *ring {
            None => {
                let qtd = self.qtd_mut(id)?;
                qtd.next = id;
                qtd.prev = id;
                *ring = Some(id);
            }
            Some(head) => {
                let tail = self.qtd(head)?.prev;
                {
                    let qtd = self.qtd_mut(id)?;
                    qtd.next = head;
                    qtd.prev = tail;
                }
                self.qtd_mut(tail)?.next = id;
                self.qtd_mut(head)?.prev = id;
            }
        }
        Ok(())
    }

    /// Return a whole transfer ring to the pool. Pool overflow destroys
    /// the oldest pooled descriptor first.
    pub(crate) fn qtds_put(&mut self, first: QtdId) -> Result<(), UsbError> {
        let mut ids = Vec::new();
        let mut id = first;
        loop {
            ids.push(id);
            id = self.qtd(id)?.next;
            if id == first {
                break;
            }
        }

        for id in ids {
            {
                let qtd = self.qtd_mut(id)?;
                qtd.qh = None;
                qtd.next = id;
                qtd.prev = id;
            }
            if self.qtd_pool.len() >= EHCI_MAX_QTD_POOL {
                if let Some(oldest) = self.qtd_pool.pop_back() {
                    self.qtds.remove(oldest.0);
                }
            }
            self.qtd_pool.push_front(id);
        }
        Ok(())
    }

    /// Take a QH from the pool or create one; all hardware-visible fields
    /// come back invalid/zeroed.
    pub(crate) fn qh_alloc(&mut self) -> Result<QhId, UsbError> {
        let id = match self.qh_pool.pop_front() {
            Some(id) => id,
            None => {
                let hw: DmaBlock<QhHw> = DmaBlock::new()?;
                let paddr = hw.paddr();
                QhId(self.qhs.insert(Qh {
                    hw,
                    paddr,
                    next: None,
                    prev: None,
                    last_qtd: None,
                    period: 0,
                    uframes: 0,
                    phase: 0,
                    uframe: None,
                }))
            }
        };

        let qh = self.qh_mut(id)?;
        qh.hw.info0.write(QhInfo0::from(0));
        qh.hw.info1.write(QhInfo1::from(0));
        qh.hw.token.write(QtdToken::from(0));
        qh.hw.horizontal.write(QH_PTR_INVALID);
        qh.hw.current.write(QTD_PTR_INVALID);
        qh.hw.next_qtd.write(QTD_PTR_INVALID);
        qh.hw.alt_next_qtd.write(QTD_PTR_INVALID);
        for i in 0..EHCI_QH_NBUFS {
            qh.hw.buf[i].write(0);
            qh.hw.buf_hi[i].write(0);
        }
        qh.next = None;
        qh.prev = None;
        qh.last_qtd = None;
        qh.period = 0;
        qh.uframes = 0;
        qh.phase = 0;
        qh.uframe = None;
        Ok(id)
    }

    pub(crate) fn qh_put(&mut self, id: QhId) {
        if self.qh_pool.len() >= EHCI_MAX_QH_POOL {
            if let Some(oldest) = self.qh_pool.pop_back() {
                self.qhs.remove(oldest.0);
            }
        }
        self.qh_pool.push_front(id);
    }

    /// First-use endpoint configuration of a QH.
    pub(crate) fn qh_conf(&mut self, id: QhId, pipe: &UsbPipe) -> Result<(), UsbError> {
        let speed = pipe.dev.speed;
        let address = pipe.dev.address();
        let max_packet = pipe.max_packet_len();

        let qh = self.qh_mut(id)?;
        let mut info = QhInfo0::from(0);
        info.set_device_address(u7::new(address & 0x7f));
        info.set_endpoint(u4::new(pipe.num & 0xf));
        info.set_speed(u2::new(speed as u8));
        // control endpoints take the data toggle from qTD tokens
        info.set_dtc(pipe.kind == TransferType::Control);
        info.set_max_packet_len(u11::new(max_packet.min(0x400)));
        if pipe.kind == TransferType::Control && speed != UsbSpeed::High {
            info.set_control_endpoint(true);
        }
        info.set_nak_reload(u4::new(3));
        qh.hw.info0.write(info);
        qh.hw.info1.write(QhInfo1::from(0));

        if pipe.kind == TransferType::Interrupt {
            if speed == UsbSpeed::High {
                // bInterval is log2-encoded in microframes, valid 1..=16
                qh.uframes = 1 << (pipe.interval.clamp(1, 16) - 1);
                qh.period = (qh.uframes >> 3).max(1);
            } else {
                qh.uframes = 0;
                let mut period = 1;
                while period * 2 < pipe.interval as u32 {
                    period *= 2;
                }
                qh.period = period;
            }
        }
        Ok(())
    }

    /// Rewrite only the address and packet-size fields that may drift
    /// between submissions on the same pipe.
    pub(crate) fn qh_refresh(&mut self, id: QhId, pipe: &UsbPipe) -> Result<(), UsbError> {
        let address = pipe.dev.address();
        let max_packet = pipe.max_packet_len();
        let qh = self.qh_mut(id)?;
        let mut info = qh.hw.info0.read();
        let mut changed = false;
        if info.device_address().value() != address {
            info.set_device_address(u7::new(address & 0x7f));
            changed = true;
        }
        if info.max_packet_len().value() != max_packet {
            info.set_max_packet_len(u11::new(max_packet.min(0x400)));
            changed = true;
        }
        if changed {
            qh.hw.info0.write(info);
        }
        Ok(())
    }
}
