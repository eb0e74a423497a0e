//! The two hardware schedules: the asynchronous ring and the periodic
//! frame list.
//!
//! Async QHs hang off a dummy head whose H bit is set; insertion is a
//! splice right after the head, removal stops the async schedule so the
//! controller cannot prefetch a stale horizontal pointer across the edit.
//! Periodic QHs are placed by band allocation (least-loaded phase, then
//! least-loaded microframe for whole-frame high-speed periods) and chained
//! per slot in descending period order.

use core::alloc::Layout;

use alloc::vec;
use alloc::vec::Vec;
use volatile::Volatile;

use usb_host::mem::DmaBlock;
use usb_host::UsbError;

use crate::desc::{
    qh_link, DescArena, QhId, QhInfo1, CMASK_DEFAULT, QH_PTR_INVALID, SMASK_ALL,
};
use crate::regs::mem_dmb;
use crate::{wait_until, Ehci, EHCI_PERIODIC_SIZE};

/// Hardware frame list: one link pointer per frame slot, aligned to its
/// own byte size.
#[repr(C)]
pub(crate) struct FrameList {
    pub slots: [Volatile<u32>; EHCI_PERIODIC_SIZE],
}

/// Frame list plus the owner array mapping each slot to its head QH.
/// Protected by the periodic lock.
pub(crate) struct PeriodicState {
    pub list: DmaBlock<FrameList>,
    pub nodes: Vec<Option<QhId>>,
}

impl PeriodicState {
    pub(crate) fn new() -> Result<Self, UsbError> {
        let bytes = EHCI_PERIODIC_SIZE * core::mem::size_of::<u32>();
        let layout =
            Layout::from_size_align(bytes, bytes).map_err(|_| UsbError::InvalidConfiguration)?;
        let mut list = DmaBlock::<FrameList>::with_layout(layout)?;
        for slot in list.slots.iter_mut() {
            slot.write(QH_PTR_INVALID);
        }
        Ok(Self {
            list,
            nodes: vec![None; EHCI_PERIODIC_SIZE],
        })
    }
}

impl Ehci {
    /// Point the controller at the async ring and run it.
    pub(crate) fn start_async(&self, arena: &DescArena) -> Result<(), UsbError> {
        let head = arena.async_head.ok_or(UsbError::InvalidConfiguration)?;
        self.regs.write_async_list_addr(arena.qh(head)?.paddr);
        self.regs.update_command(|cmd| cmd.set_async_enable(true));
        mem_dmb();
        wait_until!(1, 100, self.regs.status().async_running())
    }

    pub(crate) fn stop_async(&self) -> Result<(), UsbError> {
        self.regs.update_command(|cmd| cmd.set_async_enable(false));
        mem_dmb();
        wait_until!(1, 100, !self.regs.status().async_running())
    }

    /// Insert a QH right after the dummy head of the async ring.
    pub(crate) fn link_async(&self, qh: QhId) -> Result<(), UsbError> {
        let mut arena = self.asyn.lock();
        let arena = &mut *arena;
        let head = arena.async_head.ok_or(UsbError::InvalidConfiguration)?;

        let old_next = arena.qh(head)?.next;
        {
            let new = arena.qh_mut(qh)?;
            new.next = old_next;
            new.prev = Some(head);
        }
        if let Some(next) = old_next {
            arena.qh_mut(next)?.prev = Some(qh);
        }
        arena.qh_mut(head)?.next = Some(qh);

        let head_horizontal = arena.qh(head)?.hw.horizontal.read();
        arena.qh_mut(qh)?.hw.horizontal.write(head_horizontal);
        let qh_paddr = arena.qh(qh)?.paddr;
        arena.qh_mut(head)?.hw.horizontal.write(qh_link(qh_paddr));
        mem_dmb();
        Ok(())
    }

    /// Unlink a QH from the async ring.
    ///
    /// The schedule is stopped across the horizontal-pointer rewrite and
    /// restarted afterwards, so the controller observes a consistent ring.
    pub(crate) fn unlink_async(&self, qh: QhId) -> Result<(), UsbError> {
        let mut arena = self.asyn.lock();
        let arena = &mut *arena;

        self.stop_async()?;
        let horizontal = arena.qh(qh)?.hw.horizontal.read();
        if let Some(prev) = arena.qh(qh)?.prev {
            arena.qh_mut(prev)?.hw.horizontal.write(horizontal);
        }
        self.start_async(arena)?;
        mem_dmb();

        let (prev, next) = {
            let victim = arena.qh(qh)?;
            (victim.prev, victim.next)
        };
        if let Some(prev) = prev {
            arena.qh_mut(prev)?.next = next;
        }
        if let Some(next) = next {
            arena.qh_mut(next)?.prev = prev;
        }
        let victim = arena.qh_mut(qh)?;
        victim.next = None;
        victim.prev = None;
        Ok(())
    }

    /// Choose the least-loaded phase for a QH's period, and for high-speed
    /// QHs with whole-frame periods the least-loaded microframe at that
    /// phase.
    fn band_alloc(
        &self,
        arena: &DescArena,
        periodic: &PeriodicState,
        qh: QhId,
    ) -> Result<(usize, Option<u8>), UsbError> {
        let record = arena.qh(qh)?;

        let mut best = usize::MAX;
        let mut phase = 0;
        for candidate in 0..(record.period as usize).min(EHCI_PERIODIC_SIZE) {
            let mut count = 0;
            let mut node = periodic.nodes[candidate];
            while let Some(id) = node {
                count += 1;
                node = arena.qh(id)?.next;
            }
            if count < best {
                best = count;
                phase = candidate;
            }
        }

        let high_speed = record.hw.info0.read().speed().value() == 2;
        let mut uframe = None;
        // Sub-frame periods get every microframe; whole-frame periods get
        // the single least-populated one.
        if high_speed && record.uframes >= 8 {
            let mut census = [0usize; 8];
            let mut node = periodic.nodes[phase];
            while let Some(id) = node {
                let sibling = arena.qh(id)?;
                if let Some(u) = sibling.uframe {
                    census[u as usize] += 1;
                }
                node = sibling.next;
            }
            let mut best = usize::MAX;
            let mut elected = 0u8;
            for (i, &count) in census.iter().enumerate() {
                if count < best {
                    best = count;
                    elected = i as u8;
                }
            }
            uframe = Some(elected);
        }
        Ok((phase, uframe))
    }

    /// Link a QH into the periodic schedule at its elected phase, keeping
    /// each slot chain ordered by strictly descending period.
    pub(crate) fn link_periodic(&self, qh: QhId) -> Result<(), UsbError> {
        let mut arena = self.asyn.lock();
        let arena = &mut *arena;
        let mut periodic = self.periodic.lock();
        let periodic = &mut *periodic;

        let (phase, uframe) = self.band_alloc(arena, periodic, qh)?;
        {
            let record = arena.qh_mut(qh)?;
            record.phase = phase;
            record.uframe = uframe;
            let mut info1 = QhInfo1::from(0);
            info1.set_smask(match uframe {
                Some(u) => 1 << u,
                None => SMASK_ALL,
            });
            info1.set_cmask(CMASK_DEFAULT);
            // TODO: compute split-transaction S/C masks for FS/LS
            // endpoints behind a high-speed hub
            record.hw.info1.write(info1);
        }

        let period = arena.qh(qh)?.period;

        // Find the insertion point: the last chain entry whose successor
        // still has a period no smaller than ours.
        let mut cursor = periodic.nodes[phase];
        while let Some(current) = cursor {
            match arena.qh(current)?.next {
                Some(next) if arena.qh(next)?.period >= period => cursor = Some(next),
                _ => break,
            }
        }

        let becomes_head = match cursor {
            None => true,
            Some(current) => arena.qh(current)?.period < period,
        };

        if becomes_head {
            let old_head = periodic.nodes[phase];
            arena.qh_mut(qh)?.next = old_head;
            let horizontal = match old_head {
                Some(next) => qh_link(arena.qh(next)?.paddr),
                None => QH_PTR_INVALID,
            };
            arena.qh_mut(qh)?.hw.horizontal.write(horizontal);

            let paddr = arena.qh(qh)?.paddr;
            let mut slot = phase;
            while slot < EHCI_PERIODIC_SIZE {
                periodic.nodes[slot] = Some(qh);
                periodic.list.slots[slot].write(qh_link(paddr));
                slot += period as usize;
            }
        } else {
            let before = match cursor {
                Some(id) => id,
                None => return Err(UsbError::InvalidConfiguration),
            };
            let after = arena.qh(before)?.next;
            arena.qh_mut(qh)?.next = after;
            arena.qh_mut(before)?.next = Some(qh);

            let horizontal = match after {
                Some(next) => qh_link(arena.qh(next)?.paddr),
                None => QH_PTR_INVALID,
            };
            arena.qh_mut(qh)?.hw.horizontal.write(horizontal);
            let qh_paddr = arena.qh(qh)?.paddr;
            arena.qh_mut(before)?.hw.horizontal.write(qh_link(qh_paddr));
        }
        mem_dmb();
        Ok(())
    }

    /// Unlink a QH from every periodic slot it appears in, as head or
    /// mid-chain.
    pub(crate) fn unlink_periodic(&self, qh: QhId) -> Result<(), UsbError> {
        let mut arena = self.asyn.lock();
        let arena = &mut *arena;
        let mut periodic = self.periodic.lock();
        let periodic = &mut *periodic;

        let successor = arena.qh(qh)?.next;
        for slot in 0..EHCI_PERIODIC_SIZE {
            if periodic.nodes[slot] == Some(qh) {
                match successor {
                    Some(next) => {
                        let paddr = arena.qh(next)?.paddr;
                        periodic.list.slots[slot].write(qh_link(paddr));
                    }
                    None => periodic.list.slots[slot].write(QH_PTR_INVALID),
                }
                periodic.nodes[slot] = successor;
            } else {
                let mut cursor = periodic.nodes[slot];
                while let Some(current) = cursor {
                    if arena.qh(current)?.next == Some(qh) {
                        break;
                    }
                    cursor = arena.qh(current)?.next;
                }
                if let Some(prev) = cursor {
                    arena.qh_mut(prev)?.next = successor;
                    let horizontal = match successor {
                        Some(next) => qh_link(arena.qh(next)?.paddr),
                        None => QH_PTR_INVALID,
                    };
                    arena.qh_mut(prev)?.hw.horizontal.write(horizontal);
                }
            }
        }
        mem_dmb();

        let victim = arena.qh_mut(qh)?;
        victim.next = None;
        Ok(())
    }
}
