//! Transfer submission, the completion reaper, cancellation and pipe
//! teardown.

use core::mem::size_of;
use core::sync::atomic::Ordering;

use alloc::sync::Arc;
use alloc::vec::Vec;

use usb_host::hcd::Hcd;
use usb_host::hub;
use usb_host::pipe::UsbPipe;
use usb_host::transfer::{Direction, SetupPacket, TransferStatus, TransferType, UsbTransfer};
use usb_host::UsbError;

use crate::desc::{Pid, QhId, QtdId, QTD_PTR_INVALID};
use crate::regs::mem_dmb;
use crate::{drv, Ehci};

/// First qTD of a transfer's ring, decoded from its driver-private slot.
pub(crate) fn chain(transfer: &UsbTransfer) -> Option<QtdId> {
    match transfer.hcdpriv.load(Ordering::Acquire) {
        0 => None,
        token => Some(QtdId(token - 1)),
    }
}

/// Queue head of a pipe, decoded from its driver-private slot.
pub(crate) fn pipe_qh(pipe: &UsbPipe) -> Option<QhId> {
    match pipe.hcdpriv.load(Ordering::Acquire) {
        0 => None,
        token => Some(QhId(token - 1)),
    }
}

impl Ehci {
    /// Hand a linked qTD ring to the endpoint queue: terminate it, set IOC
    /// on the last qTD, and append at the QH's tail cursor.
    pub(crate) fn enqueue(&self, qh: QhId, first: QtdId, last: QtdId) -> Result<(), UsbError> {
        let mut arena = self.asyn.lock();
        {
            let tail = arena.qtd_mut(last)?;
            tail.hw.next.write(QTD_PTR_INVALID);
            let mut token = tail.hw.token.read();
            token.set_ioc(true);
            tail.hw.token.write(token);
        }

        let first_paddr = arena.qtd(first)?.paddr;
        match arena.qh(qh)?.last_qtd {
            // no qtds pending on this endpoint
            None => arena.qh_mut(qh)?.hw.next_qtd.write(first_paddr),
            Some(tail) => arena.qtd_mut(tail)?.hw.next.write(first_paddr),
        }
        mem_dmb();

        arena.qh_mut(qh)?.last_qtd = Some(last);
        Ok(())
    }

    /// Re-home a QH's pending cursor after one of its transfers finished
    /// with `last` as its final qTD.
    pub(crate) fn continue_qh(&self, qh: QhId, last: QtdId) -> Result<(), UsbError> {
        let mut arena = self.asyn.lock();
        let arena = &mut *arena;
        let last_paddr = arena.qtd(last)?.paddr;
        let last_next = arena.qtd(last)?.hw.next.read();
        let record = arena.qh_mut(qh)?;

        // queue for this endpoint is now empty
        if record.last_qtd == Some(last) {
            record.last_qtd = None;
            record.hw.next_qtd.write(QTD_PTR_INVALID);
        }

        // The queue got stuck: the ring grew after the controller copied
        // the finished qtd into the overlay. Repair the link from the
        // finished qtd's original next pointer.
        if record.hw.next_qtd.read() == QTD_PTR_INVALID && record.hw.current.read() == last_paddr
        {
            record.hw.next_qtd.write(last_next);
        }

        // clean up the error state so the endpoint can resume
        let token = record.hw.token.read();
        if token.has_error() {
            record.hw.next_qtd.write(last_next);
            let mut token = token;
            token.clear_status();
            record.hw.token.write(token);
        }
        mem_dmb();
        Ok(())
    }

    /// Classify one in-flight transfer: `None` while still running,
    /// otherwise its terminal status.
    pub(crate) fn qtds_check(
        &self,
        transfer: &UsbTransfer,
    ) -> Result<Option<TransferStatus>, UsbError> {
        let first = match chain(transfer) {
            Some(id) => id,
            None => return Ok(None),
        };
        let arena = self.asyn.lock();

        let mut errors: u8 = 0;
        let mut id = first;
        loop {
            let qtd = arena.qtd(id)?;
            if qtd.hw.token.read().has_error() {
                errors = errors.saturating_add(1);
            }
            id = qtd.next;
            if id == first {
                break;
            }
        }

        if errors > 0 {
            return Ok(Some(Err(UsbError::Transaction(errors))));
        }

        let last = arena.qtd(first)?.prev;
        let last_token = arena.qtd(last)?.hw.token.read();
        if !last_token.active() || last_token.halted() {
            let remaining = last_token.total_bytes().value() as usize;
            return Ok(Some(Ok(transfer.size.saturating_sub(remaining))));
        }
        Ok(None)
    }

    /// The completion reaper: walk the in-flight list, retire every
    /// terminal transfer, return its descriptors and notify the submitter.
    ///
    /// The caller holds the transfer lock.
    pub(crate) fn trans_update(&self, transfers: &mut Vec<Arc<UsbTransfer>>) {
        let mut index = 0;
        while index < transfers.len() {
            let transfer = transfers[index].clone();
            let status = match self.qtds_check(&transfer) {
                Ok(Some(status)) => status,
                _ => {
                    index += 1;
                    continue;
                }
            };

            if let Some(first) = chain(&transfer) {
                let owner = {
                    let arena = self.asyn.lock();
                    arena.qtd(first).map(|qtd| (qtd.qh, qtd.prev)).ok()
                };
                if let Some((Some(qh), last)) = owner {
                    let _ = self.continue_qh(qh, last);
                }
                let mut arena = self.asyn.lock();
                let _ = arena.qtds_put(first);
            }

            transfer.hcdpriv.store(0, Ordering::Release);
            transfers.remove(index);
            transfer.finish(status);
        }
    }

    /// Clear the active bit on every qTD of a ring; the controller retires
    /// them naturally and the reaper then observes them as finished.
    pub(crate) fn qtds_deactivate(&self, first: QtdId) -> Result<(), UsbError> {
        let mut arena = self.asyn.lock();
        let mut id = first;
        loop {
            let qtd = arena.qtd_mut(id)?;
            let mut token = qtd.hw.token.read();
            token.set_active(false);
            qtd.hw.token.write(token);
            id = qtd.next;
            if id == first {
                break;
            }
        }
        mem_dmb();
        Ok(())
    }
}

pub(crate) fn ehci_transfer_enqueue(
    hcd: &Hcd,
    transfer: &Arc<UsbTransfer>,
    pipe: &Arc<UsbPipe>,
) -> Result<(), UsbError> {
    if hub::is_roothub(&pipe.dev) {
        return hub::roothub_request(hcd, transfer);
    }
    if transfer.kind == TransferType::Isochronous || pipe.kind == TransferType::Isochronous {
        return Err(UsbError::Unsupported);
    }

    let ehci = drv(hcd)?;
    if ehci.dead.load(Ordering::Acquire) {
        return Err(UsbError::SystemError);
    }

    // clamped to the 11-bit field limit, matching the QH encoding
    let max_packet = (pipe.max_packet_len() as usize).min(0x400);
    if max_packet == 0 {
        return Err(UsbError::InvalidConfiguration);
    }

    let qh = match pipe_qh(pipe) {
        None => {
            let qh = {
                let mut arena = ehci.asyn.lock();
                let qh = arena.qh_alloc()?;
                arena.qh_conf(qh, pipe)?;
                qh
            };
            pipe.hcdpriv.store(qh.0 + 1, Ordering::Release);
            match pipe.kind {
                TransferType::Control | TransferType::Bulk => ehci.link_async(qh)?,
                _ => ehci.link_periodic(qh)?,
            }
            qh
        }
        Some(qh) => {
            let mut arena = ehci.asyn.lock();
            arena.qh_refresh(qh, pipe)?;
            qh
        }
    };

    let pid = match transfer.direction {
        Direction::In => Pid::In,
        Direction::Out => Pid::Out,
    };

    let mut ring: Option<QtdId> = None;
    let built: Result<(), UsbError> = (|| {
        let mut arena = ehci.asyn.lock();

        // setup stage
        if transfer.kind == TransferType::Control {
            let setup = transfer.setup.as_ref().ok_or(UsbError::InvalidConfiguration)?;
            let setup_ptr = setup as *const SetupPacket as *mut u8;
            arena.qtd_add(
                &mut ring,
                Pid::Setup,
                max_packet,
                Some(setup_ptr),
                size_of::<SetupPacket>(),
                false,
            )?;
        }

        // data stage
        if (transfer.kind == TransferType::Control && transfer.size > 0)
            || transfer.kind == TransferType::Bulk
            || transfer.kind == TransferType::Interrupt
        {
            let data = if transfer.buffer().is_null() {
                None
            } else {
                Some(transfer.buffer())
            };
            arena.qtd_add(&mut ring, pid, max_packet, data, transfer.size, true)?;
        }

        // status stage, opposite direction
        if transfer.kind == TransferType::Control {
            let status_pid = if pid == Pid::In { Pid::Out } else { Pid::In };
            arena.qtd_add(&mut ring, status_pid, max_packet, None, 0, true)?;
        }
        Ok(())
    })();

    if let Err(err) = built {
        if let Some(first) = ring {
            let mut arena = ehci.asyn.lock();
            let _ = arena.qtds_put(first);
        }
        transfer.hcdpriv.store(0, Ordering::Release);
        return Err(err);
    }

    let first = ring.ok_or(UsbError::InvalidConfiguration)?;

    // Write the hardware ring and the owning-QH back references. The last
    // qtd's next pointer is overwritten at enqueue time.
    let last = {
        let mut arena = ehci.asyn.lock();
        let mut id = first;
        loop {
            let next = arena.qtd(id)?.next;
            let next_paddr = arena.qtd(next)?.paddr;
            let qtd = arena.qtd_mut(id)?;
            qtd.hw.next.write(next_paddr);
            qtd.qh = Some(qh);
            id = next;
            if id == first {
                break;
            }
        }
        mem_dmb();
        arena.qtd(first)?.prev
    };
    transfer.hcdpriv.store(first.0 + 1, Ordering::Release);

    let mut transfers = hcd.transfers.lock();
    transfers.push(transfer.clone());
    if let Err(err) = ehci.enqueue(qh, first, last) {
        transfers.pop();
        transfer.hcdpriv.store(0, Ordering::Release);
        let mut arena = ehci.asyn.lock();
        let _ = arena.qtds_put(first);
        return Err(err);
    }
    Ok(())
}

/// Cancel a transfer in place: deactivate its qTDs and re-run the reaper.
/// Idempotent; the queue head stays linked.
pub(crate) fn ehci_transfer_dequeue(hcd: &Hcd, transfer: &UsbTransfer) {
    let Ok(ehci) = drv(hcd) else { return };
    let mut transfers = hcd.transfers.lock();
    if let Some(first) = chain(transfer) {
        let _ = ehci.qtds_deactivate(first);
    }
    ehci.trans_update(&mut transfers);
}

/// Tear down a pipe: unlink its QH from its schedule, cancel what is in
/// flight on it, and release the QH to the pool.
pub(crate) fn ehci_pipe_destroy(hcd: &Hcd, pipe: &UsbPipe) {
    let Ok(ehci) = drv(hcd) else { return };
    let Some(qh) = pipe_qh(pipe) else { return };

    let unlinked = match pipe.kind {
        TransferType::Control | TransferType::Bulk => ehci.unlink_async(qh),
        TransferType::Interrupt => ehci.unlink_periodic(qh),
        TransferType::Isochronous => Ok(()),
    };
    if let Err(err) = unlinked {
        log::error!("ehci: queue head unlink failed: {:?}", err);
    }

    {
        let mut transfers = hcd.transfers.lock();
        for transfer in transfers.iter() {
            if let Some(first) = chain(transfer) {
                let owned = {
                    let arena = ehci.asyn.lock();
                    arena
                        .qtd(first)
                        .map(|qtd| qtd.qh == Some(qh))
                        .unwrap_or(false)
                };
                if owned {
                    let _ = ehci.qtds_deactivate(first);
                }
            }
        }
        ehci.trans_update(&mut transfers);
    }

    pipe.hcdpriv.store(0, Ordering::Release);
    let mut arena = ehci.asyn.lock();
    arena.qh_put(qh);
}

/// Roothub port-change bitmap: bit N+1 set when port N latched a change.
pub(crate) fn ehci_roothub_status(hcd: &Hcd) -> u32 {
    let Ok(ehci) = drv(hcd) else { return 0 };
    let mut status = 0;
    for index in 0..ehci.regs.port_count() {
        let port = ehci.regs.port(index);
        if port.connect_change() || port.enable_change() || port.overcurrent_change() {
            status |= 1 << (index + 1);
        }
    }
    status
}
