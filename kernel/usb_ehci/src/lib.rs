//! EHCI (USB 2.0) host-controller driver.
//!
//! The driver manages the controller's hardware-visible schedules: it
//! builds DMA-visible qTD rings under endpoint queue heads, links them
//! into the asynchronous ring (control/bulk) or the periodic frame list
//! (interrupt), and reaps finished transfers when the completion
//! interrupt fires.
//!
//! Three actors share the driver state:
//! - the ISR top-half latches USBSTS into an accumulator and signals the
//!   worker; it never touches descriptor memory,
//! - the worker task classifies latched events and runs the reaper,
//! - client tasks submit, cancel and tear down through the registered
//!   [`HcdOps`] table.
//!
//! Lock order, outermost first: the HCD transfer lock, then the async
//! lock (descriptor arena, async ring, tail cursors, ASE stop/start),
//! then the periodic lock (frame list and owner array).

#![no_std]
#![allow(dead_code)]

extern crate alloc;

mod desc;
mod regs;
mod sched;
mod xfer;


use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use alloc::boxed::Box;
use alloc::sync::Arc;
#[cfg(feature = "imx")]
use bilge::prelude::*;
use spin::Mutex;

use usb_host::hcd::{hcd_register, Hcd, HcdOps};
use usb_host::hub;
use usb_host::platform::{self, IrqEvent};
use usb_host::UsbError;

use desc::{qh_link, DescArena, QhInfo0};
use regs::{
    EhciRegs, EHCI_INTRMASK, USBSTS_FRI, USBSTS_PCI, USBSTS_SEI, USBSTS_UEI, USBSTS_UI,
};
use sched::PeriodicState;

/// Periodic frame list slots; the embedded i.MX variant runs the short
/// list.
#[cfg(feature = "imx")]
pub const EHCI_PERIODIC_SIZE: usize = 128;
#[cfg(not(feature = "imx"))]
pub const EHCI_PERIODIC_SIZE: usize = 1024;

/// Worker task priority.
pub const EHCI_PRIO: u8 = 2;

/// Pool caps; surplus descriptors are destroyed, not cached.
pub const EHCI_MAX_QTD_POOL: usize = 64;
pub const EHCI_MAX_QH_POOL: usize = 16;

/// Buffer pointers per qTD.
pub const EHCI_QH_NBUFS: usize = 5;
pub const EHCI_PAGE_SIZE: usize = 4096;

/// Per-transaction error retry count programmed into every qTD.
pub const EHCI_TRANS_ERRORS: u8 = 3;

/// Bound on the ISR's stability rescan of USBSTS.
const ISR_RESCAN_LIMIT: usize = 8;

/// Bounded poll on a controller condition, in place of an unbounded spin.
macro_rules! wait_until {
    ($poll_ms:literal, $timeout_ms:literal, $cond:expr) => {{
        let mut waited: u64 = 0;
        loop {
            if $cond {
                break Ok(());
            }
            if waited >= $timeout_ms {
                log::error!("ehci: timeout waiting on controller state");
                break Err(usb_host::UsbError::Timeout);
            }
            usb_host::platform::get()?.sleep_ms($poll_ms);
            waited += $poll_ms;
        }
    }};
}
pub(crate) use wait_until;

/// Driver state, one per controller, installed as the HCD's private data.
pub(crate) struct Ehci {
    pub(crate) regs: EhciRegs,
    /// The async lock: descriptor arena, pools, async ring and tail
    /// cursors.
    pub(crate) asyn: Mutex<DescArena>,
    /// The periodic lock: frame list and owner array.
    pub(crate) periodic: Mutex<PeriodicState>,
    /// Interrupt-status accumulator; the ISR ORs into it, the worker
    /// clears only what it consumes.
    pub(crate) status: AtomicU32,
    pub(crate) event: Arc<dyn IrqEvent>,
    /// Latched on a host system error; the controller is not recovered.
    pub(crate) dead: AtomicBool,
}

impl Ehci {
    /// Assemble the driver state over a pre-allocated frame list and IRQ
    /// event. The first controller access happens here: the base is
    /// checked for 32-byte alignment and the operational-register file
    /// is located, so the PHY must already be up.
    fn new(
        base: usize,
        periodic: PeriodicState,
        event: Arc<dyn IrqEvent>,
    ) -> Result<Self, UsbError> {
        let mut arena = DescArena::new();

        // Dummy queue head keeping the async ring non-empty: H bit set,
        // horizontal pointer closed on itself.
        let head = arena.qh_alloc()?;
        {
            let qh = arena.qh_mut(head)?;
            let mut info = QhInfo0::from(0);
            info.set_head(true);
            qh.hw.info0.write(info);
            let link = qh_link(qh.paddr);
            qh.hw.horizontal.write(link);
            qh.next = Some(head);
            qh.prev = Some(head);
        }
        arena.async_head = Some(head);

        if base & 0x1f != 0 {
            log::error!("ehci: register base {:#x} not 32-byte aligned", base);
            return Err(UsbError::InvalidConfiguration);
        }
        let regs = unsafe { EhciRegs::new(base) };

        Ok(Self {
            regs,
            asyn: Mutex::new(arena),
            periodic: Mutex::new(periodic),
            status: AtomicU32::new(0),
            event,
            dead: AtomicBool::new(false),
        })
    }

    /// Hardware bring-up: halt, reset, program the schedules, run, claim
    /// the ports, start the async schedule.
    fn start_controller(&self) -> Result<(), UsbError> {
        let plat = platform::get()?;

        // halt first (hangs the controller on i.MX)
        #[cfg(not(feature = "imx"))]
        {
            self.regs.update_command(|cmd| {
                cmd.set_run_stop(false);
                cmd.set_iaa_doorbell(false);
            });
            wait_until!(1, 250, self.regs.status().halted())?;
        }

        self.regs.update_command(|cmd| cmd.set_reset(true));
        wait_until!(1, 250, !self.regs.command().reset())?;

        // i.MX deviation: register-level host mode select
        #[cfg(feature = "imx")]
        self.regs.set_host_mode();
        #[cfg(not(feature = "imx"))]
        if self.regs.hcc_params().addr64() {
            self.regs.write_ctrl_ds_segment(0);
        }

        self.regs.write_intr(USBSTS_UI | USBSTS_UEI | USBSTS_SEI);

        let list_paddr = self.periodic.lock().list.paddr();
        self.regs.write_periodic_list_base(list_paddr);

        // i.MX deviation: select the 128-entry frame list
        #[cfg(feature = "imx")]
        self.regs
            .update_command(|cmd| cmd.set_frame_list_size(u2::new(3)));

        self.regs.update_command(|cmd| {
            cmd.set_light_reset(false);
            cmd.set_async_enable(false);
        });
        self.regs.update_command(|cmd| {
            cmd.set_periodic_enable(true);
            cmd.set_run_stop(true);
        });
        wait_until!(1, 250, !self.regs.status().halted())?;

        // route all ports to this controller
        self.regs.write_config_flag(1);

        // allow the hardware to catch up
        plat.sleep_ms(50);

        let arena = self.asyn.lock();
        self.start_async(&arena)?;
        log::debug!("ehci: host controller initialized");
        Ok(())
    }
}

pub(crate) fn drv(hcd: &Hcd) -> Result<&Ehci, UsbError> {
    hcd.drvdata::<Ehci>().ok_or(UsbError::InvalidConfiguration)
}

/// ISR top-half.
///
/// Acknowledges and accumulates USBSTS interrupt bits (preserving the
/// frame-rollover indicator), rescanning until the register is stable so
/// edge-triggered delivery cannot lose an interrupt. Signals the worker
/// and reports "handled" only when an interrupt bit was present. Never
/// clears the accumulator.
pub(crate) fn ehci_isr(hcd: &'static Hcd) -> bool {
    let Ok(ehci) = drv(hcd) else { return false };

    let mut current = ehci.regs.status_raw();
    for _ in 0..ISR_RESCAN_LIMIT {
        ehci.regs
            .write_status_raw(current & (EHCI_INTRMASK | USBSTS_FRI));
        ehci.status.fetch_or(current, Ordering::AcqRel);

        current = ehci.regs.status_raw();
        if current & EHCI_INTRMASK == 0 {
            break;
        }
    }

    let handled = ehci.status.load(Ordering::Acquire) & EHCI_INTRMASK != 0;
    if handled {
        ehci.event.signal();
    }
    handled
}

/// One worker pass: classify and dispatch the latched interrupt status,
/// clearing only the bits consumed.
pub(crate) fn ehci_handle_events(hcd: &Hcd) {
    let Ok(ehci) = drv(hcd) else { return };
    let status = ehci.status.load(Ordering::Acquire);
    log::trace!("ehci: irq status {:#010x}", status);

    if status & USBSTS_SEI != 0 {
        ehci.status.fetch_and(!USBSTS_SEI, Ordering::AcqRel);
        ehci.dead.store(true, Ordering::Release);
        log::error!("ehci: host system error, controller halted");
        // TODO: reset and reinitialize the controller after a host
        // system error
        return;
    }

    if status & (USBSTS_UI | USBSTS_UEI) != 0 {
        ehci.status
            .fetch_and(!(USBSTS_UI | USBSTS_UEI), Ordering::AcqRel);
        let mut transfers = hcd.transfers.lock();
        ehci.trans_update(&mut transfers);
    }

    if status & USBSTS_PCI != 0 {
        ehci.status.fetch_and(!USBSTS_PCI, Ordering::AcqRel);
        hub::port_status_changed(hcd);
    }
}

/// Worker task: drains events whenever the ISR signals.
fn ehci_worker(hcd: &'static Hcd) -> ! {
    loop {
        match drv(hcd) {
            Ok(ehci) => {
                ehci.event.wait();
                ehci_handle_events(hcd);
            }
            Err(_) => core::hint::spin_loop(),
        }
    }
}

fn ehci_init(hcd: &'static Hcd) -> Result<(), UsbError> {
    let plat = platform::get()?;

    // Frame list and owner array first, then the PHY; no controller
    // register is touched until the PHY is up.
    let periodic = PeriodicState::new()?;
    plat.phy_init(hcd)?;
    let event = plat.create_event();

    let ehci = Ehci::new(hcd.info.base, periodic, event)?;
    hcd.set_drvdata(Box::new(ehci));
    let ehci = drv(hcd)?;

    plat.attach_irq(hcd.info.irq, ehci_isr, hcd)?;
    plat.spawn("ehci-worker", EHCI_PRIO, ehci_worker, hcd)?;

    ehci.start_controller()
}

/// The EHCI driver's operation table.
pub static EHCI_OPS: HcdOps = HcdOps {
    kind: "ehci",
    init: ehci_init,
    transfer_enqueue: xfer::ehci_transfer_enqueue,
    transfer_dequeue: xfer::ehci_transfer_dequeue,
    pipe_destroy: xfer::ehci_pipe_destroy,
    roothub_status: xfer::ehci_roothub_status,
};

/// Registers this driver with the host stack; invoked once at module
/// load.
pub fn register() {
    hcd_register(&EHCI_OPS);
}
