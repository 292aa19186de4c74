//! The completion pass and the thread that drives it.
//!
//! UHCI has no event ring: an interrupt only says that *something* finished, so every pass walks
//! the registry of pending transfers and looks at their descriptors. The pass never blocks on
//! anything that waits for a pass to finish. Callbacks run on this thread, and an unlink issued
//! from inside one is completed later instead of sleeping here.
use std::cell::Cell;
use std::fs::File;
use std::io::prelude::*;
use std::sync::atomic::Ordering;
use std::sync::{Arc, TryLockError};
use std::thread;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use common::io::Io as _;
use log::{debug, error, trace, warn};

use super::desc::{TdStatus, PID_SETUP};
use super::regs::*;
use super::{AsyncPriv, InterruptPriv, IsoPriv, Uhci, UrbPriv};
use crate::driver_interface::*;

thread_local! {
    static IN_COMPLETION: Cell<bool> = Cell::new(false);
}

/// Whether the current thread is running a completion pass, callbacks included.
pub(crate) fn in_completion() -> bool {
    IN_COMPLETION.with(|flag| flag.get())
}

pub(crate) struct CompletionContext {
    outer: bool,
}

impl CompletionContext {
    pub(crate) fn enter() -> Self {
        Self {
            outer: IN_COMPLETION.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for CompletionContext {
    fn drop(&mut self) {
        IN_COMPLETION.with(|flag| flag.set(self.outer));
    }
}

/// Map the error bits of a retired TD to a transfer result.
pub fn transfer_error(status: TdStatus, out: bool) -> TransferError {
    if status.contains(TdStatus::BITSTUFF) {
        TransferError::BitStuff
    } else if status.contains(TdStatus::CRC_TIMEOUT) {
        TransferError::CrcTimeout { out }
    } else if status.contains(TdStatus::NAK) {
        TransferError::Nak
    } else if status.contains(TdStatus::BABBLE) {
        TransferError::Babble
    } else if status.contains(TdStatus::DATABUFFER) {
        TransferError::DataBuffer
    } else if status.contains(TdStatus::STALLED) {
        TransferError::Stall
    } else {
        TransferError::Internal
    }
}

/// Error bits that end a transfer. A NAK alone only means the device was not ready.
pub(crate) fn failed(status: TdStatus) -> bool {
    status.intersects(TdStatus::ERRORS - TdStatus::NAK)
}

enum Scan {
    Pending,
    Done(TransferResult),
    /// A periodic transfer completed one period.
    Report(TransferResult),
}

impl Uhci {
    /// Acknowledge the controller's status and process everything it finished. Returns whether
    /// the controller had anything to report.
    pub fn handle_interrupt(&self) -> bool {
        let _context = CompletionContext::enter();

        let status = {
            let mut regs = self.regs();
            let status = regs.read16(USBSTS);
            let ack = status & USBSTS_ACK_MASK;
            if ack != 0 {
                regs.write16(USBSTS, ack);
            }
            if status & USBSTS_RD != 0 {
                debug!("UHCI resume detected");
                regs.reg16(USBCMD)
                    .writef(USBCMD_EGSM | USBCMD_FGR, false);
            }
            status
        };
        trace!("UHCI status {:#06x}", status);

        if status & USBSTS_HSE != 0 {
            error!("UHCI host system error");
        }
        if status & USBSTS_HCPE != 0 {
            error!("UHCI host controller process error");
        }
        if status & USBSTS_HCH != 0 && self.is_running() {
            error!("UHCI halted unexpectedly (status {:#06x})", status);
            if let Err(err) = self.restart() {
                error!("failed to restart UHCI: {}", err);
            }
        }

        self.scan();
        while self.rescan.swap(false, Ordering::AcqRel) {
            thread::yield_now();
            self.scan();
        }
        self.reap(false);

        status & USBSTS_ACK_MASK != 0
    }

    fn scan(&self) {
        let pending = match self.registry.try_lock() {
            Ok(registry) => registry.clone(),
            Err(TryLockError::WouldBlock) => {
                trace!("registry busy, rescanning");
                self.rescan.store(true, Ordering::Release);
                return;
            }
            Err(TryLockError::Poisoned(err)) => panic!("registry lock poisoned: {}", err),
        };

        // newest first, so a chained submission is only looked at by the next pass
        for urb in pending.iter().rev() {
            self.process(urb);
        }
    }

    fn process(&self, urb: &Arc<Urb>) {
        if urb.timed_out() {
            warn!("{:?} timed out", urb);
            self.cancel(urb, TransferError::TimedOut);
            return;
        }

        let scan = {
            let mut hcpriv = urb.hcpriv.lock().unwrap();
            match hcpriv.as_mut() {
                Some(UrbPriv::Async(queue)) => self.scan_async(urb, queue),
                Some(UrbPriv::Interrupt(int)) => self.scan_interrupt(urb, int),
                Some(UrbPriv::Iso(iso)) => self.scan_iso(urb, iso),
                Some(UrbPriv::RootHub) | None => Scan::Pending,
            }
        };

        match scan {
            Scan::Pending => (),
            Scan::Done(status) => self.retire(urb, status),
            Scan::Report(status) => {
                if !urb.report(status) || !urb.is_pending() {
                    return;
                }
                // still polling: hand the TD back with the next toggle
                if let Some(UrbPriv::Interrupt(int)) = urb.hcpriv.lock().unwrap().as_ref() {
                    let toggle = urb.device().toggle(urb.pipe.endpoint, urb.pipe.direction);
                    self.sched.tds.get(int.td).rearm(toggle);
                }
            }
        }
    }

    /// Take a finished transfer off the schedule and complete it.
    pub(crate) fn retire(&self, urb: &Arc<Urb>, status: TransferResult) {
        if !self.take_pending(urb) {
            return;
        }
        let Some(hcpriv) = urb.hcpriv.lock().unwrap().take() else {
            return;
        };
        self.detach(urb, &hcpriv);
        self.defer(urb, hcpriv, None);

        trace!("{:?} completed: {:?}", urb, status);
        let ok = status.is_ok();
        urb.finish(status);
        urb.device().put();

        if ok {
            if let Some(next) = urb.next() {
                if let Err(err) = self.submit(&next, true) {
                    warn!("failed to submit chained transfer {:?}: {}", next, err);
                    // nobody else will complete it; a transfer still pending elsewhere is left alone
                    if next.begin() {
                        next.finish(Err(TransferError::Rejected { errno: err.errno }));
                    }
                }
            }
        }
    }

    fn scan_async(&self, urb: &Urb, queue: &mut AsyncPriv) -> Scan {
        let pipe = urb.pipe;
        let device = urb.device();
        let control = pipe.kind == PipeKind::Control;

        let mut actual = 0;
        let mut short = false;
        let mut errors = 0;
        let mut next_toggle = queue
            .tds
            .first()
            .map(|&td| self.sched.tds.get(td).toggle())
            .unwrap_or(false);
        let mut result = Ok(());

        let mut index = 0;
        while index < queue.tds.len() {
            let td = self.sched.tds.get(queue.tds[index]);
            let status = td.status();
            if status.contains(TdStatus::ACTIVE) {
                return Scan::Pending;
            }
            errors += 3 - td.error_count().min(3) as usize;
            if failed(status) {
                if status.contains(TdStatus::STALLED) && !control {
                    device.set_halted(pipe.endpoint, pipe.direction, true);
                }
                result = Err(transfer_error(status, !td.is_in()));
                break;
            }

            let len = td.actual_len();
            if td.pid() != PID_SETUP {
                actual += len;
            }
            next_toggle = !td.toggle();

            if td.pid() != PID_SETUP && len < td.max_len() {
                short = true;
                if status.contains(TdStatus::SPD) {
                    // the controller stopped on this TD
                    match queue.status_stage {
                        Some(status_stage) if index < status_stage => {
                            if !queue.retriggered {
                                queue.retriggered = true;
                                self.sched.retrigger(queue.qh, queue.tds[status_stage]);
                                return Scan::Pending;
                            }
                            index = status_stage;
                            continue;
                        }
                        _ => break,
                    }
                }
            }
            index += 1;
        }

        if result.is_ok() && short && urb.flags.contains(TransferFlags::SHORT_NOT_OK) {
            result = Err(TransferError::ShortPacket);
        }
        if !control {
            device.set_toggle(pipe.endpoint, pipe.direction, next_toggle);
        }
        urb.set_actual_length(actual);
        urb.set_error_count(errors);
        Scan::Done(result)
    }

    fn scan_interrupt(&self, urb: &Urb, int: &mut InterruptPriv) -> Scan {
        let td = self.sched.tds.get(int.td);
        let status = td.status();
        if status.contains(TdStatus::ACTIVE) {
            return Scan::Pending;
        }
        let pipe = urb.pipe;
        let device = urb.device();

        urb.set_actual_length(td.actual_len());
        let result = if failed(status) {
            if status.contains(TdStatus::STALLED) {
                device.set_halted(pipe.endpoint, pipe.direction, true);
            }
            Err(transfer_error(status, !td.is_in()))
        } else {
            device.set_toggle(pipe.endpoint, pipe.direction, !td.toggle());
            Ok(())
        };

        if urb.interval == 0 {
            td.disable_ioc();
            return Scan::Done(result);
        }
        match result {
            // a stalled endpoint would stall again every period
            Err(TransferError::Stall) => Scan::Done(result),
            _ => Scan::Report(result),
        }
    }

    fn scan_iso(&self, urb: &Urb, iso: &mut IsoPriv) -> Scan {
        if let Some(last) = iso.tds.last() {
            if self.sched.tds.get(last.td).is_active() {
                return Scan::Pending;
            }
        }

        let out = !urb.pipe.is_in();
        let mut packets = urb.iso_lock();
        let mut actual = 0;
        let mut errors = 0;
        let mut consistent = true;
        for iso_td in &iso.tds {
            let td = self.sched.tds.get(iso_td.td);
            let Some(packet) = packets.get_mut(iso_td.packet) else {
                consistent = false;
                continue;
            };
            if td.buffer_addr() != iso_td.buffer {
                error!(
                    "isochronous TD for packet {} in frame {} points at {:#010x}, expected {:#010x}",
                    iso_td.packet,
                    iso_td.frame,
                    td.buffer_addr(),
                    iso_td.buffer
                );
                packet.status = Err(TransferError::Internal);
                consistent = false;
                errors += 1;
                continue;
            }
            let status = td.status();
            packet.actual_length = td.actual_len();
            actual += packet.actual_length;
            if failed(status) {
                packet.status = Err(transfer_error(status, out));
                errors += 1;
            }
        }
        drop(packets);

        trace!(
            "isochronous window {:?} done, {} bytes, {} errors",
            iso.window,
            actual,
            errors
        );
        urb.set_actual_length(actual);
        urb.set_error_count(errors);
        Scan::Done(if consistent {
            Ok(())
        } else {
            Err(TransferError::Internal)
        })
    }
}

pub struct IrqReactor {
    hci: Arc<Uhci>,
    irq_file: Option<File>,
    stop: Receiver<()>,
}

impl IrqReactor {
    pub fn new(hci: Arc<Uhci>, irq_file: Option<File>, stop: Receiver<()>) -> Self {
        Self {
            hci,
            irq_file,
            stop,
        }
    }

    fn run_polling(self) {
        debug!("Running IRQ reactor in polling mode.");
        let interval = self.hci.config().polling_interval();
        loop {
            match self.stop.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    self.hci.handle_interrupt();
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("IRQ reactor stopped");
    }

    fn run_with_irq_file(mut self) {
        debug!("Running IRQ reactor with IRQ file");
        let Some(mut irq_file) = self.irq_file.take() else {
            return self.run_polling();
        };
        let mut buffer = [0u8; 8];
        loop {
            if let Err(err) = irq_file.read(&mut buffer) {
                error!("failed to read IRQ file: {}", err);
                break;
            }
            if self.stop.try_recv().is_ok() {
                break;
            }
            if self.hci.handle_interrupt() {
                if let Err(err) = irq_file.write(&buffer) {
                    error!("failed to acknowledge IRQ: {}", err);
                }
            }
        }
        debug!("IRQ reactor stopped");
    }

    pub fn run(self) {
        if self.irq_file.is_some() {
            self.run_with_irq_file();
        } else {
            self.run_polling();
        }
    }
}
