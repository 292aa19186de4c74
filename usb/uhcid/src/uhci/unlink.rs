//! Cancellation and deferred release.
//!
//! Unlinking a descriptor does not stop the controller from reading it: it may have fetched the
//! link a moment earlier and still be working on the frame. Descriptors are therefore only
//! returned to the pools after the frame number moved on and at least one frame period passed,
//! or right away if the controller is halted.
use std::mem;
use std::sync::Arc;
use std::time::Instant;

use common::timeout::Timeout;
use log::{debug, trace};
use syscall::error::{Error, Result, ENOENT};

use super::desc::TdStatus;
use super::irq_reactor::{failed, in_completion};
use super::regs::*;
use super::{Retired, Uhci, UrbPriv};
use crate::driver_interface::*;

impl Uhci {
    /// Remove `urb` from the registry. Returns `false` if it was not pending, which means
    /// somebody else is already completing it.
    pub(crate) fn take_pending(&self, urb: &Arc<Urb>) -> bool {
        let mut registry = self.registry.lock().unwrap();
        match registry.iter().position(|pending| Arc::ptr_eq(pending, urb)) {
            Some(index) => {
                registry.remove(index);
                true
            }
            None => false,
        }
    }

    fn take_hcpriv(&self, urb: &Arc<Urb>) -> Option<UrbPriv> {
        if !self.take_pending(urb) {
            return None;
        }
        urb.hcpriv.lock().unwrap().take()
    }

    pub(crate) fn unlink(&self, urb: &Arc<Urb>) -> Result<UnlinkProgress> {
        let Some(hcpriv) = self.take_hcpriv(urb) else {
            debug!("unlink of {:?}: not pending", urb);
            return Err(Error::new(ENOENT));
        };
        self.detach(urb, &hcpriv);

        if urb.flags.contains(TransferFlags::ASYNC_UNLINK) || in_completion() {
            trace!("unlinking {:?} asynchronously", urb);
            self.settle_toggle(urb, &hcpriv);
            self.defer(urb, hcpriv, Some(Err(TransferError::Unlinked)));
            return Ok(UnlinkProgress::InProgress);
        }

        if self.is_running() {
            // the controller may still hold a descriptor it fetched this frame
            Timeout::new(self.config.frame_period()).wait();
        }
        self.settle_toggle(urb, &hcpriv);
        self.release(hcpriv);
        trace!("unlinked {:?}", urb);
        urb.finish(Err(TransferError::Killed));
        urb.device().put();
        Ok(UnlinkProgress::Done)
    }

    /// Take a transfer off the schedule from the completion pass, completing it with `reason`
    /// once its descriptors are released.
    pub(crate) fn cancel(&self, urb: &Arc<Urb>, reason: TransferError) {
        if let Some(hcpriv) = self.take_hcpriv(urb) {
            self.detach(urb, &hcpriv);
            self.settle_toggle(urb, &hcpriv);
            self.defer(urb, hcpriv, Some(Err(reason)));
        }
    }

    /// Point a bulk endpoint's data toggle past the last packet the device acknowledged.
    ///
    /// Submission advances the toggle over the whole transfer; a transfer taken off the schedule
    /// early has to hand back the toggles it never used.
    pub(crate) fn settle_toggle(&self, urb: &Urb, hcpriv: &UrbPriv) {
        let UrbPriv::Async(queue) = hcpriv else {
            return;
        };
        let pipe = urb.pipe;
        if pipe.kind != PipeKind::Bulk {
            return;
        }
        let Some(&first) = queue.tds.first() else {
            return;
        };

        let mut toggle = self.sched.tds.get(first).toggle();
        for &td in &queue.tds {
            let td = self.sched.tds.get(td);
            let status = td.status();
            if status.contains(TdStatus::ACTIVE) || failed(status) {
                break;
            }
            toggle = !td.toggle();
        }
        trace!(
            "endpoint {:#04x} toggle settled at {}",
            pipe.endpoint_address(),
            toggle as u8
        );
        urb.device().set_toggle(pipe.endpoint, pipe.direction, toggle);
    }

    /// Keep a detached transfer's descriptors until the controller is guaranteed to be done
    /// with them.
    pub(crate) fn defer(&self, urb: &Arc<Urb>, hcpriv: UrbPriv, notify: Option<TransferResult>) {
        let frame = self.regs().frame_number();
        self.retired.lock().unwrap().push(Retired {
            urb: Arc::clone(urb),
            hcpriv,
            frame,
            at: Instant::now(),
            notify,
        });
    }

    /// Release every retired transfer that is safe to release, or all of them if `force` is set.
    pub(crate) fn reap(&self, force: bool) {
        let (frame, halted) = {
            let regs = self.regs();
            (regs.frame_number(), regs.read16(USBSTS) & USBSTS_HCH != 0)
        };
        let period = self.config.frame_period();

        let ready: Vec<Retired> = {
            let mut retired = self.retired.lock().unwrap();
            if retired.is_empty() {
                return;
            }
            let (ready, waiting) = mem::take(&mut *retired).into_iter().partition(|retired| {
                force || halted || (retired.frame != frame && retired.at.elapsed() >= period)
            });
            *retired = waiting;
            ready
        };

        for retired in ready {
            self.dispose(retired);
        }
    }

    pub(crate) fn dispose(&self, retired: Retired) {
        let Retired {
            urb,
            hcpriv,
            notify,
            ..
        } = retired;
        self.release(hcpriv);
        if let Some(status) = notify {
            trace!("{:?} released: {:?}", urb, status);
            urb.finish(status);
            urb.device().put();
        }
    }
}
