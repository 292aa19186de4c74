//! The UHCI host controller.
//!
//! [`Uhci`] owns the register block, the schedule and the registry of pending transfers. The
//! work is split by concern:
//!
//! - [`submit`]: turning an [`Urb`] into descriptors and linking them into the schedule;
//! - [`irq_reactor`]: the completion pass that runs whenever the controller raises an interrupt;
//! - [`unlink`]: cancellation and the deferred release of descriptors;
//! - [`root_hub`]: the emulated hub in front of the two root ports.
use std::fs::File;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Instant;

use chashmap::CHashMap;
use common::dma::{BusMapper, Dma};
use common::io::Io as _;
use common::timeout::Timeout;
use crossbeam_channel::{Receiver, Sender};
use log::{debug, error, info, warn};
use smallvec::SmallVec;
use syscall::error::{Error, Result, EBUSY, EINVAL, EIO, ESHUTDOWN};

use crate::config::UhciConfig;
use crate::driver_interface::*;
use crate::usb::Setup;

use self::irq_reactor::IrqReactor;
use self::pool::{QhHandle, TdHandle};
use self::regs::*;
use self::root_hub::RootHub;
use self::schedule::IsoWindow;
use self::skeleton::Schedule;

pub mod debug;
pub mod desc;
pub mod irq_reactor;
pub mod pool;
pub mod regs;
pub mod root_hub;
pub mod schedule;
pub mod skeleton;
pub mod submit;
pub mod unlink;

#[cfg(test)]
mod sim;

/// Controller state attached to a pending [`Urb`].
pub(crate) enum UrbPriv {
    /// Control and bulk: one QH with a vertical TD list.
    Async(AsyncPriv),
    Interrupt(InterruptPriv),
    Iso(IsoPriv),
    /// Polling the root hub's status change endpoint.
    RootHub,
}

pub(crate) struct AsyncPriv {
    pub qh: QhHandle,
    pub tds: SmallVec<[TdHandle; 8]>,
    /// The SETUP packet the first TD points at, for control transfers.
    pub setup: Option<Dma<Setup>>,
    /// Index of the status stage TD, for control transfers.
    pub status_stage: Option<usize>,
    /// The queue was pointed at the status stage after a short read.
    pub retriggered: bool,
    /// Holds a bandwidth reclamation reference.
    pub reclaiming: bool,
}

pub(crate) struct InterruptPriv {
    pub td: TdHandle,
    pub level: u8,
}

pub(crate) struct IsoTd {
    pub td: TdHandle,
    pub packet: usize,
    pub frame: u16,
    /// Where the packet's data must land.
    pub buffer: u32,
}

pub(crate) struct IsoPriv {
    pub window: IsoWindow,
    pub tds: Vec<IsoTd>,
}

/// A transfer whose descriptors are unreachable but may still be read by the controller.
pub(crate) struct Retired {
    pub urb: Arc<Urb>,
    pub hcpriv: UrbPriv,
    pub frame: u16,
    pub at: Instant,
    /// Delivered once the descriptors are released, for asynchronous unlinks.
    pub notify: Option<TransferResult>,
}

pub struct Uhci {
    config: UhciConfig,
    regs: Mutex<Box<dyn UhciRegisters>>,
    mapper: Arc<dyn BusMapper>,
    sched: Schedule,

    /// Pending transfers, in submission order.
    registry: Mutex<Vec<Arc<Urb>>>,
    retired: Mutex<Vec<Retired>>,
    /// A completion pass could not see the registry and has to be repeated.
    rescan: AtomicBool,
    running: AtomicBool,

    devices: CHashMap<usize, Arc<UsbDevice>>,
    root_hub: RootHub,

    irq_reactor: Mutex<Option<thread::JoinHandle<()>>>,
    irq_reactor_stop: (Sender<()>, Receiver<()>),
    root_hub_timer: Mutex<Option<thread::JoinHandle<()>>>,
    root_hub_timer_stop: (Sender<()>, Receiver<()>),
}

impl Uhci {
    /// Build the schedule and reset the controller. The controller is left halted; call
    /// [`Uhci::start`] to run it.
    pub fn new(
        regs: Box<dyn UhciRegisters>,
        mapper: Arc<dyn BusMapper>,
        config: UhciConfig,
    ) -> Result<Self> {
        let sched = Schedule::new(&config, &mapper)?;
        debug!("UHCI frame list at {:#010x}", sched.frame_list_base());
        let root_hub = RootHub::new(Arc::new(UsbDevice::new(Speed::Full, true)), regs.serial());

        let uhci = Self {
            root_hub,
            config,
            regs: Mutex::new(regs),
            mapper,
            sched,
            registry: Mutex::new(Vec::new()),
            retired: Mutex::new(Vec::new()),
            rescan: AtomicBool::new(false),
            running: AtomicBool::new(false),
            devices: CHashMap::new(),
            irq_reactor: Mutex::new(None),
            irq_reactor_stop: crossbeam_channel::bounded(1),
            root_hub_timer: Mutex::new(None),
            root_hub_timer_stop: crossbeam_channel::bounded(1),
        };
        uhci.reset()?;
        Ok(uhci)
    }

    pub fn config(&self) -> &UhciConfig {
        &self.config
    }

    pub(crate) fn regs(&self) -> MutexGuard<'_, Box<dyn UhciRegisters>> {
        self.regs.lock().unwrap()
    }

    /// Global reset followed by a controller reset.
    pub fn reset(&self) -> Result<()> {
        let mut regs = self.regs();

        debug!("UHCI global reset");
        regs.write16(USBINTR, 0);
        regs.write16(USBCMD, USBCMD_GRESET);
        Timeout::from_millis(self.config.controller.global_reset_hold_ms).wait();
        regs.write16(USBCMD, 0);

        debug!("UHCI host controller reset");
        regs.reg16(USBCMD).writef(USBCMD_HCRESET, true);
        let timeout = Timeout::from_millis(self.config.controller.reset_timeout_ms);
        while regs.reg16(USBCMD).readf(USBCMD_HCRESET) {
            timeout.run().map_err(|()| {
                log::error!("timeout on USBCMD_HCRESET");
                Error::new(EIO)
            })?;
        }
        Ok(())
    }

    /// Program the schedule and set the controller running.
    pub fn start(&self) -> Result<()> {
        {
            let mut regs = self.regs();
            regs.write16(USBINTR, USBINTR_ALL);
            regs.write32(FLBASEADD, self.sched.frame_list_base());
            regs.write16(FRNUM, 0);
            regs.write16(USBSTS, USBSTS_ACK_MASK);
            regs.write16(USBCMD, USBCMD_RS | USBCMD_CF | USBCMD_MAXP);

            let timeout = Timeout::from_millis(self.config.controller.reset_timeout_ms);
            while regs.reg16(USBSTS).readf(USBSTS_HCH) {
                timeout.run().map_err(|()| {
                    log::error!("timeout on USBSTS_HCH");
                    Error::new(EIO)
                })?;
            }
        }
        self.running.store(true, Ordering::Release);
        info!("UHCI running, frame list at {:#010x}", self.sched.frame_list_base());
        Ok(())
    }

    /// Clear Run/Stop and wait for the controller to halt. Pending transfers stay queued.
    pub fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        let mut regs = self.regs();
        regs.reg16(USBCMD).writef(USBCMD_RS, false);
        let timeout = Timeout::from_millis(self.config.controller.reset_timeout_ms);
        while !regs.reg16(USBSTS).readf(USBSTS_HCH) {
            timeout.run().map_err(|()| {
                log::error!("timeout on USBSTS_HCH");
                Error::new(EIO)
            })?;
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Bring a controller back after it halted on its own, e.g. on a host system error.
    pub(crate) fn restart(&self) -> Result<()> {
        warn!("UHCI restarting after unexpected halt");
        self.running.store(false, Ordering::Release);
        self.reset()?;
        self.start()
    }

    /// Stop the worker threads and the controller, and complete every pending transfer with
    /// [`TransferError::Shutdown`].
    pub fn shutdown(&self) {
        info!("UHCI shutting down");
        let _ = self.irq_reactor_stop.0.try_send(());
        let _ = self.root_hub_timer_stop.0.try_send(());
        for handle in [&self.root_hub_timer, &self.irq_reactor] {
            if let Some(handle) = handle.lock().unwrap().take() {
                if handle.join().is_err() {
                    error!("UHCI worker thread panicked");
                }
            }
        }

        if let Err(err) = self.stop() {
            error!("failed to stop UHCI: {}", err);
        }

        let pending = std::mem::take(&mut *self.registry.lock().unwrap());
        for urb in pending.into_iter().rev() {
            if let Some(hcpriv) = urb.hcpriv.lock().unwrap().take() {
                self.detach(&urb, &hcpriv);
                self.settle_toggle(&urb, &hcpriv);
                self.release(hcpriv);
            }
            urb.finish(Err(TransferError::Shutdown));
            urb.device().put();
        }
        // the controller is halted, nothing can be fetched anymore
        for retired in std::mem::take(&mut *self.retired.lock().unwrap()) {
            self.dispose(retired);
        }
        self.root_hub.shutdown();
    }

    pub fn root_hub_device(&self) -> &Arc<UsbDevice> {
        self.root_hub.device()
    }

    pub(crate) fn mapper(&self) -> &Arc<dyn BusMapper> {
        &self.mapper
    }

    /// Transfers currently in the registry.
    pub fn pending_transfers(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    /// Retired transfers whose descriptors are waiting to be released.
    pub fn retired_transfers(&self) -> usize {
        self.retired.lock().unwrap().len()
    }

    /// Descriptors available to new transfers.
    pub fn free_descriptors(&self) -> (usize, usize) {
        (self.sched.tds.available(), self.sched.qhs.available())
    }

    /// Make a transfer's descriptors unreachable for the controller.
    pub(crate) fn detach(&self, urb: &Urb, hcpriv: &UrbPriv) {
        match hcpriv {
            UrbPriv::Async(queue) => {
                self.sched.unlink_qh(queue.qh);
                if queue.reclaiming {
                    self.sched.reclamation_put();
                }
            }
            UrbPriv::Interrupt(int) => {
                self.sched
                    .unlink_td(skeleton::Anchor::Interrupt(int.level), int.td);
            }
            UrbPriv::Iso(iso) => {
                for iso_td in &iso.tds {
                    self.sched
                        .unlink_td(skeleton::Anchor::Frame(iso_td.frame), iso_td.td);
                }
            }
            UrbPriv::RootHub => {
                self.root_hub.take_status_urb(urb);
            }
        }
    }

    /// Return a detached transfer's descriptors to the pools.
    pub(crate) fn release(&self, hcpriv: UrbPriv) {
        match hcpriv {
            UrbPriv::Async(queue) => {
                for td in queue.tds {
                    self.sched.tds.free(td);
                }
                self.sched.qhs.free(queue.qh);
            }
            UrbPriv::Interrupt(int) => self.sched.tds.free(int.td),
            UrbPriv::Iso(iso) => {
                for iso_td in iso.tds {
                    self.sched.tds.free(iso_td.td);
                }
            }
            UrbPriv::RootHub => (),
        }
    }

    fn device_key(device: &Arc<UsbDevice>) -> usize {
        Arc::as_ptr(device) as usize
    }
}

impl HostController for Uhci {
    fn alloc_device(&self, speed: Speed) -> Result<Arc<UsbDevice>> {
        let device = Arc::new(UsbDevice::new(speed, false));
        self.devices
            .insert(Self::device_key(&device), Arc::clone(&device));
        debug!("allocated {:?} device", speed);
        Ok(device)
    }

    fn free_device(&self, device: &Arc<UsbDevice>) -> Result<()> {
        if device.is_root_hub() {
            return Err(Error::new(EINVAL));
        }
        if device.pending_transfers() != 0 {
            warn!(
                "device {} still has {} pending transfers",
                device.address(),
                device.pending_transfers()
            );
            return Err(Error::new(EBUSY));
        }
        match self.devices.remove(&Self::device_key(device)) {
            Some(_) => Ok(()),
            None => Err(Error::new(EINVAL)),
        }
    }

    fn current_frame_number(&self) -> u16 {
        self.regs().frame_number()
    }

    fn submit_urb(&self, urb: &Arc<Urb>) -> Result<()> {
        if !self.is_running() {
            return Err(Error::new(ESHUTDOWN));
        }
        self.submit(urb, irq_reactor::in_completion())
    }

    fn unlink_urb(&self, urb: &Arc<Urb>) -> Result<UnlinkProgress> {
        self.unlink(urb)
    }
}

/// Run the completion pass on its own thread. With an IRQ file the thread blocks on interrupts,
/// otherwise it polls the status register.
pub fn start_irq_reactor(hci: &Arc<Uhci>, irq_file: Option<File>) {
    let hci_clone = Arc::clone(hci);
    let stop = hci.irq_reactor_stop.1.clone();
    let polling = irq_file.is_none();

    debug!("About to start IRQ reactor");

    let handle = thread::spawn(move || {
        debug!("Started IRQ reactor thread");
        IrqReactor::new(hci_clone, irq_file, stop).run()
    });
    // A reactor blocked on the IRQ file cannot be joined once interrupts are off.
    if polling {
        *hci.irq_reactor.lock().unwrap() = Some(handle);
    }
}

/// Sample the root ports for the hub's status change endpoint.
pub fn start_root_hub_timer(hci: &Arc<Uhci>) {
    let hci_clone = Arc::clone(hci);
    let stop = hci.root_hub_timer_stop.1.clone();

    debug!("About to start root hub timer");

    let handle = thread::spawn(move || {
        debug!("Started root hub timer");
        root_hub::run_timer(hci_clone, stop)
    });
    *hci.root_hub_timer.lock().unwrap() = Some(handle);
}

#[cfg(test)]
mod test {
    use super::sim::{self, Response};
    use super::*;
    use common::dma::BusWindow;

    /// A controller that never finishes its reset.
    struct Stuck;

    impl UhciRegisters for Stuck {
        fn read16(&self, _offset: u16) -> u16 {
            USBCMD_HCRESET
        }
        fn write16(&mut self, _offset: u16, _value: u16) {}
        fn read32(&self, _offset: u16) -> u32 {
            0
        }
        fn write32(&mut self, _offset: u16, _value: u32) {}
    }

    #[test]
    fn start_programs_the_controller() {
        let (uhci, hc) = sim::controller(sim::config());
        assert!(uhci.is_running());
        assert_eq!(hc.command(), USBCMD_RS | USBCMD_CF | USBCMD_MAXP);
        assert_eq!(hc.status() & USBSTS_HCH, 0);
        assert_eq!(uhci.regs().read32(FLBASEADD), uhci.sched.frame_list_base());
        assert_eq!(uhci.regs().read16(USBINTR), USBINTR_ALL);
    }

    #[test]
    fn reset_timeout_is_fatal() {
        let mut config = sim::config();
        config.controller.reset_timeout_ms = 5;
        let mapper: Arc<dyn BusMapper> = Arc::new(BusWindow::new(0x0100_0000, 0x0400_0000));
        assert_eq!(
            Uhci::new(Box::new(Stuck), mapper, config).err(),
            Some(Error::new(EIO))
        );
    }

    #[test]
    fn frame_number_follows_the_controller() {
        let (uhci, hc) = sim::controller(sim::config());
        assert_eq!(uhci.current_frame_number(), 0);
        hc.run(&uhci, 3, &mut |_| Response::Full);
        assert_eq!(uhci.current_frame_number(), 3);
    }

    #[test]
    fn device_lifetime() {
        let (uhci, _hc) = sim::controller(sim::config());
        assert_eq!(
            uhci.free_device(uhci.root_hub_device()),
            Err(Error::new(EINVAL))
        );

        let device = sim::device(&uhci, 4);
        let urb = UrbBuilder::new(&device, Pipe::bulk(1, Direction::In, 64))
            .buffer(sim::buffer(&uhci, 64))
            .build()
            .unwrap();
        uhci.submit_urb(&urb).unwrap();
        assert_eq!(uhci.free_device(&device), Err(Error::new(EBUSY)));

        uhci.unlink_urb(&urb).unwrap();
        assert_eq!(uhci.free_device(&device), Ok(()));
        assert_eq!(uhci.free_device(&device), Err(Error::new(EINVAL)));
    }

    #[test]
    fn stopped_controller_refuses_transfers() {
        let (uhci, hc) = sim::controller(sim::config());
        let device = sim::device(&uhci, 4);
        let urb = UrbBuilder::new(&device, Pipe::bulk(1, Direction::Out, 64))
            .buffer(sim::buffer(&uhci, 64))
            .build()
            .unwrap();

        uhci.stop().unwrap();
        assert!(!uhci.is_running());
        assert_ne!(hc.status() & USBSTS_HCH, 0);
        assert_eq!(uhci.submit_urb(&urb), Err(Error::new(ESHUTDOWN)));

        uhci.start().unwrap();
        uhci.submit_urb(&urb).unwrap();
        hc.run(&uhci, 1, &mut |_| Response::Full);
        assert_eq!(urb.status(), Some(Ok(())));
    }
}
