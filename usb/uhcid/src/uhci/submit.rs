//! Turning transfer requests into descriptor chains.
//!
//! Every builder allocates and fills all of its descriptors before anything becomes reachable
//! from the schedule, so a failed submission never leaves partial state behind. The registry lock
//! is held across building and linking, which keeps duplicate detection and isochronous placement
//! consistent with what is actually scheduled.
use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::dma::Dma;
use log::{debug, trace, warn};
use smallvec::SmallVec;
use syscall::error::{Error, Result, EBUSY, EINVAL, EMSGSIZE, ENOMEM, EPIPE};

use super::desc::*;
use super::pool::{QhHandle, TdHandle};
use super::schedule::{interrupt_level, iso_start_frame, IsoRequest, IsoStart, IsoWindow};
use super::skeleton::Anchor;
use super::{AsyncPriv, InterruptPriv, IsoPriv, IsoTd, Uhci, UrbPriv};
use crate::driver_interface::*;
use crate::usb::{ReqDirection, Setup};

/// Retries the controller makes on CRC, timeout and bit stuffing errors.
const ERROR_LIMIT: u32 = 3;
/// Largest payload one TD can carry.
const MAX_TD_PAYLOAD: u16 = 1023;
/// Maximum packet size of a low-speed control endpoint.
const LOW_SPEED_MAX_PACKET: u16 = 8;

fn bus32(address: usize) -> Result<u32> {
    u32::try_from(address).map_err(|_| {
        warn!("buffer at {:#x} is not reachable with 32-bit DMA", address);
        Error::new(EINVAL)
    })
}

/// Descriptors of a transfer under construction. Freed on drop unless committed.
struct Staged<'a> {
    uhci: &'a Uhci,
    tds: SmallVec<[TdHandle; 8]>,
    qh: Option<QhHandle>,
    committed: bool,
}

impl<'a> Staged<'a> {
    fn new(uhci: &'a Uhci) -> Self {
        Self {
            uhci,
            tds: SmallVec::new(),
            qh: None,
            committed: false,
        }
    }

    fn td(&mut self) -> Result<TdHandle> {
        let td = self.uhci.sched.tds.alloc()?;
        self.tds.push(td);
        Ok(td)
    }

    fn qh(&mut self) -> Result<QhHandle> {
        let qh = self.uhci.sched.qhs.alloc()?;
        self.qh = Some(qh);
        Ok(qh)
    }

    fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for Staged<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for &td in &self.tds {
            self.uhci.sched.tds.free(td);
        }
        if let Some(qh) = self.qh {
            self.uhci.sched.qhs.free(qh);
        }
    }
}

/// Fields shared by all TDs of one transfer.
struct Target {
    address: u8,
    endpoint: u8,
    speed: TdStatus,
    buffer: u32,
}

impl Target {
    fn new(urb: &Urb) -> Result<Self> {
        let device = urb.device();
        Ok(Self {
            address: device.address(),
            endpoint: urb.pipe.endpoint,
            speed: if device.is_low_speed() {
                TdStatus::LOW_SPEED
            } else {
                TdStatus::empty()
            },
            buffer: bus32(urb.buffer_phys())?,
        })
    }

    fn token(&self, pid: u8, toggle: bool, len: usize) -> u32 {
        token(pid, self.address, self.endpoint, toggle, len)
    }

    /// Bus address of `offset` bytes into the transfer buffer.
    fn at(&self, offset: usize) -> Result<u32> {
        u32::try_from(offset)
            .ok()
            .and_then(|offset| self.buffer.checked_add(offset))
            .ok_or_else(|| {
                warn!("buffer offset {:#x} is not reachable with 32-bit DMA", offset);
                Error::new(EINVAL)
            })
    }
}

fn same_endpoint(a: &Urb, b: &Urb) -> bool {
    Arc::ptr_eq(a.device(), b.device())
        && a.pipe.kind == b.pipe.kind
        && a.pipe.endpoint == b.pipe.endpoint
        && (a.pipe.kind == PipeKind::Control || a.pipe.direction == b.pipe.direction)
}

impl Uhci {
    pub(crate) fn submit(&self, urb: &Arc<Urb>, in_completion: bool) -> Result<()> {
        if urb.device().is_root_hub() {
            return self.root_hub_submit(urb);
        }
        self.check_pipe(urb)?;

        let pipe = urb.pipe;
        if matches!(pipe.kind, PipeKind::Bulk | PipeKind::Interrupt)
            && urb.device().is_halted(pipe.endpoint, pipe.direction)
        {
            if in_completion {
                debug!("endpoint {:#04x} is halted", pipe.endpoint_address());
                return Err(Error::new(EPIPE));
            }
            self.clear_halt(urb.device(), pipe)?;
        }

        if !urb.begin() {
            return Err(Error::new(EBUSY));
        }

        let mut registry = self.registry.lock().unwrap();
        let mut built = self.build(urb, &registry);
        if matches!(&built, Err(err) if err.errno == ENOMEM) {
            // retired transfers may still hold descriptors the controller is done with
            drop(registry);
            self.reap(false);
            registry = self.registry.lock().unwrap();
            built = self.build(urb, &registry);
        }

        match built {
            Ok(hcpriv) => {
                *urb.hcpriv.lock().unwrap() = Some(hcpriv);
                urb.device().get();
                registry.push(Arc::clone(urb));
                trace!("submitted {:?}", urb);
                Ok(())
            }
            Err(err) => {
                drop(registry);
                urb.abort();
                debug!("failed to submit {:?}: {}", urb, err);
                Err(err)
            }
        }
    }

    fn build(&self, urb: &Urb, registry: &[Arc<Urb>]) -> Result<UrbPriv> {
        let pipe = urb.pipe;
        if pipe.kind != PipeKind::Isochronous
            && registry.iter().any(|other| same_endpoint(other, urb))
        {
            debug!(
                "endpoint {:#04x} of device {} already has a pending transfer",
                pipe.endpoint_address(),
                urb.device().address()
            );
            return Err(Error::new(EBUSY));
        }
        match pipe.kind {
            PipeKind::Control => self.build_control(urb),
            PipeKind::Bulk => self.build_bulk(urb),
            PipeKind::Interrupt => self.build_interrupt(urb),
            PipeKind::Isochronous => {
                let pending = registry
                    .iter()
                    .filter(|other| same_endpoint(other, urb))
                    .map(|other| IsoWindow::new(other.start_frame(), other.iso_lock().len()))
                    .collect::<Vec<_>>();
                self.build_iso(urb, &pending)
            }
        }
    }

    fn check_pipe(&self, urb: &Urb) -> Result<()> {
        let pipe = &urb.pipe;
        if pipe.max_packet == 0 || pipe.max_packet > MAX_TD_PAYLOAD {
            return Err(Error::new(EMSGSIZE));
        }
        if urb.device().is_low_speed() {
            match pipe.kind {
                PipeKind::Bulk | PipeKind::Isochronous => return Err(Error::new(EINVAL)),
                PipeKind::Control if pipe.max_packet > LOW_SPEED_MAX_PACKET => {
                    return Err(Error::new(EMSGSIZE))
                }
                _ => (),
            }
        }
        if pipe.kind == PipeKind::Control && urb.setup.is_none() {
            return Err(Error::new(EINVAL));
        }
        Ok(())
    }

    fn build_control(&self, urb: &Urb) -> Result<UrbPriv> {
        let setup = urb.setup.ok_or(Error::new(EINVAL))?;
        let target = Target::new(urb)?;
        let max_packet = urb.pipe.max_packet as usize;
        let length = urb.length();
        let data_in = setup.direction() == ReqDirection::DeviceToHost;

        let setup_packet = Dma::new(setup, &self.mapper)?;
        let setup_bus = bus32(setup_packet.physical())?;

        let mut staged = Staged::new(self);
        let qh = staged.qh()?;
        let mut tds = SmallVec::new();

        let td = staged.td()?;
        self.sched.tds.get(td).fill(
            TdStatus::ACTIVE | target.speed,
            ERROR_LIMIT,
            target.token(PID_SETUP, false, 8),
            setup_bus,
        );
        self.sched.append_td(qh, &mut tds, td, true);

        let (data_pid, mut data_status) = if data_in {
            (PID_IN, TdStatus::ACTIVE | target.speed | TdStatus::SPD)
        } else {
            (PID_OUT, TdStatus::ACTIVE | target.speed)
        };
        if urb.flags.contains(TransferFlags::DISABLE_SPD) {
            data_status.remove(TdStatus::SPD);
        }
        let mut toggle = true;
        for offset in (0..length).step_by(max_packet) {
            let len = max_packet.min(length - offset);
            let td = staged.td()?;
            self.sched.tds.get(td).fill(
                data_status,
                ERROR_LIMIT,
                target.token(data_pid, toggle, len),
                target.at(offset)?,
            );
            self.sched.append_td(qh, &mut tds, td, true);
            toggle = !toggle;
        }

        // The status stage runs opposite to the data stage.
        let status_pid = if data_in && length > 0 { PID_OUT } else { PID_IN };
        let td = staged.td()?;
        self.sched.tds.get(td).fill(
            TdStatus::ACTIVE | TdStatus::IOC | target.speed,
            ERROR_LIMIT,
            target.token(status_pid, true, 0),
            0,
        );
        self.sched.append_td(qh, &mut tds, td, true);

        self.sched.insert_qh(self.sched.control_tail(), qh)?;
        let reclaiming = !urb.device().is_low_speed();
        if reclaiming {
            self.sched.reclamation_get();
        }
        staged.commit();

        Ok(UrbPriv::Async(AsyncPriv {
            qh,
            status_stage: Some(tds.len() - 1),
            tds,
            setup: Some(setup_packet),
            retriggered: false,
            reclaiming,
        }))
    }

    fn build_bulk(&self, urb: &Urb) -> Result<UrbPriv> {
        let target = Target::new(urb)?;
        let pipe = urb.pipe;
        let device = urb.device();
        let max_packet = pipe.max_packet as usize;
        let length = urb.length();

        let (pid, mut status) = if pipe.is_in() {
            (PID_IN, TdStatus::ACTIVE | TdStatus::SPD)
        } else {
            (PID_OUT, TdStatus::ACTIVE)
        };
        if urb.flags.contains(TransferFlags::DISABLE_SPD) {
            status.remove(TdStatus::SPD);
        }

        let mut staged = Staged::new(self);
        let qh = staged.qh()?;
        let mut tds = SmallVec::new();
        let mut toggle = device.toggle(pipe.endpoint, pipe.direction);

        let mut offset = 0;
        loop {
            let len = max_packet.min(length - offset);
            let td = staged.td()?;
            self.sched.tds.get(td).fill(
                status,
                ERROR_LIMIT,
                target.token(pid, toggle, len),
                target.at(offset)?,
            );
            self.sched.append_td(qh, &mut tds, td, false);
            toggle = !toggle;
            offset += len;
            if offset >= length {
                break;
            }
        }

        if !pipe.is_in()
            && urb.flags.contains(TransferFlags::ZERO_PACKET)
            && length > 0
            && length % max_packet == 0
        {
            let td = staged.td()?;
            self.sched.tds.get(td).fill(
                status,
                ERROR_LIMIT,
                target.token(pid, toggle, 0),
                0,
            );
            self.sched.append_td(qh, &mut tds, td, false);
            toggle = !toggle;
        }

        if let Some(&last) = tds.last() {
            self.sched
                .tds
                .get(last)
                .ctrl_sts
                .fetch_or(TdStatus::IOC.bits(), Ordering::Release);
        }

        self.sched.insert_qh(self.sched.bulk_tail(pipe.endpoint), qh)?;
        self.sched.reclamation_get();
        staged.commit();
        // Corrected on completion if the transfer ends early.
        device.set_toggle(pipe.endpoint, pipe.direction, toggle);

        Ok(UrbPriv::Async(AsyncPriv {
            qh,
            tds,
            setup: None,
            status_stage: None,
            retriggered: false,
            reclaiming: true,
        }))
    }

    fn build_interrupt(&self, urb: &Urb) -> Result<UrbPriv> {
        let target = Target::new(urb)?;
        let pipe = urb.pipe;
        let length = urb.length();
        if length > pipe.max_packet as usize {
            return Err(Error::new(EMSGSIZE));
        }
        let level = interrupt_level(urb.interval);
        let pid = if pipe.is_in() { PID_IN } else { PID_OUT };
        let toggle = urb.device().toggle(pipe.endpoint, pipe.direction);

        let mut staged = Staged::new(self);
        let td = staged.td()?;
        self.sched.tds.get(td).fill(
            TdStatus::ACTIVE | TdStatus::IOC | target.speed,
            ERROR_LIMIT,
            target.token(pid, toggle, length),
            target.buffer,
        );
        self.sched.insert_td(Anchor::Interrupt(level), td);
        staged.commit();

        trace!(
            "interrupt endpoint {:#04x} at level {} (interval {})",
            pipe.endpoint_address(),
            level,
            urb.interval
        );
        Ok(UrbPriv::Interrupt(InterruptPriv { td, level }))
    }

    fn build_iso(&self, urb: &Urb, pending: &[IsoWindow]) -> Result<UrbPriv> {
        let target = Target::new(urb)?;
        let pipe = urb.pipe;
        let packets = urb.iso_lock().clone();
        if packets
            .iter()
            .any(|packet| packet.length > pipe.max_packet as usize)
        {
            return Err(Error::new(EMSGSIZE));
        }

        let request = IsoRequest {
            start: if urb.flags.contains(TransferFlags::ISO_ASAP) {
                IsoStart::Asap
            } else {
                IsoStart::At(urb.start_frame())
            },
            packets: packets.len(),
            pending,
        };
        let start = iso_start_frame(
            self.current_frame_number(),
            self.config.schedule.iso_latency,
            self.config.schedule.max_iso_packets,
            &request,
        )?;
        let window = IsoWindow::new(start, packets.len());

        let pid = if pipe.is_in() { PID_IN } else { PID_OUT };
        let mut staged = Staged::new(self);
        let mut tds = Vec::with_capacity(packets.len());
        for (index, packet) in packets.iter().enumerate() {
            // empty packets are gaps in the stream
            if packet.length == 0 {
                continue;
            }
            let td = staged.td()?;
            let buffer = target.at(packet.offset)?;
            self.sched.tds.get(td).fill(
                TdStatus::ACTIVE | TdStatus::IOS,
                0,
                target.token(pid, false, packet.length),
                buffer,
            );
            tds.push(IsoTd {
                td,
                packet: index,
                frame: window.frame(index),
                buffer,
            });
        }
        if let Some(last) = tds.last() {
            self.sched
                .tds
                .get(last.td)
                .ctrl_sts
                .fetch_or(TdStatus::IOC.bits(), Ordering::Release);
        }

        for iso_td in &tds {
            self.sched.insert_td(Anchor::Frame(iso_td.frame), iso_td.td);
        }
        staged.commit();
        urb.set_start_frame(start);

        trace!(
            "isochronous endpoint {:#04x}: {} packets from frame {}",
            pipe.endpoint_address(),
            packets.len(),
            start
        );
        Ok(UrbPriv::Iso(IsoPriv { window, tds }))
    }

    /// Clear a halted endpoint with CLEAR_FEATURE(ENDPOINT_HALT) and reset its data toggle.
    ///
    /// Blocks until the request completed, so it must not be called from a completion callback.
    pub fn clear_halt(&self, device: &Arc<UsbDevice>, pipe: Pipe) -> Result<()> {
        debug!(
            "clearing halt on endpoint {:#04x} of device {}",
            pipe.endpoint_address(),
            device.address()
        );
        let (sender, receiver) = crossbeam_channel::bounded(1);
        let request = UrbBuilder::new(device, Pipe::control(0, LOW_SPEED_MAX_PACKET))
            .setup(Setup::clear_endpoint_halt(pipe.endpoint_address()))
            .on_complete(move |urb| {
                let _ = sender.try_send(urb.status());
            })
            .build()?;
        self.submit(&request, false)?;

        match receiver.recv_timeout(self.config.clear_halt_timeout()) {
            Ok(Some(Ok(()))) => {
                device.set_halted(pipe.endpoint, pipe.direction, false);
                device.set_toggle(pipe.endpoint, pipe.direction, false);
                Ok(())
            }
            Ok(status) => {
                warn!(
                    "failed to clear halt on endpoint {:#04x}: {:?}",
                    pipe.endpoint_address(),
                    status
                );
                Err(Error::new(EPIPE))
            }
            Err(_) => {
                warn!(
                    "timeout clearing halt on endpoint {:#04x}",
                    pipe.endpoint_address()
                );
                let _ = self.unlink(&request);
                Err(Error::new(EPIPE))
            }
        }
    }
}
