//! A software controller for tests: a register block with UHCI semantics and a schedule walker
//! that executes the descriptors the driver links into the frame list.
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};

use common::dma::{BusMapper, BusWindow, Dma};

use super::desc::*;
use super::regs::*;
use super::Uhci;
use crate::config::UhciConfig;
use crate::driver_interface::*;

/// What the device on the other end of the wire does with one packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Response {
    /// Data moved; for IN this is the number of bytes the device sent.
    Ack(usize),
    /// Full-length acknowledge.
    Full,
    Nak,
    Stall,
    /// The TD retires with these error bits.
    Error(TdStatus),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Packet {
    pub pid: u8,
    pub address: u8,
    pub endpoint: u8,
    pub toggle: bool,
    pub max_len: usize,
    pub frame: u16,
    pub isochronous: bool,
}

#[derive(Default)]
struct SimState {
    cmd: u16,
    sts: u16,
    intr: u16,
    frnum: u16,
    sofmod: u16,
    flbase: u32,
    ports: [u16; ROOT_PORTS],
}

impl SimState {
    fn port_write(&mut self, port: usize, value: u16) {
        let value = PortSc::from_bits_truncate(value);
        let mut current = PortSc::from_bits_truncate(self.ports[port]);
        current -= value & PortSc::WC;
        let control = PortSc::PE | PortSc::PR | PortSc::SUSP | PortSc::RD;
        let was_resetting = current.contains(PortSc::PR);
        current = (current - control) | (value & control);
        if was_resetting && !current.contains(PortSc::PR) {
            // reset signalling disables the port
            current.remove(PortSc::PE);
        }
        if !current.contains(PortSc::CCS) {
            current.remove(PortSc::PE);
        }
        self.ports[port] = current.bits();
    }
}

pub struct SimRegisters {
    state: Arc<Mutex<SimState>>,
}

impl UhciRegisters for SimRegisters {
    fn read16(&self, offset: u16) -> u16 {
        let state = self.state.lock().unwrap();
        match offset {
            USBCMD => state.cmd,
            USBSTS => state.sts,
            USBINTR => state.intr,
            FRNUM => state.frnum,
            SOFMOD => state.sofmod,
            _ if offset >= PORTSC1 && offset < PORTSC1 + 2 * ROOT_PORTS as u16 => {
                state.ports[(offset - PORTSC1) as usize / 2] | PortSc::RESERVED.bits()
            }
            _ => 0,
        }
    }

    fn write16(&mut self, offset: u16, value: u16) {
        let mut state = self.state.lock().unwrap();
        match offset {
            USBCMD if value & USBCMD_HCRESET != 0 => {
                let ports = state.ports.map(|port| {
                    (PortSc::from_bits_truncate(port) & (PortSc::CCS | PortSc::LSDA)).bits()
                });
                *state = SimState {
                    sts: USBSTS_HCH,
                    ports,
                    ..SimState::default()
                };
            }
            USBCMD => {
                state.cmd = value;
                if value & USBCMD_RS != 0 {
                    state.sts &= !USBSTS_HCH;
                } else {
                    state.sts |= USBSTS_HCH;
                }
            }
            USBSTS => state.sts &= !(value & USBSTS_ACK_MASK),
            USBINTR => state.intr = value,
            FRNUM => state.frnum = value & 0x7FF,
            SOFMOD => state.sofmod = value,
            _ if offset >= PORTSC1 && offset < PORTSC1 + 2 * ROOT_PORTS as u16 => {
                state.port_write((offset - PORTSC1) as usize / 2, value)
            }
            _ => (),
        }
    }

    fn read32(&self, offset: u16) -> u32 {
        match offset {
            FLBASEADD => self.state.lock().unwrap().flbase,
            _ => self.read16(offset) as u32,
        }
    }

    fn write32(&mut self, offset: u16, value: u32) {
        match offset {
            FLBASEADD => self.state.lock().unwrap().flbase = value & !0xFFF,
            _ => self.write16(offset, value as u16),
        }
    }
}

/// The test's handle on the simulated controller.
#[derive(Clone)]
pub struct SimHc {
    state: Arc<Mutex<SimState>>,
    /// Packets seen on the wire, oldest first.
    pub log: Arc<Mutex<VecDeque<Packet>>>,
}

pub fn config() -> UhciConfig {
    let mut config = UhciConfig::default();
    config.pool.transfer_descriptors = 256;
    config.pool.queue_heads = 32;
    config.controller.polling_interval_ms = 1;
    config.root_hub.poll_interval_ms = 2;
    // keeps the walk to one pass per frame, so packet logs stay readable
    config.schedule.bandwidth_reclamation = false;
    config
}

/// A running controller backed by the simulator.
pub fn controller(config: UhciConfig) -> (Arc<Uhci>, SimHc) {
    let state = Arc::new(Mutex::new(SimState::default()));
    let regs = Box::new(SimRegisters {
        state: Arc::clone(&state),
    });
    let mapper: Arc<dyn BusMapper> = Arc::new(BusWindow::new(0x0100_0000, 0x0400_0000));
    let uhci = Uhci::new(regs, mapper, config).unwrap();
    uhci.start().unwrap();
    (
        Arc::new(uhci),
        SimHc {
            state,
            log: Arc::new(Mutex::new(VecDeque::new())),
        },
    )
}

/// An addressed full-speed device behind the root hub.
pub fn device(uhci: &Uhci, address: u8) -> Arc<UsbDevice> {
    let device = uhci.alloc_device(Speed::Full).unwrap();
    device.set_address(address);
    device
}

pub fn low_speed_device(uhci: &Uhci, address: u8) -> Arc<UsbDevice> {
    let device = uhci.alloc_device(Speed::Low).unwrap();
    device.set_address(address);
    device
}

pub fn buffer(uhci: &Uhci, len: usize) -> Dma<[u8]> {
    Dma::<[u8]>::buffer(len, uhci.mapper()).unwrap()
}

pub type Results = Arc<Mutex<Vec<TransferResult>>>;

/// A completion callback that records every status it is called with.
pub fn recorder() -> (Results, impl Fn(&Urb) + Send + Sync + 'static) {
    let results = Results::default();
    let sink = Arc::clone(&results);
    (results, move |urb: &Urb| {
        if let Some(status) = urb.status() {
            sink.lock().unwrap().push(status);
        }
    })
}

const VISIT_BUDGET: usize = 4096;

impl SimHc {
    pub fn frame(&self) -> u16 {
        self.state.lock().unwrap().frnum & 0x3FF
    }

    pub fn status(&self) -> u16 {
        self.state.lock().unwrap().sts
    }

    pub fn raise(&self, bits: u16) {
        self.state.lock().unwrap().sts |= bits;
    }

    /// Halt the controller behind the driver's back.
    pub fn halt(&self) {
        let mut state = self.state.lock().unwrap();
        state.cmd &= !USBCMD_RS;
        state.sts |= USBSTS_HCH;
    }

    pub fn command(&self) -> u16 {
        self.state.lock().unwrap().cmd
    }

    pub fn port(&self, port: usize) -> PortSc {
        PortSc::from_bits_truncate(self.state.lock().unwrap().ports[port])
    }

    pub fn connect(&self, port: usize, low_speed: bool) {
        let mut state = self.state.lock().unwrap();
        let mut bits = PortSc::CCS | PortSc::CSC;
        if low_speed {
            bits |= PortSc::LSDA;
        }
        state.ports[port] |= bits.bits();
    }

    pub fn disconnect(&self, port: usize) {
        let mut state = self.state.lock().unwrap();
        let mut current = PortSc::from_bits_truncate(state.ports[port]);
        if current.contains(PortSc::PE) {
            current |= PortSc::PEC;
        }
        current = (current - PortSc::CCS - PortSc::PE - PortSc::LSDA) | PortSc::CSC;
        state.ports[port] = current.bits();
    }

    pub fn packets(&self) -> Vec<Packet> {
        self.log.lock().unwrap().iter().copied().collect()
    }

    /// Execute one frame of the schedule against `device`.
    pub fn run_frame(&self, uhci: &Uhci, device: &mut dyn FnMut(&Packet) -> Response) {
        let (frame, flbase) = {
            let state = self.state.lock().unwrap();
            if state.cmd & USBCMD_RS == 0 {
                return;
            }
            (state.frnum & 0x3FF, state.flbase)
        };
        assert_eq!(flbase, uhci.sched.frame_list_base());

        let mut walk = Walk {
            uhci,
            frame,
            device,
            log: &self.log,
            interrupt: false,
            error: false,
        };
        walk.frame(uhci.sched.frame_entry(frame as usize));

        let mut state = self.state.lock().unwrap();
        if walk.interrupt {
            state.sts |= USBSTS_USBINT;
        }
        if walk.error {
            state.sts |= USBSTS_ERROR;
        }
        state.frnum = (state.frnum + 1) & 0x7FF;
    }

    /// Run `frames` frames, then let the driver process completions.
    pub fn run(&self, uhci: &Uhci, frames: usize, device: &mut dyn FnMut(&Packet) -> Response) {
        for _ in 0..frames {
            self.run_frame(uhci, device);
        }
        uhci.handle_interrupt();
    }

    /// Advance the frame counter without executing anything.
    pub fn skip_frames(&self, frames: u16) {
        let mut state = self.state.lock().unwrap();
        state.frnum = (state.frnum + frames) & 0x7FF;
    }
}

enum Outcome {
    Nak,
    Done { short: bool },
    Failed,
}

struct Walk<'a> {
    uhci: &'a Uhci,
    frame: u16,
    device: &'a mut dyn FnMut(&Packet) -> Response,
    log: &'a Mutex<VecDeque<Packet>>,
    interrupt: bool,
    error: bool,
}

impl Walk<'_> {
    fn frame(&mut self, mut link: u32) {
        let sched = &self.uhci.sched;
        for _ in 0..VISIT_BUDGET {
            if link & LINK_TERMINATE != 0 {
                return;
            }
            if link & LINK_QH != 0 {
                let qh = sched
                    .qhs
                    .lookup(link & LINK_ADDR_MASK)
                    .expect("link to a QH outside the pool");
                self.queue(sched.qhs.get(qh));
                link = sched.qhs.get(qh).head.load(Ordering::Acquire);
            } else {
                let td = sched
                    .tds
                    .lookup(link & LINK_ADDR_MASK)
                    .expect("link to a TD outside the pool");
                let td = sched.tds.get(td);
                if td.is_active() {
                    self.execute(td);
                }
                link = td.link.load(Ordering::Acquire);
            }
        }
    }

    fn queue(&mut self, qh: &Qh) {
        let sched = &self.uhci.sched;
        loop {
            let element = qh.element.load(Ordering::Acquire);
            if element & (LINK_TERMINATE | LINK_QH) != 0 {
                return;
            }
            let td = sched
                .tds
                .lookup(element & LINK_ADDR_MASK)
                .expect("QH element outside the pool");
            let td = sched.tds.get(td);
            if !td.is_active() {
                return;
            }
            match self.execute(td) {
                Outcome::Nak | Outcome::Failed => return,
                Outcome::Done { short } if short && td.status().contains(TdStatus::SPD) => {
                    // the element stays on the short TD until software moves it
                    return;
                }
                Outcome::Done { .. } => {
                    let next = td.link.load(Ordering::Acquire);
                    qh.element.store(next & !LINK_DEPTH, Ordering::Release);
                    if next & LINK_DEPTH == 0 {
                        return;
                    }
                }
            }
        }
    }

    fn execute(&mut self, td: &Td) -> Outcome {
        let token = td.token.load(Ordering::Acquire);
        let status = td.status();
        let packet = Packet {
            pid: td.pid(),
            address: ((token >> TOKEN_DEVADDR_SHIFT) & 0x7F) as u8,
            endpoint: ((token >> TOKEN_ENDPT_SHIFT) & 0xF) as u8,
            toggle: td.toggle(),
            max_len: td.max_len(),
            frame: self.frame,
            isochronous: status.contains(TdStatus::IOS),
        };
        self.log.lock().unwrap().push_back(packet);

        let keep = td.ctrl_sts.load(Ordering::Acquire)
            & (TdStatus::IOC | TdStatus::IOS | TdStatus::LOW_SPEED | TdStatus::SPD).bits()
            | (td.ctrl_sts.load(Ordering::Acquire) & CTRL_CERR_MASK);
        let ioc = status.contains(TdStatus::IOC);

        match (self.device)(&packet) {
            Response::Nak if !packet.isochronous => {
                td.ctrl_sts
                    .fetch_or(TdStatus::NAK.bits(), Ordering::AcqRel);
                Outcome::Nak
            }
            Response::Nak => self.retire(td, keep, 0, ioc),
            Response::Full => self.retire(td, keep, packet.max_len, ioc),
            Response::Ack(len) => self.retire(td, keep, len.min(packet.max_len), ioc),
            Response::Stall => {
                td.ctrl_sts
                    .store(keep | TdStatus::STALLED.bits() | CTRL_ACTLEN_MASK, Ordering::Release);
                self.interrupt |= ioc;
                self.error = true;
                Outcome::Failed
            }
            Response::Error(bits) => {
                let bits = bits | if packet.isochronous { TdStatus::empty() } else { TdStatus::STALLED };
                td.ctrl_sts
                    .store((keep & !CTRL_CERR_MASK) | bits.bits() | CTRL_ACTLEN_MASK, Ordering::Release);
                self.interrupt |= ioc;
                self.error = true;
                Outcome::Failed
            }
        }
    }

    fn retire(&mut self, td: &Td, keep: u32, len: usize, ioc: bool) -> Outcome {
        let short = len < td.max_len();
        td.ctrl_sts
            .store(keep | encode_len(len), Ordering::Release);
        self.interrupt |= ioc || (short && keep & TdStatus::SPD.bits() != 0);
        Outcome::Done { short }
    }
}
