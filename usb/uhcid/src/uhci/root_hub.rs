//! The emulated root hub.
//!
//! UHCI exposes its two ports as bare registers. The USB layer expects a hub, so requests to the
//! root hub device never reach the schedule: control requests are answered here from the port
//! registers, and the status change endpoint is fed by a timer that samples the change bits.
use std::cmp;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::timeout::Timeout;
use crossbeam_channel::{select, Receiver};
use log::{debug, info, trace, warn};
use syscall::error::{Error, Result, EBUSY, EINVAL};

use super::irq_reactor::CompletionContext;
use super::regs::*;
use super::{Uhci, UrbPriv};
use crate::driver_interface::*;
use crate::usb::*;

const PRODUCT: &str = "UHCI Host Controller";
/// Attempts to enable a port after reset before giving up.
const ENABLE_ATTEMPTS: usize = 10;
/// Recovery time after reset signalling ends, before the port is enabled.
const RESET_RECOVERY: Duration = Duration::from_micros(100);
const ENABLE_RETRY: Duration = Duration::from_millis(1);
const STATUS_ENDPOINT: u8 = 1;

/// English (United States).
const LANGUAGE_ID: u16 = 0x0409;

pub struct RootHub {
    device: Arc<UsbDevice>,
    serial: String,
    status_urb: Mutex<Option<Arc<Urb>>>,
    /// C_PORT_RESET has no register bit, so it is kept here.
    reset_changed: [AtomicBool; ROOT_PORTS],
    configuration: AtomicU8,
}

impl RootHub {
    pub fn new(device: Arc<UsbDevice>, serial: String) -> Self {
        Self {
            device,
            serial,
            status_urb: Mutex::new(None),
            reset_changed: Default::default(),
            configuration: AtomicU8::new(0),
        }
    }

    pub fn device(&self) -> &Arc<UsbDevice> {
        &self.device
    }

    fn status_urb(&self) -> Option<Arc<Urb>> {
        self.status_urb.lock().unwrap().clone()
    }

    /// Forget the status change transfer if it is `urb`.
    pub(crate) fn take_status_urb(&self, urb: &Urb) -> Option<Arc<Urb>> {
        let mut slot = self.status_urb.lock().unwrap();
        match slot.as_ref() {
            Some(pending) if std::ptr::eq(Arc::as_ptr(pending), urb) => slot.take(),
            _ => None,
        }
    }

    pub fn shutdown(&self) {
        self.status_urb.lock().unwrap().take();
        self.configuration.store(0, Ordering::Release);
    }
}

fn device_descriptor() -> DeviceDescriptor {
    DeviceDescriptor {
        length: std::mem::size_of::<DeviceDescriptor>() as u8,
        kind: DescriptorKind::Device as u8,
        usb: 0x0110,
        class: 9,
        sub_class: 0,
        protocol: 0,
        packet_size: 64,
        vendor: 0,
        product: 0,
        release: 0,
        manufacturer_str: 0,
        product_str: 2,
        serial_str: 1,
        configurations: 1,
    }
}

/// Configuration, interface and status change endpoint, in one block.
fn configuration_descriptor() -> Vec<u8> {
    let config_len = std::mem::size_of::<ConfigDescriptor>();
    let interface_len = std::mem::size_of::<InterfaceDescriptor>();
    let endpoint_len = std::mem::size_of::<EndpointDescriptor>();

    let config = ConfigDescriptor {
        length: config_len as u8,
        kind: DescriptorKind::Configuration as u8,
        total_length: (config_len + interface_len + endpoint_len) as u16,
        interfaces: 1,
        configuration_value: 1,
        configuration_str: 0,
        // self powered, remote wakeup
        attributes: 0xE0,
        max_power: 0,
    };
    let interface = InterfaceDescriptor {
        length: interface_len as u8,
        kind: DescriptorKind::Interface as u8,
        number: 0,
        alternate_setting: 0,
        endpoints: 1,
        class: 9,
        sub_class: 0,
        protocol: 0,
        interface_str: 0,
    };
    let endpoint = EndpointDescriptor {
        length: endpoint_len as u8,
        kind: DescriptorKind::Endpoint as u8,
        address: ENDP_ADDR_DIR_IN | STATUS_ENDPOINT,
        attributes: ENDP_ATTR_INTERRUPT,
        // one bit per port plus the hub bit
        max_packet_size: 1,
        interval: 255,
    };

    let mut bytes = Vec::with_capacity(config_len + interface_len + endpoint_len);
    bytes.extend_from_slice(unsafe { plain::as_bytes(&config) });
    bytes.extend_from_slice(unsafe { plain::as_bytes(&interface) });
    bytes.extend_from_slice(unsafe { plain::as_bytes(&endpoint) });
    bytes
}

fn hub_descriptor() -> HubDescriptorV2 {
    HubDescriptorV2 {
        ports: ROOT_PORTS as u8,
        characteristics: HUB_CHAR_NO_POWER_SWITCHING | HUB_CHAR_GLOBAL_OVER_CURRENT,
        power_on_good: 1,
        ..Default::default()
    }
}

fn string_descriptor(text: &str) -> Vec<u8> {
    let mut bytes = vec![0, DescriptorKind::String as u8];
    for unit in text.encode_utf16() {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes[0] = bytes.len() as u8;
    bytes
}

/// Translate a one-based hub port number.
fn port_index(index: u16) -> Option<usize> {
    match index as usize {
        port @ 1..=ROOT_PORTS => Some(port - 1),
        _ => None,
    }
}

enum Reply {
    Data(Vec<u8>),
    Empty,
}

impl Uhci {
    pub(crate) fn root_hub_submit(&self, urb: &Arc<Urb>) -> Result<()> {
        match urb.pipe.kind {
            PipeKind::Control => {
                let setup = urb.setup.ok_or(Error::new(EINVAL))?;
                if !urb.begin() {
                    return Err(Error::new(EBUSY));
                }
                let status = self.root_hub_control(urb, &setup);
                trace!("root hub {:?}: {:?}", setup, status);
                urb.finish(status);
                Ok(())
            }
            PipeKind::Interrupt if urb.pipe.endpoint == STATUS_ENDPOINT && urb.pipe.is_in() => {
                let mut registry = self.registry.lock().unwrap();
                let mut slot = self.root_hub.status_urb.lock().unwrap();
                if slot.is_some() || !urb.begin() {
                    return Err(Error::new(EBUSY));
                }
                *urb.hcpriv.lock().unwrap() = Some(UrbPriv::RootHub);
                urb.device().get();
                registry.push(Arc::clone(urb));
                *slot = Some(Arc::clone(urb));
                debug!("root hub status polling armed");
                Ok(())
            }
            _ => Err(Error::new(EINVAL)),
        }
    }

    fn root_hub_control(&self, urb: &Urb, setup: &Setup) -> TransferResult {
        let value = setup.value;
        let index = setup.index;
        let reply = match setup.request_word() {
            // GET_STATUS, device: self powered
            0x8000 => Reply::Data(vec![1, 0]),
            0x8100 | 0x8200 => Reply::Data(vec![0, 0]),
            // GET_STATUS, hub: no local power or over-current changes
            0xA000 => Reply::Data(vec![0; 4]),
            0xA300 => {
                let port = port_index(index).ok_or(TransferError::Stall)?;
                Reply::Data(self.port_status(port).bits().to_le_bytes().to_vec())
            }

            // CLEAR_FEATURE and SET_FEATURE on device, endpoint and hub have nothing to act on
            0x0001 | 0x0201 | 0x2001 | 0x0003 | 0x2003 => Reply::Empty,
            0x2301 => {
                let port = port_index(index).ok_or(TransferError::Stall)?;
                self.clear_port_feature(port, value)?;
                Reply::Empty
            }
            0x2303 => {
                let port = port_index(index).ok_or(TransferError::Stall)?;
                self.set_port_feature(port, value)?;
                Reply::Empty
            }

            0x0005 => {
                self.root_hub.device.set_address(value as u8);
                Reply::Empty
            }
            0x8006 => self.root_hub_descriptor(value)?,
            0xA006 => Reply::Data(unsafe { plain::as_bytes(&hub_descriptor()) }.to_vec()),
            0x8008 => Reply::Data(vec![self.root_hub.configuration.load(Ordering::Acquire)]),
            0x0009 if value <= 1 => {
                self.root_hub
                    .configuration
                    .store(value as u8, Ordering::Release);
                Reply::Empty
            }
            0x810A => Reply::Data(vec![0]),
            0x010B if value == 0 => Reply::Empty,
            request => {
                debug!("root hub: unsupported request {:#06x}", request);
                return Err(TransferError::Stall);
            }
        };

        let copied = match reply {
            Reply::Data(data) => {
                let wanted = cmp::min(data.len(), cmp::min(setup.length as usize, urb.length()));
                match urb.buffer() {
                    Some(mut buffer) => {
                        buffer[..wanted].copy_from_slice(&data[..wanted]);
                        wanted
                    }
                    None => 0,
                }
            }
            Reply::Empty => 0,
        };
        urb.set_actual_length(copied);
        Ok(())
    }

    fn root_hub_descriptor(&self, value: u16) -> std::result::Result<Reply, TransferError> {
        let index = value as u8;
        let data = match DescriptorKind::from_u8((value >> 8) as u8) {
            Some(DescriptorKind::Device) => {
                unsafe { plain::as_bytes(&device_descriptor()) }.to_vec()
            }
            Some(DescriptorKind::Configuration) => configuration_descriptor(),
            Some(DescriptorKind::String) => match index {
                0 => {
                    let mut bytes = vec![4, DescriptorKind::String as u8];
                    bytes.extend_from_slice(&LANGUAGE_ID.to_le_bytes());
                    bytes
                }
                1 => string_descriptor(&self.root_hub.serial),
                2 => string_descriptor(PRODUCT),
                _ => return Err(TransferError::Stall),
            },
            Some(DescriptorKind::Hub) => unsafe { plain::as_bytes(&hub_descriptor()) }.to_vec(),
            _ => return Err(TransferError::Stall),
        };
        Ok(Reply::Data(data))
    }

    /// The hub class view of a root port.
    pub fn port_status(&self, port: usize) -> HubPortStatusV2 {
        let portsc = self.regs().port(port);
        let mut status = HubPortStatusV2::POWER;

        let map = [
            (PortSc::CCS, HubPortStatusV2::CONNECTION),
            (PortSc::PE, HubPortStatusV2::ENABLE),
            (PortSc::SUSP, HubPortStatusV2::SUSPEND),
            (PortSc::OC, HubPortStatusV2::OVER_CURRENT),
            (PortSc::PR, HubPortStatusV2::RESET),
            (PortSc::LSDA, HubPortStatusV2::LOW_SPEED),
            (PortSc::CSC, HubPortStatusV2::CONNECTION_CHANGED),
            (PortSc::PEC, HubPortStatusV2::ENABLE_CHANGED),
            (PortSc::RD, HubPortStatusV2::SUSPEND_CHANGED),
            (PortSc::OCC, HubPortStatusV2::OVER_CURRENT_CHANGED),
        ];
        for (bit, flag) in map {
            if portsc.contains(bit) {
                status |= flag;
            }
        }
        if self.root_hub.reset_changed[port].load(Ordering::Acquire) {
            status |= HubPortStatusV2::RESET_CHANGED;
        }
        status
    }

    fn set_port_feature(&self, port: usize, feature: u16) -> TransferResult {
        match HubPortFeature::from_u16(feature) {
            Some(HubPortFeature::PortReset) => {
                self.reset_port(port);
            }
            Some(HubPortFeature::PortSuspend) => self.regs().set_port(port, PortSc::SUSP),
            Some(HubPortFeature::PortEnable) => self.regs().set_port(port, PortSc::PE),
            // ports are always powered
            Some(HubPortFeature::PortPower) => (),
            _ => {
                debug!("root hub: SET_FEATURE {} on port {}", feature, port + 1);
                return Err(TransferError::Stall);
            }
        }
        Ok(())
    }

    fn clear_port_feature(&self, port: usize, feature: u16) -> TransferResult {
        match HubPortFeature::from_u16(feature) {
            Some(HubPortFeature::PortEnable) => self.regs().clear_port(port, PortSc::PE),
            Some(HubPortFeature::PortSuspend) => {
                self.regs().clear_port(port, PortSc::SUSP | PortSc::RD)
            }
            Some(HubPortFeature::PortPower) => (),
            Some(HubPortFeature::CPortConnection) => self.regs().ack_port(port, PortSc::CSC),
            Some(HubPortFeature::CPortEnable) => self.regs().ack_port(port, PortSc::PEC),
            Some(HubPortFeature::CPortSuspend) => self.regs().clear_port(port, PortSc::RD),
            Some(HubPortFeature::CPortOverCurrent) => self.regs().ack_port(port, PortSc::OCC),
            Some(HubPortFeature::CPortReset) => {
                self.root_hub.reset_changed[port].store(false, Ordering::Release)
            }
            _ => {
                debug!("root hub: CLEAR_FEATURE {} on port {}", feature, port + 1);
                return Err(TransferError::Stall);
            }
        }
        Ok(())
    }

    /// Drive reset signalling on a port, then enable it. Returns whether the port came up
    /// enabled.
    pub fn reset_port(&self, port: usize) -> bool {
        info!("UHCI resetting port {}", port + 1);
        self.regs().set_port(port, PortSc::PR);
        Timeout::from_millis(self.config.root_hub.port_reset_hold_ms).wait();
        self.regs().clear_port(port, PortSc::PR);
        Timeout::new(RESET_RECOVERY).wait();

        let mut enabled = false;
        for _ in 0..ENABLE_ATTEMPTS {
            let mut regs = self.regs();
            let portsc = regs.port(port);
            if !portsc.contains(PortSc::CCS) {
                break;
            }
            if portsc.contains(PortSc::PE) {
                enabled = true;
                break;
            }
            // the connect and enable changes caused by the reset itself are not reported
            regs.ack_port(port, PortSc::CSC | PortSc::PEC);
            regs.set_port(port, PortSc::PE);
            drop(regs);
            Timeout::new(ENABLE_RETRY).wait();
        }

        self.root_hub.reset_changed[port].store(true, Ordering::Release);
        if enabled {
            info!("UHCI port {} enabled", port + 1);
        } else {
            warn!("UHCI port {} did not enable after reset", port + 1);
        }
        enabled
    }

    /// Sample the port change bits and complete the status change transfer if any port has
    /// something to report. Returns whether it was completed.
    pub fn root_hub_poll(&self) -> bool {
        let mut bitmap = 0u8;
        for port in 0..ROOT_PORTS {
            if self.port_status(port).has_changes() {
                bitmap |= 1 << (port + 1);
            }
        }
        if bitmap == 0 {
            return false;
        }
        let Some(urb) = self.root_hub.status_urb() else {
            return false;
        };
        trace!("root hub change bitmap {:#04x}", bitmap);

        let _context = CompletionContext::enter();
        let copied = match urb.buffer() {
            Some(mut buffer) if urb.length() > 0 => {
                buffer[0] = bitmap;
                1
            }
            _ => 0,
        };
        urb.set_actual_length(copied);
        if urb.interval == 0 {
            self.retire(&urb, Ok(()));
        } else {
            urb.report(Ok(()));
        }
        true
    }
}

/// Poll the root ports until told to stop.
pub(crate) fn run_timer(hci: Arc<Uhci>, stop: Receiver<()>) {
    let ticker = crossbeam_channel::tick(hci.config().root_hub_poll_interval());
    loop {
        select! {
            recv(stop) -> _ => break,
            recv(ticker) -> _ => {
                hci.root_hub_poll();
            }
        }
    }
    debug!("root hub timer stopped");
}

#[cfg(test)]
mod test {
    use super::super::sim;
    use super::*;

    fn control(uhci: &Uhci, setup: Setup) -> (TransferResult, Vec<u8>) {
        let urb = UrbBuilder::new(uhci.root_hub_device(), Pipe::control(0, 64))
            .setup(setup)
            .buffer(sim::buffer(uhci, 64))
            .length(setup.length as usize)
            .build()
            .unwrap();
        uhci.submit_urb(&urb).unwrap();
        let data = urb.buffer().unwrap()[..urb.actual_length()].to_vec();
        (urb.status().unwrap(), data)
    }

    fn port_status(uhci: &Uhci, port: u16) -> HubPortStatusV2 {
        let (status, data) = control(uhci, Setup::get_port_status(port));
        assert_eq!(status, Ok(()));
        HubPortStatusV2::from_bits_truncate(u32::from_le_bytes(data.try_into().unwrap()))
    }

    #[test]
    fn descriptors() {
        let (uhci, _hc) = sim::controller(sim::config());

        let (status, data) = control(&uhci, Setup::get_descriptor(DescriptorKind::Device, 0, 0, 18));
        assert_eq!(status, Ok(()));
        assert_eq!(data.len(), 18);
        assert_eq!(data[1], DescriptorKind::Device as u8);
        assert_eq!(data[4], 9);

        // a short request gets a prefix
        let (_, data) = control(&uhci, Setup::get_descriptor(DescriptorKind::Configuration, 0, 0, 9));
        assert_eq!(data.len(), 9);
        assert_eq!(u16::from_le_bytes([data[2], data[3]]), 25);
        let (_, data) = control(&uhci, Setup::get_descriptor(DescriptorKind::Configuration, 0, 0, 25));
        assert_eq!(&data[18..21], &[7, DescriptorKind::Endpoint as u8, 0x81]);

        let (_, data) = control(&uhci, Setup::get_hub_descriptor(9));
        assert_eq!(data[2], 2);

        let (_, data) = control(&uhci, Setup::get_descriptor(DescriptorKind::String, 0, 0, 4));
        assert_eq!(data, vec![4, 3, 0x09, 0x04]);
        let (_, data) = control(&uhci, Setup::get_descriptor(DescriptorKind::String, 2, LANGUAGE_ID, 64));
        assert_eq!(data[0] as usize, 2 + 2 * PRODUCT.len());

        let (status, _) = control(&uhci, Setup::get_descriptor(DescriptorKind::String, 7, LANGUAGE_ID, 64));
        assert_eq!(status, Err(TransferError::Stall));
    }

    #[test]
    fn address_and_configuration() {
        let (uhci, _hc) = sim::controller(sim::config());
        assert_eq!(control(&uhci, Setup::set_address(1)).0, Ok(()));
        assert_eq!(uhci.root_hub_device().address(), 1);
        assert_eq!(control(&uhci, Setup::set_configuration(1)).0, Ok(()));
        assert_eq!(control(&uhci, Setup::get_configuration()).1, vec![1]);
        assert_eq!(
            control(&uhci, Setup::set_configuration(2)).0,
            Err(TransferError::Stall)
        );
    }

    #[test]
    fn port_status_decoding() {
        let (uhci, hc) = sim::controller(sim::config());
        assert_eq!(port_status(&uhci, 1), HubPortStatusV2::POWER);

        hc.connect(0, true);
        let status = port_status(&uhci, 1);
        assert!(status.contains(
            HubPortStatusV2::CONNECTION | HubPortStatusV2::LOW_SPEED | HubPortStatusV2::CONNECTION_CHANGED
        ));
        assert!(!status.contains(HubPortStatusV2::ENABLE));

        assert_eq!(
            control(&uhci, Setup::clear_port_feature(1, HubPortFeature::CPortConnection as u16)).0,
            Ok(())
        );
        assert!(!port_status(&uhci, 1).has_changes());

        // port numbers are one-based
        assert_eq!(control(&uhci, Setup::get_port_status(0)).0, Err(TransferError::Stall));
        assert_eq!(control(&uhci, Setup::get_port_status(3)).0, Err(TransferError::Stall));
    }

    #[test]
    fn reset_enables_port() {
        let (uhci, hc) = sim::controller(sim::config());
        hc.connect(1, true);
        assert_eq!(
            control(&uhci, Setup::set_port_feature(2, HubPortFeature::PortReset as u16)).0,
            Ok(())
        );
        let status = port_status(&uhci, 2);
        assert!(status.contains(
            HubPortStatusV2::CONNECTION
                | HubPortStatusV2::ENABLE
                | HubPortStatusV2::LOW_SPEED
                | HubPortStatusV2::RESET_CHANGED
        ));
        assert!(!status.contains(HubPortStatusV2::RESET));
        assert!(!status.contains(HubPortStatusV2::CONNECTION_CHANGED));
        assert!(hc.port(1).contains(PortSc::PE));

        control(&uhci, Setup::clear_port_feature(2, HubPortFeature::CPortReset as u16));
        assert!(!port_status(&uhci, 2).has_changes());
    }

    #[test]
    fn reset_without_device_stays_disabled() {
        let (uhci, hc) = sim::controller(sim::config());
        assert!(!uhci.reset_port(0));
        assert!(!hc.port(0).contains(PortSc::PE));
    }

    #[test]
    fn status_change_endpoint() {
        let (uhci, hc) = sim::controller(sim::config());
        let (results, callback) = sim::recorder();
        let urb = UrbBuilder::new(uhci.root_hub_device(), Pipe::interrupt(1, Direction::In, 1))
            .interval(255)
            .buffer(sim::buffer(&uhci, 1))
            .on_complete(callback)
            .build()
            .unwrap();
        uhci.submit_urb(&urb).unwrap();
        assert_eq!(uhci.submit_urb(&urb), Err(Error::new(EBUSY)));

        // nothing changed, nothing reported
        assert!(!uhci.root_hub_poll());
        assert!(results.lock().unwrap().is_empty());

        hc.connect(1, false);
        assert!(uhci.root_hub_poll());
        assert_eq!(*results.lock().unwrap(), vec![Ok(())]);
        assert_eq!(urb.buffer().unwrap()[0], 0b100);
        assert!(urb.is_pending());

        assert_eq!(uhci.unlink_urb(&urb), Ok(UnlinkProgress::Done));
        assert_eq!(uhci.pending_transfers(), 0);
        assert!(!uhci.root_hub_poll());
    }

    #[test]
    fn one_shot_status_transfer_retires() {
        let (uhci, hc) = sim::controller(sim::config());
        let urb = UrbBuilder::new(uhci.root_hub_device(), Pipe::interrupt(1, Direction::In, 1))
            .buffer(sim::buffer(&uhci, 1))
            .build()
            .unwrap();
        uhci.submit_urb(&urb).unwrap();
        hc.connect(0, false);
        assert!(uhci.root_hub_poll());
        assert_eq!(urb.state(), UrbState::Completed);
        assert_eq!(urb.buffer().unwrap()[0], 0b10);
        assert_eq!(uhci.pending_transfers(), 0);

        // the slot is free again
        uhci.submit_urb(&urb).unwrap();
    }

    #[test]
    fn bulk_to_root_hub_is_rejected() {
        let (uhci, _hc) = sim::controller(sim::config());
        let urb = UrbBuilder::new(uhci.root_hub_device(), Pipe::bulk(1, Direction::In, 64))
            .buffer(sim::buffer(&uhci, 64))
            .build()
            .unwrap();
        assert_eq!(uhci.submit_urb(&urb), Err(Error::new(EINVAL)));
    }
}
