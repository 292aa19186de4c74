//! The interface the generic USB layer uses to talk to the host controller.
//!
//! A transfer is described by an [`Urb`] (USB Request Block). The USB layer builds one with
//! [`UrbBuilder`], hands it to [`HostController::submit_urb`], and is told about the result
//! through the completion callback. Devices are represented by [`UsbDevice`], which also carries
//! the per-endpoint data toggles and halt bits that survive between transfers.
use std::fmt;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use common::dma::Dma;
use syscall::error::{Error, Result};
use syscall::error::{
    ECONNRESET, EILSEQ, EINVAL, ENOENT, ENOSR, EOVERFLOW, EPIPE, EPROTO, EREMOTEIO, ESHUTDOWN,
    ETIMEDOUT,
};
use thiserror::Error;

use crate::uhci::UrbPriv;
use crate::usb::Setup;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Speed {
    Low,
    Full,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum PipeKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Direction {
    Out,
    In,
}

/// The endpoint a transfer is addressed to. The device address comes from the owning
/// [`UsbDevice`] at submission time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Pipe {
    pub kind: PipeKind,
    pub endpoint: u8,
    pub direction: Direction,
    pub max_packet: u16,
}

impl Pipe {
    pub const fn control(endpoint: u8, max_packet: u16) -> Self {
        Self {
            kind: PipeKind::Control,
            endpoint,
            direction: Direction::Out,
            max_packet,
        }
    }
    pub const fn bulk(endpoint: u8, direction: Direction, max_packet: u16) -> Self {
        Self {
            kind: PipeKind::Bulk,
            endpoint,
            direction,
            max_packet,
        }
    }
    pub const fn interrupt(endpoint: u8, direction: Direction, max_packet: u16) -> Self {
        Self {
            kind: PipeKind::Interrupt,
            endpoint,
            direction,
            max_packet,
        }
    }
    pub const fn isochronous(endpoint: u8, direction: Direction, max_packet: u16) -> Self {
        Self {
            kind: PipeKind::Isochronous,
            endpoint,
            direction,
            max_packet,
        }
    }
    pub fn is_in(&self) -> bool {
        self.direction == Direction::In
    }
    /// The endpoint address as it appears in descriptors (direction in bit 7).
    pub fn endpoint_address(&self) -> u8 {
        (self.endpoint & 0x0F) | if self.is_in() { 0x80 } else { 0 }
    }
}

bitflags::bitflags! {
    pub struct TransferFlags: u32 {
        /// A short read completes the transfer with [`TransferError::ShortPacket`].
        const SHORT_NOT_OK = 1 << 0;
        /// Schedule an isochronous transfer right after the endpoint's previous one, or as soon
        /// as possible if there is none.
        const ISO_ASAP = 1 << 1;
        /// Unlinking returns immediately; the callback runs once the hardware let go.
        const ASYNC_UNLINK = 1 << 2;
        /// Don't stop a bulk or control read at the first short packet.
        const DISABLE_SPD = 1 << 3;
        /// Terminate bulk OUT payloads that are a multiple of the packet size with an empty
        /// packet.
        const ZERO_PACKET = 1 << 4;
    }
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum TransferError {
    #[error("bit stuffing error")]
    BitStuff,
    #[error("CRC or timeout error")]
    CrcTimeout { out: bool },
    #[error("NAK timeout")]
    Nak,
    #[error("babble detected")]
    Babble,
    #[error("data buffer error")]
    DataBuffer,
    #[error("endpoint stalled")]
    Stall,
    #[error("short packet")]
    ShortPacket,
    #[error("internal scheduling inconsistency")]
    Internal,
    #[error("transfer killed")]
    Killed,
    #[error("transfer unlinked")]
    Unlinked,
    #[error("transfer timed out")]
    TimedOut,
    #[error("host controller shut down")]
    Shutdown,
    /// A chained transfer the controller refused to schedule.
    #[error("submission rejected (errno {errno})")]
    Rejected { errno: i32 },
}

impl TransferError {
    pub fn errno(&self) -> i32 {
        match self {
            Self::BitStuff => EPROTO,
            Self::CrcTimeout { out: true } => ETIMEDOUT,
            Self::CrcTimeout { out: false } => EILSEQ,
            Self::Nak => ETIMEDOUT,
            Self::Babble => EOVERFLOW,
            Self::DataBuffer => ENOSR,
            Self::Stall => EPIPE,
            Self::ShortPacket => EREMOTEIO,
            Self::Internal => EINVAL,
            Self::Killed => ENOENT,
            Self::Unlinked => ECONNRESET,
            Self::TimedOut => ETIMEDOUT,
            Self::Shutdown => ESHUTDOWN,
            Self::Rejected { errno } => *errno,
        }
    }

    /// Results that mean the transfer was taken off the schedule rather than finished by the
    /// hardware.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            Self::Killed | Self::Unlinked | Self::TimedOut | Self::Shutdown
        )
    }
}

impl From<TransferError> for Error {
    fn from(err: TransferError) -> Self {
        Error::new(err.errno())
    }
}

pub type TransferResult = std::result::Result<(), TransferError>;

/// One packet of an isochronous transfer. `offset`/`length` are supplied by the submitter, the
/// rest is filled in on completion.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IsoPacket {
    pub offset: usize,
    pub length: usize,
    pub actual_length: usize,
    pub status: TransferResult,
}

impl IsoPacket {
    pub fn new(offset: usize, length: usize) -> Self {
        Self {
            offset,
            length,
            actual_length: 0,
            status: Ok(()),
        }
    }
}

/// A device known to the host controller.
///
/// Pending transfers hold a reference, and [`HostController::free_device`] refuses to drop a
/// device that still has any.
pub struct UsbDevice {
    address: AtomicU8,
    speed: Speed,
    root_hub: bool,
    /// Bit `endpoint` for OUT, bit `16 + endpoint` for IN.
    toggles: AtomicU32,
    halted: AtomicU32,
    pending: AtomicUsize,
}

fn endpoint_bit(endpoint: u8, direction: Direction) -> u32 {
    let shift = (endpoint & 0x0F) as u32 + if direction == Direction::In { 16 } else { 0 };
    1 << shift
}

impl UsbDevice {
    pub(crate) fn new(speed: Speed, root_hub: bool) -> Self {
        Self {
            address: AtomicU8::new(0),
            speed,
            root_hub,
            toggles: AtomicU32::new(0),
            halted: AtomicU32::new(0),
            pending: AtomicUsize::new(0),
        }
    }

    pub fn address(&self) -> u8 {
        self.address.load(Ordering::Acquire)
    }
    /// Record the address assigned with SET_ADDRESS.
    pub fn set_address(&self, address: u8) {
        self.address.store(address & 0x7F, Ordering::Release);
    }
    pub fn speed(&self) -> Speed {
        self.speed
    }
    pub fn is_low_speed(&self) -> bool {
        self.speed == Speed::Low
    }
    pub fn is_root_hub(&self) -> bool {
        self.root_hub
    }

    pub fn toggle(&self, endpoint: u8, direction: Direction) -> bool {
        self.toggles.load(Ordering::Acquire) & endpoint_bit(endpoint, direction) != 0
    }
    pub fn set_toggle(&self, endpoint: u8, direction: Direction, value: bool) {
        let bit = endpoint_bit(endpoint, direction);
        if value {
            self.toggles.fetch_or(bit, Ordering::AcqRel);
        } else {
            self.toggles.fetch_and(!bit, Ordering::AcqRel);
        }
    }

    pub fn is_halted(&self, endpoint: u8, direction: Direction) -> bool {
        self.halted.load(Ordering::Acquire) & endpoint_bit(endpoint, direction) != 0
    }
    pub fn set_halted(&self, endpoint: u8, direction: Direction, value: bool) {
        let bit = endpoint_bit(endpoint, direction);
        if value {
            self.halted.fetch_or(bit, Ordering::AcqRel);
        } else {
            self.halted.fetch_and(!bit, Ordering::AcqRel);
        }
    }

    /// Number of transfers currently holding this device.
    pub fn pending_transfers(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
    pub(crate) fn get(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }
    pub(crate) fn put(&self) {
        self.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for UsbDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsbDevice")
            .field("address", &self.address())
            .field("speed", &self.speed)
            .field("root_hub", &self.root_hub)
            .field("toggles", &format_args!("{:#010x}", self.toggles.load(Ordering::Relaxed)))
            .field("halted", &format_args!("{:#010x}", self.halted.load(Ordering::Relaxed)))
            .field("pending", &self.pending_transfers())
            .finish()
    }
}

pub type Callback = Box<dyn Fn(&Urb) + Send + Sync>;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum UrbState {
    Idle = 0,
    Pending = 1,
    /// A periodic completion is being reported; still pending.
    Reporting = 2,
    Completed = 3,
    Killed = 4,
}

impl UrbState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Pending,
            2 => Self::Reporting,
            3 => Self::Completed,
            4 => Self::Killed,
            _ => Self::Idle,
        }
    }
}

fn terminal_state(status: &TransferResult) -> UrbState {
    match status {
        Err(err) if err.is_cancellation() => UrbState::Killed,
        _ => UrbState::Completed,
    }
}

pub struct Urb {
    pub pipe: Pipe,
    pub flags: TransferFlags,
    pub setup: Option<Setup>,
    /// Polling interval in frames for interrupt transfers; 0 means one-shot.
    pub interval: u32,
    pub timeout: Option<Duration>,
    device: Arc<UsbDevice>,
    buffer: Option<Mutex<Dma<[u8]>>>,
    buffer_phys: usize,
    length: usize,
    callback: Option<Callback>,

    state: AtomicU8,
    status: Mutex<Option<TransferResult>>,
    deferred: Mutex<Option<TransferResult>>,
    actual_length: AtomicUsize,
    error_count: AtomicUsize,
    start_frame: AtomicU16,
    iso: Mutex<Vec<IsoPacket>>,
    submitted_at: Mutex<Option<Instant>>,
    next: Mutex<Option<Arc<Urb>>>,
    pub(crate) hcpriv: Mutex<Option<UrbPriv>>,
}

impl Urb {
    pub fn device(&self) -> &Arc<UsbDevice> {
        &self.device
    }
    pub fn state(&self) -> UrbState {
        UrbState::from_u8(self.state.load(Ordering::Acquire))
    }
    pub fn is_pending(&self) -> bool {
        matches!(self.state(), UrbState::Pending | UrbState::Reporting)
    }
    /// The result of the last completion, if any.
    pub fn status(&self) -> Option<TransferResult> {
        self.status.lock().unwrap().clone()
    }
    pub fn actual_length(&self) -> usize {
        self.actual_length.load(Ordering::Acquire)
    }
    /// Requested transfer length in bytes.
    pub fn length(&self) -> usize {
        self.length
    }
    pub fn error_count(&self) -> usize {
        self.error_count.load(Ordering::Acquire)
    }
    /// First frame of an isochronous transfer, valid once it was submitted.
    pub fn start_frame(&self) -> u16 {
        self.start_frame.load(Ordering::Acquire)
    }
    pub fn iso_packets(&self) -> Vec<IsoPacket> {
        self.iso.lock().unwrap().clone()
    }
    pub fn buffer(&self) -> Option<MutexGuard<'_, Dma<[u8]>>> {
        self.buffer.as_ref().map(|buffer| buffer.lock().unwrap())
    }
    /// Queue `next` to be submitted when this transfer completes successfully.
    pub fn set_next(&self, next: Option<Arc<Urb>>) {
        *self.next.lock().unwrap() = next;
    }

    pub(crate) fn buffer_phys(&self) -> usize {
        self.buffer_phys
    }
    pub(crate) fn iso_lock(&self) -> MutexGuard<'_, Vec<IsoPacket>> {
        self.iso.lock().unwrap()
    }
    pub(crate) fn next(&self) -> Option<Arc<Urb>> {
        self.next.lock().unwrap().clone()
    }
    pub(crate) fn set_start_frame(&self, frame: u16) {
        self.start_frame.store(frame, Ordering::Release);
    }
    pub(crate) fn set_actual_length(&self, len: usize) {
        self.actual_length.store(len, Ordering::Release);
    }
    pub(crate) fn set_error_count(&self, count: usize) {
        self.error_count.store(count, Ordering::Release);
    }
    pub(crate) fn timed_out(&self) -> bool {
        match (self.timeout, *self.submitted_at.lock().unwrap()) {
            (Some(timeout), Some(at)) => at.elapsed() >= timeout,
            _ => false,
        }
    }

    /// Idle, completed or killed -> pending. Fails if the transfer is already in flight.
    pub(crate) fn begin(&self) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            match UrbState::from_u8(current) {
                UrbState::Pending | UrbState::Reporting => return false,
                _ => (),
            }
            match self.state.compare_exchange(
                current,
                UrbState::Pending as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        *self.status.lock().unwrap() = None;
        *self.deferred.lock().unwrap() = None;
        *self.submitted_at.lock().unwrap() = Some(Instant::now());
        self.actual_length.store(0, Ordering::Release);
        self.error_count.store(0, Ordering::Release);
        for packet in self.iso.lock().unwrap().iter_mut() {
            packet.actual_length = 0;
            packet.status = Ok(());
        }
        true
    }

    /// Roll back a `begin` whose submission failed before anything was scheduled.
    pub(crate) fn abort(&self) {
        let _ = self.state.compare_exchange(
            UrbState::Pending as u8,
            UrbState::Idle as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Move the transfer to its terminal state and run the callback, exactly once. Returns
    /// `false` if somebody else already finished it.
    ///
    /// If a periodic completion is being reported at the same time (possibly on this very
    /// thread, from inside the callback), the terminal result is handed to the reporter, which
    /// delivers it as soon as the callback returns.
    pub(crate) fn finish(&self, status: TransferResult) -> bool {
        let terminal = terminal_state(&status) as u8;
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            match UrbState::from_u8(current) {
                UrbState::Pending => {
                    match self.state.compare_exchange(
                        current,
                        terminal,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            self.deliver(status);
                            return true;
                        }
                        Err(actual) => current = actual,
                    }
                }
                UrbState::Reporting => {
                    let mut deferred = self.deferred.lock().unwrap();
                    current = self.state.load(Ordering::Acquire);
                    if UrbState::from_u8(current) != UrbState::Reporting {
                        continue;
                    }
                    if deferred.is_some() {
                        return false;
                    }
                    *deferred = Some(status);
                    return true;
                }
                _ => return false,
            }
        }
    }

    /// Report a periodic completion without ending the transfer.
    pub(crate) fn report(&self, status: TransferResult) -> bool {
        if self
            .state
            .compare_exchange(
                UrbState::Pending as u8,
                UrbState::Reporting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        *self.status.lock().unwrap() = Some(status);
        if let Some(callback) = &self.callback {
            callback(self);
        }

        let mut deferred = self.deferred.lock().unwrap();
        match deferred.take() {
            Some(terminal) => {
                self.state
                    .store(terminal_state(&terminal) as u8, Ordering::Release);
                drop(deferred);
                self.deliver(terminal);
            }
            None => self.state.store(UrbState::Pending as u8, Ordering::Release),
        }
        true
    }

    fn deliver(&self, status: TransferResult) {
        *self.status.lock().unwrap() = Some(status);
        if let Some(callback) = &self.callback {
            callback(self);
        }
    }
}

impl fmt::Debug for Urb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Urb")
            .field("pipe", &self.pipe)
            .field("device", &self.device.address())
            .field("flags", &self.flags)
            .field("length", &self.length)
            .field("state", &self.state())
            .field("actual_length", &self.actual_length())
            .finish()
    }
}

/// Builds an [`Urb`].
pub struct UrbBuilder {
    device: Arc<UsbDevice>,
    pipe: Pipe,
    flags: TransferFlags,
    setup: Option<Setup>,
    interval: u32,
    timeout: Option<Duration>,
    buffer: Option<Dma<[u8]>>,
    length: Option<usize>,
    iso: Vec<IsoPacket>,
    start_frame: u16,
    callback: Option<Callback>,
}

impl UrbBuilder {
    pub fn new(device: &Arc<UsbDevice>, pipe: Pipe) -> Self {
        Self {
            device: Arc::clone(device),
            pipe,
            flags: TransferFlags::empty(),
            setup: None,
            interval: 0,
            timeout: None,
            buffer: None,
            length: None,
            iso: Vec::new(),
            start_frame: 0,
            callback: None,
        }
    }

    pub fn setup(mut self, setup: Setup) -> Self {
        self.setup = Some(setup);
        self
    }
    pub fn flags(mut self, flags: TransferFlags) -> Self {
        self.flags = flags;
        self
    }
    pub fn interval(mut self, interval: u32) -> Self {
        self.interval = interval;
        self
    }
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
    pub fn buffer(mut self, buffer: Dma<[u8]>) -> Self {
        self.buffer = Some(buffer);
        self
    }
    /// Transfer fewer bytes than the buffer holds.
    pub fn length(mut self, length: usize) -> Self {
        self.length = Some(length);
        self
    }
    pub fn iso_packets(mut self, packets: Vec<IsoPacket>) -> Self {
        self.iso = packets;
        self
    }
    /// Explicit first frame for an isochronous transfer without [`TransferFlags::ISO_ASAP`].
    pub fn start_frame(mut self, frame: u16) -> Self {
        self.start_frame = frame;
        self
    }
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Urb) + Send + Sync + 'static,
    {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn build(self) -> Result<Arc<Urb>> {
        let capacity = self.buffer.as_ref().map_or(0, |buffer| buffer.len());
        let length = self.length.unwrap_or(capacity);
        if length > capacity {
            return Err(Error::new(EINVAL));
        }
        if self.pipe.kind == PipeKind::Control && self.setup.is_none() {
            return Err(Error::new(EINVAL));
        }
        if self
            .iso
            .iter()
            .any(|packet| match packet.offset.checked_add(packet.length) {
                Some(end) => end > length,
                None => true,
            })
        {
            return Err(Error::new(EINVAL));
        }

        let buffer_phys = self.buffer.as_ref().map_or(0, |buffer| buffer.physical());
        Ok(Arc::new(Urb {
            pipe: self.pipe,
            flags: self.flags,
            setup: self.setup,
            interval: self.interval,
            timeout: self.timeout,
            device: self.device,
            buffer: self.buffer.map(Mutex::new),
            buffer_phys,
            length,
            callback: self.callback,
            state: AtomicU8::new(UrbState::Idle as u8),
            status: Mutex::new(None),
            deferred: Mutex::new(None),
            actual_length: AtomicUsize::new(0),
            error_count: AtomicUsize::new(0),
            start_frame: AtomicU16::new(self.start_frame),
            iso: Mutex::new(self.iso),
            submitted_at: Mutex::new(None),
            next: Mutex::new(None),
            hcpriv: Mutex::new(None),
        }))
    }
}

/// Whether [`HostController::unlink_urb`] already completed the transfer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum UnlinkProgress {
    /// Descriptors are freed and the transfer is [`UrbState::Killed`]. The callback normally
    /// ran already; if a periodic report was running on another thread at the time, it runs
    /// with [`TransferError::Killed`] as soon as that report returns.
    Done,
    /// The callback runs with [`TransferError::Unlinked`] once the hardware let go.
    InProgress,
}

/// Operations the USB layer needs from a host controller driver.
pub trait HostController: Send + Sync {
    fn alloc_device(&self, speed: Speed) -> Result<Arc<UsbDevice>>;
    fn free_device(&self, device: &Arc<UsbDevice>) -> Result<()>;
    fn current_frame_number(&self) -> u16;
    fn submit_urb(&self, urb: &Arc<Urb>) -> Result<()>;
    fn unlink_urb(&self, urb: &Arc<Urb>) -> Result<UnlinkProgress>;
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn urb_with_counter(counter: &Arc<AtomicUsize>) -> Arc<Urb> {
        let device = Arc::new(UsbDevice::new(Speed::Full, false));
        let counter = Arc::clone(counter);
        UrbBuilder::new(&device, Pipe::interrupt(1, Direction::In, 8))
            .interval(8)
            .on_complete(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap()
    }

    #[test]
    fn finish_runs_callback_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let urb = urb_with_counter(&counter);
        assert!(urb.begin());
        assert!(!urb.begin());
        assert!(urb.finish(Err(TransferError::Killed)));
        assert!(!urb.finish(Ok(())));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(urb.state(), UrbState::Killed);
        assert_eq!(urb.status(), Some(Err(TransferError::Killed)));
    }

    #[test]
    fn finish_during_report_is_deferred() {
        let device = Arc::new(UsbDevice::new(Speed::Full, false));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let urb = UrbBuilder::new(&device, Pipe::interrupt(1, Direction::In, 8))
            .interval(8)
            .on_complete(move |urb| {
                let status = urb.status().unwrap();
                seen_cb.lock().unwrap().push(status.clone());
                if status.is_ok() {
                    // a driver stopping its own polling from the callback
                    assert!(urb.finish(Err(TransferError::Killed)));
                }
            })
            .build()
            .unwrap();
        assert!(urb.begin());
        assert!(urb.report(Ok(())));
        assert!(!urb.report(Ok(())));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Ok(()), Err(TransferError::Killed)]
        );
        assert_eq!(urb.state(), UrbState::Killed);
    }

    #[test]
    fn iso_packets_must_fit_the_buffer() {
        let device = Arc::new(UsbDevice::new(Speed::Full, false));
        let pipe = Pipe::isochronous(1, Direction::In, 8);
        for packet in [IsoPacket::new(0, 1), IsoPacket::new(usize::MAX, 1)] {
            let built = UrbBuilder::new(&device, pipe)
                .iso_packets(vec![packet])
                .build();
            assert_eq!(built.err(), Some(Error::new(EINVAL)));
        }
    }

    #[test]
    fn rejected_submission_keeps_its_errno() {
        let err = TransferError::Rejected { errno: EPIPE };
        assert_eq!(err.errno(), EPIPE);
        assert!(!err.is_cancellation());
        assert_eq!(Error::from(err), Error::new(EPIPE));
    }

    #[test]
    fn toggles_and_halts_are_per_direction() {
        let device = UsbDevice::new(Speed::Low, false);
        device.set_toggle(2, Direction::In, true);
        assert!(device.toggle(2, Direction::In));
        assert!(!device.toggle(2, Direction::Out));
        device.set_halted(2, Direction::Out, true);
        assert!(device.is_halted(2, Direction::Out));
        device.set_halted(2, Direction::Out, false);
        assert!(!device.is_halted(2, Direction::Out));
        assert!(device.is_low_speed());
    }

    #[test]
    fn error_numbers() {
        assert_eq!(TransferError::Stall.errno(), EPIPE);
        assert_eq!(TransferError::CrcTimeout { out: false }.errno(), EILSEQ);
        assert_eq!(Error::from(TransferError::Unlinked), Error::new(ECONNRESET));
        assert!(TransferError::TimedOut.is_cancellation());
        assert!(!TransferError::Babble.is_cancellation());
    }

    #[test]
    fn builder_validates_lengths() {
        let device = Arc::new(UsbDevice::new(Speed::Full, false));
        assert_eq!(
            UrbBuilder::new(&device, Pipe::bulk(1, Direction::Out, 64))
                .length(1)
                .build()
                .unwrap_err(),
            Error::new(EINVAL)
        );
        assert!(UrbBuilder::new(&device, Pipe::control(0, 8)).build().is_err());
    }
}
