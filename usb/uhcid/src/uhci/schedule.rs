//! Frame arithmetic: interrupt levels and isochronous placement.
//!
//! Everything here is pure so it can be reasoned about without a controller; the engine feeds in
//! the current frame number and the windows already occupied by an endpoint.
use syscall::error::{Error, Result, EAGAIN, EFBIG, EINVAL};

/// Entries in the frame list; frame numbers wrap at this value.
pub const FRAME_COUNT: usize = 1024;
/// Interrupt skeleton levels. Level `k` is visited every `2^k` frames.
pub const INT_LEVELS: usize = 9;
pub const MAX_INT_PERIOD: u32 = 1 << (INT_LEVELS - 1);

const FRAME_MASK: usize = FRAME_COUNT - 1;

/// The deepest interrupt level frame `frame` visits.
///
/// A frame whose number ends in `k` one bits visits levels `k` and below, so level `k` is reached
/// in exactly one out of `2^k` frames and every level keeps the same phase.
pub fn frame_level(frame: usize) -> u8 {
    (frame.trailing_ones() as usize).min(INT_LEVELS - 1) as u8
}

/// Map a polling interval in frames to a skeleton level, rounding the period down to a power of
/// two in `[1, 256]`.
pub fn interrupt_level(interval: u32) -> u8 {
    let interval = interval.clamp(1, MAX_INT_PERIOD);
    (31 - interval.leading_zeros()) as u8
}

pub fn level_period(level: u8) -> u32 {
    1 << level
}

pub fn frame_add(frame: u16, count: usize) -> u16 {
    ((frame as usize + count) & FRAME_MASK) as u16
}

/// Frames from `from` forward to `to`.
pub fn frame_distance(from: u16, to: u16) -> usize {
    (to as usize).wrapping_sub(from as usize) & FRAME_MASK
}

/// The frames occupied by one isochronous submission.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IsoWindow {
    pub start: u16,
    pub packets: usize,
}

impl IsoWindow {
    pub fn new(start: u16, packets: usize) -> Self {
        Self {
            start: start & FRAME_MASK as u16,
            packets,
        }
    }

    /// First frame after the window.
    pub fn end(&self) -> u16 {
        frame_add(self.start, self.packets)
    }

    pub fn contains(&self, frame: u16) -> bool {
        frame_distance(self.start, frame) < self.packets
    }

    pub fn overlaps(&self, other: &IsoWindow) -> bool {
        self.packets > 0 && other.packets > 0 && (self.contains(other.start) || other.contains(self.start))
    }

    /// The frame of packet `index`.
    pub fn frame(&self, index: usize) -> u16 {
        frame_add(self.start, index)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IsoStart {
    Asap,
    At(u16),
}

pub struct IsoRequest<'a> {
    pub start: IsoStart,
    pub packets: usize,
    /// Windows of transfers already pending on the same endpoint, in submission order.
    pub pending: &'a [IsoWindow],
}

/// Pick the first frame of an isochronous submission.
///
/// - an ASAP transfer continues right where the endpoint's last pending transfer ends, or starts
///   `latency` frames from `now` if there is none;
/// - an explicit start must lie ahead of the controller and must not collide with a window the
///   endpoint already owns.
///
/// The whole window has to fit ahead of the controller within one trip around the frame list.
/// Nothing is modified, so a rejected request leaves no trace.
pub fn iso_start_frame(now: u16, latency: u16, max_packets: usize, request: &IsoRequest) -> Result<u16> {
    if request.packets == 0 {
        return Err(Error::new(EINVAL));
    }
    if request.packets > max_packets {
        return Err(Error::new(EFBIG));
    }

    let start = match request.start {
        IsoStart::Asap => match request.pending.last() {
            Some(previous) => previous.end(),
            None => frame_add(now, latency as usize),
        },
        IsoStart::At(start) => {
            let window = IsoWindow::new(start, request.packets);
            if request.pending.iter().any(|pending| pending.overlaps(&window)) {
                return Err(Error::new(EAGAIN));
            }
            window.start
        }
    };

    let lead = frame_distance(now, start);
    // the window must close before the controller comes around to `now` again
    if lead == 0 || lead + request.packets >= FRAME_COUNT {
        return Err(Error::new(EAGAIN));
    }
    Ok(start)
}
