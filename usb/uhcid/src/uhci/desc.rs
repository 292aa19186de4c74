//! Hardware descriptor layouts (UHCI 3.2 and 3.3).
//!
//! Both descriptors are shared with the controller, which reads and writes them by DMA at any
//! time. Every field is therefore an atomic word, and they are only ever accessed through shared
//! references.
use std::fmt;
use std::sync::atomic::{fence, AtomicU32, Ordering};

/// Link pointer: nothing follows.
pub const LINK_TERMINATE: u32 = 1 << 0;
/// Link pointer: the target is a QH.
pub const LINK_QH: u32 = 1 << 1;
/// Link pointer (TDs only): process the next TD of the same queue before moving on.
pub const LINK_DEPTH: u32 = 1 << 2;
pub const LINK_ADDR_MASK: u32 = !0xF;

pub const PID_SETUP: u8 = 0x2D;
pub const PID_IN: u8 = 0x69;
pub const PID_OUT: u8 = 0xE1;

pub const TOKEN_DEVADDR_SHIFT: u32 = 8;
pub const TOKEN_ENDPT_SHIFT: u32 = 15;
pub const TOKEN_TOGGLE: u32 = 1 << 19;
pub const TOKEN_MAXLEN_SHIFT: u32 = 21;
/// Encoded maximum length of a zero-length packet.
pub const TOKEN_MAXLEN_NULL: u32 = 0x7FF;

pub const CTRL_ACTLEN_MASK: u32 = 0x7FF;
pub const CTRL_CERR_SHIFT: u32 = 27;
pub const CTRL_CERR_MASK: u32 = 3 << CTRL_CERR_SHIFT;

bitflags::bitflags! {
    /// The control and status word of a TD, without the actual length and error counter.
    pub struct TdStatus: u32 {
        const BITSTUFF = 1 << 17;
        const CRC_TIMEOUT = 1 << 18;
        const NAK = 1 << 19;
        const BABBLE = 1 << 20;
        const DATABUFFER = 1 << 21;
        const STALLED = 1 << 22;
        const ACTIVE = 1 << 23;
        const IOC = 1 << 24;
        const IOS = 1 << 25;
        const LOW_SPEED = 1 << 26;
        const SPD = 1 << 29;
    }
}

impl TdStatus {
    pub const ERRORS: TdStatus = TdStatus::from_bits_truncate(
        TdStatus::BITSTUFF.bits()
            | TdStatus::CRC_TIMEOUT.bits()
            | TdStatus::NAK.bits()
            | TdStatus::BABBLE.bits()
            | TdStatus::DATABUFFER.bits()
            | TdStatus::STALLED.bits(),
    );
}

/// Convert a byte count to the n-1 encoding used by the token and status words.
pub fn encode_len(len: usize) -> u32 {
    if len == 0 {
        TOKEN_MAXLEN_NULL
    } else {
        (len as u32 - 1) & CTRL_ACTLEN_MASK
    }
}

pub fn decode_len(field: u32) -> usize {
    ((field + 1) & CTRL_ACTLEN_MASK) as usize
}

/// Build a TD token word.
pub fn token(pid: u8, address: u8, endpoint: u8, toggle: bool, len: usize) -> u32 {
    (encode_len(len) << TOKEN_MAXLEN_SHIFT)
        | if toggle { TOKEN_TOGGLE } else { 0 }
        | ((endpoint as u32 & 0xF) << TOKEN_ENDPT_SHIFT)
        | ((address as u32 & 0x7F) << TOKEN_DEVADDR_SHIFT)
        | pid as u32
}

/// Transfer Descriptor.
#[repr(C, align(16))]
#[derive(Default)]
pub struct Td {
    pub link: AtomicU32,
    pub ctrl_sts: AtomicU32,
    pub token: AtomicU32,
    pub buffer: AtomicU32,
}

impl Td {
    /// Reset to an inactive TD with a terminating link.
    pub fn clear(&self) {
        self.link.store(LINK_TERMINATE, Ordering::Relaxed);
        self.ctrl_sts.store(0, Ordering::Relaxed);
        self.token.store(0, Ordering::Relaxed);
        self.buffer.store(0, Ordering::Relaxed);
    }

    /// Fill in everything but the link. The TD becomes visible to hardware only once something
    /// links to it.
    pub fn fill(&self, status: TdStatus, error_limit: u32, token: u32, buffer: u32) {
        let ctrl = status.bits()
            | ((error_limit << CTRL_CERR_SHIFT) & CTRL_CERR_MASK)
            | CTRL_ACTLEN_MASK;
        self.token.store(token, Ordering::Relaxed);
        self.buffer.store(buffer, Ordering::Relaxed);
        self.ctrl_sts.store(ctrl, Ordering::Relaxed);
    }

    pub fn status(&self) -> TdStatus {
        TdStatus::from_bits_truncate(self.ctrl_sts.load(Ordering::Acquire))
    }
    pub fn is_active(&self) -> bool {
        self.status().contains(TdStatus::ACTIVE)
    }
    pub fn actual_len(&self) -> usize {
        decode_len(self.ctrl_sts.load(Ordering::Acquire))
    }
    pub fn error_count(&self) -> u32 {
        (self.ctrl_sts.load(Ordering::Acquire) & CTRL_CERR_MASK) >> CTRL_CERR_SHIFT
    }

    pub fn pid(&self) -> u8 {
        self.token.load(Ordering::Acquire) as u8
    }
    pub fn is_in(&self) -> bool {
        self.pid() == PID_IN
    }
    pub fn toggle(&self) -> bool {
        self.token.load(Ordering::Acquire) & TOKEN_TOGGLE != 0
    }
    pub fn max_len(&self) -> usize {
        decode_len(self.token.load(Ordering::Acquire) >> TOKEN_MAXLEN_SHIFT)
    }
    pub fn buffer_addr(&self) -> u32 {
        self.buffer.load(Ordering::Acquire)
    }

    /// Flip the data toggle and hand the TD back to the controller.
    pub fn rearm(&self, toggle: bool) {
        let token = self.token.load(Ordering::Relaxed);
        self.token.store(
            if toggle { token | TOKEN_TOGGLE } else { token & !TOKEN_TOGGLE },
            Ordering::Relaxed,
        );
        let ctrl = self.ctrl_sts.load(Ordering::Relaxed);
        let ctrl = (ctrl & !(TdStatus::ERRORS.bits() | CTRL_CERR_MASK))
            | (3 << CTRL_CERR_SHIFT)
            | CTRL_ACTLEN_MASK;
        fence(Ordering::SeqCst);
        self.ctrl_sts
            .store(ctrl | TdStatus::ACTIVE.bits(), Ordering::Release);
    }

    /// Stop reporting completions from this TD.
    pub fn disable_ioc(&self) {
        self.ctrl_sts
            .fetch_and(!TdStatus::IOC.bits(), Ordering::AcqRel);
    }
}

/// Queue Head.
#[repr(C, align(16))]
#[derive(Default)]
pub struct Qh {
    pub head: AtomicU32,
    pub element: AtomicU32,
}

impl Qh {
    pub fn clear(&self) {
        self.head.store(LINK_TERMINATE, Ordering::Relaxed);
        self.element.store(LINK_TERMINATE, Ordering::Relaxed);
    }
}

/// Write a link that hardware may follow as soon as the store lands. Everything the link makes
/// reachable must already be written.
pub fn publish(link: &AtomicU32, value: u32) {
    fence(Ordering::SeqCst);
    link.store(value, Ordering::Release);
}

pub fn describe_link(link: u32) -> String {
    if link & LINK_TERMINATE != 0 {
        return String::from("T");
    }
    let kind = if link & LINK_QH != 0 { "QH" } else { "TD" };
    let depth = if link & LINK_DEPTH != 0 { " depth" } else { "" };
    format!("{} {:#010x}{}", kind, link & LINK_ADDR_MASK, depth)
}

impl fmt::Debug for Td {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pid = match self.pid() {
            PID_SETUP => "SETUP",
            PID_IN => "IN",
            PID_OUT => "OUT",
            _ => "?",
        };
        let token = self.token.load(Ordering::Acquire);
        write!(
            f,
            "TD link {} status {:?} len {}/{} err {} {} dev {} ep {} toggle {} buf {:#010x}",
            describe_link(self.link.load(Ordering::Acquire)),
            self.status(),
            self.actual_len(),
            self.max_len(),
            self.error_count(),
            pid,
            (token >> TOKEN_DEVADDR_SHIFT) & 0x7F,
            (token >> TOKEN_ENDPT_SHIFT) & 0xF,
            self.toggle() as u8,
            self.buffer_addr()
        )
    }
}

impl fmt::Debug for Qh {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "QH head {} element {}",
            describe_link(self.head.load(Ordering::Acquire)),
            describe_link(self.element.load(Ordering::Acquire))
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use core::mem;

    #[test]
    fn links() {
        assert_eq!(describe_link(LINK_TERMINATE), "T");
        assert_eq!(describe_link(0x1000 | LINK_QH), "QH 0x00001000");
        assert_eq!(describe_link(0x2000 | LINK_DEPTH), "TD 0x00002000 depth");
    }

    #[test]
    fn descriptor_layout() {
        assert_eq!(mem::size_of::<Td>(), 16);
        assert_eq!(mem::align_of::<Td>(), 16);
        assert_eq!(mem::size_of::<Qh>(), 16);
        assert_eq!(mem::align_of::<Qh>(), 16);
    }

    #[test]
    fn token_encoding() {
        let word = token(PID_IN, 5, 2, true, 64);
        assert_eq!(word & 0xFF, PID_IN as u32);
        assert_eq!((word >> TOKEN_DEVADDR_SHIFT) & 0x7F, 5);
        assert_eq!((word >> TOKEN_ENDPT_SHIFT) & 0xF, 2);
        assert_ne!(word & TOKEN_TOGGLE, 0);
        assert_eq!(word >> TOKEN_MAXLEN_SHIFT, 63);
        assert_eq!(token(PID_OUT, 0, 0, false, 0) >> TOKEN_MAXLEN_SHIFT, TOKEN_MAXLEN_NULL);
    }

    #[test]
    fn lengths_round_trip_through_n_minus_one() {
        assert_eq!(decode_len(encode_len(0)), 0);
        assert_eq!(decode_len(encode_len(1)), 1);
        assert_eq!(decode_len(encode_len(1023)), 1023);
    }

    #[test]
    fn rearm_restores_active_and_counter() {
        let td = Td::default();
        td.fill(
            TdStatus::ACTIVE | TdStatus::IOC,
            3,
            token(PID_IN, 1, 1, false, 8),
            0x1000,
        );
        // what the controller leaves behind after a NAK-free successful packet
        td.ctrl_sts.store(TdStatus::IOC.bits() | (3 << CTRL_CERR_SHIFT) | 7, Ordering::SeqCst);
        assert!(!td.is_active());
        assert_eq!(td.actual_len(), 8);

        td.rearm(true);
        assert!(td.is_active());
        assert!(td.toggle());
        assert_eq!(td.error_count(), 3);
        assert_eq!(td.actual_len(), 0);
        assert!(td.status().contains(TdStatus::IOC));
    }
}
