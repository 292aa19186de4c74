//! The UHCI I/O register block (UHCI 2.1).
use common::io::Io;

pub const USBCMD: u16 = 0x00;
pub const USBSTS: u16 = 0x02;
pub const USBINTR: u16 = 0x04;
pub const FRNUM: u16 = 0x06;
pub const FLBASEADD: u16 = 0x08;
pub const SOFMOD: u16 = 0x0C;
pub const PORTSC1: u16 = 0x10;

/// Number of root hub ports; every UHCI has exactly two.
pub const ROOT_PORTS: usize = 2;

pub const USBCMD_RS: u16 = 1 << 0;
pub const USBCMD_HCRESET: u16 = 1 << 1;
pub const USBCMD_GRESET: u16 = 1 << 2;
pub const USBCMD_EGSM: u16 = 1 << 3;
pub const USBCMD_FGR: u16 = 1 << 4;
pub const USBCMD_SWDBG: u16 = 1 << 5;
pub const USBCMD_CF: u16 = 1 << 6;
pub const USBCMD_MAXP: u16 = 1 << 7;

pub const USBSTS_USBINT: u16 = 1 << 0;
pub const USBSTS_ERROR: u16 = 1 << 1;
pub const USBSTS_RD: u16 = 1 << 2;
pub const USBSTS_HSE: u16 = 1 << 3;
pub const USBSTS_HCPE: u16 = 1 << 4;
pub const USBSTS_HCH: u16 = 1 << 5;
/// Everything that is cleared by writing a one.
pub const USBSTS_ACK_MASK: u16 = 0x1F;

pub const USBINTR_TIMEOUT: u16 = 1 << 0;
pub const USBINTR_RESUME: u16 = 1 << 1;
pub const USBINTR_IOC: u16 = 1 << 2;
pub const USBINTR_SP: u16 = 1 << 3;
pub const USBINTR_ALL: u16 = USBINTR_TIMEOUT | USBINTR_RESUME | USBINTR_IOC | USBINTR_SP;

pub const FRNUM_MASK: u16 = 0x3FF;

bitflags::bitflags! {
    pub struct PortSc: u16 {
        const CCS = 1 << 0;
        const CSC = 1 << 1;
        const PE = 1 << 2;
        const PEC = 1 << 3;
        const LINE_STATUS = 3 << 4;
        const RD = 1 << 6;
        /// Always reads as one.
        const RESERVED = 1 << 7;
        const LSDA = 1 << 8;
        const PR = 1 << 9;
        const OC = 1 << 10;
        const OCC = 1 << 11;
        const SUSP = 1 << 12;
    }
}

impl PortSc {
    /// Write-one-to-clear bits; writing back a read value would acknowledge them.
    pub const WC: PortSc = PortSc::from_bits_truncate(
        PortSc::CSC.bits() | PortSc::PEC.bits() | PortSc::OCC.bits(),
    );
    pub const CHANGES: PortSc = PortSc::WC;
}

/// Raw access to the register block. Offsets are relative to the I/O base.
pub trait UhciRegisters: Send {
    fn read16(&self, offset: u16) -> u16;
    fn write16(&mut self, offset: u16, value: u16);
    fn read32(&self, offset: u16) -> u32;
    fn write32(&mut self, offset: u16, value: u32);

    /// Identifies the controller in the root hub's serial number string.
    fn serial(&self) -> String {
        String::from("0000")
    }
}

/// One 16-bit register, usable with the [`Io`] flag helpers.
pub struct Reg16<'a> {
    regs: &'a mut (dyn UhciRegisters + 'a),
    offset: u16,
}

impl Io for Reg16<'_> {
    type Value = u16;

    fn read(&self) -> u16 {
        self.regs.read16(self.offset)
    }
    fn write(&mut self, value: u16) {
        self.regs.write16(self.offset, value)
    }
}

fn port_offset(port: usize) -> u16 {
    assert!(port < ROOT_PORTS);
    PORTSC1 + 2 * port as u16
}

impl<'r> dyn UhciRegisters + 'r {
    pub fn reg16(&mut self, offset: u16) -> Reg16<'_> {
        Reg16 { regs: self, offset }
    }

    pub fn frame_number(&self) -> u16 {
        self.read16(FRNUM) & FRNUM_MASK
    }

    pub fn port(&self, port: usize) -> PortSc {
        PortSc::from_bits_truncate(self.read16(port_offset(port)))
    }

    /// Set control bits without acknowledging pending changes.
    pub fn set_port(&mut self, port: usize, bits: PortSc) {
        let value = (self.port(port) - PortSc::WC) | bits;
        self.write16(port_offset(port), value.bits());
    }

    /// Clear control bits without acknowledging pending changes.
    pub fn clear_port(&mut self, port: usize, bits: PortSc) {
        let value = self.port(port) - PortSc::WC - bits;
        self.write16(port_offset(port), value.bits());
    }

    /// Acknowledge change bits.
    pub fn ack_port(&mut self, port: usize, changes: PortSc) {
        let value = (self.port(port) - PortSc::WC) | (changes & PortSc::WC);
        self.write16(port_offset(port), value.bits());
    }
}

/// The register block of a real controller, reached through x86 port I/O.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub struct PioRegisters {
    base: u16,
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl PioRegisters {
    /// # Safety
    /// The caller must own the 32-byte I/O range at `base` and have I/O privileges.
    pub unsafe fn new(base: u16) -> Self {
        Self { base }
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
impl UhciRegisters for PioRegisters {
    fn read16(&self, offset: u16) -> u16 {
        common::io::Pio::<u16>::new(self.base + offset).read()
    }
    fn write16(&mut self, offset: u16, value: u16) {
        common::io::Pio::<u16>::new(self.base + offset).write(value)
    }
    fn read32(&self, offset: u16) -> u32 {
        common::io::Pio::<u32>::new(self.base + offset).read()
    }
    fn write32(&mut self, offset: u16, value: u32) {
        common::io::Pio::<u32>::new(self.base + offset).write(value)
    }
    fn serial(&self) -> String {
        format!("{:04x}", self.base)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct Latches([u16; 16]);

    impl UhciRegisters for Latches {
        fn read16(&self, offset: u16) -> u16 {
            self.0[offset as usize / 2]
        }
        fn write16(&mut self, offset: u16, value: u16) {
            self.0[offset as usize / 2] = value;
        }
        fn read32(&self, offset: u16) -> u32 {
            self.read16(offset) as u32 | (self.read16(offset + 2) as u32) << 16
        }
        fn write32(&mut self, offset: u16, value: u32) {
            self.write16(offset, value as u16);
            self.write16(offset + 2, (value >> 16) as u16);
        }
    }

    #[test]
    fn port_writes_preserve_change_bits() {
        let mut latches = Latches([0; 16]);
        let regs: &mut dyn UhciRegisters = &mut latches;
        regs.write16(PORTSC1, (PortSc::CCS | PortSc::CSC | PortSc::PEC).bits());

        regs.set_port(0, PortSc::PE);
        assert_eq!(regs.read16(PORTSC1), (PortSc::CCS | PortSc::PE).bits());

        regs.write16(PORTSC1 + 2, (PortSc::CCS | PortSc::PE | PortSc::OCC).bits());
        regs.clear_port(1, PortSc::PE);
        assert_eq!(regs.port(1), PortSc::CCS);

        regs.write16(PORTSC1, (PortSc::CCS | PortSc::CSC | PortSc::PEC).bits());
        regs.ack_port(0, PortSc::CSC);
        assert_eq!(regs.port(0), PortSc::CCS | PortSc::CSC);
    }

    #[test]
    fn command_flags() {
        let mut latches = Latches([0; 16]);
        let regs: &mut dyn UhciRegisters = &mut latches;
        regs.reg16(USBCMD).writef(USBCMD_RS | USBCMD_CF, true);
        assert!(regs.reg16(USBCMD).readf(USBCMD_RS));
        regs.reg16(USBCMD).writef(USBCMD_RS, false);
        assert_eq!(regs.read16(USBCMD), USBCMD_CF);
        regs.write16(FRNUM, 0x1403);
        assert_eq!(regs.frame_number(), 0x003);
    }
}
