/// Hub descriptor for hubs with at most seven ports, where each of the two port bitmaps fits in
/// one byte (USB2 11.23.2.1).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug)]
pub struct HubDescriptorV2 {
    pub length: u8,
    pub kind: u8,
    pub ports: u8,
    pub characteristics: u16,
    pub power_on_good: u8,
    pub current: u8,
    pub device_removable: u8,
    pub port_power_mask: u8,
}

unsafe impl plain::Plain for HubDescriptorV2 {}

impl HubDescriptorV2 {
    pub const DESCRIPTOR_KIND: u8 = 0x29;
}

impl Default for HubDescriptorV2 {
    fn default() -> Self {
        Self {
            length: core::mem::size_of::<Self>() as u8,
            kind: Self::DESCRIPTOR_KIND,
            ports: 0,
            characteristics: 0,
            power_on_good: 0,
            current: 0,
            device_removable: 0,
            port_power_mask: 0xFF,
        }
    }
}

/// wHubCharacteristics: no power switching, not part of a compound device, global over-current.
pub const HUB_CHAR_NO_POWER_SWITCHING: u16 = 0x0002;
pub const HUB_CHAR_GLOBAL_OVER_CURRENT: u16 = 0x0000;

/// Port feature selectors (USB2 Table 11-17).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum HubPortFeature {
    PortConnection = 0,
    PortEnable = 1,
    PortSuspend = 2,
    PortOverCurrent = 3,
    PortReset = 4,
    PortPower = 8,
    PortLowSpeed = 9,
    CPortConnection = 16,
    CPortEnable = 17,
    CPortSuspend = 18,
    CPortOverCurrent = 19,
    CPortReset = 20,
}

impl HubPortFeature {
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0 => Self::PortConnection,
            1 => Self::PortEnable,
            2 => Self::PortSuspend,
            3 => Self::PortOverCurrent,
            4 => Self::PortReset,
            8 => Self::PortPower,
            9 => Self::PortLowSpeed,
            16 => Self::CPortConnection,
            17 => Self::CPortEnable,
            18 => Self::CPortSuspend,
            19 => Self::CPortOverCurrent,
            20 => Self::CPortReset,
            _ => return None,
        })
    }
}

bitflags::bitflags! {
    /// wPortStatus in the low half, wPortChange in the high half.
    #[derive(Default)]
    #[repr(transparent)]
    pub struct HubPortStatusV2: u32 {
        const CONNECTION = 1 << 0;
        const ENABLE = 1 << 1;
        const SUSPEND = 1 << 2;
        const OVER_CURRENT = 1 << 3;
        const RESET = 1 << 4;
        // bits 5-7 reserved
        const POWER = 1 << 8;
        const LOW_SPEED = 1 << 9;
        const HIGH_SPEED = 1 << 10;
        const TEST = 1 << 11;
        const INDICATOR = 1 << 12;
        // bits 13-15 reserved
        const CONNECTION_CHANGED = 1 << 16;
        const ENABLE_CHANGED = 1 << 17;
        const SUSPEND_CHANGED = 1 << 18;
        const OVER_CURRENT_CHANGED = 1 << 19;
        const RESET_CHANGED = 1 << 20;
        // bits 21 - 31 reserved
    }
}

unsafe impl plain::Plain for HubPortStatusV2 {}

impl HubPortStatusV2 {
    pub const CHANGE_MASK: u32 = 0xFFFF_0000;

    pub fn status(&self) -> u16 {
        self.bits() as u16
    }
    pub fn change(&self) -> u16 {
        (self.bits() >> 16) as u16
    }
    pub fn has_changes(&self) -> bool {
        self.bits() & Self::CHANGE_MASK != 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn descriptor_size() {
        assert_eq!(core::mem::size_of::<HubDescriptorV2>(), 9);
        assert_eq!(HubDescriptorV2::default().length, 9);
    }

    #[test]
    fn status_halves() {
        let status = HubPortStatusV2::CONNECTION
            | HubPortStatusV2::POWER
            | HubPortStatusV2::CONNECTION_CHANGED;
        assert_eq!(status.status(), 0x0101);
        assert_eq!(status.change(), 0x0001);
        assert!(status.has_changes());
        assert!(!HubPortStatusV2::ENABLE.has_changes());
    }
}
