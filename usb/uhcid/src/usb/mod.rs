//! Standard USB structures needed by the host controller itself: setup packets, the descriptors
//! the root hub reports, and the hub class definitions.
pub use self::device::*;
pub use self::hub::*;
pub use self::setup::*;

mod device;
mod hub;
mod setup;

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DescriptorKind {
    None = 0,
    Device = 1,
    Configuration = 2,
    String = 3,
    Interface = 4,
    Endpoint = 5,
    DeviceQualifier = 6,
    OtherSpeedConfiguration = 7,
    InterfacePower = 8,
    Hub = 0x29,
}

impl DescriptorKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::None,
            1 => Self::Device,
            2 => Self::Configuration,
            3 => Self::String,
            4 => Self::Interface,
            5 => Self::Endpoint,
            6 => Self::DeviceQualifier,
            7 => Self::OtherSpeedConfiguration,
            8 => Self::InterfacePower,
            0x29 => Self::Hub,
            _ => return None,
        })
    }
}
