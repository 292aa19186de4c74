use super::DescriptorKind;

/// The 8-byte SETUP packet of a control transfer (USB2 9.3).
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Setup {
    pub kind: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub length: u16,
}

unsafe impl plain::Plain for Setup {}

#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReqDirection {
    HostToDevice = 0,
    DeviceToHost = 1,
}

#[repr(u8)]
pub enum ReqType {
    Standard = 0,
    Class = 1,
    Vendor = 2,
    Reserved = 3,
}

#[repr(u8)]
pub enum ReqRecipient {
    Device = 0,
    Interface = 1,
    Endpoint = 2,
    Other = 3,
    // 4..=30 are reserved
    VendorSpecific = 31,
}

#[repr(u8)]
pub enum SetupReq {
    GetStatus = 0x00,
    ClearFeature = 0x01,
    SetFeature = 0x03,
    SetAddress = 0x05,
    GetDescriptor = 0x06,
    SetDescriptor = 0x07,
    GetConfiguration = 0x08,
    SetConfiguration = 0x09,
    GetInterface = 0x0A,
    SetInterface = 0x0B,
    SynchFrame = 0x0C,
}

/// Feature selector for CLEAR_FEATURE on an endpoint recipient.
pub const ENDPOINT_HALT: u16 = 0;

pub const USB_SETUP_DIR_BIT: u8 = 1 << 7;
pub const USB_SETUP_DIR_SHIFT: u8 = 7;
pub const USB_SETUP_REQ_TY_MASK: u8 = 0x60;
pub const USB_SETUP_REQ_TY_SHIFT: u8 = 5;
pub const USB_SETUP_RECIPIENT_MASK: u8 = 0x1F;
pub const USB_SETUP_RECIPIENT_SHIFT: u8 = 0;

impl Setup {
    pub fn direction(&self) -> ReqDirection {
        if self.kind & USB_SETUP_DIR_BIT == 0 {
            ReqDirection::HostToDevice
        } else {
            ReqDirection::DeviceToHost
        }
    }
    pub const fn req_ty(&self) -> u8 {
        (self.kind & USB_SETUP_REQ_TY_MASK) >> USB_SETUP_REQ_TY_SHIFT
    }
    pub const fn req_recipient(&self) -> u8 {
        (self.kind & USB_SETUP_RECIPIENT_MASK) >> USB_SETUP_RECIPIENT_SHIFT
    }
    /// bmRequestType and bRequest as one word, the way hub requests are usually dispatched.
    pub const fn request_word(&self) -> u16 {
        ((self.kind as u16) << 8) | self.request as u16
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { plain::as_bytes(self) }
    }

    pub const fn get_status() -> Self {
        Self {
            kind: 0b1000_0000,
            request: SetupReq::GetStatus as u8,
            value: 0,
            index: 0,
            length: 2,
        }
    }

    pub const fn clear_feature(feature: u16) -> Self {
        Self {
            kind: 0b0000_0000,
            request: SetupReq::ClearFeature as u8,
            value: feature,
            index: 0,
            length: 0,
        }
    }

    pub const fn clear_endpoint_halt(endpoint_address: u8) -> Self {
        Self {
            kind: 0b0000_0010,
            request: SetupReq::ClearFeature as u8,
            value: ENDPOINT_HALT,
            index: endpoint_address as u16,
            length: 0,
        }
    }

    pub const fn set_feature(feature: u16) -> Self {
        Self {
            kind: 0b0000_0000,
            request: SetupReq::SetFeature as u8,
            value: feature,
            index: 0,
            length: 0,
        }
    }

    pub const fn set_address(address: u16) -> Self {
        Self {
            kind: 0b0000_0000,
            request: SetupReq::SetAddress as u8,
            value: address,
            index: 0,
            length: 0,
        }
    }

    pub const fn get_descriptor(
        kind: DescriptorKind,
        index: u8,
        language: u16,
        length: u16,
    ) -> Self {
        Self {
            kind: 0b1000_0000,
            request: SetupReq::GetDescriptor as u8,
            value: ((kind as u16) << 8) | (index as u16),
            index: language,
            length,
        }
    }

    pub const fn get_configuration() -> Self {
        Self {
            kind: 0b1000_0000,
            request: SetupReq::GetConfiguration as u8,
            value: 0,
            index: 0,
            length: 1,
        }
    }

    pub const fn set_configuration(value: u8) -> Self {
        Self {
            kind: 0b0000_0000,
            request: SetupReq::SetConfiguration as u8,
            value: value as u16,
            index: 0,
            length: 0,
        }
    }

    /// Hub class GET_STATUS addressed to a port (USB2 11.24.2.7).
    pub const fn get_port_status(port: u16) -> Self {
        Self {
            kind: 0b1010_0011,
            request: SetupReq::GetStatus as u8,
            value: 0,
            index: port,
            length: 4,
        }
    }

    pub const fn set_port_feature(port: u16, feature: u16) -> Self {
        Self {
            kind: 0b0010_0011,
            request: SetupReq::SetFeature as u8,
            value: feature,
            index: port,
            length: 0,
        }
    }

    pub const fn clear_port_feature(port: u16, feature: u16) -> Self {
        Self {
            kind: 0b0010_0011,
            request: SetupReq::ClearFeature as u8,
            value: feature,
            index: port,
            length: 0,
        }
    }

    pub const fn get_hub_descriptor(length: u16) -> Self {
        Self {
            kind: 0b1010_0000,
            request: SetupReq::GetDescriptor as u8,
            value: (DescriptorKind::Hub as u16) << 8,
            index: 0,
            length,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn setup_packet_layout() {
        assert_eq!(core::mem::size_of::<Setup>(), 8);
        let setup = Setup::get_descriptor(DescriptorKind::Device, 0, 0, 18);
        assert_eq!(setup.as_bytes(), &[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 18, 0]);
        assert_eq!(setup.direction(), ReqDirection::DeviceToHost);
        assert_eq!(setup.request_word(), 0x8006);
    }

    #[test]
    fn port_requests() {
        let setup = Setup::set_port_feature(2, 4);
        assert_eq!(setup.request_word(), 0x2303);
        assert_eq!(setup.req_recipient(), ReqRecipient::Other as u8);
        assert_eq!(setup.req_ty(), ReqType::Class as u8);
        assert_eq!(setup.direction(), ReqDirection::HostToDevice);
        assert_eq!(Setup::get_port_status(1).request_word(), 0xA300);
    }
}
