//! Standard descriptors (USB2 section 9.6).

/// A USB Device Descriptor.
///
/// "Provides information that applies globally to the device and all the device's
/// configurations" (USB2 9.6.1). Field order follows USB2 Table 9-8.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceDescriptor {
    pub length: u8,
    pub kind: u8,
    /// The USB release in binary-coded decimal, 0x0110 for USB 1.1.
    pub usb: u16,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    /// The maximum packet size for endpoint 0.
    pub packet_size: u8,
    pub vendor: u16,
    pub product: u16,
    pub release: u16,
    pub manufacturer_str: u8,
    pub product_str: u8,
    pub serial_str: u8,
    pub configurations: u8,
}

unsafe impl plain::Plain for DeviceDescriptor {}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct ConfigDescriptor {
    pub length: u8,
    pub kind: u8,
    pub total_length: u16,
    pub interfaces: u8,
    pub configuration_value: u8,
    pub configuration_str: u8,
    pub attributes: u8,
    pub max_power: u8,
}

unsafe impl plain::Plain for ConfigDescriptor {}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct InterfaceDescriptor {
    pub length: u8,
    pub kind: u8,
    pub number: u8,
    pub alternate_setting: u8,
    pub endpoints: u8,
    pub class: u8,
    pub sub_class: u8,
    pub protocol: u8,
    pub interface_str: u8,
}

unsafe impl plain::Plain for InterfaceDescriptor {}

#[repr(C, packed)]
#[derive(Clone, Copy, Debug, Default)]
pub struct EndpointDescriptor {
    pub length: u8,
    pub kind: u8,
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

unsafe impl plain::Plain for EndpointDescriptor {}

pub const ENDP_ATTR_TY_MASK: u8 = 0x3;
pub const ENDP_ATTR_INTERRUPT: u8 = 0x3;
pub const ENDP_ADDR_DIR_IN: u8 = 0x80;
