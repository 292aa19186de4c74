//! The Universal Host Controller Interface (UHCI) driver core
//!
//! UHCI is Intel's USB 1.1 host controller. Unlike its successors it does almost no scheduling on
//! its own: software builds a 1024 entry frame list in memory, hangs transfer descriptors (TDs)
//! and queue heads (QHs) off it, and the controller walks that structure once per millisecond.
//! Completion is signalled by a single interrupt, after which software has to find out by itself
//! which descriptors were retired.
//!
//! The crate is organised as follows:
//!
//! - [`driver_interface`]: the transfer model ([`driver_interface::Urb`]) and the
//!   [`driver_interface::HostController`] trait the USB layer talks to;
//! - [`uhci`]: the controller itself, its schedule, and the emulated root hub;
//! - [`usb`]: the standard USB structures the controller needs to know about;
//! - [`config`]: tunables, embedded as TOML.
//!
//! This documentation refers to the following standards:
//!
//! - UHCI - Universal Host Controller Interface (UHCI) Design Guide, Revision 1.1
//! - USB2 - [Universal Serial Bus Specification](https://www.usb.org/document-library/usb-20-specification)

pub mod config;
pub mod driver_interface;
pub mod uhci;
pub mod usb;
