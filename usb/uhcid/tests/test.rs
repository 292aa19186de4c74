use std::time::Duration;

use syscall::error::{Error, EAGAIN, EFBIG, EINVAL, EPIPE};

use uhcid::config::UhciConfig;
use uhcid::driver_interface::TransferError;
use uhcid::uhci::desc::TdStatus;
use uhcid::uhci::irq_reactor::transfer_error;
use uhcid::uhci::schedule::{
    frame_level, interrupt_level, iso_start_frame, IsoRequest, IsoStart, IsoWindow, FRAME_COUNT,
};
use uhcid::usb::{DescriptorKind, Setup};

const DEFAULT_TOML: &str = include_str!("../uhcid.toml");

#[test]
fn shipped_config_matches_builtin_defaults() {
    let config = UhciConfig::from_toml(DEFAULT_TOML).unwrap();
    assert_eq!(config, UhciConfig::default());
    assert_eq!(config.schedule.iso_latency, 10);
    assert_eq!(config.schedule.max_iso_packets, 900);
    assert_eq!(config.frame_period(), Duration::from_millis(1));
    assert_eq!(config.root_hub_poll_interval(), Duration::from_millis(32));
}

#[test]
fn config_values_below_hardware_limits_are_raised() {
    let text = DEFAULT_TOML
        .replace("frame_period_us = 1000", "frame_period_us = 100")
        .replace("max_iso_packets = 900", "max_iso_packets = 5000")
        .replace("port_reset_hold_ms = 10", "port_reset_hold_ms = 1");
    let config = UhciConfig::from_toml(&text).unwrap();
    assert_eq!(config.schedule.frame_period_us, 1000);
    assert_eq!(config.schedule.max_iso_packets, 1000);
    assert_eq!(config.root_hub.port_reset_hold_ms, 10);
}

#[test]
fn malformed_config_is_rejected() {
    assert!(UhciConfig::from_toml("[controller]\nglobal_reset_hold_ms = \"long\"").is_err());
}

#[test]
fn every_interrupt_level_is_reached_at_its_period() {
    for level in 0..9u8 {
        let visits = (0..FRAME_COUNT)
            .filter(|&frame| frame_level(frame) >= level)
            .count();
        assert_eq!(visits, FRAME_COUNT >> level, "level {}", level);
    }
    assert_eq!(interrupt_level(10), 3);
    assert_eq!(interrupt_level(1000), 8);
}

#[test]
fn iso_stream_continues_across_the_frame_list_wrap() {
    let pending = [IsoWindow::new(1020, 8)];
    let request = IsoRequest {
        start: IsoStart::Asap,
        packets: 16,
        pending: &pending,
    };
    assert_eq!(iso_start_frame(1018, 10, 900, &request), Ok(4));
}

#[test]
fn iso_requests_that_cannot_be_placed() {
    let pending = [IsoWindow::new(100, 10)];
    let request = |start, packets| IsoRequest {
        start,
        packets,
        pending: &pending,
    };

    assert_eq!(
        iso_start_frame(50, 10, 900, &request(IsoStart::Asap, 901)),
        Err(Error::new(EFBIG))
    );
    assert_eq!(
        iso_start_frame(50, 10, 900, &request(IsoStart::Asap, 0)),
        Err(Error::new(EINVAL))
    );
    // collides with the pending window
    assert_eq!(
        iso_start_frame(50, 10, 900, &request(IsoStart::At(105), 4)),
        Err(Error::new(EAGAIN))
    );
    // already behind the controller
    assert_eq!(
        iso_start_frame(50, 10, 900, &request(IsoStart::At(50), 4)),
        Err(Error::new(EAGAIN))
    );
    assert_eq!(
        iso_start_frame(50, 10, 900, &request(IsoStart::At(110), 4)),
        Ok(110)
    );
}

#[test]
fn hardware_status_maps_to_errno() {
    let stalled = transfer_error(TdStatus::STALLED | TdStatus::BABBLE, false);
    assert_eq!(stalled, TransferError::Babble);
    assert_eq!(transfer_error(TdStatus::STALLED, true).errno(), EPIPE);
    assert_eq!(
        transfer_error(TdStatus::CRC_TIMEOUT, true),
        TransferError::CrcTimeout { out: true }
    );
    assert!(!TransferError::Stall.is_cancellation());
    assert!(TransferError::Unlinked.is_cancellation());
}

#[test]
fn setup_packets_are_little_endian() {
    let setup = Setup::get_descriptor(DescriptorKind::Device, 0, 0, 18);
    assert_eq!(setup.as_bytes(), &[0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00]);

    let setup = Setup::get_port_status(2);
    assert_eq!(setup.request_word(), 0xA300);
    assert_eq!(setup.as_bytes(), &[0xA3, 0x00, 0x00, 0x00, 0x02, 0x00, 0x04, 0x00]);
}
