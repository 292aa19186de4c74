//! Driver tunables, loaded from TOML.
use std::time::Duration;

use lazy_static::lazy_static;
use log::warn;
use serde::Deserialize;
use thiserror::Error;

/// USB 2.0 section 7.1.7.5: reset signalling must last at least 10 ms on a root port.
pub const MIN_PORT_RESET_HOLD_MS: u64 = 10;
/// UHCI 2.1.1: software must hold GRESET for at least 10 ms; USB requires 50 ms for a root reset.
pub const MIN_GLOBAL_RESET_HOLD_MS: u64 = 50;
/// One full-speed frame.
pub const MIN_FRAME_PERIOD_US: u64 = 1000;
/// Packets per isochronous submission can never exceed the frame list.
pub const MAX_ISO_PACKETS_LIMIT: usize = 1000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ControllerConfig {
    pub global_reset_hold_ms: u64,
    pub reset_timeout_ms: u64,
    pub polling_interval_ms: u64,
    pub clear_halt_timeout_ms: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ScheduleConfig {
    pub iso_latency: u16,
    pub max_iso_packets: usize,
    pub frame_period_us: u64,
    pub bandwidth_reclamation: bool,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct PoolConfig {
    pub transfer_descriptors: usize,
    pub queue_heads: usize,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RootHubConfig {
    pub poll_interval_ms: u64,
    pub port_reset_hold_ms: u64,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct UhciConfig {
    pub controller: ControllerConfig,
    pub schedule: ScheduleConfig,
    pub pool: PoolConfig,
    pub root_hub: RootHubConfig,
}

lazy_static! {
    static ref DEFAULT_CONFIG: UhciConfig = {
        const TOML: &'static [u8] = include_bytes!("../uhcid.toml");

        toml::from_slice::<UhciConfig>(TOML).expect("Failed to parse internally embedded config file")
    };
}

impl Default for UhciConfig {
    fn default() -> Self {
        DEFAULT_CONFIG.clone()
    }
}

impl UhciConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str::<UhciConfig>(text)?.sanitized())
    }

    pub fn load(path: &str) -> Result<Self, ConfigError> {
        Self::from_toml(&std::fs::read_to_string(path)?)
    }

    /// Raise every value that the hardware or the USB specification puts a floor on.
    pub fn sanitized(mut self) -> Self {
        fn floor<T: PartialOrd + Copy + std::fmt::Display>(name: &str, value: &mut T, min: T) {
            if *value < min {
                warn!("config: {} = {} is below the minimum of {}", name, value, min);
                *value = min;
            }
        }

        floor(
            "controller.global_reset_hold_ms",
            &mut self.controller.global_reset_hold_ms,
            MIN_GLOBAL_RESET_HOLD_MS,
        );
        floor("controller.polling_interval_ms", &mut self.controller.polling_interval_ms, 1);
        floor(
            "schedule.frame_period_us",
            &mut self.schedule.frame_period_us,
            MIN_FRAME_PERIOD_US,
        );
        floor("schedule.iso_latency", &mut self.schedule.iso_latency, 1);
        floor("schedule.max_iso_packets", &mut self.schedule.max_iso_packets, 1);
        floor("root_hub.poll_interval_ms", &mut self.root_hub.poll_interval_ms, 1);
        floor(
            "root_hub.port_reset_hold_ms",
            &mut self.root_hub.port_reset_hold_ms,
            MIN_PORT_RESET_HOLD_MS,
        );
        if self.schedule.max_iso_packets > MAX_ISO_PACKETS_LIMIT {
            warn!(
                "config: schedule.max_iso_packets = {} exceeds {}",
                self.schedule.max_iso_packets, MAX_ISO_PACKETS_LIMIT
            );
            self.schedule.max_iso_packets = MAX_ISO_PACKETS_LIMIT;
        }
        self
    }

    pub fn frame_period(&self) -> Duration {
        Duration::from_micros(self.schedule.frame_period_us)
    }
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.controller.polling_interval_ms)
    }
    pub fn clear_halt_timeout(&self) -> Duration {
        Duration::from_millis(self.controller.clear_halt_timeout_ms)
    }
    pub fn root_hub_poll_interval(&self) -> Duration {
        Duration::from_millis(self.root_hub.poll_interval_ms)
    }
}
