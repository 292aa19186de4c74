//! The uhcid daemon: brings up one UHCI controller reached through x86 port I/O.
//!
//! Usage: `uhcid <io-base> [irq] [config]`, with the I/O base in hexadecimal.
use std::env;
use std::fs::{File, OpenOptions};
use std::process;
use std::sync::Arc;
use std::thread;

use common::dma::IdentityMapper;
use uhcid::config::UhciConfig;
use uhcid::uhci::{self, Uhci};

/// Overrides the level logged to stderr.
const LOG_LEVEL_VAR: &str = "UHCID_LOG";

fn usage() -> ! {
    eprintln!("usage: uhcid <io-base> [irq] [config]");
    process::exit(1);
}

fn parse_io_base(arg: &str) -> Option<u16> {
    u16::from_str_radix(arg.trim_start_matches("0x"), 16).ok()
}

fn open_irq(irq: u8) -> Option<File> {
    let path = format!("/scheme/irq/{}", irq);
    match OpenOptions::new().read(true).write(true).open(&path) {
        Ok(file) => Some(file),
        Err(err) => {
            log::warn!("failed to open {}: {}, falling back to polling", path, err);
            None
        }
    }
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn main() {
    let mut args = env::args().skip(1);
    let io_base = args
        .next()
        .as_deref()
        .and_then(parse_io_base)
        .unwrap_or_else(|| usage());
    let irq = match args.next() {
        Some(arg) => Some(arg.parse::<u8>().unwrap_or_else(|_| usage())),
        None => None,
    };
    let config = match args.next() {
        Some(path) => UhciConfig::load(&path).expect("uhcid: failed to load configuration"),
        None => UhciConfig::default(),
    };

    let name = format!("pio_{:04x}_uhci", io_base);
    common::setup_logging(
        "usb",
        "host",
        &name,
        common::output_level(LOG_LEVEL_VAR),
        common::file_level(),
    );

    log::info!("UHCI at I/O {:#06x}, IRQ {:?}", io_base, irq);
    log::debug!("UHCI config: {:?}", config);

    let regs = Box::new(unsafe { uhci::regs::PioRegisters::new(io_base) });
    let hci = Arc::new(
        Uhci::new(regs, Arc::new(IdentityMapper), config)
            .expect("uhcid: failed to allocate device"),
    );
    hci.start().expect("uhcid: failed to start controller");

    uhci::start_irq_reactor(&hci, irq.and_then(open_irq));
    uhci::start_root_hub_timer(&hci);
    log::trace!("UHCI schedule:\n{}", hci.dump_schedule());

    // The USB layer drives the controller through `HostController`; the daemon keeps it alive.
    loop {
        thread::park();
    }
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
fn main() {
    eprintln!("uhcid: UHCI controllers are only reachable through x86 port I/O");
    process::exit(1);
}
