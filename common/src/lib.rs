//! Helpers shared by the host controller drivers: DMA memory, register I/O, timeouts and logging.

pub mod dma;
pub mod io;
pub mod timeout;

mod logger;

pub use logger::{file_level, output_level, setup_logging};
