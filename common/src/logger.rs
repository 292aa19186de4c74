use std::env;

use redox_log::{OutputBuilder, RedoxLogger};

fn parse_level(value: &str) -> Option<log::LevelFilter> {
    match value.trim().to_ascii_lowercase().as_str() {
        "off" => Some(log::LevelFilter::Off),
        "error" => Some(log::LevelFilter::Error),
        "warn" => Some(log::LevelFilter::Warn),
        "info" => Some(log::LevelFilter::Info),
        "debug" => Some(log::LevelFilter::Debug),
        "trace" => Some(log::LevelFilter::Trace),
        _ => None,
    }
}

/// The level logged to stderr: `Info`, unless the environment variable `var` names another one.
pub fn output_level(var: &str) -> log::LevelFilter {
    env::var(var)
        .ok()
        .and_then(|value| parse_level(&value))
        .unwrap_or(log::LevelFilter::Info)
}

pub fn file_level() -> log::LevelFilter {
    log::LevelFilter::Info
}

/// Configures logging for a single driver.
#[cfg_attr(not(target_os = "redox"), allow(unused_variables, unused_mut))]
pub fn setup_logging(
    category: &str,
    subcategory: &str,
    logfile_base: &str,
    output_level: log::LevelFilter,
    file_level: log::LevelFilter,
) {
    let mut logger = RedoxLogger::new().with_output(
        OutputBuilder::stderr()
            .with_filter(output_level) // limit global output to important info
            .with_ansi_escape_codes()
            .flush_on_newline(true)
            .build(),
    );

    #[cfg(target_os = "redox")]
    for (suffix, ansi) in [("log", false), ("ansi.log", true)] {
        match OutputBuilder::in_redox_logging_scheme(
            category,
            subcategory,
            format!("{logfile_base}.{suffix}"),
        ) {
            Ok(b) => {
                let b = b.with_filter(file_level).flush_on_newline(true);
                let b = if ansi { b.with_ansi_escape_codes() } else { b };
                logger = logger.with_output(b.build())
            }
            Err(error) => eprintln!("Failed to create {logfile_base}.{suffix}: {}", error),
        }
    }

    if let Err(error) = logger.enable() {
        eprintln!("{logfile_base}: failed to set default logger: {error}");
    }
}
