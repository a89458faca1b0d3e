//! CLI logging setup.
//!
//! The tool's verbosity is a counter: each `-v` raises the log filter one
//! step from the default (warnings), each `-q` lowers it.

use log::LevelFilter;

/// Initialise the global logger from the verbosity counters.
pub fn init(verbose: u8, quiet: u8) {
    env_logger::Builder::new()
        .filter_level(level_filter(verbose, quiet))
        .format_timestamp(None)
        .format_target(false)
        .init();
}

fn level_filter(verbose: u8, quiet: u8) -> LevelFilter {
    // Warn sits at step 2 of the Off..Trace ladder
    match 2 + i16::from(verbose) - i16::from(quiet) {
        i16::MIN..=0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}
