// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Console logging.
//!
//! Operator-facing lines go to stderr with the traditional
//! prefixes: `info:` for progress, `ERROR:` for trouble the
//! emulator survives, `FATAL:` right before exit.  Background
//! mode keeps errors only.

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

struct StderrLogger {
    background: AtomicBool,
}

static LOGGER: StderrLogger = StderrLogger { background: AtomicBool::new(false) };

impl Log for StderrLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        if self.background.load(Ordering::Relaxed) {
            metadata.level() <= Level::Warn
        } else {
            metadata.level() <= log::max_level()
        }
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        match record.level() {
            Level::Error | Level::Warn => {
                eprintln!("ERROR: {}", record.args())
            }
            Level::Info => eprintln!("info: {}", record.args()),
            Level::Debug => eprintln!("debug: {}", record.args()),
            Level::Trace => eprintln!("trace: {}", record.args()),
        }
    }

    fn flush(&self) {}
}

/// Installs the logger.  Safe to call once.
pub fn init(background: bool) {
    LOGGER.background.store(background, Ordering::Relaxed);
    let _ = log::set_logger(&LOGGER);
    log::set_max_level(LevelFilter::Info);
}

/// Maps the V/D console toggles onto log levels.
pub fn apply_levels(verbose: bool, debug: bool) {
    let level = if debug {
        LevelFilter::Trace
    } else if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    log::set_max_level(level);
}

/// Startup-time dead end: complain and exit 1.
pub fn fatal(msg: fmt::Arguments) -> ! {
    eprintln!("FATAL: {msg}");
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_mapping() {
        apply_levels(false, false);
        assert_eq!(log::max_level(), LevelFilter::Info);
        apply_levels(true, false);
        assert_eq!(log::max_level(), LevelFilter::Debug);
        apply_levels(true, true);
        assert_eq!(log::max_level(), LevelFilter::Trace);
        apply_levels(false, false);
    }
}
