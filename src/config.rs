// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The emulator configuration, consumed by the rest of tu58d.
//!
//! One `Config` exists per process, shared by the protocol,
//! monitor and console threads.  Parsed options are immutable;
//! the runtime toggles and the cross-thread flags are single
//! words, each written by exactly one thread.

use crate::drive::Bank;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Options fixed at startup by the command line.
#[derive(Clone, Debug)]
pub struct Options {
    pub port: String,
    pub baud: u32,
    pub stopbits: u8,
    pub mrsp: bool,
    pub nosync: bool,
    pub vax: bool,
    pub timing: u8,
    pub background: bool,
    pub synctimeout: Duration,
    pub offlinetimeout: Duration,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            port: "1".into(),
            baud: 9600,
            stopbits: 1,
            mrsp: false,
            nosync: false,
            vax: false,
            timing: 0,
            background: false,
            synctimeout: Duration::from_secs(5),
            offlinetimeout: Duration::from_secs(5),
        }
    }
}

pub struct Config {
    pub opts: Options,
    pub bank: Bank,
    /// Runtime toggles, flipped from the console.
    pub verbose: AtomicBool,
    pub debug: AtomicBool,
    /// Send INIT when the server (re)starts.
    pub doinit: AtomicBool,
    /// Console asks the drive to go offline; the protocol thread
    /// obliges once the line has been idle long enough.
    pub offline_request: AtomicBool,
    pub offline: AtomicBool,
    /// Cooperative cancellation, checked at I/O and timer
    /// boundaries.
    pub cancel_server: AtomicBool,
    pub cancel_monitor: AtomicBool,
    epoch: Instant,
    last_activity_ms: AtomicU64,
}

impl Config {
    pub fn new(opts: Options) -> Config {
        let doinit = !opts.nosync;
        Config {
            opts,
            bank: Bank::new(),
            verbose: AtomicBool::new(false),
            debug: AtomicBool::new(false),
            doinit: AtomicBool::new(doinit),
            offline_request: AtomicBool::new(false),
            offline: AtomicBool::new(false),
            cancel_server: AtomicBool::new(false),
            cancel_monitor: AtomicBool::new(false),
            epoch: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    /// Called by the protocol thread for every serial byte.
    pub fn note_activity(&self) {
        let ms = self.epoch.elapsed().as_millis() as u64;
        self.last_activity_ms.store(ms, Ordering::Relaxed);
    }

    /// How long the serial line has been silent.
    pub fn serial_idle(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        self.epoch.elapsed().saturating_sub(Duration::from_millis(last))
    }
}
