// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Operator console: single-key polling while the emulator runs,
//! and the per-unit dialog behind the 0..7 keys.
//!
//! The keyboard is polled raw (no echo, no line buffering); the
//! dialog temporarily restores canonical mode so the operator can
//! type whole lines.

use crate::config::Config;
use crate::result::{Error, Result};
use log::{error, info};
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

pub struct Console {
    orig: Option<libc::termios>,
}

impl Console {
    /// Puts stdin into raw single-key mode.  A non-tty stdin is
    /// left alone and simply yields no keys.
    pub fn init() -> Console {
        let fd = libc::STDIN_FILENO;
        if unsafe { libc::isatty(fd) } != 1 {
            return Console { orig: None };
        }
        let mut orig = unsafe { std::mem::zeroed::<libc::termios>() };
        if unsafe { libc::tcgetattr(fd, &mut orig) } < 0 {
            return Console { orig: None };
        }
        let mut raw = orig;
        raw.c_lflag &= !(libc::ICANON | libc::ECHO);
        raw.c_cc[libc::VMIN] = 0;
        raw.c_cc[libc::VTIME] = 0;
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &raw) } < 0 {
            return Console { orig: None };
        }
        Console { orig: Some(orig) }
    }

    fn set_canonical(&self, on: bool) {
        let Some(orig) = self.orig else { return };
        let mut t = orig;
        if !on {
            t.c_lflag &= !(libc::ICANON | libc::ECHO);
            t.c_cc[libc::VMIN] = 0;
            t.c_cc[libc::VTIME] = 0;
        }
        unsafe {
            libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &t);
        }
    }

    /// One key if pressed, without blocking.
    pub fn poll_key(&self) -> Option<u8> {
        self.orig?;
        let mut pfd = libc::pollfd {
            fd: libc::STDIN_FILENO,
            events: libc::POLLIN,
            revents: 0,
        };
        if unsafe { libc::poll(&mut pfd, 1, 0) } <= 0 {
            return None;
        }
        let mut b = 0u8;
        let n = unsafe {
            libc::read(libc::STDIN_FILENO, (&mut b as *mut u8).cast(), 1)
        };
        (n == 1).then_some(b)
    }

    /// Prompts for one whole line, in canonical mode.
    pub fn read_line(&self, prompt: &str) -> Result<String> {
        eprint!("{prompt}");
        let _ = io::stderr().flush();
        self.set_canonical(true);
        let mut line = String::new();
        let n = io::stdin().lock().read_line(&mut line)?;
        self.set_canonical(false);
        if n == 0 {
            return Err(Error::LineClosed);
        }
        Ok(line.trim().to_string())
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        if let Some(orig) = self.orig {
            unsafe {
                libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &orig);
            }
        }
    }
}

/// The 0..7 key: take the drive offline, then let the operator
/// save, load or resume.
pub fn device_dialog(cfg: &Arc<Config>, unit: usize, console: &Console) {
    cfg.offline_request.store(true, Ordering::Relaxed);
    info!(
        "TU58 goes offline after {}s of RS232 inactivity ...",
        cfg.opts.offlinetimeout.as_secs()
    );
    while !cfg.offline.load(Ordering::Relaxed) {
        if cfg.cancel_server.load(Ordering::Relaxed) {
            break;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    info!("TU58 now offline: \"all cartridges removed\"");

    loop {
        {
            let img = cfg.bank.image(unit);
            eprintln!(
                "Choices for device {unit}{}:",
                if img.changed { " (unsaved changes)" } else { "" }
            );
            eprintln!(
                "S - save image to disk{}",
                if img.changed { "" } else { " (though unchanged)" }
            );
            if img.shared {
                eprintln!(
                    "L <file> - reload image from dir \"{}\"",
                    img.host_fpath.display()
                );
            } else {
                eprintln!(
                    "L <file> - load other image file (now \"{}\")",
                    img.host_fpath.display()
                );
            }
            eprintln!("C - continue server with all drives online");
        }
        let line = match console.read_line(". ") {
            Ok(line) if !line.is_empty() => line,
            Ok(_) => continue,
            Err(_) => break,
        };
        let mut tokens = line.split_whitespace();
        let cmd = tokens.next().unwrap_or("");
        match cmd.to_ascii_uppercase().as_str() {
            "S" => {
                let mut img = cfg.bank.image(unit);
                match img.save() {
                    Ok(()) => info!("unit {unit} saved"),
                    Err(e) => error!("save failed: {e}"),
                }
            }
            "L" => {
                let Some(fpath) = tokens.next() else {
                    error!("syntax: \"L filename\"");
                    continue;
                };
                let mut img = cfg.bank.image(unit);
                if img.shared {
                    // Reload semantics for shared units are still
                    // an open question upstream.
                    error!("{}", Error::UnsupportedOperation);
                    continue;
                }
                let (readonly, device, fs_kind, autosizing) =
                    (img.readonly, img.device, img.fs_kind, img.autosizing);
                if let Err(e) = img.close() {
                    error!("closing current image failed: {e}");
                }
                match img.open(
                    unit,
                    false,
                    readonly,
                    false,
                    std::path::Path::new(fpath),
                    device,
                    fs_kind,
                    autosizing,
                ) {
                    Ok(()) => info!("opened file \"{fpath}\""),
                    Err(e) => error!("opening file \"{fpath}\" failed: {e}"),
                }
            }
            "C" => break,
            other => error!("unknown choice \"{other}\""),
        }
    }
    cfg.offline_request.store(false, Ordering::Relaxed);
}
