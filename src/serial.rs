// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The serial line under the protocol engine.
//!
//! The engine only needs a byte stream with timeouts, expressed
//! by the [`Line`] trait; the real implementation is a raw-mode
//! termios port.  Timeout `Duration::ZERO` means wait forever.

use crate::result::{Error, Result};
use log::{debug, info};
use std::ffi::CString;
use std::io;
use std::os::raw::c_int;
use std::time::Duration;

/// A half-duplex byte stream.
pub trait Line {
    /// Waits up to `timeout` for one byte, forever when the
    /// timeout is zero.  `Error::Timeout` when nothing arrived.
    fn try_getb_timeout(&mut self, timeout: Duration) -> Result<u8>;

    fn putb(&mut self, b: u8) -> Result<()>;

    fn putbs(&mut self, bs: &[u8]) -> Result<()> {
        for &b in bs {
            self.putb(b)?;
        }
        Ok(())
    }

    /// Waits for pending output to reach the wire.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn getb(&mut self) -> Result<u8> {
        self.try_getb_timeout(Duration::ZERO)
    }
}

/// Supported line speeds.
const RATES: &[(u32, libc::speed_t)] = &[
    (1200, libc::B1200),
    (2400, libc::B2400),
    (4800, libc::B4800),
    (9600, libc::B9600),
    (19200, libc::B19200),
    (38400, libc::B38400),
    (57600, libc::B57600),
    (115200, libc::B115200),
    (230400, libc::B230400),
    (460800, libc::B460800),
    (500000, libc::B500000),
    (921600, libc::B921600),
    (1000000, libc::B1000000),
    (1500000, libc::B1500000),
    (2000000, libc::B2000000),
    (3000000, libc::B3000000),
];

fn speed_of(baud: u32) -> Result<libc::speed_t> {
    RATES
        .iter()
        .find(|&&(b, _)| b == baud)
        .map(|&(_, s)| s)
        .ok_or(Error::NumRange)
}

/// Maps "1".."9" to /dev/ttyS0.. like the usual COM numbering;
/// anything with a slash is taken literally.
pub fn device_path(port: &str) -> String {
    match port.parse::<usize>() {
        Ok(n) if n >= 1 => format!("/dev/ttyS{}", n - 1),
        _ => port.to_string(),
    }
}

/// A raw 8-N-1 (or 8-N-2) serial port.
pub struct SerialPort {
    fd: c_int,
    orig: libc::termios,
    path: String,
}

// The fd is used from one thread at a time; the server loop owns
// the port.
unsafe impl Send for SerialPort {}

impl SerialPort {
    pub fn open(port: &str, baud: u32, stopbits: u8) -> Result<SerialPort> {
        let path = device_path(port);
        let speed = speed_of(baud)?;
        let cpath = CString::new(path.as_str()).map_err(|_| Error::BadArgs)?;
        let fd = unsafe {
            libc::open(cpath.as_ptr(), libc::O_RDWR | libc::O_NOCTTY)
        };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let mut orig = unsafe { std::mem::zeroed::<libc::termios>() };
        if unsafe { libc::tcgetattr(fd, &mut orig) } < 0 {
            let e = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(e.into());
        }
        let mut raw = orig;
        unsafe {
            libc::cfmakeraw(&mut raw);
            libc::cfsetispeed(&mut raw, speed);
            libc::cfsetospeed(&mut raw, speed);
        }
        raw.c_cflag |= libc::CLOCAL | libc::CREAD;
        if stopbits == 2 {
            raw.c_cflag |= libc::CSTOPB;
        } else {
            raw.c_cflag &= !libc::CSTOPB;
        }
        raw.c_cc[libc::VMIN] = 0;
        raw.c_cc[libc::VTIME] = 0;
        if unsafe { libc::tcsetattr(fd, libc::TCSANOW, &raw) } < 0 {
            let e = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(e.into());
        }
        unsafe {
            libc::tcflush(fd, libc::TCIOFLUSH);
        }
        info!("serial port {path} at {baud} baud, {stopbits} stop");
        Ok(SerialPort { fd, orig, path })
    }

    fn wait_readable(&self, timeout: Duration) -> Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let ms: c_int = if timeout.is_zero() {
            -1
        } else {
            timeout.as_millis().min(i32::MAX as u128) as c_int
        };
        loop {
            let ret = unsafe { libc::poll(&mut pfd, 1, ms) };
            if ret < 0 {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }
            return Ok(ret > 0);
        }
    }
}

impl Line for SerialPort {
    fn try_getb_timeout(&mut self, timeout: Duration) -> Result<u8> {
        if !self.wait_readable(timeout)? {
            return Err(Error::Timeout);
        }
        let mut b = 0u8;
        loop {
            let n = unsafe {
                libc::read(self.fd, (&mut b as *mut u8).cast(), 1)
            };
            if n < 0 {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }
            if n == 0 {
                return Err(Error::LineClosed);
            }
            return Ok(b);
        }
    }

    fn putb(&mut self, b: u8) -> Result<()> {
        loop {
            let n =
                unsafe { libc::write(self.fd, (&b as *const u8).cast(), 1) };
            if n < 0 {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }
            if n == 1 {
                return Ok(());
            }
        }
    }

    fn flush(&mut self) -> Result<()> {
        if unsafe { libc::tcdrain(self.fd) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(())
    }
}

impl Drop for SerialPort {
    fn drop(&mut self) {
        debug!("closing serial port {}", self.path);
        unsafe {
            libc::tcsetattr(self.fd, libc::TCSANOW, &self.orig);
            libc::close(self.fd);
        }
    }
}
