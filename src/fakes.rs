// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Test doubles.

use crate::result::{Error, Result};
use crate::serial::Line;
use std::collections::VecDeque;
use std::time::Duration;

/// An in-memory serial line: the test scripts the host side into
/// `input` and inspects what the drive wrote in `output`.
pub struct FakeLine {
    pub input: VecDeque<u8>,
    pub output: Vec<u8>,
}

impl FakeLine {
    pub fn new(input: Vec<u8>) -> FakeLine {
        FakeLine { input: input.into(), output: Vec::new() }
    }
}

impl Line for FakeLine {
    fn try_getb_timeout(&mut self, _timeout: Duration) -> Result<u8> {
        self.input.pop_front().ok_or(Error::Timeout)
    }

    fn putb(&mut self, b: u8) -> Result<()> {
        self.output.push(b);
        Ok(())
    }
}
