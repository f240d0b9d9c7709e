// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The TU58 command/response state machine.
//!
//! One session serves one serial line.  Bytes arrive, frames are
//! assembled and checked, and READ/WRITE/POSITION commands run
//! against the drive bank.  The session also owns the offline
//! handshake: a latched operator request takes effect once the
//! line has been silent for the configured window, and until the
//! request clears every framed packet is answered with an END
//! carrying the no-cartridge status.
//!
//! In MRSP mode every transmitted frame byte waits for a
//! CONTINUE handshake before the next; XOFF pauses transmission
//! the same way.  An INIT byte aborts whatever is in progress
//! and is answered with CONTINUE.

use crate::config::Config;
use crate::drive::Bank;
use crate::image::BLOCK_SIZE;
use crate::packet::{
    self, Command, EndStatus, Flag, Opcode, Packet, Switches,
};
use crate::result::{Error, Result};
use crate::serial::Line;
use log::{debug, info, warn};
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Poll granularity of the serve loop; cancel and offline checks
/// happen at this rate.
pub const TICK: Duration = Duration::from_millis(100);

/// How long mid-frame silence may last before the frame is
/// abandoned.
const BYTE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Uninit,
    Idle,
    RxCommand,
    RxData,
    TxData,
    EndPending,
    Offline,
}

pub struct Session<'a, L: Line> {
    line: &'a mut L,
    cfg: &'a Config,
    state: State,
    mrsp: bool,
    xoff: bool,
}

impl<'a, L: Line> Session<'a, L> {
    pub fn new(line: &'a mut L, cfg: &'a Config) -> Session<'a, L> {
        Session {
            line,
            cfg,
            state: State::Uninit,
            mrsp: cfg.opts.mrsp,
            xoff: false,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Startup: announce ourselves with INIT INIT and wait for the
    /// echo, unless that is disabled.
    pub fn start(&mut self) -> Result<()> {
        if self.cfg.doinit.load(Ordering::Relaxed) {
            self.putb_raw(packet::INIT)?;
            self.putb_raw(packet::INIT)?;
            self.line.flush()?;
            self.state = State::Uninit;
        } else {
            self.state = State::Idle;
        }
        Ok(())
    }

    /// Serves until cancelled.
    pub fn run(&mut self) -> Result<()> {
        self.start()?;
        info!("TU58 protocol service running");
        loop {
            if self.cfg.cancel_server.load(Ordering::Relaxed) {
                return Ok(());
            }
            self.poll_offline();
            match self.step(TICK) {
                Ok(()) | Err(Error::Timeout) | Err(Error::Interrupted) => {}
                Err(Error::LineClosed) => return Err(Error::LineClosed),
                Err(e) => warn!("protocol: {e}"),
            }
        }
    }

    /// Applies a latched offline request (or its withdrawal).
    pub fn poll_offline(&mut self) {
        let want = self.cfg.offline_request.load(Ordering::Relaxed);
        match self.state {
            State::Offline if !want => {
                self.state = State::Idle;
                self.cfg.offline.store(false, Ordering::Relaxed);
                info!("drive back online");
            }
            State::Idle | State::Uninit if want => {
                if self.cfg.serial_idle() >= self.cfg.opts.offlinetimeout {
                    self.state = State::Offline;
                    self.cfg.offline.store(true, Ordering::Relaxed);
                    info!("drive offline");
                }
            }
            _ => {}
        }
    }

    /// Waits up to `timeout` for one byte and handles it.
    pub fn step(&mut self, timeout: Duration) -> Result<()> {
        let b = self.line.try_getb_timeout(timeout)?;
        self.cfg.note_activity();
        self.on_byte(b)
    }

    fn on_byte(&mut self, b: u8) -> Result<()> {
        match b {
            packet::INIT => self.on_init(),
            packet::BOOT => self.on_boot(),
            packet::XOFF => {
                self.xoff = true;
                Ok(())
            }
            packet::CONTINUE => {
                self.xoff = false;
                Ok(())
            }
            _ => match Flag::from_byte(b) {
                Some(Flag::Command) => self.on_command_frame(),
                Some(flag) => {
                    // Stray DATA or END outside a transfer: drain
                    // the frame so we stay in sync, then drop it.
                    debug!("stray {flag:?} frame dropped");
                    let _ = self.recv_frame_body(flag);
                    Ok(())
                }
                None => {
                    debug!("line noise {b:#04x}");
                    Ok(())
                }
            },
        }
    }

    fn on_init(&mut self) -> Result<()> {
        debug!("INIT");
        self.xoff = false;
        self.putb_raw(packet::CONTINUE)?;
        if self.state != State::Offline {
            self.state = State::Idle;
        }
        Ok(())
    }

    /// BOOT <unit>: the requested unit's block 0, raw and
    /// unframed.
    fn on_boot(&mut self) -> Result<()> {
        let unit = self.line.try_getb_timeout(BYTE_TIMEOUT)? as usize;
        if self.state == State::Offline {
            return Ok(());
        }
        let mut block = [0u8; BLOCK_SIZE];
        if unit < Bank::UNITS {
            let cfg = self.cfg;
            let mut img = cfg.bank.image(unit);
            if img.open {
                if let Ok(b) = img.read_block(0) {
                    block.copy_from_slice(b);
                }
            }
        }
        info!("BOOT unit {unit}");
        self.send_raw(&block)
    }

    /// Reads length, payload and checksum of a frame whose flag
    /// byte was already consumed.
    fn recv_frame_body(&mut self, flag: Flag) -> Result<Vec<u8>> {
        let len = self.line.try_getb_timeout(BYTE_TIMEOUT)? as usize;
        if len > packet::MAX_PAYLOAD {
            return Err(Error::BadLength);
        }
        let mut frame = Vec::with_capacity(len + 4);
        frame.push(flag as u8);
        frame.push(len as u8);
        for _ in 0..len + 2 {
            frame.push(self.line.try_getb_timeout(BYTE_TIMEOUT)?);
        }
        Ok(Packet::decode(&frame)?.payload)
    }

    fn on_command_frame(&mut self) -> Result<()> {
        let offline = self.state == State::Offline;
        if !offline {
            self.state = State::RxCommand;
        }
        let payload = match self.recv_frame_body(Flag::Command) {
            Ok(p) => p,
            Err(Error::BadChecksum) => {
                warn!("command packet failed checksum");
                return self.send_end(
                    &Command::default(),
                    EndStatus::DataCheck,
                    0,
                );
            }
            Err(e) => {
                if !offline {
                    self.state = State::Idle;
                }
                return Err(e);
            }
        };
        let cmd = match Command::decode(&payload) {
            Ok(cmd) => cmd,
            Err(_) => {
                warn!("malformed command record ({} bytes)", payload.len());
                return self.send_end(
                    &Command::default(),
                    EndStatus::BadOpcode,
                    0,
                );
            }
        };
        if offline {
            debug!("offline: dropping {:#04x}", cmd.opcode);
            return self.send_end(&cmd, EndStatus::NoCartridge, 0);
        }
        self.dispatch(&cmd)
    }

    fn dispatch(&mut self, cmd: &Command) -> Result<()> {
        if self.cfg.debug.load(Ordering::Relaxed) {
            debug!(
                "cmd op={:#04x} unit={} seq={} count={} block={}",
                cmd.opcode, cmd.unit, cmd.sequence, cmd.count, cmd.block
            );
        }
        if cmd.switches().contains(Switches::MRSP) && !self.mrsp {
            debug!("host asked for MRSP, mode not enabled");
        }
        match Opcode::from_byte(cmd.opcode) {
            Err(_) => self.send_end(cmd, EndStatus::BadOpcode, 0),
            Ok(Opcode::Read) => self.cmd_read(cmd),
            Ok(Opcode::Write) => self.cmd_write(cmd),
            Ok(Opcode::Position) => self.cmd_position(cmd),
            Ok(Opcode::Diagnose) => {
                self.packet_delay();
                self.send_end(cmd, EndStatus::Success, 0)
            }
            Ok(Opcode::Init) => {
                self.state = State::Idle;
                self.send_end(cmd, EndStatus::Success, 0)
            }
            Ok(Opcode::Nop | Opcode::GetStatus | Opcode::SetStatus) => {
                self.send_end(cmd, EndStatus::Success, 0)
            }
            Ok(Opcode::End) => {
                debug!("END record from host ignored");
                self.state = State::Idle;
                Ok(())
            }
        }
    }

    /// Validates the addressed unit.
    fn check_unit(
        &self,
        cmd: &Command,
    ) -> std::result::Result<usize, EndStatus> {
        let unit = cmd.unit as usize;
        if unit >= Bank::UNITS {
            return Err(EndStatus::BadUnit);
        }
        if !self.cfg.bank.image(unit).open {
            return Err(EndStatus::NoCartridge);
        }
        Ok(unit)
    }

    fn cmd_position(&mut self, cmd: &Command) -> Result<()> {
        match self.check_unit(cmd) {
            Err(st) => self.send_end(cmd, st, 0),
            Ok(_) => {
                self.seek_delay(cmd.block);
                self.send_end(cmd, EndStatus::Success, 0)
            }
        }
    }

    fn cmd_read(&mut self, cmd: &Command) -> Result<()> {
        let unit = match self.check_unit(cmd) {
            Ok(u) => u,
            Err(st) => return self.send_end(cmd, st, 0),
        };
        let count = cmd.count as usize;
        // Gather everything under one lock acquisition, then
        // transmit without it.  Running off the end of a
        // fixed-size cartridge mid-transfer is a partial
        // operation; an unreachable first block is a bad block.
        let (buf, status) = {
            let cfg = self.cfg;
            let mut img = cfg.bank.image(unit);
            let mut buf = Vec::with_capacity(count);
            let mut bno = cmd.block as usize;
            let mut status = EndStatus::Success;
            while buf.len() < count {
                match img.read_block(bno) {
                    Ok(b) => {
                        let take = (count - buf.len()).min(BLOCK_SIZE);
                        buf.extend_from_slice(&b[..take]);
                    }
                    Err(Error::OutOfRange) => {
                        status = if buf.is_empty() {
                            EndStatus::BadBlock
                        } else {
                            EndStatus::PartialOperation
                        };
                        break;
                    }
                    Err(_) => {
                        status = EndStatus::SeekError;
                        break;
                    }
                }
                bno += 1;
            }
            (buf, status)
        };
        self.state = State::TxData;
        self.seek_delay(cmd.block);
        for chunk in buf.chunks(packet::MAX_PAYLOAD) {
            match self.send_packet(&Packet::data(chunk)) {
                Ok(()) => {}
                Err(Error::Interrupted) => return self.on_init(),
                Err(e) => return Err(e),
            }
        }
        self.state = State::EndPending;
        self.send_end(cmd, status, buf.len() as u16)
    }

    fn cmd_write(&mut self, cmd: &Command) -> Result<()> {
        let unit = match self.check_unit(cmd) {
            Ok(u) => u,
            Err(st) => return self.send_end(cmd, st, 0),
        };
        let cfg = self.cfg;
        if cfg.bank.image(unit).readonly {
            return self.send_end(cmd, EndStatus::WriteProtected, 0);
        }
        self.state = State::RxData;
        self.seek_delay(cmd.block);
        let count = cmd.count as usize;
        let mut buf: Vec<u8> = Vec::with_capacity(count);
        // The image lock is taken at the first received data byte
        // and held through the bitmap update.
        let mut guard = None;
        self.putb_raw(packet::CONTINUE)?;
        while buf.len() < count {
            let b = match self.line.try_getb_timeout(BYTE_TIMEOUT) {
                Ok(b) => b,
                Err(e) => {
                    self.state = State::Idle;
                    return Err(e);
                }
            };
            self.cfg.note_activity();
            match b {
                packet::INIT => {
                    drop(guard);
                    return self.on_init();
                }
                packet::XOFF => self.xoff = true,
                packet::CONTINUE => self.xoff = false,
                b if Flag::from_byte(b) == Some(Flag::Data) => {
                    if guard.is_none() {
                        guard = Some(cfg.bank.image(unit));
                    }
                    match self.recv_frame_body(Flag::Data) {
                        Ok(payload) => {
                            buf.extend_from_slice(&payload);
                            if buf.len() < count {
                                self.putb_raw(packet::CONTINUE)?;
                            }
                        }
                        Err(Error::BadChecksum) => {
                            warn!("data packet failed checksum");
                            drop(guard);
                            return self.send_end(
                                cmd,
                                EndStatus::DataCheck,
                                buf.len() as u16,
                            );
                        }
                        Err(e) => {
                            drop(guard);
                            self.state = State::Idle;
                            return Err(e);
                        }
                    }
                }
                other => debug!("byte {other:#04x} during write dropped"),
            }
        }
        buf.truncate(count);
        // Commit whole blocks; a short tail is zero filled.
        let mut img =
            guard.unwrap_or_else(|| cfg.bank.image(unit));
        let mut status = EndStatus::Success;
        for (i, chunk) in buf.chunks(BLOCK_SIZE).enumerate() {
            let mut block = [0u8; BLOCK_SIZE];
            block[..chunk.len()].copy_from_slice(chunk);
            match img.write_block(cmd.block as usize + i, &block) {
                Ok(()) => {}
                Err(Error::OutOfRange) => {
                    status = EndStatus::BadBlock;
                    break;
                }
                Err(Error::ImageReadOnly) => {
                    status = EndStatus::WriteProtected;
                    break;
                }
                Err(e) => {
                    warn!("write to unit {unit} failed: {e}");
                    status = EndStatus::SeekError;
                    break;
                }
            }
        }
        drop(img);
        self.state = State::EndPending;
        let count = if status == EndStatus::Success { cmd.count } else { 0 };
        self.send_end(cmd, status, count)
    }

    fn send_end(
        &mut self,
        cmd: &Command,
        status: EndStatus,
        count: u16,
    ) -> Result<()> {
        if status != EndStatus::Success {
            debug!("END status {status:?}");
        }
        match self.send_packet(&Packet::end(cmd, status, count)) {
            Ok(()) => {}
            Err(Error::Interrupted) => return self.on_init(),
            Err(e) => return Err(e),
        }
        if self.state != State::Offline {
            self.state = State::Idle;
        }
        Ok(())
    }

    fn send_packet(&mut self, p: &Packet) -> Result<()> {
        self.packet_delay();
        for &b in &p.encode() {
            self.send_byte(b)?;
        }
        self.line.flush()
    }

    /// Raw block transmission (BOOT): paced, but never MRSP
    /// handshaked.
    fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.packet_delay();
        for &b in bytes {
            self.wait_xon()?;
            self.line.putb(b)?;
            self.byte_delay();
        }
        self.line.flush()
    }

    /// One framed byte: XOFF gate, transmit, then the MRSP
    /// handshake when enabled.
    fn send_byte(&mut self, b: u8) -> Result<()> {
        self.wait_xon()?;
        self.line.putb(b)?;
        self.byte_delay();
        if self.mrsp {
            loop {
                match self.line.try_getb_timeout(BYTE_TIMEOUT)? {
                    packet::CONTINUE => break,
                    packet::INIT => return Err(Error::Interrupted),
                    packet::XOFF => self.xoff = true,
                    other => debug!("mrsp: unexpected {other:#04x}"),
                }
            }
        }
        Ok(())
    }

    fn wait_xon(&mut self) -> Result<()> {
        while self.xoff {
            match self.line.try_getb_timeout(BYTE_TIMEOUT)? {
                packet::CONTINUE => self.xoff = false,
                packet::INIT => return Err(Error::Interrupted),
                other => debug!("xoff: byte {other:#04x} dropped"),
            }
        }
        Ok(())
    }

    fn putb_raw(&mut self, b: u8) -> Result<()> {
        self.line.putb(b)?;
        self.line.flush()
    }

    /// Inter-packet gap for the maintenance diagnostic.
    fn packet_delay(&self) {
        if self.cfg.opts.vax || self.cfg.opts.timing == 0 {
            return;
        }
        std::thread::sleep(Duration::from_millis(3));
    }

    /// Inter-byte pacing for the maintenance diagnostic.
    fn byte_delay(&self) {
        if self.cfg.opts.vax || self.cfg.opts.timing == 0 {
            return;
        }
        std::thread::sleep(Duration::from_micros(300));
    }

    /// Cartridge seek emulation: a tape spends real time winding
    /// to the target block.
    fn seek_delay(&self, block: u16) {
        if self.cfg.opts.vax || self.cfg.opts.timing < 2 {
            return;
        }
        let ms = 50 + u64::from(block % 512) / 4;
        std::thread::sleep(Duration::from_millis(ms.min(500)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::fakes::FakeLine;
    use crate::image::{DeviceKind, Image};

    fn test_cfg(autosizing: bool) -> Config {
        let cfg = Config::new(Options {
            nosync: true,
            offlinetimeout: Duration::ZERO,
            ..Options::default()
        });
        let mut img = Image::memory(DeviceKind::Tu58, None, autosizing);
        img.unit = 0;
        *cfg.bank.image(0) = img;
        cfg
    }

    fn read_cmd(unit: u8, block: u16, count: u16) -> Command {
        Command {
            opcode: Opcode::Read as u8,
            unit,
            sequence: 0x42,
            count,
            block,
            ..Default::default()
        }
    }

    fn write_cmd(unit: u8, block: u16, count: u16) -> Command {
        Command { opcode: Opcode::Write as u8, ..read_cmd(unit, block, count) }
    }

    /// Feeds `input` through a fresh session and returns the
    /// output bytes.
    fn converse(cfg: &Config, input: Vec<u8>) -> Vec<u8> {
        let mut line = FakeLine::new(input);
        let mut sess = Session::new(&mut line, cfg);
        sess.start().unwrap();
        loop {
            sess.poll_offline();
            match sess.step(Duration::ZERO) {
                Err(Error::Timeout) => break,
                Ok(()) | Err(Error::Interrupted) => {}
                Err(e) => panic!("session error: {e:?}"),
            }
        }
        line.output
    }

    /// Splits output into framed packets and loose control bytes.
    fn split_output(mut bytes: &[u8]) -> (Vec<Packet>, Vec<u8>) {
        let mut frames = Vec::new();
        let mut control = Vec::new();
        while !bytes.is_empty() {
            if Flag::from_byte(bytes[0]).is_some() {
                let len = bytes[1] as usize;
                let (frame, rest) = bytes.split_at(len + 4);
                frames.push(Packet::decode(frame).unwrap());
                bytes = rest;
            } else {
                control.push(bytes[0]);
                bytes = &bytes[1..];
            }
        }
        (frames, control)
    }

    fn ends(frames: &[Packet]) -> Vec<Command> {
        frames
            .iter()
            .filter(|p| p.flag == Flag::End)
            .map(|p| Command::decode(&p.payload).unwrap())
            .collect()
    }

    #[test]
    fn read_of_fresh_image_returns_zeros() {
        let cfg = test_cfg(false);
        let out = converse(&cfg, Packet::command(&read_cmd(0, 0, 512)).encode());
        let (frames, _) = split_output(&out);
        let data: Vec<&Packet> =
            frames.iter().filter(|p| p.flag == Flag::Data).collect();
        assert_eq!(data.len(), 4); // ceil(512 / 128)
        assert!(data.iter().all(|p| p.payload.iter().all(|&b| b == 0)));
        let ends = ends(&frames);
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0].modifier as i8, 0);
        assert_eq!(ends[0].sequence, 0x42);
        assert_eq!(ends[0].count, 512);
    }

    #[test]
    fn sequenced_write_then_read() {
        let cfg = test_cfg(false);
        let mut input = Packet::command(&write_cmd(0, 10, 1024)).encode();
        for _ in 0..8 {
            input.extend(Packet::data(&[0xAA; 128]).encode());
        }
        input.extend(Packet::command(&read_cmd(0, 10, 1024)).encode());
        let out = converse(&cfg, input);
        let (frames, control) = split_output(&out);

        // Write: one CONTINUE to solicit data, one after each
        // packet except the last.
        assert_eq!(
            control.iter().filter(|&&b| b == packet::CONTINUE).count(),
            8
        );
        let end_records = ends(&frames);
        assert_eq!(end_records.len(), 2);
        assert!(end_records.iter().all(|e| e.modifier as i8 == 0));
        let data: Vec<&Packet> =
            frames.iter().filter(|p| p.flag == Flag::Data).collect();
        assert_eq!(data.len(), 8);
        assert!(
            data.iter().all(|p| p.payload.iter().all(|&b| b == 0xAA))
        );
        // And the image itself took the bytes.
        let mut img = cfg.bank.image(0);
        assert!(img.changed);
        assert!(img.dirty.get(10) && img.dirty.get(11));
        assert!(img.read_block(10).unwrap().iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn autosize_read_beyond_end_grows() {
        let cfg = test_cfg(true);
        let out = converse(&cfg, Packet::command(&read_cmd(0, 600, 512)).encode());
        let (frames, _) = split_output(&out);
        let ends = ends(&frames);
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0].modifier as i8, 0);
        assert_eq!(cfg.bank.image(0).blocks(), 1024);
    }

    #[test]
    fn fixed_size_read_beyond_end_is_bad_block() {
        let cfg = test_cfg(false);
        let out = converse(&cfg, Packet::command(&read_cmd(0, 600, 512)).encode());
        let (frames, _) = split_output(&out);
        assert!(frames.iter().all(|p| p.flag != Flag::Data));
        let ends = ends(&frames);
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0].modifier as i8, EndStatus::BadBlock as i8);
    }

    #[test]
    fn corrupted_command_answered_with_data_check() {
        let cfg = test_cfg(false);
        let mut input = Packet::command(&write_cmd(0, 0, 512)).encode();
        let last = input.len() - 1;
        input[last] ^= 0x04;
        let out = converse(&cfg, input);
        let (frames, _) = split_output(&out);
        let ends = ends(&frames);
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0].modifier as i8, EndStatus::DataCheck as i8);
        assert!(!cfg.bank.image(0).changed);
    }

    #[test]
    fn every_command_yields_exactly_one_end() {
        let cfg = test_cfg(false);
        let ops = [
            Opcode::Nop as u8,
            Opcode::Init as u8,
            Opcode::Position as u8,
            Opcode::Diagnose as u8,
            Opcode::GetStatus as u8,
            Opcode::SetStatus as u8,
            0x2A, // unknown
        ];
        let mut input = Vec::new();
        for op in ops {
            input.extend(
                Packet::command(&Command {
                    opcode: op,
                    unit: 0,
                    ..Default::default()
                })
                .encode(),
            );
        }
        // Bad unit and closed unit.
        input.extend(
            Packet::command(&read_cmd(9, 0, 0)).encode(),
        );
        input.extend(
            Packet::command(&read_cmd(5, 0, 0)).encode(),
        );
        let out = converse(&cfg, input);
        let (frames, _) = split_output(&out);
        let ends = ends(&frames);
        assert_eq!(ends.len(), ops.len() + 2);
        assert_eq!(
            ends[ops.len() - 1].modifier as i8,
            EndStatus::BadOpcode as i8
        );
        assert_eq!(
            ends[ops.len()].modifier as i8,
            EndStatus::BadUnit as i8
        );
        assert_eq!(
            ends[ops.len() + 1].modifier as i8,
            EndStatus::NoCartridge as i8
        );
    }

    #[test]
    fn init_byte_answered_with_continue() {
        let cfg = test_cfg(false);
        let out = converse(&cfg, vec![packet::INIT]);
        assert_eq!(out, vec![packet::CONTINUE]);
    }

    #[test]
    fn boot_byte_serves_raw_block_zero() {
        let cfg = test_cfg(false);
        cfg.bank.image(0).write_block(0, &[0x5A; BLOCK_SIZE]).unwrap();
        let out = converse(&cfg, vec![packet::BOOT, 0]);
        assert_eq!(out.len(), BLOCK_SIZE);
        assert!(out.iter().all(|&b| b == 0x5A));
    }

    #[test]
    fn mrsp_waits_for_continue_per_byte() {
        let cfg = Config::new(Options {
            nosync: true,
            mrsp: true,
            offlinetimeout: Duration::ZERO,
            ..Options::default()
        });
        *cfg.bank.image(0) = Image::memory(DeviceKind::Tu58, None, false);
        let mut input = Packet::command(&read_cmd(0, 0, 128)).encode();
        // One CONTINUE per transmitted frame byte: one DATA packet
        // (132 bytes) plus the END packet (14 bytes).
        input.extend(std::iter::repeat(packet::CONTINUE).take(132 + 14));
        let out = converse(&cfg, input);
        let (frames, _) = split_output(&out);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].flag, Flag::Data);
        assert_eq!(frames[1].flag, Flag::End);
    }

    #[test]
    fn offline_request_takes_effect_when_idle() {
        let cfg = test_cfg(false);
        let mut line = FakeLine::new(Vec::new());
        let mut sess = Session::new(&mut line, &cfg);
        sess.start().unwrap();
        cfg.offline_request.store(true, Ordering::Relaxed);
        sess.poll_offline();
        assert_eq!(sess.state(), State::Offline);
        assert!(cfg.offline.load(Ordering::Relaxed));

        // Commands are answered with the no-cartridge status.
        sess.line.input.extend(Packet::command(&read_cmd(0, 0, 512)).encode());
        loop {
            match sess.step(Duration::ZERO) {
                Err(Error::Timeout) => break,
                Ok(()) => {}
                Err(e) => panic!("{e:?}"),
            }
        }
        let out = std::mem::take(&mut sess.line.output);
        let (frames, _) = split_output(&out);
        let e = ends(&frames);
        assert_eq!(e.len(), 1);
        assert_eq!(e[0].modifier as i8, EndStatus::NoCartridge as i8);

        // Withdrawing the request restores service.
        cfg.offline_request.store(false, Ordering::Relaxed);
        sess.poll_offline();
        assert_eq!(sess.state(), State::Idle);
        sess.line.input.extend(Packet::command(&read_cmd(0, 0, 128)).encode());
        loop {
            match sess.step(Duration::ZERO) {
                Err(Error::Timeout) => break,
                Ok(()) => {}
                Err(e) => panic!("{e:?}"),
            }
        }
        let (frames, _) = split_output(&sess.line.output);
        assert!(frames.iter().any(|p| p.flag == Flag::Data));
    }

    #[test]
    fn startup_sends_double_init_and_awaits_echo() {
        let cfg = Config::new(Options {
            offlinetimeout: Duration::ZERO,
            ..Options::default()
        });
        let mut line = FakeLine::new(vec![packet::INIT]);
        let mut sess = Session::new(&mut line, &cfg);
        sess.start().unwrap();
        assert_eq!(sess.state(), State::Uninit);
        sess.step(Duration::ZERO).unwrap();
        assert_eq!(sess.state(), State::Idle);
        assert_eq!(
            line.output,
            vec![packet::INIT, packet::INIT, packet::CONTINUE]
        );
    }
}
