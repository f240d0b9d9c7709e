// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! TU58 radial serial protocol wire format.
//!
//! Single control bytes flow outside any frame: `INIT`,
//! `CONTINUE`, `XOFF` and `BOOT`.  Everything else is a framed
//! packet: a flag byte, a length byte, up to 128 payload bytes
//! and a 16-bit little-endian checksum computed as the
//! ones-complement sum, with end-around carry, of every byte
//! before it (flag and length included).
//!
//! Command packets carry a fixed 10-byte record; END packets
//! reuse the record with the drive status in the modifier field.

use crate::result::{Error, Result};
use bitflags::bitflags;
use static_assertions::const_assert_eq;

/// Control bytes sent and recognized outside packet frames.
pub const INIT: u8 = 0x04;
pub const CONTINUE: u8 = 0x10;
pub const XOFF: u8 = 0x13;
pub const BOOT: u8 = 0x08;

/// Largest payload a single framed packet may carry.
pub const MAX_PAYLOAD: usize = 128;

/// Bytes in a command or END record.
pub const COMMAND_BYTES: usize = 10;

/// Packet flag byte.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Flag {
    Data = 0x01,
    Command = 0x02,
    End = 0x80,
}

impl Flag {
    pub fn from_byte(b: u8) -> Option<Flag> {
        match b {
            0x01 => Some(Flag::Data),
            0x02 => Some(Flag::Command),
            0x80 => Some(Flag::End),
            _ => None,
        }
    }
}

/// Command opcodes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum Opcode {
    Nop = 0,
    Init = 1,
    Read = 2,
    Write = 3,
    Position = 5,
    Diagnose = 7,
    GetStatus = 8,
    SetStatus = 9,
    End = 0x40,
}

impl Opcode {
    pub fn from_byte(b: u8) -> Result<Opcode> {
        match b {
            0 => Ok(Opcode::Nop),
            1 => Ok(Opcode::Init),
            2 => Ok(Opcode::Read),
            3 => Ok(Opcode::Write),
            5 => Ok(Opcode::Position),
            7 => Ok(Opcode::Diagnose),
            8 => Ok(Opcode::GetStatus),
            9 => Ok(Opcode::SetStatus),
            0x40 => Ok(Opcode::End),
            _ => Err(Error::BadOpcode),
        }
    }
}

bitflags! {
    /// The switches byte of a command record.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct Switches: u8 {
        /// Maintenance mode: per-byte handshake on transmit.
        const MRSP = 0x08;
        /// Special (absolute record) addressing.
        const SPECIAL_ADDRESS = 0x10;
    }
}

/// Drive status codes carried in the modifier byte of an END
/// record, as the original drive reports them.  The table is
/// kept whole; the emulation has no use for some of the
/// hardware-fault codes.
#[allow(dead_code)]
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(i8)]
pub enum EndStatus {
    Success = 0,
    SuccessWithRetries = 1,
    FailedSelfTest = -1,
    PartialOperation = -2,
    BadUnit = -8,
    NoCartridge = -9,
    WriteProtected = -11,
    DataCheck = -17,
    SeekError = -32,
    MotorStopped = -33,
    BadOpcode = -48,
    BadBlock = -55,
}

impl EndStatus {
    pub fn as_byte(self) -> u8 {
        self as i8 as u8
    }
}

/// The 10-byte record inside COMMAND and END packets.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Command {
    pub opcode: u8,
    pub modifier: u8,
    pub unit: u8,
    pub switches: u8,
    pub sequence: u16,
    pub count: u16,
    pub block: u16,
}

const_assert_eq!(COMMAND_BYTES, 10);

impl Command {
    pub fn encode(&self) -> [u8; COMMAND_BYTES] {
        let mut b = [0u8; COMMAND_BYTES];
        b[0] = self.opcode;
        b[1] = self.modifier;
        b[2] = self.unit;
        b[3] = self.switches;
        b[4..6].copy_from_slice(&self.sequence.to_le_bytes());
        b[6..8].copy_from_slice(&self.count.to_le_bytes());
        b[8..10].copy_from_slice(&self.block.to_le_bytes());
        b
    }

    pub fn decode(b: &[u8]) -> Result<Command> {
        if b.len() != COMMAND_BYTES {
            return Err(Error::BadLength);
        }
        Ok(Command {
            opcode: b[0],
            modifier: b[1],
            unit: b[2],
            switches: b[3],
            sequence: u16::from_le_bytes([b[4], b[5]]),
            count: u16::from_le_bytes([b[6], b[7]]),
            block: u16::from_le_bytes([b[8], b[9]]),
        })
    }

    pub fn switches(&self) -> Switches {
        Switches::from_bits_truncate(self.switches)
    }
}

/// A framed packet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Packet {
    pub flag: Flag,
    pub payload: Vec<u8>,
}

impl Packet {
    pub fn data(payload: &[u8]) -> Packet {
        assert!(payload.len() <= MAX_PAYLOAD);
        Packet { flag: Flag::Data, payload: payload.to_vec() }
    }

    pub fn command(cmd: &Command) -> Packet {
        Packet { flag: Flag::Command, payload: cmd.encode().to_vec() }
    }

    /// An END response for `cmd` with the given status and actual
    /// transfer count.
    pub fn end(cmd: &Command, status: EndStatus, count: u16) -> Packet {
        let record = Command {
            opcode: Opcode::End as u8,
            modifier: status.as_byte(),
            unit: cmd.unit,
            switches: 0,
            sequence: cmd.sequence,
            count,
            block: cmd.block,
        };
        Packet { flag: Flag::End, payload: record.encode().to_vec() }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 4);
        out.push(self.flag as u8);
        out.push(self.payload.len() as u8);
        out.extend_from_slice(&self.payload);
        let ck = checksum(&out);
        out.extend_from_slice(&ck.to_le_bytes());
        out
    }

    /// Decodes one packet from `bytes`, which must contain exactly
    /// one encoded packet.
    pub fn decode(bytes: &[u8]) -> Result<Packet> {
        if bytes.len() < 4 {
            return Err(Error::Truncated);
        }
        let flag = Flag::from_byte(bytes[0]).ok_or(Error::BadFlag)?;
        let len = bytes[1] as usize;
        if len > MAX_PAYLOAD {
            return Err(Error::BadLength);
        }
        if bytes.len() != len + 4 {
            return Err(Error::Truncated);
        }
        let want = checksum(&bytes[..len + 2]);
        let got = u16::from_le_bytes([bytes[len + 2], bytes[len + 3]]);
        if want != got {
            return Err(Error::BadChecksum);
        }
        Ok(Packet { flag, payload: bytes[2..len + 2].to_vec() })
    }
}

/// 16-bit ones-complement sum with end-around carry over
/// little-endian byte pairs; a trailing odd byte is the low half
/// of its word.
pub fn checksum(bytes: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    for pair in bytes.chunks(2) {
        let lo = pair[0] as u32;
        let hi = *pair.get(1).unwrap_or(&0) as u32;
        sum += lo | (hi << 8);
        if sum > 0xFFFF {
            sum = (sum & 0xFFFF) + 1;
        }
    }
    sum as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_simple() {
        // One word per pair, no carries.
        assert_eq!(checksum(&[0x02, 0x0A, 0x01, 0x00]), 0x0A03);
        // Odd tail byte is a low byte.
        assert_eq!(checksum(&[0x02, 0x0A, 0x01]), 0x0A03);
        assert_eq!(checksum(&[]), 0);
    }

    #[test]
    fn checksum_end_around_carry() {
        assert_eq!(checksum(&[0xFF, 0xFF, 0x01, 0x00]), 0x0001);
        assert_eq!(checksum(&[0xFF, 0xFF, 0xFF, 0xFF]), 0xFFFF);
    }

    #[test]
    fn command_record_round_trip() {
        let cmd = Command {
            opcode: Opcode::Read as u8,
            modifier: 0,
            unit: 3,
            switches: Switches::MRSP.bits(),
            sequence: 0x1234,
            count: 1024,
            block: 10,
        };
        let enc = cmd.encode();
        assert_eq!(enc.len(), COMMAND_BYTES);
        assert_eq!(Command::decode(&enc).unwrap(), cmd);
        assert_eq!(Command::decode(&enc[..9]).unwrap_err(), Error::BadLength);
    }

    #[test]
    fn packet_round_trip() {
        let p = Packet::command(&Command {
            opcode: Opcode::Write as u8,
            unit: 1,
            count: 512,
            block: 7,
            ..Default::default()
        });
        assert_eq!(Packet::decode(&p.encode()).unwrap(), p);

        let d = Packet::data(&[0xAA; 128]);
        let enc = d.encode();
        assert_eq!(enc.len(), 128 + 4);
        assert_eq!(Packet::decode(&enc).unwrap(), d);
    }

    #[test]
    fn corrupted_checksum_rejected() {
        let p = Packet::data(&[1, 2, 3, 4]);
        let mut enc = p.encode();
        let last = enc.len() - 1;
        enc[last] ^= 0x01;
        assert_eq!(Packet::decode(&enc).unwrap_err(), Error::BadChecksum);
        // A payload bit-flip is equally fatal.
        let mut enc = p.encode();
        enc[3] ^= 0x40;
        assert_eq!(Packet::decode(&enc).unwrap_err(), Error::BadChecksum);
    }

    #[test]
    fn bad_flag_and_truncation() {
        assert_eq!(Packet::decode(&[0x7E, 0, 0, 0]).unwrap_err(), Error::BadFlag);
        assert_eq!(Packet::decode(&[0x01, 2, 0]).unwrap_err(), Error::Truncated);
    }

    #[test]
    fn end_packet_carries_status() {
        let cmd = Command {
            opcode: Opcode::Read as u8,
            unit: 2,
            sequence: 9,
            block: 4,
            ..Default::default()
        };
        let end = Packet::end(&cmd, EndStatus::DataCheck, 0);
        assert_eq!(end.flag, Flag::End);
        let rec = Command::decode(&end.payload).unwrap();
        assert_eq!(rec.opcode, Opcode::End as u8);
        assert_eq!(rec.modifier as i8, -17);
        assert_eq!(rec.unit, 2);
        assert_eq!(rec.sequence, 9);
    }
}
