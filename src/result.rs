// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;
use std::io;

/// Various errors
#[derive(Clone, Copy, Eq, PartialEq)]
pub enum Error {
    NotFound,
    UnsupportedSize,
    FilesystemRequired,
    InvalidDevice,
    OutOfRange,
    ImageReadOnly,
    ImageClosed,
    CorruptMfd,
    CorruptUfd,
    CycleInFile,
    BlockOutOfRange,
    BitmapMismatch,
    CorruptHome,
    InvalidSegmentChain,
    OverlappingFiles,
    NoSpace,
    NameCollision,
    NameUnrepresentable,
    HostDirMissing,
    HostDirEmpty,
    NotADirectory,
    BadFlag,
    BadLength,
    BadChecksum,
    BadOpcode,
    Truncated,
    Timeout,
    Interrupted,
    LineClosed,
    UnsupportedOperation,
    Utf8,
    NumRange,
    BadArgs,
    Io(io::ErrorKind),
}

impl Error {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "Image file or directory not found",
            Self::UnsupportedSize => "Image size not supported by device",
            Self::FilesystemRequired => {
                "Shared device requires a filesystem selection"
            }
            Self::InvalidDevice => "Device geometry does not match filesystem",
            Self::OutOfRange => "Block number beyond end of image",
            Self::ImageReadOnly => "Image is read-only",
            Self::ImageClosed => "Image is not open",
            Self::CorruptMfd => "XXDP: corrupt master file directory",
            Self::CorruptUfd => "XXDP: corrupt user file directory",
            Self::CycleInFile => "XXDP: cycle in file block chain",
            Self::BlockOutOfRange => "Filesystem references block beyond image",
            Self::BitmapMismatch => "XXDP: file blocks not covered by bitmap",
            Self::CorruptHome => "RT-11: corrupt home block",
            Self::InvalidSegmentChain => {
                "RT-11: invalid directory segment chain"
            }
            Self::OverlappingFiles => "RT-11: overlapping file extents",
            Self::NoSpace => "Filesystem does not fit on image",
            Self::NameCollision => {
                "Host filenames collide after RADIX-50 mapping"
            }
            Self::NameUnrepresentable => {
                "Host filename not representable in RADIX-50"
            }
            Self::HostDirMissing => "Host directory does not exist",
            Self::HostDirEmpty => "Host directory contains no usable files",
            Self::NotADirectory => "Host path is not a directory",
            Self::BadFlag => "Unknown packet flag byte",
            Self::BadLength => "Packet length out of range",
            Self::BadChecksum => "Packet checksum mismatch",
            Self::BadOpcode => "Unknown command opcode",
            Self::Truncated => "Packet truncated",
            Self::Timeout => "Timeout",
            Self::Interrupted => "Transfer aborted by INIT",
            Self::LineClosed => "Serial line closed",
            Self::UnsupportedOperation => "Operation not supported",
            Self::Utf8 => "UTF-8 conversion error",
            Self::NumRange => "Parsed number out of range",
            Self::BadArgs => "Bad command arguments",
            Self::Io(_) => "I/O error",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(kind) => write!(f, "I/O error: {kind}"),
            _ => write!(f, "{}", self.as_str()),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Error {
        Error::Io(e.kind())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
