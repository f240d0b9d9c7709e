// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Block images backing the emulated drives.
//!
//! An image is a flat byte buffer addressed in 512-byte blocks.
//! It is either loaded from (and saved to) a single host file, or
//! "shared": materialized from a host directory through one of
//! the PDP filesystem codecs, with changes flowing back out to
//! the directory.  Writes mark blocks in a dirty bitmap; the
//! drive monitor uses that and a write timestamp to decide when
//! to sync.

use crate::fs::{self, FsKind};
use crate::hostdir::HostDir;
use crate::result::{Error, Result};
use bit_field::BitField;
use log::{debug, info};
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Bytes per block, fixed by the TU58.
pub const BLOCK_SIZE: usize = 512;

/// Autosized images may grow to 32 MiB.
pub const AUTOSIZE_MAX_BLOCKS: usize = 65_536;

/// Autosize growth granularity, in blocks.
const AUTOSIZE_CHUNK: usize = 512;

/// Device geometries the filesystem codecs understand.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceKind {
    Tu58,
    Rl02,
}

/// Physical shape of a device.  Only the block total matters for
/// the emulation; the split is kept because the filesystem layout
/// tables are per-device.
#[derive(Clone, Copy, Debug)]
pub struct Geometry {
    pub surfaces: usize,
    pub blocks_per_surface: usize,
}

impl DeviceKind {
    pub fn geometry(self) -> Geometry {
        match self {
            // One spiral track of 512 records.
            Self::Tu58 => Geometry { surfaces: 1, blocks_per_surface: 512 },
            Self::Rl02 => Geometry { surfaces: 2, blocks_per_surface: 10_240 },
        }
    }

    /// Standard (unextended) image size in blocks.
    pub fn std_blocks(self) -> usize {
        let g = self.geometry();
        g.surfaces * g.blocks_per_surface
    }

    pub fn max_blocks(self, autosizing: bool) -> usize {
        if autosizing { AUTOSIZE_MAX_BLOCKS } else { self.std_blocks() }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Tu58 => "TU58",
            Self::Rl02 => "RL02",
        }
    }
}

/// One dirty bit per block.
pub struct DirtyMap {
    words: Vec<u64>,
    len: usize,
}

impl DirtyMap {
    pub fn new(len: usize) -> DirtyMap {
        DirtyMap { words: vec![0; len.div_ceil(64)], len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn resize(&mut self, len: usize) {
        self.words.resize(len.div_ceil(64), 0);
        if len < self.len {
            // Drop bits beyond the new end.
            for i in len..self.len.min(self.words.len() * 64) {
                self.clear(i);
            }
        }
        self.len = len;
    }

    pub fn set(&mut self, block: usize) {
        assert!(block < self.len);
        self.words[block / 64].set_bit(block % 64, true);
    }

    pub fn clear(&mut self, block: usize) {
        if block < self.len {
            self.words[block / 64].set_bit(block % 64, false);
        }
    }

    pub fn get(&self, block: usize) -> bool {
        block < self.len && self.words[block / 64].get_bit(block % 64)
    }

    pub fn clear_all(&mut self) {
        self.words.fill(0);
    }

    pub fn any(&self) -> bool {
        self.words.iter().any(|&w| w != 0)
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// A mounted (or mountable) drive image.
pub struct Image {
    pub unit: usize,
    pub open: bool,
    pub shared: bool,
    pub readonly: bool,
    pub changed: bool,
    pub autosizing: bool,
    pub device: DeviceKind,
    pub fs_kind: Option<FsKind>,
    pub host_fpath: PathBuf,
    pub data: Vec<u8>,
    pub dirty: DirtyMap,
    /// Instant of the last PDP-side write, for sync-after-idle.
    pub last_write: Option<Instant>,
    /// Present on shared images only.
    pub mirror: Option<HostDir>,
}

impl Image {
    /// An unopened slot for the drive bank.
    pub fn unopened(unit: usize) -> Image {
        Image {
            unit,
            open: false,
            shared: false,
            readonly: false,
            changed: false,
            autosizing: false,
            device: DeviceKind::Tu58,
            fs_kind: None,
            host_fpath: PathBuf::new(),
            data: Vec::new(),
            dirty: DirtyMap::new(0),
            last_write: None,
            mirror: None,
        }
    }

    pub fn blocks(&self) -> usize {
        self.data.len() / BLOCK_SIZE
    }

    /// An anonymous in-memory image at standard size, used by the
    /// one-shot pack path and by tests.
    pub fn memory(
        device: DeviceKind,
        fs_kind: Option<FsKind>,
        autosizing: bool,
    ) -> Image {
        let mut img = Image::unopened(0);
        img.device = device;
        img.fs_kind = fs_kind;
        img.autosizing = autosizing;
        img.data = vec![0; device.std_blocks() * BLOCK_SIZE];
        img.dirty = DirtyMap::new(device.std_blocks());
        img.open = true;
        img
    }

    /// Opens an image into this slot.
    ///
    /// File-backed: `path` is a flat image file, loaded whole (or
    /// created zero-filled / freshly formatted when `allow_create`
    /// is set and a filesystem is selected).  Shared: `path` is a
    /// host directory whose files are rendered into the buffer
    /// through the selected codec.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        &mut self,
        unit: usize,
        shared: bool,
        readonly: bool,
        allow_create: bool,
        path: &Path,
        device: DeviceKind,
        fs_kind: Option<FsKind>,
        autosizing: bool,
    ) -> Result<()> {
        if shared && fs_kind.is_none() {
            return Err(Error::FilesystemRequired);
        }
        self.unit = unit;
        self.shared = shared;
        self.readonly = readonly;
        self.autosizing = autosizing;
        self.device = device;
        self.fs_kind = fs_kind;
        self.host_fpath = path.to_path_buf();
        self.changed = false;
        self.last_write = None;
        self.mirror = None;

        if shared {
            self.open_shared(allow_create)?;
        } else {
            self.open_file(allow_create)?;
        }
        self.dirty = DirtyMap::new(self.blocks());
        self.changed = false;
        self.last_write = None;
        self.open = true;
        Ok(())
    }

    fn open_file(&mut self, allow_create: bool) -> Result<()> {
        match File::open(&self.host_fpath) {
            Ok(mut f) => {
                let len = f.metadata()?.len() as usize;
                if len % BLOCK_SIZE != 0
                    || len > self.device.max_blocks(self.autosizing) * BLOCK_SIZE
                {
                    return Err(Error::UnsupportedSize);
                }
                self.data = vec![0; len];
                f.read_exact(&mut self.data)?;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if !allow_create {
                    return Err(Error::NotFound);
                }
                self.data = vec![0; self.device.std_blocks() * BLOCK_SIZE];
                self.dirty = DirtyMap::new(self.blocks());
                if let Some(kind) = self.fs_kind {
                    let mut fs = fs::empty(kind, self.device)?;
                    fs.render(self)?;
                }
                self.changed = false;
                self.last_write = None;
                self.write_file()?;
                info!(
                    "created image file \"{}\" ({} blocks)",
                    self.host_fpath.display(),
                    self.blocks()
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn open_shared(&mut self, allow_create: bool) -> Result<()> {
        let kind = self.fs_kind.ok_or(Error::FilesystemRequired)?;
        self.data = vec![0; self.device.std_blocks() * BLOCK_SIZE];
        self.dirty = DirtyMap::new(self.blocks());
        let mut mirror = HostDir::new(&self.host_fpath);
        mirror.prepare(allow_create, true, None)?;
        let mut fs = fs::empty(kind, self.device)?;
        mirror.to_pdp_fs(fs.as_mut())?;
        fs.render(self)?;
        mirror.snapshot()?;
        // The render is the baseline, not a PDP change.
        self.changed = false;
        self.dirty.clear_all();
        self.mirror = Some(mirror);
        Ok(())
    }

    /// Reads one block.  Autosizing images grow (zero-filled) on
    /// reads beyond the end.
    pub fn read_block(&mut self, block: usize) -> Result<&[u8]> {
        self.reach(block)?;
        let off = block * BLOCK_SIZE;
        Ok(&self.data[off..off + BLOCK_SIZE])
    }

    /// Writes one block and marks it dirty.  `bytes` shorter than
    /// a block leaves the tail as it was.
    pub fn write_block(&mut self, block: usize, bytes: &[u8]) -> Result<()> {
        if self.readonly {
            return Err(Error::ImageReadOnly);
        }
        assert!(bytes.len() <= BLOCK_SIZE);
        self.reach(block)?;
        let off = block * BLOCK_SIZE;
        self.data[off..off + bytes.len()].copy_from_slice(bytes);
        self.dirty.set(block);
        self.changed = true;
        self.last_write = Some(Instant::now());
        Ok(())
    }

    /// Ensures `block` is inside the image, growing if allowed.
    fn reach(&mut self, block: usize) -> Result<()> {
        if block < self.blocks() {
            return Ok(());
        }
        if !self.autosizing || block >= AUTOSIZE_MAX_BLOCKS {
            return Err(Error::OutOfRange);
        }
        let new_blocks =
            (block + 1).div_ceil(AUTOSIZE_CHUNK) * AUTOSIZE_CHUNK;
        let new_blocks = new_blocks.min(AUTOSIZE_MAX_BLOCKS);
        debug!(
            "unit {}: autosize {} -> {} blocks",
            self.unit,
            self.blocks(),
            new_blocks
        );
        self.data.resize(new_blocks * BLOCK_SIZE, 0);
        self.dirty.resize(new_blocks);
        Ok(())
    }

    /// Grows to at least `blocks` blocks, subject to the autosize
    /// rules.  Used by the codecs while rendering.
    pub fn grow_to(&mut self, blocks: usize) -> Result<()> {
        if blocks > 0 {
            self.reach(blocks - 1)?;
        }
        Ok(())
    }

    /// Writes the image back: file-backed images are written to
    /// their file atomically; shared images are parsed and the
    /// logical files reconciled out to the host directory.
    pub fn save(&mut self) -> Result<()> {
        if !self.open {
            return Err(Error::ImageClosed);
        }
        if self.readonly {
            return Ok(());
        }
        if self.shared {
            self.sync_out()?;
        } else {
            self.write_file()?;
        }
        self.changed = false;
        self.dirty.clear_all();
        self.last_write = None;
        Ok(())
    }

    fn write_file(&self) -> Result<()> {
        // Write-new then rename, so a crash never leaves a
        // truncated image.
        let mut tmp = self.host_fpath.clone().into_os_string();
        tmp.push(".new");
        let tmp = PathBuf::from(tmp);
        let mut f = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        f.write_all(&self.data)?;
        f.sync_all()?;
        drop(f);
        std::fs::rename(&tmp, &self.host_fpath)?;
        Ok(())
    }

    /// Extracts the current image contents out to the host
    /// directory (shared images).
    fn sync_out(&mut self) -> Result<()> {
        let kind = self.fs_kind.ok_or(Error::FilesystemRequired)?;
        let fs = fs::parse(kind, self.device, self)?;
        let mut mirror = self.mirror.take().ok_or(Error::ImageClosed)?;
        let res = mirror.from_pdp_fs(fs.as_ref());
        self.mirror = Some(mirror);
        res
    }

    /// Rebuilds the image from the host directory (shared images).
    /// Any unsynced PDP-side writes are discarded in favor of the
    /// host's view.
    pub fn sync_in(&mut self) -> Result<()> {
        let kind = self.fs_kind.ok_or(Error::FilesystemRequired)?;
        let mut mirror = self.mirror.take().ok_or(Error::ImageClosed)?;
        let res = (|| {
            let mut fs = fs::empty(kind, self.device)?;
            mirror.to_pdp_fs(fs.as_mut())?;
            self.data.fill(0);
            fs.render(self)?;
            mirror.snapshot()
        })();
        self.mirror = Some(mirror);
        if res.is_ok() {
            self.changed = false;
            self.dirty.clear_all();
            self.last_write = None;
        }
        res
    }

    /// Tells whether the host directory behind a shared image has
    /// drifted from the last reconciliation.
    pub fn host_drifted(&self) -> bool {
        match &self.mirror {
            Some(m) => m.changed_since_snapshot().unwrap_or(false),
            None => false,
        }
    }

    /// Saves (if changed) and releases the buffer.
    pub fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        let res = if self.changed { self.save() } else { Ok(()) };
        self.open = false;
        self.data = Vec::new();
        self.dirty = DirtyMap::new(0);
        self.mirror = None;
        res
    }

    /// One `info:` line describing the mount, printed at startup.
    pub fn describe(&self) -> String {
        format!(
            "unit {}: {} {} \"{}\", {} blocks{}{}{}{}",
            self.unit,
            self.device.as_str(),
            if self.shared { "shared dir" } else { "file" },
            self.host_fpath.display(),
            self.blocks(),
            if self.readonly { ", readonly" } else { "" },
            if self.autosizing { ", autosizing" } else { "" },
            match self.fs_kind {
                Some(k) => match k {
                    FsKind::Xxdp => ", XXDP",
                    FsKind::Rt11 => ", RT-11",
                },
                None => "",
            },
            if self.open { "" } else { ", not open" },
        )
    }
}
