// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The XXDP diagnostic-monitor filesystem.
//!
//! On-disk shape (all words little-endian):
//!
//! * Block 0 is the boot block.
//! * Block 1 starts the Master File Directory, a linked list of
//!   blocks whose word 0 is the next-block link.  The first MFD
//!   block carries the interleave and the list of bitmap blocks;
//!   the second carries the User File Directory start block and
//!   the UFD chain length.
//! * Bitmap blocks: word 0 link, word 1 map ordinal, word 2 used
//!   word count, then up to 60 map words, one bit per block,
//!   set = allocated.
//! * UFD blocks: word 0 link, then 28 entries of 9 words each:
//!   filename (2 RADIX-50 words), extension (1), date (1),
//!   reserved (1), start block, length in blocks, last block,
//!   contiguous flag.  A zero filename word ends the directory.
//! * File data is a linked list: word 0 of each block is the next
//!   block (0 ends the file), bytes 2..4 are reserved, bytes
//!   4..512 are payload.
//!
//! The monitor core lives in a fixed region between the bitmap
//! and the file data area and is stored raw, not linked; it and
//! the boot block surface as pseudofiles under reserved names.

use crate::fs::{
    self, DecDate, DecFile, FsKind, PdpFilesystem, get_word, put_word,
};
use crate::image::{BLOCK_SIZE, DeviceKind, Image};
use crate::radix50;
use crate::result::{Error, Result};
use log::debug;
use static_assertions::const_assert;
use std::collections::BTreeSet;

/// Payload bytes per linked file block.
const PAYLOAD: usize = BLOCK_SIZE - 4;

/// Directory entries per UFD block.
const ENTRIES_PER_BLOCK: usize = 28;

/// Words per UFD entry.
const ENTRY_WORDS: usize = 9;

/// Map words per bitmap block.
const BITMAP_WORDS: usize = 60;

/// Blocks covered by one bitmap block.
const BLOCKS_PER_BITMAP_BLOCK: usize = BITMAP_WORDS * 16;

// Link word plus the entry and map areas must fit one block.
const_assert!(2 * (1 + ENTRIES_PER_BLOCK * ENTRY_WORDS) <= BLOCK_SIZE);
const_assert!(2 * (3 + BITMAP_WORDS) <= BLOCK_SIZE);

/// Where the fixed structures of a volume live.  Everything up to
/// `data_start` is reserved whether used or not.
#[derive(Clone, Copy, Debug)]
struct Layout {
    mfd1: usize,
    mfd2: usize,
    ufd_start: usize,
    ufd_blocks: usize,
    bitmap_start: usize,
    bitmap_blocks: usize,
    monitor_start: usize,
    monitor_blocks: usize,
    data_start: usize,
}

impl Layout {
    fn of(device: DeviceKind, blocks: usize) -> Layout {
        let ufd_blocks = match device {
            DeviceKind::Tu58 => 4,
            DeviceKind::Rl02 => 16,
        };
        let bitmap_start = 3 + ufd_blocks;
        let bitmap_blocks = blocks.div_ceil(BLOCKS_PER_BITMAP_BLOCK);
        let monitor_start = bitmap_start + bitmap_blocks;
        let monitor_blocks = 32;
        Layout {
            mfd1: 1,
            mfd2: 2,
            ufd_start: 3,
            ufd_blocks,
            bitmap_start,
            bitmap_blocks,
            monitor_start,
            monitor_blocks,
            data_start: monitor_start + monitor_blocks,
        }
    }
}

#[derive(Debug)]
pub struct XxdpFilesystem {
    device: DeviceKind,
    files: Vec<DecFile>,
    interleave: u16,
}

fn block(data: &[u8], n: usize) -> Result<&[u8]> {
    let off = n.checked_mul(BLOCK_SIZE).ok_or(Error::BlockOutOfRange)?;
    data.get(off..off + BLOCK_SIZE).ok_or(Error::BlockOutOfRange)
}

fn block_mut(data: &mut [u8], n: usize) -> &mut [u8] {
    &mut data[n * BLOCK_SIZE..(n + 1) * BLOCK_SIZE]
}

impl XxdpFilesystem {
    pub fn empty(device: DeviceKind) -> Result<XxdpFilesystem> {
        Ok(XxdpFilesystem { device, files: Vec::new(), interleave: 1 })
    }

    /// Parses the volume on `img`.
    pub fn parse(device: DeviceKind, img: &Image) -> Result<XxdpFilesystem> {
        let data = &img.data;
        let nblocks = img.blocks();
        if nblocks < Layout::of(device, nblocks).data_start {
            return Err(Error::CorruptMfd);
        }
        let lay = Layout::of(device, nblocks);
        let mut fs = XxdpFilesystem::empty(device)?;

        // MFD chain.
        let mfd1 = block(data, lay.mfd1)?;
        let mfd2_no = get_word(mfd1, 0) as usize;
        if mfd2_no == 0 || mfd2_no >= nblocks {
            return Err(Error::CorruptMfd);
        }
        fs.interleave = get_word(mfd1, 1);
        let mut bitmap_list = Vec::new();
        for i in 3.. {
            if 2 * i >= BLOCK_SIZE {
                break;
            }
            let w = get_word(mfd1, i) as usize;
            if w == 0 {
                break;
            }
            if w >= nblocks {
                return Err(Error::CorruptMfd);
            }
            bitmap_list.push(w);
        }
        if bitmap_list.is_empty()
            || get_word(mfd1, 2) as usize != bitmap_list[0]
        {
            return Err(Error::CorruptMfd);
        }
        let mfd2 = block(data, mfd2_no)?;
        let ufd_start = get_word(mfd2, 1) as usize;
        if ufd_start == 0 || ufd_start >= nblocks {
            return Err(Error::CorruptMfd);
        }

        // Bitmap: one bit per block, set = allocated.
        let mut allocated = vec![false; nblocks];
        for (ord, &bno) in bitmap_list.iter().enumerate() {
            let b = block(data, bno)?;
            let used = (get_word(b, 2) as usize).min(BITMAP_WORDS);
            for w in 0..used {
                let map = get_word(b, 3 + w);
                for bit in 0..16 {
                    let blockno =
                        ord * BLOCKS_PER_BITMAP_BLOCK + w * 16 + bit;
                    if blockno < nblocks && map & (1 << bit) != 0 {
                        allocated[blockno] = true;
                    }
                }
            }
        }

        // Boot block pseudofile.
        let boot = block(data, 0)?;
        if boot.iter().any(|&b| b != 0) {
            let mut f =
                DecFile::new(fs::BOOT_NAME.0, fs::BOOT_NAME.1, boot.to_vec())?;
            f.blocks = vec![0];
            f.contiguous = true;
            fs.files.push(f);
        }

        // Monitor pseudofile: the raw region right after the last
        // bitmap block, trailing zero blocks trimmed.  The image
        // may have grown since it was rendered, so the region
        // comes from the MFD, not from the current size.
        let monitor_start = bitmap_list.iter().max().unwrap() + 1;
        let mon_end = (monitor_start + lay.monitor_blocks).min(nblocks);
        let mut mon = data
            [monitor_start.min(mon_end) * BLOCK_SIZE..mon_end * BLOCK_SIZE]
            .to_vec();
        while mon.len() >= BLOCK_SIZE
            && mon[mon.len() - BLOCK_SIZE..].iter().all(|&b| b == 0)
        {
            mon.truncate(mon.len() - BLOCK_SIZE);
        }
        if !mon.is_empty() {
            let nmon = mon.len() / BLOCK_SIZE;
            let mut f = DecFile::new(
                fs::MONITOR_NAME.0,
                fs::MONITOR_NAME.1,
                mon,
            )?;
            f.blocks = (monitor_start..monitor_start + nmon).collect();
            f.contiguous = true;
            fs.files.push(f);
        }

        // UFD chain.
        let mut used = BTreeSet::new();
        let mut seen_ufd = BTreeSet::new();
        let mut ufd_no = ufd_start;
        'dir: while ufd_no != 0 {
            if ufd_no >= nblocks || !seen_ufd.insert(ufd_no) {
                return Err(Error::CorruptUfd);
            }
            let ufd = block(data, ufd_no)?;
            for e in 0..ENTRIES_PER_BLOCK {
                let w = 1 + e * ENTRY_WORDS;
                let name_words =
                    [get_word(ufd, w), get_word(ufd, w + 1)];
                if name_words[0] == 0 {
                    break 'dir;
                }
                let name = radix50::decode(&name_words);
                let ext = radix50::decode(&[get_word(ufd, w + 2)]);
                let date = DecDate::from_xxdp(get_word(ufd, w + 3));
                let start = get_word(ufd, w + 5) as usize;
                let count = get_word(ufd, w + 6) as usize;
                let mut file = DecFile::new(&name, &ext, Vec::new())?;
                file.date = date;
                let mut chain = BTreeSet::new();
                let mut bno = start;
                while bno != 0 {
                    if bno >= nblocks {
                        return Err(Error::BlockOutOfRange);
                    }
                    if !chain.insert(bno) {
                        return Err(Error::CycleInFile);
                    }
                    if !allocated[bno] || !used.insert(bno) {
                        return Err(Error::BitmapMismatch);
                    }
                    let b = block(data, bno)?;
                    file.data.extend_from_slice(&b[4..]);
                    file.blocks.push(bno);
                    bno = get_word(b, 0) as usize;
                }
                if count != 0 && file.blocks.len() != count {
                    debug!(
                        "xxdp: {} chain {} blocks, directory says {}",
                        file.filename(),
                        file.blocks.len(),
                        count
                    );
                }
                file.contiguous = file
                    .blocks
                    .windows(2)
                    .all(|w| w[1] == w[0] + 1);
                fs.files.push(file);
            }
            ufd_no = get_word(ufd, 0) as usize;
        }
        Ok(fs)
    }

    fn blocks_for(file: &DecFile) -> usize {
        file.data.len().div_ceil(PAYLOAD).max(1)
    }
}

impl PdpFilesystem for XxdpFilesystem {
    fn kind(&self) -> FsKind {
        FsKind::Xxdp
    }

    fn device(&self) -> DeviceKind {
        self.device
    }

    fn files(&self) -> &[DecFile] {
        &self.files
    }

    fn add_file(&mut self, file: DecFile) -> Result<()> {
        if self
            .files
            .iter()
            .any(|f| f.name == file.name && f.ext == file.ext)
        {
            return Err(Error::NameCollision);
        }
        self.files.push(file);
        Ok(())
    }

    fn render(&mut self, img: &mut Image) -> Result<()> {
        if img.device != self.device {
            return Err(Error::InvalidDevice);
        }
        let regular: Vec<usize> = self
            .files
            .iter()
            .enumerate()
            .filter(|(_, f)| !f.is_pseudo())
            .map(|(i, _)| i)
            .collect();
        let file_blocks: usize = regular
            .iter()
            .map(|&i| Self::blocks_for(&self.files[i]))
            .sum();

        // Size the volume: reserved area, any UFD extension, then
        // the file data, growing the image when it may.
        let mut nblocks = img.blocks().max(1);
        let (lay, extra_ufd) = loop {
            let lay = Layout::of(self.device, nblocks);
            let capacity = lay.ufd_blocks * ENTRIES_PER_BLOCK;
            let extra_ufd = regular
                .len()
                .saturating_sub(capacity)
                .div_ceil(ENTRIES_PER_BLOCK);
            let needed = lay.data_start + extra_ufd + file_blocks;
            if needed <= nblocks {
                break (lay, extra_ufd);
            }
            let max = self.device.max_blocks(img.autosizing);
            if nblocks >= max {
                return Err(Error::NoSpace);
            }
            nblocks = (needed.div_ceil(512) * 512).min(max);
        };
        img.grow_to(nblocks)?;
        let nblocks = img.blocks();
        debug_assert_eq!(
            lay.data_start,
            Layout::of(self.device, nblocks).data_start
        );

        img.data.fill(0);
        let data = &mut img.data;
        let mut allocated = vec![false; nblocks];
        for b in 0..lay.data_start {
            allocated[b] = true;
        }

        // UFD chain: the fixed region plus any extension blocks
        // placed at the start of the data area.
        let mut ufd_chain: Vec<usize> =
            (lay.ufd_start..lay.ufd_start + lay.ufd_blocks).collect();
        ufd_chain.extend(lay.data_start..lay.data_start + extra_ufd);
        for &b in &ufd_chain[lay.ufd_blocks..] {
            allocated[b] = true;
        }
        let mut cursor = lay.data_start + extra_ufd;

        // Boot and monitor pseudofiles.
        for i in 0..self.files.len() {
            let f = &mut self.files[i];
            if f.is_boot() {
                if f.data.len() > BLOCK_SIZE {
                    return Err(Error::NoSpace);
                }
                block_mut(data, 0)[..f.data.len()].copy_from_slice(&f.data);
                f.blocks = vec![0];
                f.contiguous = true;
            } else if f.is_monitor() {
                if f.data.len() > lay.monitor_blocks * BLOCK_SIZE {
                    return Err(Error::NoSpace);
                }
                let off = lay.monitor_start * BLOCK_SIZE;
                data[off..off + f.data.len()].copy_from_slice(&f.data);
                let nmon = f.data.len().div_ceil(BLOCK_SIZE);
                f.blocks =
                    (lay.monitor_start..lay.monitor_start + nmon).collect();
                f.contiguous = true;
            }
        }

        // File data, first-fit ascending in directory order.
        for &i in &regular {
            let need = Self::blocks_for(&self.files[i]);
            let list: Vec<usize> = (cursor..cursor + need).collect();
            cursor += need;
            let f = &mut self.files[i];
            for (j, &bno) in list.iter().enumerate() {
                debug_assert!(bno < nblocks);
                let b = block_mut(data, bno);
                let next =
                    if j + 1 < list.len() { list[j + 1] as u16 } else { 0 };
                put_word(b, 0, next);
                let off = j * PAYLOAD;
                let end = (off + PAYLOAD).min(f.data.len());
                if off < end {
                    b[4..4 + end - off].copy_from_slice(&f.data[off..end]);
                }
                allocated[bno] = true;
            }
            f.blocks = list;
            f.contiguous = true;
        }

        // UFD entries.
        {
            let mut entries: Vec<&DecFile> = self
                .files
                .iter()
                .filter(|f| !f.is_pseudo())
                .collect();
            let mut it = entries.drain(..);
            let mut done = false;
            for (c, &ufd_no) in ufd_chain.iter().enumerate() {
                let next = if c + 1 < ufd_chain.len() {
                    ufd_chain[c + 1] as u16
                } else {
                    0
                };
                let b = block_mut(data, ufd_no);
                put_word(b, 0, next);
                for e in 0..ENTRIES_PER_BLOCK {
                    if done {
                        break;
                    }
                    let Some(f) = it.next() else {
                        done = true;
                        break;
                    };
                    let w = 1 + e * ENTRY_WORDS;
                    let name: [u16; 2] = radix50::encode(&f.name)?;
                    let ext: [u16; 1] = radix50::encode(&f.ext)?;
                    put_word(b, w, name[0]);
                    put_word(b, w + 1, name[1]);
                    put_word(b, w + 2, ext[0]);
                    put_word(
                        b,
                        w + 3,
                        f.date.map(DecDate::to_xxdp).unwrap_or(0),
                    );
                    put_word(b, w + 4, 0);
                    put_word(b, w + 5, f.blocks[0] as u16);
                    put_word(b, w + 6, f.blocks.len() as u16);
                    put_word(b, w + 7, *f.blocks.last().unwrap() as u16);
                    put_word(b, w + 8, u16::from(f.contiguous));
                }
            }
        }

        // MFD chain.
        {
            let b = block_mut(data, lay.mfd1);
            put_word(b, 0, lay.mfd2 as u16);
            put_word(b, 1, self.interleave);
            put_word(b, 2, lay.bitmap_start as u16);
            for i in 0..lay.bitmap_blocks {
                put_word(b, 3 + i, (lay.bitmap_start + i) as u16);
            }
            let b = block_mut(data, lay.mfd2);
            put_word(b, 0, 0);
            put_word(b, 1, lay.ufd_start as u16);
            put_word(b, 2, ufd_chain.len() as u16);
        }

        // Bitmap.
        for ord in 0..lay.bitmap_blocks {
            let bno = lay.bitmap_start + ord;
            let next =
                if ord + 1 < lay.bitmap_blocks { bno + 1 } else { 0 };
            let covered = nblocks
                .saturating_sub(ord * BLOCKS_PER_BITMAP_BLOCK)
                .min(BLOCKS_PER_BITMAP_BLOCK);
            let used_words = covered.div_ceil(16);
            let b = block_mut(data, bno);
            put_word(b, 0, next as u16);
            put_word(b, 1, (ord + 1) as u16);
            put_word(b, 2, used_words as u16);
            for w in 0..used_words {
                let mut map = 0u16;
                for bit in 0..16 {
                    let blockno = ord * BLOCKS_PER_BITMAP_BLOCK + w * 16 + bit;
                    if blockno < nblocks && allocated[blockno] {
                        map |= 1 << bit;
                    }
                }
                put_word(b, 3 + w, map);
            }
        }
        debug!(
            "xxdp render: {} files, {} blocks, data area {}..{}",
            regular.len(),
            nblocks,
            lay.data_start,
            cursor
        );
        Ok(())
    }
}
