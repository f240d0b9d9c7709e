// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The RT-11 filesystem.
//!
//! Files occupy contiguous block runs; the directory alone
//! describes the layout.  Block 1 is the home block: pack cluster
//! size at 0722(8), first directory segment block at 0724(8),
//! system version at 0726(8), then the volume ID, owner and
//! system ID strings, with an additive checksum in the last word.
//!
//! The directory is a chain of 2-block segments starting (by
//! convention) at block 6.  Each segment holds a 5-word header
//! (total segments, next segment number, highest segment in use,
//! extra bytes per entry, data start block) and 7-word entries:
//! status, 3 RADIX-50 name words, length, job/channel, date.
//! Entry runs map to consecutive block runs starting at the
//! segment's data start; an end-of-segment status bit closes each
//! segment.

use crate::fs::{
    self, DecDate, DecFile, FsKind, PdpFilesystem, get_word, put_word,
};
use crate::image::{BLOCK_SIZE, DeviceKind, Image};
use crate::radix50;
use crate::result::{Error, Result};
use bitflags::bitflags;
use log::debug;
use std::collections::BTreeSet;

/// First directory segment block.
const FIRST_SEGMENT: usize = 6;

/// Blocks per directory segment.
const SEGMENT_BLOCKS: usize = 2;

/// Header words per segment.
const HEADER_WORDS: usize = 5;

/// Words per directory entry (with no extra bytes).
const ENTRY_WORDS: usize = 7;

/// Directory entries fitting one segment, less the end marker.
const ENTRIES_PER_SEGMENT: usize =
    (SEGMENT_BLOCKS * BLOCK_SIZE / 2 - HEADER_WORDS) / ENTRY_WORDS - 1;

/// The chain is limited to 31 segments by the 5-bit segment
/// number fields of the original.
const MAX_SEGMENTS: usize = 31;

/// Home block word offsets (byte offsets 0722..0776 octal).
const HOME_CLUSTER: usize = 0o722 / 2;
const HOME_FIRST_SEGMENT: usize = 0o724 / 2;
const HOME_VERSION: usize = 0o726 / 2;
const HOME_VOLUME_ID: usize = 0o730;
const HOME_OWNER: usize = 0o744;
const HOME_SYSTEM_ID: usize = 0o760;
const HOME_CHECKSUM: usize = 0o776 / 2;

bitflags! {
    /// Directory entry status word.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct EntryStatus: u16 {
        const TENTATIVE = 0o400;
        const EMPTY = 0o1000;
        const PERMANENT = 0o2000;
        const END_OF_SEGMENT = 0o4000;
        const PROTECTED = 0o100000;
    }
}

#[derive(Debug)]
pub struct Rt11Filesystem {
    device: DeviceKind,
    files: Vec<DecFile>,
    cluster: u16,
    version: u16,
    volume_id: [u8; 12],
    owner: [u8; 12],
    system_id: [u8; 12],
}

fn str12(s: &[u8]) -> [u8; 12] {
    let mut out = [b' '; 12];
    out[..s.len().min(12)].copy_from_slice(&s[..s.len().min(12)]);
    out
}

fn home_checksum(home: &[u8]) -> u16 {
    let mut sum = 0u16;
    for i in 0..HOME_CHECKSUM {
        sum = sum.wrapping_add(get_word(home, i));
    }
    sum
}

impl Rt11Filesystem {
    pub fn empty(device: DeviceKind) -> Result<Rt11Filesystem> {
        Ok(Rt11Filesystem {
            device,
            files: Vec::new(),
            cluster: 1,
            version: radix50::encode_triplet(b"V3A")?,
            volume_id: str12(b"RT11A"),
            owner: str12(b""),
            system_id: str12(b"DECRT11A"),
        })
    }

    pub fn parse(device: DeviceKind, img: &Image) -> Result<Rt11Filesystem> {
        let data = &img.data;
        let nblocks = img.blocks();
        if nblocks <= FIRST_SEGMENT + SEGMENT_BLOCKS {
            return Err(Error::CorruptHome);
        }
        let home = &data[BLOCK_SIZE..2 * BLOCK_SIZE];
        let stored = get_word(home, HOME_CHECKSUM);
        if stored != 0 && stored != home_checksum(home) {
            return Err(Error::CorruptHome);
        }
        let first_seg = get_word(home, HOME_FIRST_SEGMENT) as usize;
        if first_seg < 2 || first_seg + SEGMENT_BLOCKS > nblocks {
            return Err(Error::CorruptHome);
        }
        let mut fs = Rt11Filesystem::empty(device)?;
        fs.cluster = get_word(home, HOME_CLUSTER);
        fs.version = get_word(home, HOME_VERSION);
        fs.volume_id = str12(&home[HOME_VOLUME_ID..HOME_VOLUME_ID + 12]);
        fs.owner = str12(&home[HOME_OWNER..HOME_OWNER + 12]);
        fs.system_id = str12(&home[HOME_SYSTEM_ID..HOME_SYSTEM_ID + 12]);

        // Boot block pseudofile.
        let boot = &data[..BLOCK_SIZE];
        if boot.iter().any(|&b| b != 0) {
            let mut f =
                DecFile::new(fs::BOOT_NAME.0, fs::BOOT_NAME.1, boot.to_vec())?;
            f.blocks = vec![0];
            f.contiguous = true;
            fs.files.push(f);
        }

        // Directory segment chain.
        let mut used: BTreeSet<usize> = BTreeSet::new();
        let mut seen = BTreeSet::new();
        let mut segno = 1usize;
        loop {
            if !seen.insert(segno) || seen.len() > MAX_SEGMENTS {
                return Err(Error::InvalidSegmentChain);
            }
            let sblock = first_seg + SEGMENT_BLOCKS * (segno - 1);
            if sblock + SEGMENT_BLOCKS > nblocks {
                return Err(Error::InvalidSegmentChain);
            }
            let seg = &data
                [sblock * BLOCK_SIZE..(sblock + SEGMENT_BLOCKS) * BLOCK_SIZE];
            let total = get_word(seg, 0) as usize;
            let next = get_word(seg, 1) as usize;
            let extra = get_word(seg, 3) as usize;
            let mut cursor = get_word(seg, 4) as usize;
            if total == 0 || total > MAX_SEGMENTS {
                return Err(Error::InvalidSegmentChain);
            }
            let entry_words = ENTRY_WORDS + extra.div_ceil(2);
            let mut w = HEADER_WORDS;
            loop {
                if w + entry_words > SEGMENT_BLOCKS * BLOCK_SIZE / 2 {
                    break;
                }
                let status =
                    EntryStatus::from_bits_truncate(get_word(seg, w));
                if status.contains(EntryStatus::END_OF_SEGMENT) {
                    break;
                }
                let length = get_word(seg, w + 4) as usize;
                if status.contains(EntryStatus::PERMANENT) {
                    let name = radix50::decode(&[
                        get_word(seg, w + 1),
                        get_word(seg, w + 2),
                    ]);
                    let ext = radix50::decode(&[get_word(seg, w + 3)]);
                    if cursor + length > nblocks {
                        return Err(Error::BlockOutOfRange);
                    }
                    let mut f = DecFile::new(
                        &name,
                        &ext,
                        data[cursor * BLOCK_SIZE
                            ..(cursor + length) * BLOCK_SIZE]
                            .to_vec(),
                    )?;
                    f.date = DecDate::from_rt11(get_word(seg, w + 6));
                    f.blocks = (cursor..cursor + length).collect();
                    f.contiguous = true;
                    for b in cursor..cursor + length {
                        if !used.insert(b) {
                            return Err(Error::OverlappingFiles);
                        }
                    }
                    fs.files.push(f);
                }
                cursor += length;
                w += entry_words;
            }
            if next == 0 {
                break;
            }
            if next > total {
                return Err(Error::InvalidSegmentChain);
            }
            segno = next;
        }
        Ok(fs)
    }

    fn blocks_for(file: &DecFile) -> usize {
        file.data.len().div_ceil(BLOCK_SIZE)
    }
}

impl PdpFilesystem for Rt11Filesystem {
    fn kind(&self) -> FsKind {
        FsKind::Rt11
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
        // Directory order is sorted; contiguous allocation then
        // degenerates to first-fit ascending.
        let mut order: Vec<usize> = self
            .files
            .iter()
            .enumerate()
            .filter(|(_, f)| !f.is_boot())
            .map(|(i, _)| i)
            .collect();
        order.sort_by(|&a, &b| {
            (&self.files[a].name, &self.files[a].ext)
                .cmp(&(&self.files[b].name, &self.files[b].ext))
        });
        let nfiles = order.len();
        let nsegs = nfiles.div_ceil(ENTRIES_PER_SEGMENT).max(1);
        if nsegs > MAX_SEGMENTS {
            return Err(Error::NoSpace);
        }
        let data_start = FIRST_SEGMENT + SEGMENT_BLOCKS * nsegs;
        let file_blocks: usize = order
            .iter()
            .map(|&i| Self::blocks_for(&self.files[i]))
            .sum();
        let needed = data_start + file_blocks;
        let mut nblocks = img.blocks().max(1);
        if needed > nblocks {
            let max = self.device.max_blocks(img.autosizing);
            if needed > max {
                return Err(Error::NoSpace);
            }
            nblocks = needed.div_ceil(512) * 512;
            nblocks = nblocks.min(max);
        }
        img.grow_to(nblocks)?;
        let nblocks = img.blocks();
        img.data.fill(0);

        // Boot block.
        for i in 0..self.files.len() {
            if self.files[i].is_boot() {
                let f = &mut self.files[i];
                if f.data.len() > BLOCK_SIZE {
                    return Err(Error::NoSpace);
                }
                img.data[..f.data.len()].copy_from_slice(&f.data);
                f.blocks = vec![0];
                f.contiguous = true;
            }
        }

        // Data runs, in directory order.
        let mut cursor = data_start;
        for &i in &order {
            let f = &mut self.files[i];
            let need = Self::blocks_for(f);
            let off = cursor * BLOCK_SIZE;
            img.data[off..off + f.data.len()].copy_from_slice(&f.data);
            f.blocks = (cursor..cursor + need).collect();
            f.contiguous = true;
            cursor += need;
        }

        // Directory segments.  Each segment's header carries the
        // block where its first entry's run begins.
        let mut seg_start = data_start;
        for s in 0..nsegs {
            let sblock = FIRST_SEGMENT + SEGMENT_BLOCKS * s;
            let lo = sblock * BLOCK_SIZE;
            let seg =
                &mut img.data[lo..lo + SEGMENT_BLOCKS * BLOCK_SIZE];
            put_word(seg, 0, nsegs as u16);
            let next = if s + 1 < nsegs { (s + 2) as u16 } else { 0 };
            put_word(seg, 1, next);
            put_word(seg, 2, nsegs as u16);
            put_word(seg, 3, 0);
            let first_entry = s * ENTRIES_PER_SEGMENT;
            let seg_files =
                &order[first_entry..(first_entry + ENTRIES_PER_SEGMENT)
                    .min(nfiles)];
            put_word(seg, 4, seg_start as u16);
            let mut w = HEADER_WORDS;
            for &i in seg_files {
                seg_start += self.files[i].blocks.len();
                let f = &self.files[i];
                let name: [u16; 2] = radix50::encode(&f.name)?;
                let ext: [u16; 1] = radix50::encode(&f.ext)?;
                put_word(seg, w, EntryStatus::PERMANENT.bits());
                put_word(seg, w + 1, name[0]);
                put_word(seg, w + 2, name[1]);
                put_word(seg, w + 3, ext[0]);
                put_word(seg, w + 4, f.blocks.len() as u16);
                put_word(seg, w + 5, 0);
                put_word(
                    seg,
                    w + 6,
                    f.date.map(DecDate::to_rt11).unwrap_or(0),
                );
                w += ENTRY_WORDS;
            }
            put_word(seg, w, EntryStatus::END_OF_SEGMENT.bits());
        }

        // Home block, checksum last.
        {
            let home = &mut img.data[BLOCK_SIZE..2 * BLOCK_SIZE];
            put_word(home, HOME_CLUSTER, self.cluster);
            put_word(home, HOME_FIRST_SEGMENT, FIRST_SEGMENT as u16);
            put_word(home, HOME_VERSION, self.version);
            home[HOME_VOLUME_ID..HOME_VOLUME_ID + 12]
                .copy_from_slice(&self.volume_id);
            home[HOME_OWNER..HOME_OWNER + 12].copy_from_slice(&self.owner);
            home[HOME_SYSTEM_ID..HOME_SYSTEM_ID + 12]
                .copy_from_slice(&self.system_id);
            let sum = home_checksum(home);
            put_word(home, HOME_CHECKSUM, sum);
        }
        debug!(
            "rt11 render: {} files, {} segments, {} blocks, data {}..{}",
            nfiles, nsegs, nblocks, data_start, cursor
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memimg(autosizing: bool) -> Image {
        Image::memory(DeviceKind::Tu58, Some(FsKind::Rt11), autosizing)
    }

    fn file(name: &str, ext: &str, len: usize, seed: u8) -> DecFile {
        let data = (0..len).map(|i| (i as u8).wrapping_mul(seed)).collect();
        let mut f =
            DecFile::new(name.as_bytes(), ext.as_bytes(), data).unwrap();
        f.date = Some(DecDate { year: 1985, month: 11, day: 20 });
        f
    }

    #[test]
    fn entries_per_segment_matches_layout() {
        // 1024-byte segment, 10-byte header, 14-byte entries, one
        // end marker.
        assert_eq!(ENTRIES_PER_SEGMENT, 71);
    }

    #[test]
    fn empty_volume_round_trips() {
        let mut img = memimg(false);
        let mut fs = Rt11Filesystem::empty(DeviceKind::Tu58).unwrap();
        fs.render(&mut img).unwrap();
        let parsed = Rt11Filesystem::parse(DeviceKind::Tu58, &img).unwrap();
        assert!(parsed.files().is_empty());
        assert_eq!(parsed.system_id, str12(b"DECRT11A"));
    }

    #[test]
    fn files_round_trip_contiguously() {
        let mut img = memimg(false);
        let mut fs = Rt11Filesystem::empty(DeviceKind::Tu58).unwrap();
        fs.add_file(file("ZEBRA", "TXT", 700, 3)).unwrap();
        fs.add_file(file("AARDVK", "DAT", 2000, 5)).unwrap();
        fs.render(&mut img).unwrap();

        let parsed = Rt11Filesystem::parse(DeviceKind::Tu58, &img).unwrap();
        // Directory order is sorted.
        assert_eq!(parsed.files()[0].filename(), "AARDVK.DAT");
        assert_eq!(parsed.files()[1].filename(), "ZEBRA.TXT");
        let a = &parsed.files()[0];
        assert_eq!(a.blocks.len(), 4);
        assert!(a.contiguous);
        assert_eq!(&a.data[..2000], &fs.files()[1].data[..]);
        assert_eq!(
            a.date,
            Some(DecDate { year: 1985, month: 11, day: 20 })
        );
        let z = &parsed.files()[1];
        assert_eq!(z.blocks[0], a.blocks[3] + 1);
    }

    #[test]
    fn rendered_image_is_a_fixed_point() {
        let mut img = memimg(false);
        let mut fs = Rt11Filesystem::empty(DeviceKind::Tu58).unwrap();
        fs.add_file(file("ONE", "BIN", 1024, 2)).unwrap();
        fs.add_file(file("TWO", "BIN", 512, 4)).unwrap();
        fs.render(&mut img).unwrap();
        let first = img.data.clone();
        let mut parsed =
            Rt11Filesystem::parse(DeviceKind::Tu58, &img).unwrap();
        let mut img2 = memimg(false);
        parsed.render(&mut img2).unwrap();
        assert_eq!(first, img2.data);
    }

    #[test]
    fn home_block_checksum_validated() {
        let mut img = memimg(false);
        let mut fs = Rt11Filesystem::empty(DeviceKind::Tu58).unwrap();
        fs.render(&mut img).unwrap();
        // Corrupt the volume ID without fixing the checksum.
        img.data[BLOCK_SIZE + HOME_VOLUME_ID] ^= 0xFF;
        assert_eq!(
            Rt11Filesystem::parse(DeviceKind::Tu58, &img).unwrap_err(),
            Error::CorruptHome
        );
    }

    #[test]
    fn bad_segment_chain_detected() {
        let mut img = memimg(false);
        let mut fs = Rt11Filesystem::empty(DeviceKind::Tu58).unwrap();
        fs.add_file(file("A", "B", 100, 1)).unwrap();
        fs.render(&mut img).unwrap();
        // Segment pointing at itself.
        let lo = FIRST_SEGMENT * BLOCK_SIZE;
        let seg = &mut img.data[lo..lo + SEGMENT_BLOCKS * BLOCK_SIZE];
        put_word(seg, 0, 2);
        put_word(seg, 1, 1);
        // Home checksum does not cover the directory.
        assert_eq!(
            Rt11Filesystem::parse(DeviceKind::Tu58, &img).unwrap_err(),
            Error::InvalidSegmentChain
        );
    }

    #[test]
    fn overlapping_runs_detected() {
        let mut img = memimg(false);
        let mut fs = Rt11Filesystem::empty(DeviceKind::Tu58).unwrap();
        // Two segments' worth of one-block files.
        for i in 0..=ENTRIES_PER_SEGMENT {
            let name = format!("F{i:02}");
            fs.add_file(file(&name, "DAT", BLOCK_SIZE, i as u8)).unwrap();
        }
        fs.render(&mut img).unwrap();
        // Rewind the second segment's data start onto the first
        // segment's runs.
        let s1 = FIRST_SEGMENT * BLOCK_SIZE;
        let s2 = (FIRST_SEGMENT + SEGMENT_BLOCKS) * BLOCK_SIZE;
        let start1 = get_word(&img.data[s1..s1 + BLOCK_SIZE], 4);
        let seg2 = &mut img.data[s2..s2 + SEGMENT_BLOCKS * BLOCK_SIZE];
        put_word(seg2, 4, start1);
        assert_eq!(
            Rt11Filesystem::parse(DeviceKind::Tu58, &img).unwrap_err(),
            Error::OverlappingFiles
        );
    }

    #[test]
    fn no_space_without_autosize() {
        let mut img = memimg(false);
        let mut fs = Rt11Filesystem::empty(DeviceKind::Tu58).unwrap();
        fs.add_file(file("FAT", "BIN", 600 * BLOCK_SIZE, 1)).unwrap();
        assert_eq!(fs.render(&mut img), Err(Error::NoSpace));
    }

    #[test]
    fn autosize_growth() {
        let mut img = memimg(true);
        let mut fs = Rt11Filesystem::empty(DeviceKind::Tu58).unwrap();
        fs.add_file(file("FAT", "BIN", 600 * BLOCK_SIZE, 1)).unwrap();
        fs.render(&mut img).unwrap();
        assert_eq!(img.blocks(), 1024);
        let parsed = Rt11Filesystem::parse(DeviceKind::Tu58, &img).unwrap();
        assert_eq!(parsed.files()[0].blocks.len(), 600);
    }

    #[test]
    fn boot_block_round_trips() {
        let mut img = memimg(false);
        let mut fs = Rt11Filesystem::empty(DeviceKind::Tu58).unwrap();
        let mut boot = vec![0u8; BLOCK_SIZE];
        boot[0] = 0xA0;
        fs.add_file(
            DecFile::new(fs::BOOT_NAME.0, fs::BOOT_NAME.1, boot.clone())
                .unwrap(),
        )
        .unwrap();
        fs.render(&mut img).unwrap();
        assert_eq!(&img.data[..BLOCK_SIZE], &boot[..]);
        let parsed = Rt11Filesystem::parse(DeviceKind::Tu58, &img).unwrap();
        assert!(parsed.files().iter().any(|f| f.is_boot()));
    }
}
