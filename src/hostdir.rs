// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The host-directory side of a shared unit.
//!
//! A shared unit is backed by an ordinary directory: each DEC
//! file appears as `<base>.<ext>` in lowercase, the boot block
//! and monitor under the sentinel names `@boot.block` and
//! `@monitor.bin`.  The mirror records a snapshot (mtime, size,
//! content digest) of the directory as of the last successful
//! reconciliation; the drive monitor compares the live directory
//! against that snapshot to decide when the image must be rebuilt.
//!
//! Extraction is authoritative: after `from_pdp_fs` the directory
//! contains exactly the files of the filesystem, nothing else.

use crate::fs::{self, DecDate, DecFile, FsKind, PdpFilesystem};
use crate::image::{DeviceKind, Image};
use crate::radix50;
use crate::result::{Error, Result};
use log::{debug, info};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Host name of the boot-block pseudofile.
pub const BOOT_SENTINEL: &str = "@boot.block";

/// Host name of the monitor pseudofile.
pub const MONITOR_SENTINEL: &str = "@monitor.bin";

/// What we knew about one host file at the last reconciliation.
#[derive(Clone, Debug, Eq, PartialEq)]
struct FileState {
    mtime: i64,
    size: u64,
    digest: [u8; 32],
}

pub struct HostDir {
    path: PathBuf,
    snap: BTreeMap<String, FileState>,
}

impl HostDir {
    pub fn new(path: &Path) -> HostDir {
        HostDir { path: path.to_path_buf(), snap: BTreeMap::new() }
    }

    /// Validates (or creates) the directory.  `boot_template`, if
    /// given, seeds `@boot.block` when the directory has none.
    pub fn prepare(
        &mut self,
        create_ok: bool,
        allow_empty: bool,
        boot_template: Option<&Path>,
    ) -> Result<()> {
        match std::fs::metadata(&self.path) {
            Ok(md) if md.is_dir() => {}
            Ok(_) => return Err(Error::NotADirectory),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if !create_ok {
                    return Err(Error::HostDirMissing);
                }
                std::fs::create_dir_all(&self.path)?;
                info!("created host directory \"{}\"", self.path.display());
            }
            Err(e) => return Err(e.into()),
        }
        if let Some(template) = boot_template {
            let dst = self.path.join(BOOT_SENTINEL);
            if !dst.exists() {
                std::fs::copy(template, dst)?;
            }
        }
        if !allow_empty && self.scan()?.is_empty() {
            return Err(Error::HostDirEmpty);
        }
        Ok(())
    }

    /// Lists the regular files the mirror manages.  Dot-files and
    /// subdirectories are left alone.
    fn scan(&self) -> Result<BTreeMap<String, FileState>> {
        let mut out = BTreeMap::new();
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            let md = entry.metadata()?;
            if !md.is_file() {
                continue;
            }
            let Ok(name) = entry.file_name().into_string() else {
                return Err(Error::Utf8);
            };
            if name.starts_with('.') {
                continue;
            }
            let mtime = md
                .modified()?
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            out.insert(
                name,
                FileState { mtime, size: md.len(), digest: [0; 32] },
            );
        }
        Ok(out)
    }

    fn digest_of(&self, name: &str) -> Result<[u8; 32]> {
        let bytes = std::fs::read(self.path.join(name))?;
        Ok(Sha256::digest(&bytes).into())
    }

    /// Re-reads the directory into the snapshot.
    pub fn snapshot(&mut self) -> Result<()> {
        let mut snap = self.scan()?;
        for (name, state) in snap.iter_mut() {
            state.digest = self.digest_of(name)?;
        }
        self.snap = snap;
        Ok(())
    }

    /// Tells whether the directory has drifted from the snapshot.
    /// An mtime bump with identical content does not count.
    pub fn changed_since_snapshot(&self) -> Result<bool> {
        let now = self.scan()?;
        if now.len() != self.snap.len() {
            return Ok(true);
        }
        for (name, state) in &now {
            let Some(old) = self.snap.get(name) else {
                return Ok(true);
            };
            if state.size != old.size {
                return Ok(true);
            }
            if state.mtime != old.mtime
                && self.digest_of(name)? != old.digest
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Extracts every logical file of `pdp` into the directory
    /// and deletes host files the filesystem does not carry.
    pub fn from_pdp_fs(&mut self, pdp: &dyn PdpFilesystem) -> Result<()> {
        let mut keep = Vec::new();
        for f in pdp.files() {
            let name = host_name(f);
            let path = self.path.join(&name);
            std::fs::write(&path, &f.data)?;
            if let Some(date) = f.date {
                set_mtime(&path, date.to_unix())?;
            }
            keep.push(name);
        }
        for name in self.scan()?.keys() {
            if !keep.contains(name) {
                debug!("hostdir: removing stale \"{name}\"");
                std::fs::remove_file(self.path.join(name))?;
            }
        }
        self.snapshot()
    }

    /// Collects the host files into `pdp`.  Sentinels fill the
    /// boot and monitor slots; everything else is transliterated
    /// to a 6.3 RADIX-50 name.  Any unrepresentable or colliding
    /// name fails the whole operation.
    pub fn to_pdp_fs(&self, pdp: &mut dyn PdpFilesystem) -> Result<()> {
        for name in self.scan()?.keys() {
            let data = std::fs::read(self.path.join(name))?;
            let mtime = std::fs::metadata(self.path.join(name))?
                .modified()?
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            let (base, ext) = match name.as_str() {
                BOOT_SENTINEL => {
                    (fs::BOOT_NAME.0.to_vec(), fs::BOOT_NAME.1.to_vec())
                }
                MONITOR_SENTINEL => (
                    fs::MONITOR_NAME.0.to_vec(),
                    fs::MONITOR_NAME.1.to_vec(),
                ),
                other => dec_name(other)?,
            };
            let mut f = DecFile::new(&base, &ext, data)?;
            f.date = Some(DecDate::from_unix(mtime));
            pdp.add_file(f)?;
        }
        Ok(())
    }
}

/// Host filename for a logical file.
fn host_name(f: &DecFile) -> String {
    if f.is_boot() {
        BOOT_SENTINEL.into()
    } else if f.is_monitor() {
        MONITOR_SENTINEL.into()
    } else {
        f.filename().to_ascii_lowercase()
    }
}

/// Transliterates a host filename to a 6.3 RADIX-50 pair:
/// uppercase, characters outside the alphabet dropped, truncated.
fn dec_name(name: &str) -> Result<(Vec<u8>, Vec<u8>)> {
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i + 1..]),
        _ => (name, ""),
    };
    let clean = |s: &str, max: usize| -> Vec<u8> {
        s.bytes()
            .map(|c| c.to_ascii_uppercase())
            .filter(|&c| c != b' ' && c != b'.' && radix50::representable(c))
            .take(max)
            .collect()
    };
    let base = clean(stem, 6);
    if base.is_empty() {
        return Err(Error::NameUnrepresentable);
    }
    Ok((base, clean(ext, 3)))
}

fn set_mtime(path: &Path, secs: i64) -> Result<()> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::NameUnrepresentable)?;
    let tv = libc::timeval { tv_sec: secs as libc::time_t, tv_usec: 0 };
    let times = [tv, tv];
    let ret = unsafe { libc::utimes(cpath.as_ptr(), times.as_ptr()) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

/// One-shot `--unpack`: image file to directory.
pub fn unpack(
    img_path: &Path,
    dir_path: &Path,
    kind: FsKind,
    device: DeviceKind,
) -> Result<()> {
    let mut img = Image::unopened(0);
    img.open(0, false, false, false, img_path, device, Some(kind), true)?;
    let pdp = fs::parse(kind, device, &img)?;
    let mut dir = HostDir::new(dir_path);
    dir.prepare(true, true, None)?;
    dir.from_pdp_fs(pdp.as_ref())?;
    info!(
        "files extracted from \"{}\" and written to \"{}\"",
        img_path.display(),
        dir_path.display()
    );
    print!("{}", fs::listing(pdp.as_ref()));
    Ok(())
}

/// One-shot `--pack`: directory to image file.
pub fn pack(
    dir_path: &Path,
    img_path: &Path,
    kind: FsKind,
    device: DeviceKind,
) -> Result<()> {
    let mut dir = HostDir::new(dir_path);
    dir.prepare(false, false, None)?;
    let mut pdp = fs::empty(kind, device)?;
    dir.to_pdp_fs(pdp.as_mut())?;
    let mut img = Image::memory(device, Some(kind), true);
    pdp.render(&mut img)?;
    std::fs::write(img_path, &img.data)?;
    info!(
        "files from \"{}\" packed into \"{}\"",
        dir_path.display(),
        img_path.display()
    );
    print!("{}", fs::listing(pdp.as_ref()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmpdir(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("tu58d-hostdir-{}-{}", std::process::id(), name));
        let _ = std::fs::remove_dir_all(&p);
        std::fs::create_dir_all(&p).unwrap();
        p
    }

    #[test]
    fn dec_name_policy() {
        assert_eq!(
            dec_name("hello.txt").unwrap(),
            (b"HELLO".to_vec(), b"TXT".to_vec())
        );
        assert_eq!(
            dec_name("long-file-name.data").unwrap(),
            (b"LONGFI".to_vec(), b"DAT".to_vec())
        );
        assert_eq!(dec_name("noext").unwrap(), (b"NOEXT".to_vec(), vec![]));
        assert_eq!(
            dec_name("a.b.c").unwrap(),
            (b"AB".to_vec(), b"C".to_vec())
        );
        assert_eq!(dec_name("###"), Err(Error::NameUnrepresentable));
    }

    #[test]
    fn round_trip_through_directory() {
        let dir = tmpdir("round");
        std::fs::write(dir.join("first.txt"), b"first file").unwrap();
        std::fs::write(dir.join("second.dat"), vec![7u8; 2000]).unwrap();

        let mut host = HostDir::new(&dir);
        host.prepare(false, false, None).unwrap();
        let mut pdp = fs::empty(FsKind::Xxdp, DeviceKind::Tu58).unwrap();
        host.to_pdp_fs(pdp.as_mut()).unwrap();
        assert_eq!(pdp.files().len(), 2);

        let mut img = Image::memory(DeviceKind::Tu58, None, false);
        pdp.render(&mut img).unwrap();
        let parsed =
            fs::parse(FsKind::Xxdp, DeviceKind::Tu58, &img).unwrap();

        let out = tmpdir("round-out");
        let mut host2 = HostDir::new(&out);
        host2.prepare(false, true, None).unwrap();
        host2.from_pdp_fs(parsed.as_ref()).unwrap();

        let back = std::fs::read(out.join("first.txt")).unwrap();
        assert_eq!(&back[..10], b"first file");
        assert!(out.join("second.dat").exists());

        std::fs::remove_dir_all(&dir).unwrap();
        std::fs::remove_dir_all(&out).unwrap();
    }

    #[test]
    fn extraction_deletes_strays() {
        let dir = tmpdir("strays");
        std::fs::write(dir.join("stale.txt"), b"old").unwrap();
        let mut host = HostDir::new(&dir);
        host.prepare(false, true, None).unwrap();

        let mut pdp = fs::empty(FsKind::Rt11, DeviceKind::Tu58).unwrap();
        pdp.add_file(DecFile::new(b"KEEP", b"DAT", vec![1, 2, 3]).unwrap())
            .unwrap();
        host.from_pdp_fs(pdp.as_ref()).unwrap();

        assert!(dir.join("keep.dat").exists());
        assert!(!dir.join("stale.txt").exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn collision_fails_whole_operation() {
        let dir = tmpdir("collide");
        std::fs::write(dir.join("abc-def.txt"), b"x").unwrap();
        std::fs::write(dir.join("abcdef.txt"), b"y").unwrap();
        let host = HostDir::new(&dir);
        let mut pdp = fs::empty(FsKind::Xxdp, DeviceKind::Tu58).unwrap();
        assert_eq!(
            host.to_pdp_fs(pdp.as_mut()).unwrap_err(),
            Error::NameCollision
        );
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn snapshot_detects_changes() {
        let dir = tmpdir("snap");
        let watch = dir.join("watch.dat");
        std::fs::write(&watch, b"one").unwrap();
        let mut host = HostDir::new(&dir);
        host.prepare(false, false, None).unwrap();
        host.snapshot().unwrap();
        assert!(!host.changed_since_snapshot().unwrap());

        // Same-size content change, mtime forced forward so the
        // comparison does not depend on clock granularity.
        std::fs::write(&watch, b"two").unwrap();
        set_mtime(&watch, 1_000_000_000).unwrap();
        assert!(host.changed_since_snapshot().unwrap());
        host.snapshot().unwrap();
        assert!(!host.changed_since_snapshot().unwrap());

        // An mtime bump with identical content is not a change.
        set_mtime(&watch, 1_000_086_400).unwrap();
        assert!(!host.changed_since_snapshot().unwrap());

        // New file.
        std::fs::write(dir.join("more.dat"), b"x").unwrap();
        assert!(host.changed_since_snapshot().unwrap());
        std::fs::remove_file(dir.join("more.dat")).unwrap();

        // Removal.
        std::fs::remove_file(&watch).unwrap();
        assert!(host.changed_since_snapshot().unwrap());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn mtime_stamped_from_dec_date() {
        let dir = tmpdir("mtime");
        let mut host = HostDir::new(&dir);
        host.prepare(false, true, None).unwrap();
        let mut pdp = fs::empty(FsKind::Xxdp, DeviceKind::Tu58).unwrap();
        let mut f = DecFile::new(b"OLD", b"TXT", b"bytes".to_vec()).unwrap();
        let date = DecDate { year: 1979, month: 4, day: 1 };
        f.date = Some(date);
        pdp.add_file(f).unwrap();
        host.from_pdp_fs(pdp.as_ref()).unwrap();

        let mtime = std::fs::metadata(dir.join("old.txt"))
            .unwrap()
            .modified()
            .unwrap()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        assert_eq!(mtime, date.to_unix());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn unpack_then_pack_is_identity() {
        // Scenario: a packed volume, unpacked and repacked, is
        // byte-identical.
        let dir = tmpdir("packsrc");
        std::fs::write(dir.join("alpha.txt"), vec![3u8; 1000]).unwrap();
        std::fs::write(dir.join("beta.bin"), vec![9u8; 600]).unwrap();
        let mut boot = vec![0u8; 512];
        boot[0] = 0o240;
        std::fs::write(dir.join(BOOT_SENTINEL), &boot).unwrap();

        let img1 = tmpdir("packout").join("vol.dsk");
        pack(&dir, &img1, FsKind::Xxdp, DeviceKind::Tu58).unwrap();

        let extracted = tmpdir("unpacked");
        unpack(&img1, &extracted, FsKind::Xxdp, DeviceKind::Tu58).unwrap();
        assert!(extracted.join("alpha.txt").exists());
        assert!(extracted.join(BOOT_SENTINEL).exists());

        let img2 = tmpdir("packout2").join("vol2.dsk");
        pack(&extracted, &img2, FsKind::Xxdp, DeviceKind::Tu58).unwrap();
        assert_eq!(
            std::fs::read(&img1).unwrap(),
            std::fs::read(&img2).unwrap()
        );

        for p in [&dir, &extracted] {
            std::fs::remove_dir_all(p).unwrap();
        }
        std::fs::remove_dir_all(img1.parent().unwrap()).unwrap();
        std::fs::remove_dir_all(img2.parent().unwrap()).unwrap();
    }
}
