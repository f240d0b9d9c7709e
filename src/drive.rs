// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The eight-unit drive bank and the two service loops.
//!
//! The server loop owns the serial port, runs the protocol
//! session on it and hands the port back when cancelled, so a
//! restart never reopens the device.  The monitor loop wakes a
//! few times a second and applies the sync-after-idle policy:
//! PDP-side changes are written out once the unit has been quiet
//! long enough, and for shared units a drifted host directory is
//! rendered back in once the serial line is quiet.  Both loops
//! stop cooperatively at their I/O and timer boundaries.

use crate::config::Config;
use crate::image::Image;
use crate::protocol::Session;
use crate::serial::Line;
use log::{debug, error, info};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

/// Monitor wake interval.
const MONITOR_TICK: Duration = Duration::from_millis(250);

/// The fixed bank of drive images.
pub struct Bank {
    units: [Mutex<Image>; Bank::UNITS],
}

impl Bank {
    pub const UNITS: usize = 8;

    pub fn new() -> Bank {
        Bank { units: std::array::from_fn(|i| Mutex::new(Image::unopened(i))) }
    }

    /// Locks one unit's image.
    pub fn image(&self, unit: usize) -> MutexGuard<'_, Image> {
        self.units[unit].lock().expect("image lock poisoned")
    }
}

impl Default for Bank {
    fn default() -> Bank {
        Bank::new()
    }
}

/// Runs the protocol session until cancelled, then returns the
/// line so a restart can reuse it.  Serial faults are logged and
/// the session restarted on the same port.
pub fn server<L: Line + Send + 'static>(cfg: Arc<Config>, mut line: L) -> L {
    loop {
        let mut session = Session::new(&mut line, cfg.as_ref());
        match session.run() {
            Ok(()) => break,
            Err(e) => {
                if cfg.cancel_server.load(Ordering::Relaxed) {
                    break;
                }
                error!("serial line: {e}; retrying");
                std::thread::sleep(Duration::from_secs(1));
            }
        }
    }
    info!("TU58 protocol service stopped");
    line
}

pub fn spawn_server<L: Line + Send + 'static>(
    cfg: Arc<Config>,
    line: L,
) -> JoinHandle<L> {
    std::thread::spawn(move || server(cfg, line))
}

/// Cancels the server loop, joins it and starts a fresh one on
/// the same port.  Open images are not disturbed.
pub fn restart_server<L: Line + Send + 'static>(
    cfg: &Arc<Config>,
    handle: JoinHandle<L>,
) -> JoinHandle<L> {
    cfg.cancel_server.store(true, Ordering::Relaxed);
    let line = match handle.join() {
        Ok(line) => line,
        Err(p) => std::panic::resume_unwind(p),
    };
    cfg.cancel_server.store(false, Ordering::Relaxed);
    info!("protocol service restarting");
    spawn_server(Arc::clone(cfg), line)
}

/// The sync-after-idle policy for one image.  Called with the
/// unit lock held.
fn sync_unit(cfg: &Config, img: &mut Image) {
    if !img.open || img.readonly {
        return;
    }
    let synctimeout = cfg.opts.synctimeout;
    // PDP wrote: flush out once the unit has been idle.
    if img.changed {
        let idle = img
            .last_write
            .map(|t| t.elapsed())
            .unwrap_or(Duration::MAX);
        if idle >= synctimeout {
            info!(
                "unit {}: writing back changed image ({} dirty blocks)",
                img.unit,
                img.dirty.count()
            );
            if let Err(e) = img.save() {
                error!("unit {}: save failed: {e}", img.unit);
            }
        }
        return;
    }
    // Host directory drifted: rebuild the image, but only while
    // the PDP is not talking to us.
    if img.shared
        && cfg.serial_idle() >= synctimeout
        && img.host_drifted()
    {
        info!("unit {}: host directory changed, reloading", img.unit);
        if let Err(e) = img.sync_in() {
            error!("unit {}: reload failed: {e}", img.unit);
        }
    }
}

/// The monitor loop: sync-after-idle for every unit.
pub fn monitor(cfg: Arc<Config>) {
    debug!("monitor running");
    while !cfg.cancel_monitor.load(Ordering::Relaxed) {
        for unit in 0..Bank::UNITS {
            let mut img = cfg.bank.image(unit);
            sync_unit(&cfg, &mut img);
        }
        std::thread::sleep(MONITOR_TICK);
    }
    // A final pass so nothing dirty is left behind; saves are not
    // interruptible.
    for unit in 0..Bank::UNITS {
        let mut img = cfg.bank.image(unit);
        if img.open && img.changed {
            if let Err(e) = img.save() {
                error!("unit {unit}: final save failed: {e}");
            }
        }
    }
    debug!("monitor stopped");
}

pub fn spawn_monitor(cfg: Arc<Config>) -> JoinHandle<()> {
    std::thread::spawn(move || monitor(cfg))
}

/// Saves and closes every open unit.
pub fn close_all(cfg: &Config) {
    for unit in 0..Bank::UNITS {
        let mut img = cfg.bank.image(unit);
        if img.open {
            if let Err(e) = img.close() {
                error!("unit {unit}: close failed: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Options;
    use crate::fs::{self, FsKind};
    use crate::image::{BLOCK_SIZE, DeviceKind};
    use std::path::PathBuf;

    fn tmpfile(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("tu58d-drive-{}-{}", std::process::id(), name));
        p
    }

    fn tmpdir(name: &str) -> PathBuf {
        let p = tmpfile(name);
        let _ = std::fs::remove_dir_all(&p);
        std::fs::create_dir_all(&p).unwrap();
        p
    }

    #[test]
    fn bank_has_eight_closed_units() {
        let bank = Bank::new();
        for unit in 0..Bank::UNITS {
            let img = bank.image(unit);
            assert_eq!(img.unit, unit);
            assert!(!img.open);
        }
    }

    #[test]
    fn sync_after_idle_writes_changed_images() {
        let cfg = Config::new(Options {
            synctimeout: Duration::ZERO,
            ..Options::default()
        });
        let path = tmpfile("sync.dsk");
        {
            let mut img = cfg.bank.image(0);
            img.open(
                0,
                false,
                false,
                true,
                &path,
                DeviceKind::Tu58,
                None,
                false,
            )
            .unwrap();
            img.write_block(5, &[0x11; BLOCK_SIZE]).unwrap();
            assert!(img.changed);
            sync_unit(&cfg, &mut img);
            assert!(!img.changed);
        }
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes[5 * BLOCK_SIZE], 0x11);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn sync_waits_for_the_idle_window() {
        let cfg = Config::new(Options {
            synctimeout: Duration::from_secs(3600),
            ..Options::default()
        });
        let path = tmpfile("wait.dsk");
        let mut img = cfg.bank.image(0);
        img.open(0, false, false, true, &path, DeviceKind::Tu58, None, false)
            .unwrap();
        img.write_block(1, &[0x22; 16]).unwrap();
        sync_unit(&cfg, &mut img);
        // Still inside the window: nothing flushed.
        assert!(img.changed);
        drop(img);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn shared_unit_reconciles_both_ways() {
        let cfg = Config::new(Options {
            synctimeout: Duration::ZERO,
            ..Options::default()
        });
        let dir = tmpdir("shared");
        std::fs::write(dir.join("note.txt"), b"from host").unwrap();
        {
            let mut img = cfg.bank.image(2);
            img.open(
                2,
                true,
                false,
                false,
                &dir,
                DeviceKind::Tu58,
                Some(FsKind::Xxdp),
                false,
            )
            .unwrap();
            assert!(!img.changed);

            // The PDP rewrites the file's first data block; after
            // the idle window the change lands in the host file.
            let bno = {
                let pdp =
                    fs::parse(FsKind::Xxdp, DeviceKind::Tu58, &img).unwrap();
                let f = pdp
                    .files()
                    .iter()
                    .find(|f| f.filename() == "NOTE.TXT")
                    .unwrap();
                f.blocks[0]
            };
            let mut block = img.read_block(bno).unwrap().to_vec();
            block[4..13].copy_from_slice(b"from pdp!");
            img.write_block(bno, &block).unwrap();
            sync_unit(&cfg, &mut img);
            assert!(!img.changed);
        }
        let back = std::fs::read(dir.join("note.txt")).unwrap();
        assert_eq!(&back[..9], b"from pdp!");

        // The host adds a file; the monitor rebuilds the image.
        std::fs::write(dir.join("extra.dat"), b"host side").unwrap();
        {
            let mut img = cfg.bank.image(2);
            assert!(img.host_drifted());
            sync_unit(&cfg, &mut img);
            assert!(!img.host_drifted());
            let pdp =
                fs::parse(FsKind::Xxdp, DeviceKind::Tu58, &img).unwrap();
            assert!(
                pdp.files().iter().any(|f| f.filename() == "EXTRA.DAT")
            );
        }
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn readonly_units_never_sync() {
        let cfg = Config::new(Options {
            synctimeout: Duration::ZERO,
            ..Options::default()
        });
        let path = tmpfile("ro.dsk");
        {
            let mut img = cfg.bank.image(0);
            img.open(
                0,
                false,
                false,
                true,
                &path,
                DeviceKind::Tu58,
                None,
                false,
            )
            .unwrap();
        }
        let mut img = cfg.bank.image(0);
        img.readonly = true;
        img.changed = true;
        sync_unit(&cfg, &mut img);
        assert!(img.changed);
        img.changed = false;
        drop(img);
        std::fs::remove_file(&path).unwrap();
    }
}
