// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! tu58d: a DEC TU58 tape drive emulator with host file sharing.
//!
//! Eight emulated drive units are served over a serial line to a
//! PDP-11 or VAX host.  Units are backed by flat image files or
//! by live host directories rendered as XXDP or RT-11 volumes.

mod config;
mod console;
mod drive;
mod fs;
mod hostdir;
mod image;
mod logger;
mod packet;
mod protocol;
mod radix50;
mod result;
mod serial;

#[cfg(test)]
mod fakes;

use config::{Config, Options};
use console::Console;
use fs::FsKind;
use image::DeviceKind;
use log::info;
use logger::fatal;
use serial::SerialPort;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

const VERSION: &str =
    concat!("tu58d - DEC TU58 tape emulator with file sharing v",
            env!("CARGO_PKG_VERSION"));

/// Ordered work items from the command line; selector prefixes
/// (`--xxdp`, `--rt11`, `--size`) apply to the items after them.
enum Action {
    Mount {
        unit: usize,
        shared: bool,
        readonly: bool,
        allow_create: bool,
        path: PathBuf,
        fs_kind: Option<FsKind>,
        autosizing: bool,
    },
    Unpack { image: PathBuf, dir: PathBuf, fs_kind: FsKind },
    Pack { dir: PathBuf, image: PathBuf, fs_kind: FsKind },
}

struct CommandLine {
    opts: Options,
    actions: Vec<Action>,
    verbose: bool,
    debug: bool,
}

fn help() -> ! {
    eprintln!("{VERSION}");
    eprintln!();
    eprintln!("usage: tu58d [options]");
    eprintln!();
    eprintln!(" -p,  --port <dev>            serial port [1..N] or /dev/...");
    eprintln!(" -b,  --baudrate <n>          line speed, 1200..3000000");
    eprintln!(" -sb, --stopbits <1|2>        stop bits");
    eprintln!(" -m,  --mrsp                  enable MRSP byte handshake mode");
    eprintln!(" -n,  --nosync                do not send INIT at startup");
    eprintln!(" -x,  --vax                   no delays, for VAX console timeouts");
    eprintln!(" -t,  --timing <0|1|2>        1: diagnostic delays, 2: tape delays");
    eprintln!(" -bk, --background            no console I/O except errors");
    eprintln!(" -st, --synctimeout <sec>     write changed images after idle time");
    eprintln!(" -ot, --offlinetimeout <sec>  offline after RS232 idle time");
    eprintln!(" -xx, --xxdp                  select XXDP for following devices");
    eprintln!(" -rt, --rt11                  select RT-11 for following devices");
    eprintln!(" -s,  --size <std|auto>       standard 256KB, or grow to 32MB");
    eprintln!(" -d,  --device <u>,<r|w|c>,<file>");
    eprintln!("                              mount image file on unit 0..7");
    eprintln!(" -sd, --shareddevice <u>,<r|w|c>,<dir>");
    eprintln!("                              mount host directory on unit 0..7");
    eprintln!(" -up, --unpack <image>,<dir>  extract image files into directory");
    eprintln!(" -pk, --pack <dir>,<image>    pack directory files into image");
    eprintln!(" -v,  --verbose               more output");
    eprintln!(" -dbg,--debug                 debug output");
    eprintln!(" -V,  --version               print version");
    eprintln!();
    eprintln!("interactive keys: 0..7 device dialog, V verbose, D debug,");
    eprintln!("S toggle INIT-on-start, R restart protocol, Q quit");
    std::process::exit(1);
}

fn next_value(args: &mut impl Iterator<Item = String>, opt: &str) -> String {
    args.next()
        .unwrap_or_else(|| fatal(format_args!("option {opt} needs a value")))
}

fn parse_num(v: &str, opt: &str) -> u64 {
    v.parse()
        .unwrap_or_else(|_| fatal(format_args!("bad number \"{v}\" for {opt}")))
}

/// Splits "unit,r|w|c,path" into its parts.
fn parse_device_spec(v: &str, opt: &str) -> (usize, bool, bool, PathBuf) {
    let parts: Vec<&str> = v.splitn(3, ',').collect();
    let [unit, mode, path] = parts[..] else {
        fatal(format_args!("{opt} wants <unit>,<r|w|c>,<path>"))
    };
    let unit = parse_num(unit, opt) as usize;
    if unit >= drive::Bank::UNITS {
        fatal(format_args!("unit {unit} out of range 0..7"));
    }
    let (readonly, allow_create) = match mode.to_ascii_lowercase().as_str() {
        "r" => (true, false),
        "w" => (false, false),
        "c" => (false, true),
        other => fatal(format_args!("bad access mode \"{other}\" for {opt}")),
    };
    (unit, readonly, allow_create, PathBuf::from(path))
}

fn parse_pair(v: &str, opt: &str) -> (PathBuf, PathBuf) {
    let parts: Vec<&str> = v.splitn(2, ',').collect();
    let [a, b] = parts[..] else {
        fatal(format_args!("{opt} wants two comma separated paths"))
    };
    (PathBuf::from(a), PathBuf::from(b))
}

fn parse_commandline() -> CommandLine {
    let mut args = std::env::args().skip(1).peekable();
    if args.peek().is_none() {
        help();
    }
    let mut cl = CommandLine {
        opts: Options::default(),
        actions: Vec::new(),
        verbose: false,
        debug: false,
    };
    // Selector state carried into following device options.
    let mut cur_fs: Option<FsKind> = None;
    let mut cur_autosizing = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-?" | "--help" => help(),
            "-V" | "--version" => {
                eprintln!("{VERSION}");
                std::process::exit(0);
            }
            "-v" | "--verbose" => cl.verbose = true,
            "-dbg" | "--debug" => cl.debug = true,
            "-m" | "--mrsp" => cl.opts.mrsp = true,
            "-n" | "--nosync" => cl.opts.nosync = true,
            "-x" | "--vax" => cl.opts.vax = true,
            "-bk" | "--background" => cl.opts.background = true,
            "-p" | "--port" => cl.opts.port = next_value(&mut args, &arg),
            "-b" | "--baudrate" => {
                let v = parse_num(&next_value(&mut args, &arg), &arg);
                if !(1200..=3_000_000).contains(&v) {
                    fatal(format_args!("baudrate {v} out of range"));
                }
                cl.opts.baud = v as u32;
            }
            "-sb" | "--stopbits" => {
                let v = parse_num(&next_value(&mut args, &arg), &arg);
                if v != 1 && v != 2 {
                    fatal(format_args!("stopbits must be 1 or 2"));
                }
                cl.opts.stopbits = v as u8;
            }
            "-t" | "--timing" => {
                let v = parse_num(&next_value(&mut args, &arg), &arg);
                if v > 2 {
                    fatal(format_args!("timing must be 0, 1 or 2"));
                }
                cl.opts.timing = v as u8;
            }
            "-st" | "--synctimeout" => {
                let v = parse_num(&next_value(&mut args, &arg), &arg);
                cl.opts.synctimeout = Duration::from_secs(v);
            }
            "-ot" | "--offlinetimeout" => {
                let v = parse_num(&next_value(&mut args, &arg), &arg);
                cl.opts.offlinetimeout = Duration::from_secs(v);
            }
            "-xx" | "--xxdp" => cur_fs = Some(FsKind::Xxdp),
            "-rt" | "--rt11" => cur_fs = Some(FsKind::Rt11),
            "-s" | "--size" => {
                let v = next_value(&mut args, &arg);
                match v.to_ascii_lowercase().as_str() {
                    "std" => cur_autosizing = false,
                    "auto" => cur_autosizing = true,
                    other => {
                        fatal(format_args!("size must be std or auto, not \"{other}\""))
                    }
                }
            }
            "-d" | "--device" | "-sd" | "--shareddevice" => {
                let shared = arg == "-sd" || arg == "--shareddevice";
                let v = next_value(&mut args, &arg);
                let (unit, readonly, allow_create, path) =
                    parse_device_spec(&v, &arg);
                if shared && cur_fs.is_none() {
                    fatal(format_args!("{arg}: no filesystem specified"));
                }
                cl.actions.push(Action::Mount {
                    unit,
                    shared,
                    readonly,
                    allow_create,
                    path,
                    fs_kind: cur_fs,
                    autosizing: cur_autosizing,
                });
            }
            "-up" | "--unpack" => {
                let (image, dir) =
                    parse_pair(&next_value(&mut args, &arg), &arg);
                let Some(fs_kind) = cur_fs else {
                    fatal(format_args!("{arg}: no filesystem specified"));
                };
                cl.actions.push(Action::Unpack { image, dir, fs_kind });
            }
            "-pk" | "--pack" => {
                let (dir, image) =
                    parse_pair(&next_value(&mut args, &arg), &arg);
                let Some(fs_kind) = cur_fs else {
                    fatal(format_args!("{arg}: no filesystem specified"));
                };
                cl.actions.push(Action::Pack { dir, image, fs_kind });
            }
            other => fatal(format_args!("unknown option \"{other}\"")),
        }
    }
    cl
}

fn interactive_loop(
    cfg: &Arc<Config>,
    console: &Console,
    mut server: std::thread::JoinHandle<SerialPort>,
) -> std::thread::JoinHandle<SerialPort> {
    loop {
        if let Some(key) = console.poll_key() {
            match key.to_ascii_uppercase() {
                unit @ b'0'..=b'7' => {
                    let unit = usize::from(unit - b'0');
                    let open = cfg.bank.image(unit).open;
                    if open {
                        console::device_dialog(cfg, unit, console);
                    }
                }
                b'V' => {
                    let v = !cfg.verbose.load(Ordering::Relaxed);
                    cfg.verbose.store(v, Ordering::Relaxed);
                    cfg.debug.store(false, Ordering::Relaxed);
                    logger::apply_levels(v, false);
                    info!("verbosity {}; debug OFF", if v { "ON" } else { "OFF" });
                }
                b'D' => {
                    let d = !cfg.debug.load(Ordering::Relaxed);
                    cfg.verbose.store(true, Ordering::Relaxed);
                    cfg.debug.store(d, Ordering::Relaxed);
                    logger::apply_levels(true, d);
                    info!("verbosity ON; debug {}", if d { "ON" } else { "OFF" });
                }
                b'S' => {
                    let send = !cfg.doinit.load(Ordering::Relaxed);
                    cfg.doinit.store(send, Ordering::Relaxed);
                    info!(
                        "send of <INIT> {}abled",
                        if send { "en" } else { "dis" }
                    );
                }
                b'R' => server = drive::restart_server(cfg, server),
                b'Q' => return server,
                _ => {}
            }
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}

fn main() {
    let cl = parse_commandline();
    logger::init(cl.opts.background);
    logger::apply_levels(cl.verbose, cl.debug);

    let cfg = Arc::new(Config::new(cl.opts.clone()));
    cfg.verbose.store(cl.verbose, Ordering::Relaxed);
    cfg.debug.store(cl.debug, Ordering::Relaxed);

    let mut mounted = 0usize;
    for action in &cl.actions {
        match action {
            Action::Mount {
                unit,
                shared,
                readonly,
                allow_create,
                path,
                fs_kind,
                autosizing,
            } => {
                let mut img = cfg.bank.image(*unit);
                img.open(
                    *unit,
                    *shared,
                    *readonly,
                    *allow_create,
                    path,
                    DeviceKind::Tu58,
                    *fs_kind,
                    *autosizing,
                )
                .unwrap_or_else(|e| {
                    fatal(format_args!(
                        "opening unit {unit} from \"{}\": {e}",
                        path.display()
                    ))
                });
                info!("{}", img.describe());
                mounted += 1;
            }
            Action::Unpack { image, dir, fs_kind } => {
                hostdir::unpack(image, dir, *fs_kind, DeviceKind::Tu58)
                    .unwrap_or_else(|e| fatal(format_args!("unpack: {e}")));
            }
            Action::Pack { dir, image, fs_kind } => {
                hostdir::pack(dir, image, *fs_kind, DeviceKind::Tu58)
                    .unwrap_or_else(|e| fatal(format_args!("pack: {e}")));
            }
        }
    }

    if mounted == 0 {
        info!("no units were specified, emulator not started");
        return;
    }

    let line = SerialPort::open(
        &cfg.opts.port,
        cfg.opts.baud,
        cfg.opts.stopbits,
    )
    .unwrap_or_else(|e| {
        fatal(format_args!("serial port {}: {e}", cfg.opts.port))
    });

    info!("TU58 emulation start");
    if cfg.opts.mrsp {
        info!("MRSP mode enabled (use with caution)");
    }
    let server = drive::spawn_server(Arc::clone(&cfg), line);
    let monitor = drive::spawn_monitor(Arc::clone(&cfg));

    if cfg.opts.background {
        // No console; serve until the process is killed.
        let _ = server.join();
        let _ = monitor.join();
        return;
    }
    info!(
        "0-7 device dialog, R restart, S toggle send init, \
         V toggle verbose, D toggle debug, Q quit"
    );
    let console = Console::init();
    let server = interactive_loop(&cfg, &console, server);

    cfg.cancel_server.store(true, Ordering::Relaxed);
    cfg.cancel_monitor.store(true, Ordering::Relaxed);
    if server.join().is_err() {
        log::error!("protocol thread panicked");
    }
    if monitor.join().is_err() {
        log::error!("monitor thread panicked");
    }
    drive::close_all(&cfg);
    info!("TU58 emulation end");
}
