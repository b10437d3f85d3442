//! `cachefilesd` binary entry point (spec §6 "CLI", grounded on
//! `original_source/cachefilesd.c:main`).

use std::fs::File;
use std::io::{self, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};
use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use log::info;
use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd::{fork, setsid, ForkResult};

use cachefilesd::channel::Channel;
use cachefilesd::config::{self, Cli};
use cachefilesd::control::ControlLoop;
use cachefilesd::error::Result;
use cachefilesd::fsck;
use cachefilesd::logging;
use cachefilesd::queue::Queue;
use cachefilesd::signals;
use cachefilesd::state::{State, StateFlags};

const DEVICE_NODE: &str = "/dev/cachefiles";
const PROC_NODE: &str = "/proc/fs/cachefiles";
const CACHE_CHANNEL_FD: RawFd = 3;

fn main() -> ExitCode {
    let cli = Cli::parse();
    logging::init(cli.stderr_log, cli.log_level());

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let max_line_len = page_size::get();
    let cfg = config::read_file(&cli.configfile, max_line_len)?;
    let cache_root = cfg.dir()?.clone();
    let mut state = State::new(&cache_root);

    fsck::preflight(&mut state)?;
    if cli.force_scan {
        state.flags.insert(StateFlags::NEED_FSCK);
    }

    if cli.scan_only {
        if state.need_fsck() {
            info!("running a deep fsck scan");
            let report = fsck::run(&state, None)?;
            info!(
                "deep scan complete: {} fixes, {} deletions",
                report.fixes, report.deletions
            );
            remove_lock_file(&state)?;
        } else {
            info!("cull_index fsck completed successfully.");
        }
        return Ok(());
    }

    let mut queue = Queue::new(cfg.culltable_exponent)?;
    let mut channel = open_channel()?;
    for line in &cfg.passthrough {
        channel.send_config_line(line)?;
    }

    info!("About to bind cache");
    channel.bind()?;
    state.flags.insert(StateFlags::BOUND);
    info!("Bound cache");

    if !cli.no_daemon && !daemonize(cli.pidfile.as_deref())? {
        // We're the original process; the child carries on as the daemon.
        return Ok(());
    }
    if let Some(pidfile) = cli.pidfile.as_deref() {
        write_pidfile(pidfile)?;
    }

    signals::install()?;
    ControlLoop::new(&mut state, &mut queue, &mut channel, cfg.nocull).run()
}

/// Opens `/dev/cachefiles`, falling back to `/proc/fs/cachefiles`, and
/// parks it on the conventional fd 3 (spec §6 "Device nodes").
fn open_channel() -> Result<Channel> {
    let file = File::options()
        .read(true)
        .write(true)
        .open(DEVICE_NODE)
        .or_else(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                File::options().read(true).write(true).open(PROC_NODE)
            } else {
                Err(e)
            }
        })?;

    let fd = file.as_raw_fd();
    if fd == CACHE_CHANNEL_FD {
        return Ok(unsafe { Channel::from_raw_fd(file.into_raw_fd()) });
    }
    nix::unistd::dup2(fd, CACHE_CHANNEL_FD)?;
    // `file` drops here, closing the original fd; the dup on fd 3 survives.
    Ok(unsafe { Channel::from_raw_fd(CACHE_CHANNEL_FD) })
}

/// Forks into the background the way `cachefilesd.c:main`'s daemonizing
/// branch does: the parent returns (`Ok(false)`) so the launching shell
/// sees a normal exit, and the child ignores the job-control signals,
/// starts a new session, and becomes the daemon (`Ok(true)`).
fn daemonize(_pidfile: Option<&Path>) -> Result<bool> {
    match unsafe { fork() }? {
        ForkResult::Parent { .. } => Ok(false),
        ForkResult::Child => {
            unsafe {
                signal::signal(Signal::SIGTTIN, SigHandler::SigIgn)?;
                signal::signal(Signal::SIGTTOU, SigHandler::SigIgn)?;
                signal::signal(Signal::SIGTSTP, SigHandler::SigIgn)?;
            }
            setsid()?;
            Ok(true)
        }
    }
}

fn write_pidfile(path: &Path) -> Result<()> {
    let mut f = File::create(path)?;
    writeln!(f, "{}", std::process::id())?;
    Ok(())
}

fn remove_lock_file(state: &State) -> Result<()> {
    match std::fs::remove_file(&state.lock_path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
