//! Signal-driven flags for the control loop (spec §4.6 "Signals").
//!
//! `SIGTERM`/`SIGINT` request shutdown, `SIGIO` marks the graveyard dirty,
//! `SIGALRM` requests a queue refresh. Handlers only set flags; all actual
//! work happens back in [`crate::control`]'s main loop, never in signal
//! context.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{self, SigHandler, SigSet, Signal};

use crate::error::Result;

static STOP: AtomicBool = AtomicBool::new(false);
static REAP: AtomicBool = AtomicBool::new(false);
static REFRESH: AtomicBool = AtomicBool::new(false);

extern "C" fn on_stop(_: libc::c_int) {
    STOP.store(true, Ordering::SeqCst);
}

extern "C" fn on_reap(_: libc::c_int) {
    REAP.store(true, Ordering::SeqCst);
}

extern "C" fn on_refresh(_: libc::c_int) {
    REFRESH.store(true, Ordering::SeqCst);
}

/// Installs the daemon's four handlers. Must be called once, before the
/// control loop starts masking/unmasking these signals around its poll.
pub fn install() -> Result<()> {
    unsafe {
        signal::signal(Signal::SIGTERM, SigHandler::Handler(on_stop))?;
        signal::signal(Signal::SIGINT, SigHandler::Handler(on_stop))?;
        signal::signal(Signal::SIGIO, SigHandler::Handler(on_reap))?;
        signal::signal(Signal::SIGALRM, SigHandler::Handler(on_refresh))?;
    }
    Ok(())
}

pub fn take_stop() -> bool {
    STOP.load(Ordering::SeqCst)
}

/// Sets the stop flag from ordinary control-loop code rather than a signal
/// handler (spec §4.5/§7: a non-zero fsck child exit sets `stop` in the
/// parent).
pub fn request_stop() {
    STOP.store(true, Ordering::SeqCst);
}

pub fn take_reap() -> bool {
    REAP.swap(false, Ordering::SeqCst)
}

pub fn take_refresh() -> bool {
    REFRESH.swap(false, Ordering::SeqCst)
}

/// The set blocked everywhere except during the control loop's poll
/// suspension (spec §4.6: "`SIGIO`, `SIGINT`, `SIGTERM` blocked except
/// during the poll suspension").
pub fn watched_set() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGTERM);
    set.add(Signal::SIGINT);
    set.add(Signal::SIGIO);
    set.add(Signal::SIGALRM);
    set
}

pub fn block_watched() -> Result<()> {
    signal::sigprocmask(signal::SigmaskHow::SIG_BLOCK, Some(&watched_set()), None)?;
    Ok(())
}

impl From<nix::Error> for crate::error::Error {
    fn from(err: nix::Error) -> Self {
        crate::error::Error::Os(std::io::Error::from(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_start_clear_and_are_one_shot() {
        assert!(!take_stop());
        REAP.store(true, Ordering::SeqCst);
        assert!(take_reap());
        assert!(!take_reap());
        REFRESH.store(true, Ordering::SeqCst);
        assert!(take_refresh());
        assert!(!take_refresh());
    }
}
